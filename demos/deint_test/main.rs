// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! deint_test, runs the deint-m2m test suite against a V4L2 deinterlacer, or against the
//! simulated one with `--dummy`.

use std::path::Path;
use std::process::ExitCode;

use argh::FromArgs;

use deint_m2m::device::dummy::DummyDevice;
use deint_m2m::device::DeviceError;
use deint_m2m::suite::run_suite;
use deint_m2m::suite::SuiteConfig;
use deint_m2m::Resolution;

/// Protocol tester for V4L2 M2M deinterlacers
#[derive(Debug, FromArgs)]
struct Args {
    /// index of the /dev/videoN node to test
    #[argh(option, default = "0")]
    device: u32,

    /// frame width
    #[argh(option, default = "128")]
    width: u32,

    /// frame height
    #[argh(option, default = "80")]
    height: u32,

    /// number of frames to process
    #[argh(option, default = "30")]
    num_frames: u32,

    /// verbosity, 0 to 3
    #[argh(option, default = "0")]
    verbose: u8,

    /// run the deinterlacing tests instead of the basic ones
    #[argh(switch)]
    interlaced: bool,

    /// use the simulated device instead of real hardware
    #[argh(switch)]
    dummy: bool,
}

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

#[cfg(feature = "v4l2")]
fn run_hardware(args: &Args, config: &SuiteConfig) -> usize {
    use deint_m2m::device::v4l2::V4l2Device;

    let index = args.device;
    run_suite(|| V4l2Device::open_index(index), config)
}

#[cfg(not(feature = "v4l2"))]
fn run_hardware(_args: &Args, config: &SuiteConfig) -> usize {
    log::error!("built without V4L2 support, use --dummy");
    run_suite(
        || -> Result<DummyDevice, DeviceError> {
            Err(DeviceError::Open {
                path: "/dev/video".into(),
                errno: nix::errno::Errno::ENOTSUP,
            })
        },
        config,
    )
}

fn main() -> ExitCode {
    let args: Args = argh::from_env();
    init_logger(args.verbose);

    let appname = std::env::args()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| "deint_test".to_string());

    let config = SuiteConfig {
        resolution: Resolution::from((args.width, args.height)),
        num_frames: args.num_frames,
        interlaced: args.interlaced,
    };

    let failed = if args.dummy {
        run_suite(
            || Ok::<_, DeviceError>(DummyDevice::new(Default::default())),
            &config,
        )
    } else {
        run_hardware(&args, &config)
    };

    println!("{appname}: Test results: {failed} tests failed");

    if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
