// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The test cases run against a deinterlacer.
//!
//! Every case opens its own device through a factory, traps its own failures and releases
//! everything it acquired before returning the number of failures it saw. A failing case never
//! stops the cases after it.

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Context;

use crate::buffer::BufferPool;
use crate::device::DeintMode;
use crate::device::DeviceError;
use crate::device::Direction;
use crate::device::Format;
use crate::device::M2mDevice;
use crate::device::CID_MIN_BUFFERS_FOR_CAPTURE;
use crate::device::CID_MIN_BUFFERS_FOR_OUTPUT;
use crate::scheduler::Cadence;
use crate::scheduler::FrameScheduler;
use crate::session::Session;
use crate::session::SessionParams;
use crate::FieldOrder;
use crate::Fourcc;
use crate::Resolution;

#[derive(Clone, Debug)]
pub struct SuiteConfig {
    pub resolution: Resolution,
    pub num_frames: u32,
    /// Run the deinterlacing cases instead of the basic ones.
    pub interlaced: bool,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::from((128, 80)),
            num_frames: 30,
            interlaced: false,
        }
    }
}

/// Runs `case` and turns its outcome into a failure count.
fn run_case<F>(name: &str, case: F) -> usize
where
    F: FnOnce() -> anyhow::Result<()>,
{
    log::info!("{name}: starting");
    match case() {
        Ok(()) => {
            log::info!("{name}: passed");
            0
        }
        Err(err) => {
            log::error!("{name}: failed: {err:#}");
            1
        }
    }
}

/// Opens a device and reads its capabilities.
pub fn open_close<D, F>(open: &mut F) -> usize
where
    D: M2mDevice,
    F: FnMut() -> Result<D, DeviceError>,
{
    run_case("open/close", || {
        let mut device = open().context("failed to open device")?;
        let caps = device.capabilities()?;
        log::info!(
            "driver {}, card {}, bus {}, caps 0x{:08x}",
            caps.driver,
            caps.card,
            caps.bus_info,
            caps.effective()
        );
        if !caps.is_m2m_mplane() {
            bail!("{} is not a multi-planar M2M device", caps.card);
        }
        Ok(())
    })
}

/// Allocates and frees both pools directly, without a session.
pub fn pool_allocation<D, F>(open: &mut F, config: &SuiteConfig) -> usize
where
    D: M2mDevice,
    F: FnMut() -> Result<D, DeviceError>,
{
    run_case("buffer pool allocation", || {
        let mut device = open().context("failed to open device")?;
        let format = Format::new(config.resolution, Fourcc::YUYV, FieldOrder::None);

        let mut pools = Vec::new();
        for direction in [Direction::Output, Direction::Capture] {
            let accepted = device.set_format(direction, &format)?;
            if accepted.fourcc != format.fourcc {
                bail!(
                    "{direction} format changed from {} to {}",
                    format.fourcc,
                    accepted.fourcc
                );
            }

            let pool = BufferPool::allocate(&mut device, direction, accepted.field, 4)?;
            log::info!(
                "{direction}: {} of {} buffers, {} planes each",
                pool.granted(),
                pool.requested(),
                pool.get(0).map(|b| b.num_planes()).unwrap_or(0)
            );
            pools.push(pool);
        }

        for pool in pools {
            BufferPool::free(Some(pool));
        }
        Ok(())
    })
}

/// Sets up a complete session and tears it down again.
pub fn m2m_object<D, F>(open: &mut F, config: &SuiteConfig) -> usize
where
    D: M2mDevice,
    F: FnMut() -> Result<D, DeviceError>,
{
    run_case("M2M object", || {
        let device = open().context("failed to open device")?;
        let params = SessionParams {
            resolution: config.resolution,
            ..Default::default()
        };
        let session = Session::new(device, &params)?;
        session.close();
        Ok(())
    })
}

fn log_min_buffers<D: M2mDevice>(session: &mut Session<D>) {
    for (name, id) in [
        ("MIN_BUFFERS_FOR_OUTPUT", CID_MIN_BUFFERS_FOR_OUTPUT),
        ("MIN_BUFFERS_FOR_CAPTURE", CID_MIN_BUFFERS_FOR_CAPTURE),
    ] {
        match session.get_control(id) {
            Ok(value) => log::info!("{name}: {value}"),
            Err(err) => log::debug!("{name}: {err}"),
        }
    }
}

/// Streams `config.num_frames` frames in `mode` and checks what came back.
fn stream<D, F>(open: &mut F, config: &SuiteConfig, mode: DeintMode) -> anyhow::Result<()>
where
    D: M2mDevice,
    F: FnMut() -> Result<D, DeviceError>,
{
    let device = open().context("failed to open device")?;
    let params = SessionParams {
        resolution: config.resolution,
        output_field: match mode {
            DeintMode::Progressive => FieldOrder::None,
            _ => FieldOrder::Interlaced,
        },
        ..Default::default()
    };
    let mut session = Session::new(device, &params)?;
    log_min_buffers(&mut session);

    let cadence = Cadence::from(mode);
    let mut scheduler = FrameScheduler::new(cadence, config.num_frames);
    scheduler.prime(&mut session)?;

    session
        .set_deint_mode(mode)
        .context("failed to select deinterlace mode")?;
    scheduler.start(&mut session)?;

    // The mode only takes effect once both queues stream.
    let current = session.deint_mode()?;
    if current != mode {
        bail!("deinterlace mode is {current}, expected {mode}");
    }

    let report = scheduler.run(&mut session)?;
    session.close();

    let expected = cadence.expected_dequeues(config.num_frames);
    let actual = (report.output_dequeues, report.capture_dequeues);
    if actual != expected {
        return Err(anyhow!(
            "dequeued {actual:?} OUTPUT/CAPTURE buffers, expected {expected:?}"
        ));
    }
    if report
        .capture_sequences
        .iter()
        .zip(1..)
        .any(|(&sequence, expected)| sequence != expected)
    {
        bail!("CAPTURE sequence numbers out of order: {:?}", report.capture_sequences);
    }
    if report.empty_captures > 0 {
        log::warn!("{} CAPTURE buffers carried no payload", report.empty_captures);
    }

    Ok(())
}

pub fn progressive_stream<D, F>(open: &mut F, config: &SuiteConfig) -> usize
where
    D: M2mDevice,
    F: FnMut() -> Result<D, DeviceError>,
{
    run_case("progressive stream", || stream(open, config, DeintMode::Progressive))
}

pub fn deinterlace<D, F>(open: &mut F, config: &SuiteConfig, mode: DeintMode) -> usize
where
    D: M2mDevice,
    F: FnMut() -> Result<D, DeviceError>,
{
    run_case(&format!("deinterlace ({mode})"), || stream(open, config, mode))
}

/// Runs the basic cases, or the deinterlacing case of every interlaced mode if
/// `config.interlaced` is set. Returns the number of failed cases.
pub fn run_suite<D, F>(mut open: F, config: &SuiteConfig) -> usize
where
    D: M2mDevice,
    F: FnMut() -> Result<D, DeviceError>,
{
    if config.interlaced {
        DeintMode::INTERLACED
            .into_iter()
            .map(|mode| deinterlace(&mut open, config, mode))
            .sum()
    } else {
        open_close(&mut open)
            + pool_allocation(&mut open, config)
            + m2m_object(&mut open, config)
            + progressive_stream(&mut open, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::DummyConfig;
    use crate::device::dummy::DummyDevice;

    fn factory(config: DummyConfig) -> impl FnMut() -> Result<DummyDevice, DeviceError> {
        move || Ok(DummyDevice::new(config.clone()))
    }

    #[test]
    fn healthy_device_passes() {
        let open = factory(Default::default());
        assert_eq!(run_suite(open, &Default::default()), 0);
    }

    #[test]
    fn interlaced_suite_passes() {
        let open = factory(Default::default());
        let config = SuiteConfig {
            interlaced: true,
            num_frames: 12,
            ..Default::default()
        };
        assert_eq!(run_suite(open, &config), 0);
    }

    #[test]
    fn missing_capability_fails_device_cases() {
        let open = factory(DummyConfig {
            m2m_capable: false,
            ..Default::default()
        });
        // Allocation does not look at the capabilities.
        assert_eq!(run_suite(open, &Default::default()), 3);
    }

    #[test]
    fn failures_are_isolated_and_unwound() {
        let mut probes = Vec::new();
        let mut open = || {
            let device = DummyDevice::new(DummyConfig {
                fail_dequeue_at: Some((Direction::Capture, 2)),
                ..Default::default()
            });
            probes.push(device.probe());
            Ok(device)
        };

        let config = SuiteConfig {
            num_frames: 6,
            ..Default::default()
        };
        assert_eq!(progressive_stream(&mut open, &config), 1);
        assert_eq!(m2m_object(&mut open, &config), 0);

        assert_eq!(probes.len(), 2);
        for probe in &probes {
            assert_eq!(probe.live_mappings(), 0);
            assert_eq!(probe.closes(), 1);
        }
    }

    #[test]
    fn unopenable_device() {
        let mut open = || -> Result<DummyDevice, DeviceError> {
            Err(DeviceError::Open {
                path: "/dev/video99".into(),
                errno: nix::errno::Errno::ENOENT,
            })
        };
        assert_eq!(run_suite(&mut open, &Default::default()), 4);
    }
}
