// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The ioctl boundary of an M2M device.
//!
//! Everything above this module talks to the hardware through [`M2mDevice`], which mirrors the
//! subset of the V4L2 multi-planar MMAP API a deinterlacer test needs. Two implementations exist:
//! [`v4l2::V4l2Device`] for real `/dev/videoN` nodes, and [`dummy::DummyDevice`], an in-process
//! simulation used by the tests and for runs without hardware.

pub mod dummy;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;

use nix::errno::Errno;
use thiserror::Error;

use crate::FieldOrder;
use crate::Fourcc;
use crate::Resolution;

/// `V4L2_CAP_VIDEO_M2M_MPLANE`.
pub const CAP_VIDEO_M2M_MPLANE: u32 = 0x0000_4000;
/// `V4L2_CAP_DEVICE_CAPS`.
pub const CAP_DEVICE_CAPS: u32 = 0x8000_0000;

const CID_USER_BASE: u32 = 0x0098_0900;
/// `V4L2_CID_MIN_BUFFERS_FOR_CAPTURE`.
pub const CID_MIN_BUFFERS_FOR_CAPTURE: u32 = CID_USER_BASE + 39;
/// `V4L2_CID_MIN_BUFFERS_FOR_OUTPUT`.
pub const CID_MIN_BUFFERS_FOR_OUTPUT: u32 = CID_USER_BASE + 40;
/// Vendor control selecting the deinterlacing algorithm, see [`DeintMode`].
pub const CID_DEINT_MODE: u32 = CID_USER_BASE + 0x1000;

/// Direction of a queue, named from the device's point of view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Frames fed into the device.
    Output,
    /// Frames produced by the device.
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Output => f.write_str("OUTPUT"),
            Direction::Capture => f.write_str("CAPTURE"),
        }
    }
}

/// Values of the [`CID_DEINT_MODE`] control.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(i32)]
pub enum DeintMode {
    /// No deinterlacing. Must be selected for progressive input.
    Progressive = 0,
    Adaptive2d3d = 1,
    Fixed2d = 2,
    Fixed3d = 3,
    PreviousField = 4,
    NextField = 5,
}

impl DeintMode {
    /// Every interlaced mode, in the order the interlaced suite exercises them.
    pub const INTERLACED: [DeintMode; 5] = [
        DeintMode::Adaptive2d3d,
        DeintMode::Fixed2d,
        DeintMode::Fixed3d,
        DeintMode::PreviousField,
        DeintMode::NextField,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            DeintMode::Progressive => "Progressive",
            DeintMode::Adaptive2d3d => "Adaptive 2D/3D",
            DeintMode::Fixed2d => "Fixed 2D",
            DeintMode::Fixed3d => "Fixed 3D",
            DeintMode::PreviousField => "Previous field",
            DeintMode::NextField => "Next field",
        }
    }
}

impl fmt::Display for DeintMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What `VIDIOC_QUERYCAP` told us about the device.
#[derive(Clone, Debug, Default)]
pub struct DeviceCaps {
    pub driver: String,
    pub card: String,
    pub bus_info: String,
    pub capabilities: u32,
    pub device_caps: u32,
}

impl DeviceCaps {
    /// Capabilities of the opened node, which are the ones that matter when the driver
    /// exposes several nodes.
    pub fn effective(&self) -> u32 {
        if self.capabilities & CAP_DEVICE_CAPS != 0 {
            self.device_caps
        } else {
            self.capabilities
        }
    }

    pub fn is_m2m_mplane(&self) -> bool {
        self.effective() & CAP_VIDEO_M2M_MPLANE != 0
    }
}

/// A queue format as requested by the caller or echoed back by the device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Format {
    pub resolution: Resolution,
    pub fourcc: Fourcc,
    pub field: FieldOrder,
    /// Number of memory planes. Filled in by the device, ignored on input.
    pub num_planes: u32,
}

impl Format {
    pub fn new(resolution: Resolution, fourcc: Fourcc, field: FieldOrder) -> Self {
        Self {
            resolution,
            fourcc,
            field,
            num_planes: 0,
        }
    }
}

/// Where and how large one plane of a device buffer is, as returned by `VIDIOC_QUERYBUF`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneInfo {
    pub length: u32,
    pub mem_offset: u32,
}

/// A buffer handed back by `VIDIOC_DQBUF`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    /// Bytes used, per plane.
    pub bytes_used: Vec<u32>,
    /// Sequence number assigned by the driver.
    pub sequence: u32,
    pub field: u32,
}

/// A mapping of one buffer plane into our address space. Dropping it unmaps the plane.
pub trait PlaneMapping {
    fn as_slice(&self) -> &[u8];
    fn as_mut_slice(&mut self) -> &mut [u8];
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open {path}: {errno}")]
    Open { path: String, errno: Errno },

    #[error("{which} failed: {errno}")]
    Ioctl { which: &'static str, errno: Errno },

    #[error("failed to map plane (offset 0x{offset:x}, length {length}): {errno}")]
    Mmap {
        offset: u32,
        length: u32,
        errno: Errno,
    },

    #[error("failed to wait for {0} readiness: {1}")]
    Poll(Direction, Errno),

    #[error("{0} queue reported an error condition (revents 0x{1:x})")]
    PollCondition(Direction, i16),

    #[error("{0} queue can make no progress")]
    Stalled(Direction),
}

impl DeviceError {
    pub fn ioctl(which: &'static str, errno: Errno) -> Self {
        DeviceError::Ioctl { which, errno }
    }

    /// Whether the device only asked us to try again later. Some drivers return `EIO` from
    /// DQBUF for a single aborted job while the queue keeps working.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeviceError::Ioctl {
                errno: Errno::EAGAIN | Errno::EINTR | Errno::EIO,
                ..
            }
        )
    }
}

/// The operations of a V4L2 multi-planar M2M device using MMAP buffers.
///
/// Implementations are driven by a single thread and never see concurrent calls.
pub trait M2mDevice {
    type Mapping: PlaneMapping;

    fn capabilities(&mut self) -> Result<DeviceCaps, DeviceError>;

    /// Applies `format` to the `direction` queue and returns what the device accepted, which
    /// may differ from what was asked.
    fn set_format(&mut self, direction: Direction, format: &Format)
        -> Result<Format, DeviceError>;

    /// Asks for `count` MMAP buffers and returns how many the device granted. A count of 0
    /// releases the buffers.
    fn request_buffers(&mut self, direction: Direction, count: u32) -> Result<u32, DeviceError>;

    fn query_buffer(
        &mut self,
        direction: Direction,
        index: u32,
    ) -> Result<Vec<PlaneInfo>, DeviceError>;

    fn map_plane(&mut self, plane: &PlaneInfo) -> Result<Self::Mapping, DeviceError>;

    /// Hands buffer `index` to the device, announcing `bytes_used` per plane.
    fn queue_buffer(
        &mut self,
        direction: Direction,
        index: u32,
        field: FieldOrder,
        planes: &[PlaneInfo],
        bytes_used: &[u32],
    ) -> Result<(), DeviceError>;

    /// Takes back one completed buffer without blocking.
    fn dequeue_buffer(&mut self, direction: Direction) -> Result<DequeuedBuffer, DeviceError>;

    fn stream_on(&mut self, direction: Direction) -> Result<(), DeviceError>;

    fn get_control(&mut self, id: u32) -> Result<i32, DeviceError>;

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError>;

    /// Blocks until `direction` has a completed buffer to dequeue.
    fn wait_ready(&mut self, direction: Direction) -> Result<(), DeviceError>;
}
