// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An M2M device together with its OUTPUT and CAPTURE queues.

use thiserror::Error;

use crate::buffer::AllocationError;
use crate::buffer::Buffer;
use crate::buffer::BufferPool;
use crate::buffer::MAX_POOL_BUFFERS;
use crate::device::DeintMode;
use crate::device::DeviceError;
use crate::device::Direction;
use crate::device::Format;
use crate::device::M2mDevice;
use crate::device::CID_DEINT_MODE;
use crate::queue::Dequeued;
use crate::queue::Queue;
use crate::queue::QueueError;
use crate::FieldOrder;
use crate::Fourcc;
use crate::Resolution;

/// Broad classes of session failures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The device could not be opened or configured.
    Setup,
    /// Buffers could not be obtained or mapped.
    Allocation,
    /// The device misbehaved while running.
    Protocol,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Open(DeviceError),

    #[error("failed to query capabilities: {0}")]
    QueryCap(DeviceError),

    #[error("{0} does not support V4L2_CAP_VIDEO_M2M_MPLANE")]
    NotM2m(String),

    #[error("failed to set {direction} format: {source}")]
    SetFormat {
        direction: Direction,
        source: DeviceError,
    },

    #[error("{direction} format changed: requested {requested}, got {accepted}")]
    FormatChanged {
        direction: Direction,
        requested: Fourcc,
        accepted: Fourcc,
    },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("failed to get control 0x{id:08x}: {source}")]
    GetControl { id: u32, source: DeviceError },

    #[error("failed to set control 0x{id:08x} to {value}: {source}")]
    SetControl {
        id: u32,
        value: i32,
        source: DeviceError,
    },

    #[error("device reports unknown deinterlace mode {0}")]
    UnknownMode(i32),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Open(_)
            | SessionError::QueryCap(_)
            | SessionError::NotM2m(_)
            | SessionError::SetFormat { .. }
            | SessionError::FormatChanged { .. } => ErrorKind::Setup,
            SessionError::Allocation(_) => ErrorKind::Allocation,
            SessionError::GetControl { .. }
            | SessionError::SetControl { .. }
            | SessionError::UnknownMode(_)
            | SessionError::Queue(_) => ErrorKind::Protocol,
        }
    }
}

/// How to configure a session.
#[derive(Copy, Clone, Debug)]
pub struct SessionParams {
    pub resolution: Resolution,
    pub output_fourcc: Fourcc,
    pub output_field: FieldOrder,
    pub capture_fourcc: Fourcc,
    /// Buffers to request for each queue.
    pub buffers: u32,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            resolution: Resolution::from((128, 80)),
            output_fourcc: Fourcc::YUYV,
            output_field: FieldOrder::None,
            capture_fourcc: Fourcc::YUYV,
            buffers: MAX_POOL_BUFFERS,
        }
    }
}

/// The device and both its queues.
///
/// The session owns everything: dropping it (or calling [`Session::close`]) unmaps both pools,
/// then closes the device.
pub struct Session<D: M2mDevice> {
    // Field order matters: the pools are released before the device.
    output: Queue<D::Mapping>,
    capture: Queue<D::Mapping>,
    output_format: Format,
    capture_format: Format,
    device: D,
}

impl<D: M2mDevice> Session<D> {
    /// Checks `device`, negotiates both formats and allocates both pools.
    ///
    /// On failure everything acquired so far, including `device`, is released before
    /// returning.
    pub fn new(mut device: D, params: &SessionParams) -> Result<Self, SessionError> {
        let caps = device.capabilities().map_err(SessionError::QueryCap)?;
        log::debug!(
            "{} ({}, {}): caps 0x{:08x}",
            caps.card,
            caps.driver,
            caps.bus_info,
            caps.effective()
        );
        if !caps.is_m2m_mplane() {
            return Err(SessionError::NotM2m(caps.card));
        }

        let output_format = Self::negotiate(
            &mut device,
            Direction::Output,
            Format::new(params.resolution, params.output_fourcc, params.output_field),
        )?;
        let capture_format = Self::negotiate(
            &mut device,
            Direction::Capture,
            Format::new(params.resolution, params.capture_fourcc, FieldOrder::None),
        )?;

        let output_pool = BufferPool::allocate(
            &mut device,
            Direction::Output,
            output_format.field,
            params.buffers,
        )?;
        let capture_pool = BufferPool::allocate(
            &mut device,
            Direction::Capture,
            capture_format.field,
            params.buffers,
        )?;

        log::debug!(
            "session ready: OUTPUT {} {} ({} buffers), CAPTURE {} {} ({} buffers)",
            output_format.fourcc,
            output_format.field,
            output_pool.granted(),
            capture_format.fourcc,
            capture_format.field,
            capture_pool.granted()
        );

        Ok(Self {
            output: Queue::new(output_pool),
            capture: Queue::new(capture_pool),
            output_format,
            capture_format,
            device,
        })
    }

    fn negotiate(
        device: &mut D,
        direction: Direction,
        requested: Format,
    ) -> Result<Format, SessionError> {
        let accepted = device
            .set_format(direction, &requested)
            .map_err(|source| SessionError::SetFormat { direction, source })?;

        log::debug!(
            "{direction}: format {} {} {} -> {} {} ({} planes)",
            requested.resolution,
            requested.fourcc,
            requested.field,
            accepted.fourcc,
            accepted.field,
            accepted.num_planes
        );

        if accepted.fourcc != requested.fourcc {
            return Err(SessionError::FormatChanged {
                direction,
                requested: requested.fourcc,
                accepted: accepted.fourcc,
            });
        }

        Ok(accepted)
    }

    pub fn format(&self, direction: Direction) -> &Format {
        match direction {
            Direction::Output => &self.output_format,
            Direction::Capture => &self.capture_format,
        }
    }

    pub fn queue(&self, direction: Direction) -> &Queue<D::Mapping> {
        match direction {
            Direction::Output => &self.output,
            Direction::Capture => &self.capture,
        }
    }

    pub fn buffer(&self, direction: Direction, index: u32) -> Option<&Buffer<D::Mapping>> {
        self.queue(direction).buffer(index)
    }

    /// Buffer `index` of `direction`, if the caller currently holds it.
    pub fn buffer_mut(
        &mut self,
        direction: Direction,
        index: u32,
    ) -> Option<&mut Buffer<D::Mapping>> {
        match direction {
            Direction::Output => self.output.buffer_mut(index),
            Direction::Capture => self.capture.buffer_mut(index),
        }
    }

    pub fn submit(&mut self, direction: Direction, index: u32) -> Result<(), SessionError> {
        match direction {
            Direction::Output => self.output.submit(&mut self.device, index)?,
            Direction::Capture => self.capture.submit(&mut self.device, index)?,
        }
        Ok(())
    }

    /// Blocks until the device completes a `direction` buffer and takes it back.
    pub fn dequeue(&mut self, direction: Direction) -> Result<Dequeued, SessionError> {
        let dequeued = match direction {
            Direction::Output => self.output.dequeue(&mut self.device)?,
            Direction::Capture => self.capture.dequeue(&mut self.device)?,
        };
        Ok(dequeued)
    }

    /// Starts streaming on one queue. All its buffers must have been submitted once.
    pub fn stream_on(&mut self, direction: Direction) -> Result<(), SessionError> {
        match direction {
            Direction::Output => self.output.start(&mut self.device)?,
            Direction::Capture => self.capture.start(&mut self.device)?,
        }
        Ok(())
    }

    pub fn get_control(&mut self, id: u32) -> Result<i32, SessionError> {
        self.device
            .get_control(id)
            .map_err(|source| SessionError::GetControl { id, source })
    }

    pub fn set_control(&mut self, id: u32, value: i32) -> Result<(), SessionError> {
        self.device
            .set_control(id, value)
            .map_err(|source| SessionError::SetControl { id, value, source })
    }

    /// Current deinterlacing mode.
    ///
    /// The device only applies a new mode once both queues stream, so a value read before
    /// that may be stale.
    pub fn deint_mode(&mut self) -> Result<DeintMode, SessionError> {
        let value = self.get_control(CID_DEINT_MODE)?;
        DeintMode::n(value).ok_or(SessionError::UnknownMode(value))
    }

    pub fn set_deint_mode(&mut self, mode: DeintMode) -> Result<(), SessionError> {
        self.set_control(CID_DEINT_MODE, mode as i32)
    }

    /// Unmaps both pools, then closes the device.
    pub fn close(self) {
        let Session {
            output,
            capture,
            device,
            ..
        } = self;

        BufferPool::free(Some(output.into_pool()));
        BufferPool::free(Some(capture.into_pool()));
        drop(device);
        log::debug!("session closed");
    }
}

#[cfg(feature = "v4l2")]
impl Session<crate::device::v4l2::V4l2Device> {
    /// Opens `/dev/video<index>` and sets it up as [`Session::new`] does.
    pub fn open(index: u32, params: &SessionParams) -> Result<Self, SessionError> {
        let device =
            crate::device::v4l2::V4l2Device::open_index(index).map_err(SessionError::Open)?;
        Self::new(device, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::DummyConfig;
    use crate::device::dummy::DummyDevice;
    use crate::device::dummy::DummyProbe;

    type DummySession = Result<Session<DummyDevice>, SessionError>;

    fn open(config: DummyConfig, params: &SessionParams) -> (DummySession, DummyProbe) {
        let device = DummyDevice::new(config);
        let probe = device.probe();
        (Session::new(device, params), probe)
    }

    #[test]
    fn open_close() {
        let (session, probe) = open(Default::default(), &Default::default());
        let session = session.unwrap();

        assert_eq!(session.queue(Direction::Output).num_buffers(), 4);
        assert_eq!(session.queue(Direction::Capture).num_buffers(), 4);
        assert_eq!(session.format(Direction::Output).fourcc, Fourcc::YUYV);
        assert_eq!(session.format(Direction::Capture).field, FieldOrder::None);
        assert_eq!(probe.live_mappings(), 8);

        session.close();
        assert_eq!(probe.live_mappings(), 0);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn dropping_releases_everything() {
        let (session, probe) = open(Default::default(), &Default::default());
        drop(session);
        assert_eq!(probe.live_mappings(), 0);
        assert_eq!(probe.maps(), probe.unmaps());
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn unsupported_encoding_stops_before_allocation() {
        let params = SessionParams {
            capture_fourcc: Fourcc::ARGB32,
            ..Default::default()
        };
        let (session, probe) = open(Default::default(), &params);
        let err = session.err().unwrap();

        assert!(matches!(
            err,
            SessionError::FormatChanged {
                direction: Direction::Capture,
                requested: Fourcc::ARGB32,
                accepted: Fourcc::YUYV,
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Setup);
        assert_eq!(probe.buffer_requests(), 0);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn missing_capability() {
        let config = DummyConfig {
            m2m_capable: false,
            ..Default::default()
        };
        let (session, probe) = open(config, &Default::default());
        let err = session.err().unwrap();

        assert!(matches!(err, SessionError::NotM2m(_)));
        assert_eq!(err.kind(), ErrorKind::Setup);
        assert_eq!(probe.buffer_requests(), 0);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn capture_allocation_failure_unwinds_output_pool() {
        // Four OUTPUT planes map fine, the second CAPTURE plane does not.
        let config = DummyConfig {
            fail_map_at: Some(5),
            ..Default::default()
        };
        let (session, probe) = open(config, &Default::default());
        let err = session.err().unwrap();

        assert!(matches!(
            err,
            SessionError::Allocation(AllocationError::Map {
                direction: Direction::Capture,
                index: 1,
                ..
            })
        ));
        assert_eq!(err.kind(), ErrorKind::Allocation);
        assert_eq!(probe.maps(), 5);
        assert_eq!(probe.live_mappings(), 0);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn no_buffers_granted() {
        let config = DummyConfig {
            max_buffers: 0,
            ..Default::default()
        };
        let (session, probe) = open(config, &Default::default());
        let err = session.err().unwrap();

        assert!(matches!(
            err,
            SessionError::Allocation(AllocationError::NoneGranted(Direction::Output))
        ));
        assert_eq!(probe.live_mappings(), 0);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn format_negotiation_is_idempotent() {
        let encodings = [
            Fourcc::YUYV,
            Fourcc::UYVY,
            Fourcc::NV12M,
            Fourcc::NV16M,
            Fourcc::YUV420M,
            Fourcc::ARGB32,
        ];
        let sizes = [(128, 80), (320, 240), (1920, 1080), (2, 2)];

        let mut device = DummyDevice::new(Default::default());
        for fourcc in encodings {
            for size in sizes {
                for direction in [Direction::Output, Direction::Capture] {
                    let format =
                        Format::new(Resolution::from(size), fourcc, FieldOrder::Interlaced);
                    let first = device.set_format(direction, &format).unwrap();
                    let second = device.set_format(direction, &format).unwrap();
                    assert_eq!(first, second);
                }
            }
        }
    }

    #[test]
    fn controls() {
        let (session, _probe) = open(Default::default(), &Default::default());
        let mut session = session.unwrap();

        assert_eq!(session.deint_mode().unwrap(), DeintMode::Progressive);
        session.set_deint_mode(DeintMode::NextField).unwrap();
        // Not streaming yet, so the old mode still shows.
        assert_eq!(session.deint_mode().unwrap(), DeintMode::Progressive);

        let err = session.set_control(CID_DEINT_MODE, 17).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(session.get_control(0xdead_beef).is_err());
    }

    #[test]
    fn buffers_only_writable_by_their_holder() {
        let (session, _probe) = open(Default::default(), &Default::default());
        let mut session = session.unwrap();

        assert!(session.buffer_mut(Direction::Output, 0).unwrap().fill_pattern());
        session.submit(Direction::Output, 0).unwrap();
        assert!(session.buffer_mut(Direction::Output, 0).is_none());
        assert!(session.buffer(Direction::Output, 0).is_some());

        let err = session.stream_on(Direction::Output).err().unwrap();
        assert!(matches!(
            err,
            SessionError::Queue(QueueError::NotPrimed(Direction::Output))
        ));
    }
}
