// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! [`M2mDevice`] on top of a V4L2 video node, through the `v4l2r` ioctl wrappers.

use std::fmt::Debug;
use std::os::fd::AsFd;
use std::path::Path;

use nix::errno::Errno;
use nix::poll::poll;
use nix::poll::PollFd;
use nix::poll::PollFlags;
use nix::poll::PollTimeout;
use v4l2r::bindings::v4l2_format;
use v4l2r::bindings::v4l2_requestbuffers;
use v4l2r::device::Device;
use v4l2r::device::DeviceConfig;
use v4l2r::device::DeviceOpenError;
use v4l2r::ioctl;
use v4l2r::ioctl::Capability;
use v4l2r::ioctl::IoctlConvertError;
use v4l2r::memory::MemoryType;
use v4l2r::memory::MmapHandle;
use v4l2r::QueueType;

use crate::device::DeviceCaps;
use crate::device::DeviceError;
use crate::device::DequeuedBuffer;
use crate::device::Direction;
use crate::device::Format;
use crate::device::M2mDevice;
use crate::device::PlaneInfo;
use crate::device::PlaneMapping;
use crate::FieldOrder;
use crate::Fourcc;
use crate::Resolution;

fn queue_type(direction: Direction) -> QueueType {
    match direction {
        Direction::Output => QueueType::VideoOutputMplane,
        Direction::Capture => QueueType::VideoCaptureMplane,
    }
}

/// `v4l2r` reports errors with the `Errno` of its own `nix` version.
fn errno(err: impl Into<v4l2r::nix::errno::Errno>) -> Errno {
    let errno: v4l2r::nix::errno::Errno = err.into();
    Errno::from_raw(errno as i32)
}

/// Flattens the error of an ioctl whose result also goes through a conversion.
fn ioctl_errno<IE, CE>(err: IoctlConvertError<IE, CE>) -> Errno
where
    IE: Debug + Into<v4l2r::nix::errno::Errno>,
    CE: Debug,
{
    match err {
        IoctlConvertError::IoctlError(e) => errno(e),
        IoctlConvertError::ConversionError(e) => {
            log::warn!("unexpected ioctl result: {e:?}");
            Errno::EINVAL
        }
    }
}

/// Whether the events reported by `poll` mean `wanted` can be serviced. Error conditions on the
/// node end the wait with an error instead of being taken for readiness.
fn poll_ready(
    direction: Direction,
    wanted: PollFlags,
    revents: Option<PollFlags>,
) -> Result<bool, DeviceError> {
    let revents = revents.unwrap_or(PollFlags::empty());
    if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
        return Err(DeviceError::PollCondition(direction, revents.bits()));
    }

    Ok(revents.intersects(wanted))
}

/// One plane mapped with `mmap(2)`. Unmapped on drop.
pub struct MmapPlane(ioctl::PlaneMapping);

impl PlaneMapping for MmapPlane {
    fn as_slice(&self) -> &[u8] {
        self.0.as_ref()
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }
}

/// An open `/dev/videoN` node.
pub struct V4l2Device {
    device: Device,
    path: String,
}

impl V4l2Device {
    /// Opens `path` with non-blocking dequeues.
    pub fn open(path: &str) -> Result<Self, DeviceError> {
        let device = Device::open(Path::new(path), DeviceConfig::new().non_blocking_dqbuf())
            .map_err(|err| match err {
                DeviceOpenError::OpenError(e) => DeviceError::Open {
                    path: path.to_string(),
                    errno: errno(e),
                },
                DeviceOpenError::QueryCapError(e) => {
                    DeviceError::ioctl("VIDIOC_QUERYCAP", errno(e))
                }
            })?;
        log::debug!("opened {path}");

        Ok(Self {
            device,
            path: path.to_string(),
        })
    }

    pub fn open_index(index: u32) -> Result<Self, DeviceError> {
        Self::open(&format!("/dev/video{index}"))
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        log::debug!("closing {}", self.path);
    }
}

impl M2mDevice for V4l2Device {
    type Mapping = MmapPlane;

    fn capabilities(&mut self) -> Result<DeviceCaps, DeviceError> {
        let caps: Capability = ioctl::querycap(&self.device)
            .map_err(|e| DeviceError::ioctl("VIDIOC_QUERYCAP", errno(e)))?;

        Ok(DeviceCaps {
            driver: caps.driver.trim().to_string(),
            card: caps.card.trim().to_string(),
            bus_info: caps.bus_info.trim().to_string(),
            capabilities: caps.capabilities.bits(),
            device_caps: caps.device_caps.map(|c| c.bits()).unwrap_or_default(),
        })
    }

    fn set_format(
        &mut self,
        direction: Direction,
        format: &Format,
    ) -> Result<Format, DeviceError> {
        // `v4l2r::Format` has no field order, so the raw structure is filled in directly.
        let mut fmt = v4l2_format {
            type_: queue_type(direction) as u32,
            ..Default::default()
        };
        // SAFETY: `pix_mp` is the active member for multi-planar buffer types.
        let pix = unsafe { &mut fmt.fmt.pix_mp };
        pix.width = format.resolution.width;
        pix.height = format.resolution.height;
        pix.pixelformat = format.fourcc.into();
        pix.field = format.field as u32;

        let fmt: v4l2_format = ioctl::s_fmt(&mut self.device, fmt)
            .map_err(|e| DeviceError::ioctl("VIDIOC_S_FMT", errno(e)))?;

        // SAFETY: the kernel filled in `pix_mp` for our multi-planar buffer type.
        let pix = unsafe { fmt.fmt.pix_mp };
        let (width, height, pixelformat, field, num_planes) =
            (pix.width, pix.height, pix.pixelformat, pix.field, pix.num_planes);

        Ok(Format {
            resolution: Resolution::from((width, height)),
            fourcc: Fourcc::from(pixelformat),
            field: FieldOrder::n(field).unwrap_or(FieldOrder::Any),
            num_planes: num_planes as u32,
        })
    }

    fn request_buffers(&mut self, direction: Direction, count: u32) -> Result<u32, DeviceError> {
        let reqbufs: v4l2_requestbuffers =
            ioctl::reqbufs(&self.device, queue_type(direction), MemoryType::Mmap, count)
                .map_err(|e| DeviceError::ioctl("VIDIOC_REQBUFS", errno(e)))?;

        Ok(reqbufs.count)
    }

    fn query_buffer(
        &mut self,
        direction: Direction,
        index: u32,
    ) -> Result<Vec<PlaneInfo>, DeviceError> {
        let buffer: ioctl::QueryBuffer =
            ioctl::querybuf(&self.device, queue_type(direction), index as usize)
                .map_err(|e| DeviceError::ioctl("VIDIOC_QUERYBUF", ioctl_errno(e)))?;

        Ok(buffer
            .planes
            .iter()
            .map(|plane| PlaneInfo {
                length: plane.length,
                mem_offset: plane.mem_offset,
            })
            .collect())
    }

    fn map_plane(&mut self, plane: &PlaneInfo) -> Result<MmapPlane, DeviceError> {
        let mapping = ioctl::mmap(&self.device, plane.mem_offset, plane.length).map_err(|e| {
            DeviceError::Mmap {
                offset: plane.mem_offset,
                length: plane.length,
                errno: errno(e),
            }
        })?;

        Ok(MmapPlane(mapping))
    }

    fn queue_buffer(
        &mut self,
        direction: Direction,
        index: u32,
        field: FieldOrder,
        planes: &[PlaneInfo],
        bytes_used: &[u32],
    ) -> Result<(), DeviceError> {
        let mut qbuf = ioctl::QBuffer::<MmapHandle>::new(queue_type(direction), index);
        qbuf.field = field as u32;
        qbuf.planes = bytes_used
            .iter()
            .take(planes.len())
            .map(|&used| ioctl::QBufPlane::new_from_handle(&MmapHandle, used as usize))
            .collect();

        ioctl::qbuf::<_, ()>(&self.device, qbuf)
            .map_err(|e| DeviceError::ioctl("VIDIOC_QBUF", ioctl_errno(e)))
    }

    fn dequeue_buffer(&mut self, direction: Direction) -> Result<DequeuedBuffer, DeviceError> {
        let queue = queue_type(direction);
        let buffer = match ioctl::dqbuf::<ioctl::V4l2Buffer>(&self.device, queue) {
            Ok(buffer) => buffer,
            Err(ioctl::DqBufError::IoctlError(err @ ioctl::DqBufIoctlError::NotReady)) => {
                log::trace!("{direction}: dequeue result: {err:?}");
                return Err(DeviceError::ioctl("VIDIOC_DQBUF", errno(err)));
            }
            Err(err) => return Err(DeviceError::ioctl("VIDIOC_DQBUF", ioctl_errno(err))),
        };

        Ok(DequeuedBuffer {
            index: buffer.index(),
            bytes_used: buffer.planes_iter().map(|p| *p.bytesused).collect(),
            sequence: buffer.sequence(),
            field: buffer.as_v4l2_buffer().field,
        })
    }

    fn stream_on(&mut self, direction: Direction) -> Result<(), DeviceError> {
        ioctl::streamon(&self.device, queue_type(direction))
            .map_err(|e| DeviceError::ioctl("VIDIOC_STREAMON", errno(e)))
    }

    fn get_control(&mut self, id: u32) -> Result<i32, DeviceError> {
        ioctl::g_ctrl(&self.device, id).map_err(|e| DeviceError::ioctl("VIDIOC_G_CTRL", errno(e)))
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError> {
        let applied = ioctl::s_ctrl(&self.device, id, value)
            .map_err(|e| DeviceError::ioctl("VIDIOC_S_CTRL", errno(e)))?;
        if applied != value {
            log::warn!("control 0x{id:08x} set to {applied} instead of {value}");
        }

        Ok(())
    }

    fn wait_ready(&mut self, direction: Direction) -> Result<(), DeviceError> {
        let events = match direction {
            Direction::Output => PollFlags::POLLOUT,
            Direction::Capture => PollFlags::POLLIN,
        };

        loop {
            let mut fds = [PollFd::new(self.device.as_fd(), events)];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {
                    if poll_ready(direction, events, fds[0].revents())? {
                        return Ok(());
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(DeviceError::Poll(direction, errno)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use super::*;

    #[test]
    fn queue_types() {
        assert_eq!(queue_type(Direction::Capture) as u32, 9);
        assert_eq!(queue_type(Direction::Output) as u32, 10);
    }

    #[test]
    fn missing_node() {
        let err = V4l2Device::open("/dev/video-does-not-exist").err().unwrap();
        assert!(matches!(err, DeviceError::Open { errno: Errno::ENOENT, .. }));
    }

    #[test]
    fn dequeue_not_ready_is_transient() {
        let err: ioctl::DqBufError<Infallible> =
            ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::NotReady);
        let err = DeviceError::ioctl("VIDIOC_DQBUF", ioctl_errno(err));
        assert!(err.is_transient());

        let err: ioctl::DqBufError<Infallible> =
            ioctl::DqBufError::IoctlError(ioctl::DqBufIoctlError::Eos);
        let err = DeviceError::ioctl("VIDIOC_DQBUF", ioctl_errno(err));
        assert!(!err.is_transient());
    }

    #[test]
    fn poll_error_conditions() {
        let wanted = PollFlags::POLLIN;
        assert!(poll_ready(Direction::Capture, wanted, Some(PollFlags::POLLIN)).unwrap());
        assert!(!poll_ready(Direction::Capture, wanted, Some(PollFlags::POLLOUT)).unwrap());
        assert!(!poll_ready(Direction::Capture, wanted, None).unwrap());

        for condition in [PollFlags::POLLERR, PollFlags::POLLHUP, PollFlags::POLLNVAL] {
            let err = poll_ready(Direction::Capture, wanted, Some(condition | PollFlags::POLLIN))
                .unwrap_err();
            assert!(matches!(err, DeviceError::PollCondition(Direction::Capture, _)));
            assert!(!err.is_transient());
        }
    }
}
