// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Memory-mapped frame buffers and the pools that own them.

use thiserror::Error;

use crate::device::Direction;
use crate::device::DeviceError;
use crate::device::M2mDevice;
use crate::device::PlaneInfo;
use crate::device::PlaneMapping;
use crate::FieldOrder;

/// Largest number of buffers a pool will ever hold.
pub const MAX_POOL_BUFFERS: u32 = 4;
/// Largest number of planes of a single buffer.
pub const MAX_PLANES: usize = 3;

const CONTENT_PATTERN: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";

#[derive(Debug, Error)]
pub enum AllocationError {
    #[error("failed to request {direction} buffers: {source}")]
    Request {
        direction: Direction,
        source: DeviceError,
    },

    #[error("device granted no {0} buffers")]
    NoneGranted(Direction),

    #[error("failed to query {direction} buffer {index}: {source}")]
    Query {
        direction: Direction,
        index: u32,
        source: DeviceError,
    },

    #[error("{direction} buffer {index} has {planes} planes")]
    PlaneCount {
        direction: Direction,
        index: u32,
        planes: usize,
    },

    #[error("failed to map plane {plane} of {direction} buffer {index}: {source}")]
    Map {
        direction: Direction,
        index: u32,
        plane: usize,
        source: DeviceError,
    },
}

/// Which side of the queue currently holds a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Owner {
    Caller,
    Device,
}

/// One frame slot shared with the device.
pub struct Buffer<M: PlaneMapping> {
    index: u32,
    field: FieldOrder,
    layout: Vec<PlaneInfo>,
    planes: Vec<M>,
    bytes_used: Vec<u32>,
    owner: Owner,
    sequence: Option<u32>,
}

impl<M: PlaneMapping> Buffer<M> {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn field(&self) -> FieldOrder {
        self.field
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn layout(&self) -> &[PlaneInfo] {
        &self.layout
    }

    /// Length of each plane, in bytes.
    pub fn plane_lengths(&self) -> Vec<u32> {
        self.layout.iter().map(|p| p.length).collect()
    }

    /// Bytes used per plane, as reported by the last dequeue.
    pub fn bytes_used(&self) -> &[u32] {
        &self.bytes_used
    }

    pub fn total_bytes_used(&self) -> u64 {
        self.bytes_used.iter().map(|&b| b as u64).sum()
    }

    pub fn is_caller_owned(&self) -> bool {
        self.owner == Owner::Caller
    }

    /// Queue sequence number of the dequeue that last returned this buffer.
    pub fn sequence(&self) -> Option<u32> {
        self.sequence
    }

    /// Contents of `plane`, or `None` if the plane does not exist or the device holds the
    /// buffer.
    pub fn plane(&self, plane: usize) -> Option<&[u8]> {
        if !self.is_caller_owned() {
            return None;
        }
        self.planes.get(plane).map(|m| m.as_slice())
    }

    pub fn plane_mut(&mut self, plane: usize) -> Option<&mut [u8]> {
        if !self.is_caller_owned() {
            return None;
        }
        self.planes.get_mut(plane).map(|m| m.as_mut_slice())
    }

    /// Writes the repeating test pattern into every plane. Returns false if the device holds
    /// the buffer.
    pub fn fill_pattern(&mut self) -> bool {
        if !self.is_caller_owned() {
            return false;
        }
        for plane in self.planes.iter_mut() {
            for (k, byte) in plane.as_mut_slice().iter_mut().enumerate() {
                *byte = CONTENT_PATTERN[k % 32];
            }
        }
        true
    }

    /// Paints every plane white. Returns false if the device holds the buffer.
    pub fn clear(&mut self) -> bool {
        if !self.is_caller_owned() {
            return false;
        }
        for plane in self.planes.iter_mut() {
            plane.as_mut_slice().fill(0xff);
        }
        true
    }

    pub(crate) fn hand_to_device(&mut self) {
        self.owner = Owner::Device;
    }

    pub(crate) fn hand_to_caller(&mut self, bytes_used: Vec<u32>, sequence: u32) {
        self.owner = Owner::Caller;
        self.bytes_used = bytes_used;
        self.sequence = Some(sequence);
    }
}

/// A fixed set of buffers for one direction of the device.
///
/// Every buffer of a pool is mapped for as long as the pool lives; dropping the pool unmaps
/// them all.
pub struct BufferPool<M: PlaneMapping> {
    direction: Direction,
    requested: u32,
    buffers: Vec<Buffer<M>>,
}

impl<M: PlaneMapping> BufferPool<M> {
    /// Requests up to `requested` buffers from `device` and maps all their planes.
    ///
    /// Either every granted buffer is mapped, or nothing stays mapped and an error is returned.
    pub fn allocate<D>(
        device: &mut D,
        direction: Direction,
        field: FieldOrder,
        requested: u32,
    ) -> Result<Self, AllocationError>
    where
        D: M2mDevice<Mapping = M>,
    {
        let requested = requested.min(MAX_POOL_BUFFERS);

        let granted = device
            .request_buffers(direction, requested)
            .map_err(|source| AllocationError::Request { direction, source })?;
        log::debug!("{direction}: requested {requested} buffers, got {granted}");

        if granted == 0 {
            return Err(AllocationError::NoneGranted(direction));
        }
        // A driver should never hand out more than asked. Stick to what we can track.
        let granted = granted.min(requested);

        let mut buffers = Vec::with_capacity(granted as usize);
        for index in 0..granted {
            let layout = device
                .query_buffer(direction, index)
                .map_err(|source| AllocationError::Query {
                    direction,
                    index,
                    source,
                })?;

            if layout.is_empty() || layout.len() > MAX_PLANES {
                return Err(AllocationError::PlaneCount {
                    direction,
                    index,
                    planes: layout.len(),
                });
            }

            let mut planes = Vec::with_capacity(layout.len());
            for (plane, info) in layout.iter().enumerate() {
                log::trace!(
                    "{direction}: buffer {index} plane {plane}: offset 0x{:x} length {}",
                    info.mem_offset,
                    info.length
                );
                // On error, `planes` and `buffers` are dropped here, unmapping everything done
                // so far.
                let mapping = device
                    .map_plane(info)
                    .map_err(|source| AllocationError::Map {
                        direction,
                        index,
                        plane,
                        source,
                    })?;
                planes.push(mapping);
            }

            buffers.push(Buffer {
                index,
                field,
                bytes_used: vec![0; layout.len()],
                layout,
                planes,
                owner: Owner::Caller,
                sequence: None,
            });
        }

        Ok(Self {
            direction,
            requested,
            buffers,
        })
    }

    /// Unmaps every plane of `pool`. Passing `None` does nothing.
    pub fn free(pool: Option<Self>) {
        if let Some(pool) = pool {
            log::debug!(
                "{}: unmapping {} buffers",
                pool.direction,
                pool.buffers.len()
            );
            drop(pool);
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn requested(&self) -> u32 {
        self.requested
    }

    pub fn granted(&self) -> u32 {
        self.buffers.len() as u32
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&Buffer<M>> {
        self.buffers.get(index as usize)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Buffer<M>> {
        self.buffers.get_mut(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Buffer<M>> {
        self.buffers.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::DummyConfig;
    use crate::device::dummy::DummyDevice;
    use crate::device::Format;
    use crate::Fourcc;
    use crate::Resolution;

    fn configured(config: DummyConfig) -> DummyDevice {
        let mut device = DummyDevice::new(config);
        let format = Format::new(Resolution::from((128, 80)), Fourcc::YUYV, FieldOrder::None);
        device.set_format(Direction::Output, &format).unwrap();
        device.set_format(Direction::Capture, &format).unwrap();
        device
    }

    #[test]
    fn allocate_and_free() {
        let mut device = configured(DummyConfig::default());
        let probe = device.probe();

        let pool =
            BufferPool::allocate(&mut device, Direction::Output, FieldOrder::None, 4).unwrap();
        assert_eq!(pool.granted(), 4);
        assert_eq!(pool.requested(), 4);
        assert_eq!(probe.live_mappings(), 4);

        for (i, buffer) in pool.iter().enumerate() {
            assert_eq!(buffer.index(), i as u32);
            assert_eq!(buffer.num_planes(), 1);
            assert_eq!(buffer.plane_lengths(), vec![128 * 80 * 2]);
            assert!(buffer.is_caller_owned());
        }

        BufferPool::free(Some(pool));
        assert_eq!(probe.live_mappings(), 0);
        assert_eq!(probe.maps(), probe.unmaps());
    }

    #[test]
    fn free_nothing() {
        BufferPool::<crate::device::dummy::HeapPlane>::free(None);
    }

    #[test]
    fn request_is_clamped() {
        let mut device = configured(DummyConfig::default());
        let pool =
            BufferPool::allocate(&mut device, Direction::Capture, FieldOrder::None, 16).unwrap();
        assert_eq!(pool.requested(), MAX_POOL_BUFFERS);
        assert!(pool.granted() <= MAX_POOL_BUFFERS);
    }

    #[test]
    fn fewer_buffers_granted() {
        let mut device = configured(DummyConfig {
            max_buffers: 2,
            ..Default::default()
        });
        let pool =
            BufferPool::allocate(&mut device, Direction::Capture, FieldOrder::None, 4).unwrap();
        assert_eq!(pool.granted(), 2);
        assert!(pool.granted() <= pool.requested());
        assert!(pool.get(2).is_none());
    }

    #[test]
    fn nothing_granted_is_failure() {
        let mut device = configured(DummyConfig {
            max_buffers: 0,
            ..Default::default()
        });
        let probe = device.probe();
        let err = BufferPool::allocate(&mut device, Direction::Output, FieldOrder::None, 4)
            .err()
            .unwrap();
        assert!(matches!(err, AllocationError::NoneGranted(Direction::Output)));
        assert_eq!(probe.maps(), 0);
        assert_eq!(probe.live_mappings(), 0);
    }

    #[test]
    fn map_failure_unwinds() {
        let mut device = configured(DummyConfig {
            fail_map_at: Some(5),
            ..Default::default()
        });
        device
            .set_format(
                Direction::Output,
                &Format::new(
                    Resolution::from((128, 80)),
                    Fourcc::YUV420M,
                    FieldOrder::None,
                ),
            )
            .unwrap();
        let probe = device.probe();

        let err = BufferPool::allocate(&mut device, Direction::Output, FieldOrder::None, 4)
            .err()
            .unwrap();
        // Three planes per buffer: the sixth mapping is the third plane of buffer 1.
        assert!(matches!(
            err,
            AllocationError::Map {
                index: 1,
                plane: 2,
                ..
            }
        ));
        assert_eq!(probe.maps(), 5);
        assert_eq!(probe.live_mappings(), 0);
    }

    #[test]
    fn content_helpers() {
        let mut device = configured(DummyConfig::default());
        let mut pool =
            BufferPool::allocate(&mut device, Direction::Output, FieldOrder::None, 1).unwrap();
        let buffer = pool.get_mut(0).unwrap();

        assert!(buffer.fill_pattern());
        let plane = buffer.plane(0).unwrap();
        assert_eq!(&plane[..4], b"ABCD");
        assert_eq!(plane[26], b'1');
        assert_eq!(plane[31], b'6');
        assert_eq!(plane[32], b'A');

        assert!(buffer.clear());
        assert!(buffer.plane(0).unwrap().iter().all(|&b| b == 0xff));

        buffer.hand_to_device();
        assert!(buffer.plane(0).is_none());
        assert!(buffer.plane_mut(0).is_none());
        assert!(!buffer.fill_pattern());
        assert!(!buffer.clear());
    }
}
