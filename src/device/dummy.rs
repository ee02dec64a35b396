// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A simulated M2M deinterlacer whose only purpose is to let the rest of the crate run so it
//! can be tested without hardware.
//!
//! The simulation processes one field job at a time, and only when a readiness wait or a
//! dequeue needs a completed buffer. Job `j` writes one CAPTURE buffer and reads the OUTPUT
//! buffer at position `j` (progressive), `j / 2` (2-field) or `(j + 1) / 2` (3-field) of the
//! resident inputs. In the field modes an input is released after every second job, which
//! leaves one extra input resident in 3-field mode.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use nix::errno::Errno;

use crate::device::DeintMode;
use crate::device::DeviceCaps;
use crate::device::DeviceError;
use crate::device::DequeuedBuffer;
use crate::device::Direction;
use crate::device::Format;
use crate::device::M2mDevice;
use crate::device::PlaneInfo;
use crate::device::PlaneMapping;
use crate::device::CAP_DEVICE_CAPS;
use crate::device::CAP_VIDEO_M2M_MPLANE;
use crate::device::CID_DEINT_MODE;
use crate::device::CID_MIN_BUFFERS_FOR_CAPTURE;
use crate::device::CID_MIN_BUFFERS_FOR_OUTPUT;
use crate::FieldOrder;
use crate::Fourcc;
use crate::Resolution;

#[derive(Clone, Debug)]
pub struct DummyConfig {
    /// Most buffers granted per queue.
    pub max_buffers: u32,
    /// Whether the device advertises `V4L2_CAP_VIDEO_M2M_MPLANE`.
    pub m2m_capable: bool,
    /// Encodings accepted by both queues. Anything else is replaced by YUYV.
    pub formats: Vec<Fourcc>,
    /// Answer every successful dequeue with one `EAGAIN` first.
    pub transient_dequeue: bool,
    /// Fail the plane mapping performed after this many successful ones.
    pub fail_map_at: Option<usize>,
    /// Fail the dequeue of `direction` performed after this many successful ones.
    pub fail_dequeue_at: Option<(Direction, usize)>,
    /// Answer the dequeue of `direction` performed after this many successful ones with a
    /// single `EIO`, as for a job the driver aborted.
    pub abort_dequeue_at: Option<(Direction, usize)>,
    pub min_buffers_for_capture: i32,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            max_buffers: 4,
            m2m_capable: true,
            formats: vec![
                Fourcc::YUYV,
                Fourcc::UYVY,
                Fourcc::NV12M,
                Fourcc::NV21M,
                Fourcc::NV16M,
                Fourcc::NV61M,
                Fourcc::YUV420M,
            ],
            transient_dequeue: false,
            fail_map_at: None,
            fail_dequeue_at: None,
            abort_dequeue_at: None,
            min_buffers_for_capture: 1,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    live_mappings: usize,
    maps: usize,
    unmaps: usize,
    closes: usize,
    buffer_requests: usize,
    output_dequeues: usize,
    capture_dequeues: usize,
}

/// Shared view on what a [`DummyDevice`] has been through. Stays readable after the device is
/// gone.
#[derive(Clone, Debug, Default)]
pub struct DummyProbe(Rc<RefCell<Counters>>);

impl DummyProbe {
    pub fn live_mappings(&self) -> usize {
        self.0.borrow().live_mappings
    }

    pub fn maps(&self) -> usize {
        self.0.borrow().maps
    }

    pub fn unmaps(&self) -> usize {
        self.0.borrow().unmaps
    }

    pub fn closes(&self) -> usize {
        self.0.borrow().closes
    }

    pub fn buffer_requests(&self) -> usize {
        self.0.borrow().buffer_requests
    }

    pub fn dequeues(&self, direction: Direction) -> usize {
        let counters = self.0.borrow();
        match direction {
            Direction::Output => counters.output_dequeues,
            Direction::Capture => counters.capture_dequeues,
        }
    }
}

/// Heap memory standing in for a mapped plane.
pub struct HeapPlane {
    data: Vec<u8>,
    probe: DummyProbe,
}

impl PlaneMapping for HeapPlane {
    fn as_slice(&self) -> &[u8] {
        &self.data
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl Drop for HeapPlane {
    fn drop(&mut self) {
        let mut counters = self.probe.0.borrow_mut();
        counters.live_mappings -= 1;
        counters.unmaps += 1;
    }
}

#[derive(Default)]
struct DummyQueue {
    format: Option<Format>,
    plane_sizes: Vec<u32>,
    num_buffers: u32,
    device_owned: Vec<bool>,
    /// Buffers waiting to be processed, in submission order.
    queued: VecDeque<u32>,
    done: VecDeque<DequeuedBuffer>,
    streaming: bool,
    sequence: u32,
    dequeues: usize,
    /// An `EAGAIN` is owed before the next successful dequeue.
    owes_eagain: bool,
    /// The injected `EIO` was already returned.
    aborted: bool,
}

impl DummyQueue {
    fn complete(&mut self, index: u32, field: FieldOrder) {
        self.done.push_back(DequeuedBuffer {
            index,
            bytes_used: self.plane_sizes.clone(),
            sequence: self.sequence,
            field: field as u32,
        });
        self.sequence += 1;
    }
}

pub struct DummyDevice {
    config: DummyConfig,
    probe: DummyProbe,
    output: DummyQueue,
    capture: DummyQueue,
    pending_mode: DeintMode,
    applied_mode: DeintMode,
    /// Field jobs run since streaming started.
    jobs: u64,
    /// Position of the oldest resident input among all inputs ever queued.
    input_base: u64,
}

impl DummyDevice {
    pub fn new(config: DummyConfig) -> Self {
        log::debug!("dummy: opening simulated deinterlacer");
        Self {
            config,
            probe: Default::default(),
            output: Default::default(),
            capture: Default::default(),
            pending_mode: DeintMode::Progressive,
            applied_mode: DeintMode::Progressive,
            jobs: 0,
            input_base: 0,
        }
    }

    pub fn probe(&self) -> DummyProbe {
        self.probe.clone()
    }

    fn queue(&self, direction: Direction) -> &DummyQueue {
        match direction {
            Direction::Output => &self.output,
            Direction::Capture => &self.capture,
        }
    }

    fn queue_mut(&mut self, direction: Direction) -> &mut DummyQueue {
        match direction {
            Direction::Output => &mut self.output,
            Direction::Capture => &mut self.capture,
        }
    }

    /// Size of each plane, or `None` if a plane would not fit in 32 bits.
    fn plane_sizes(fourcc: Fourcc, resolution: Resolution) -> Option<Vec<u32>> {
        let luma = resolution.width.checked_mul(resolution.height)?;
        Some(match fourcc {
            Fourcc::NV12M | Fourcc::NV21M => vec![luma, luma / 2],
            Fourcc::NV16M | Fourcc::NV61M => vec![luma, luma],
            Fourcc::YUV420M => vec![luma, luma / 4, luma / 4],
            _ => vec![luma.checked_mul(2)?],
        })
    }

    /// Where each plane of buffer `index` lives in the fake offset space of `base`, or `None`
    /// if the layout overflows it.
    fn plane_layout(plane_sizes: &[u32], base: u32, index: u32) -> Option<Vec<PlaneInfo>> {
        let stride = plane_sizes
            .iter()
            .try_fold(0u32, |total, &length| total.checked_add(length))?
            .checked_next_multiple_of(4096)?;
        let mut offset = index.checked_mul(stride)?.checked_add(base)?;

        plane_sizes
            .iter()
            .map(|&length| {
                let plane = PlaneInfo {
                    length,
                    mem_offset: offset,
                };
                offset = offset.checked_add(length.checked_next_multiple_of(4096)?)?;
                Some(plane)
            })
            .collect()
    }

    /// Index of the input that field job `job` reads, given the current mode.
    fn input_for_job(&self, job: u64) -> u64 {
        match self.applied_mode {
            DeintMode::Progressive => job,
            DeintMode::Adaptive2d3d | DeintMode::Fixed3d => (job + 1) / 2,
            DeintMode::Fixed2d | DeintMode::PreviousField | DeintMode::NextField => job / 2,
        }
    }

    /// Runs one field job. Returns false if the job cannot run yet.
    fn run_job(&mut self) -> bool {
        if !(self.output.streaming && self.capture.streaming) {
            return false;
        }

        let Some(position) = self.input_for_job(self.jobs).checked_sub(self.input_base) else {
            return false;
        };
        if position >= self.output.queued.len() as u64 || self.capture.queued.is_empty() {
            return false;
        }

        if let Some(index) = self.capture.queued.pop_front() {
            self.capture.complete(index, FieldOrder::None);
        }

        let release = match self.applied_mode {
            DeintMode::Progressive => true,
            _ => self.jobs % 2 == 1,
        };
        if release {
            let field = self
                .output
                .format
                .map(|f| f.field)
                .unwrap_or(FieldOrder::None);
            if let Some(index) = self.output.queued.pop_front() {
                self.output.complete(index, field);
                self.input_base += 1;
            }
        }

        log::trace!(
            "dummy: job {} done (mode {}, released input: {release})",
            self.jobs,
            self.applied_mode
        );
        self.jobs += 1;
        true
    }

    /// Runs jobs until `direction` has a completed buffer or nothing can progress.
    fn process_until_done(&mut self, direction: Direction) -> bool {
        while self.queue(direction).done.is_empty() {
            if !self.run_job() {
                return false;
            }
        }
        true
    }
}

impl Drop for DummyDevice {
    fn drop(&mut self) {
        log::debug!("dummy: closing simulated deinterlacer");
        self.probe.0.borrow_mut().closes += 1;
    }
}

impl M2mDevice for DummyDevice {
    type Mapping = HeapPlane;

    fn capabilities(&mut self) -> Result<DeviceCaps, DeviceError> {
        let device_caps = if self.config.m2m_capable {
            CAP_VIDEO_M2M_MPLANE
        } else {
            0
        };
        Ok(DeviceCaps {
            driver: "dummy-deint".into(),
            card: "Simulated deinterlacer".into(),
            bus_info: "platform:dummy-deint".into(),
            capabilities: device_caps | CAP_DEVICE_CAPS,
            device_caps,
        })
    }

    fn set_format(
        &mut self,
        direction: Direction,
        format: &Format,
    ) -> Result<Format, DeviceError> {
        let fourcc = if self.config.formats.contains(&format.fourcc) {
            format.fourcc
        } else {
            Fourcc::YUYV
        };
        let field = match (direction, format.field) {
            (Direction::Capture, _) | (Direction::Output, FieldOrder::Any) => FieldOrder::None,
            (Direction::Output, field) => field,
        };

        let queue = self.queue_mut(direction);
        if queue.num_buffers > 0 {
            return Err(DeviceError::ioctl("VIDIOC_S_FMT", Errno::EBUSY));
        }

        let plane_sizes = Self::plane_sizes(fourcc, format.resolution)
            .ok_or(DeviceError::ioctl("VIDIOC_S_FMT", Errno::EINVAL))?;
        let accepted = Format {
            resolution: format.resolution,
            fourcc,
            field,
            num_planes: plane_sizes.len() as u32,
        };
        queue.format = Some(accepted);
        queue.plane_sizes = plane_sizes;

        Ok(accepted)
    }

    fn request_buffers(&mut self, direction: Direction, count: u32) -> Result<u32, DeviceError> {
        self.probe.0.borrow_mut().buffer_requests += 1;

        let max_buffers = self.config.max_buffers;
        let queue = self.queue_mut(direction);
        if queue.streaming {
            return Err(DeviceError::ioctl("VIDIOC_REQBUFS", Errno::EBUSY));
        }
        if queue.format.is_none() {
            return Err(DeviceError::ioctl("VIDIOC_REQBUFS", Errno::EINVAL));
        }

        let granted = count.min(max_buffers);
        queue.num_buffers = granted;
        queue.device_owned = vec![false; granted as usize];
        queue.queued.clear();
        queue.done.clear();

        Ok(granted)
    }

    fn query_buffer(
        &mut self,
        direction: Direction,
        index: u32,
    ) -> Result<Vec<PlaneInfo>, DeviceError> {
        let queue = self.queue(direction);
        if index >= queue.num_buffers {
            return Err(DeviceError::ioctl("VIDIOC_QUERYBUF", Errno::EINVAL));
        }

        let base: u32 = match direction {
            Direction::Output => 0,
            Direction::Capture => 0x4000_0000,
        };
        Self::plane_layout(&queue.plane_sizes, base, index)
            .ok_or(DeviceError::ioctl("VIDIOC_QUERYBUF", Errno::EINVAL))
    }

    fn map_plane(&mut self, plane: &PlaneInfo) -> Result<HeapPlane, DeviceError> {
        let mut counters = self.probe.0.borrow_mut();
        if self.config.fail_map_at == Some(counters.maps) {
            return Err(DeviceError::Mmap {
                offset: plane.mem_offset,
                length: plane.length,
                errno: Errno::ENOMEM,
            });
        }
        counters.maps += 1;
        counters.live_mappings += 1;
        drop(counters);

        Ok(HeapPlane {
            data: vec![0; plane.length as usize],
            probe: self.probe.clone(),
        })
    }

    fn queue_buffer(
        &mut self,
        direction: Direction,
        index: u32,
        _field: FieldOrder,
        planes: &[PlaneInfo],
        bytes_used: &[u32],
    ) -> Result<(), DeviceError> {
        let queue = self.queue_mut(direction);
        let einval = DeviceError::ioctl("VIDIOC_QBUF", Errno::EINVAL);

        if index >= queue.num_buffers
            || planes.len() != queue.plane_sizes.len()
            || bytes_used.len() != planes.len()
        {
            return Err(einval);
        }
        if queue.device_owned[index as usize] {
            return Err(einval);
        }
        if bytes_used.iter().zip(planes).any(|(used, p)| used > &p.length) {
            return Err(einval);
        }

        queue.device_owned[index as usize] = true;
        queue.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self, direction: Direction) -> Result<DequeuedBuffer, DeviceError> {
        if !self.queue(direction).streaming {
            return Err(DeviceError::ioctl("VIDIOC_DQBUF", Errno::EINVAL));
        }
        if let Some((fail_direction, at)) = self.config.fail_dequeue_at {
            if fail_direction == direction && self.queue(direction).dequeues == at {
                return Err(DeviceError::ioctl("VIDIOC_DQBUF", Errno::EPIPE));
            }
        }
        if let Some((abort_direction, at)) = self.config.abort_dequeue_at {
            let queue = self.queue_mut(direction);
            if abort_direction == direction && queue.dequeues == at && !queue.aborted {
                queue.aborted = true;
                return Err(DeviceError::ioctl("VIDIOC_DQBUF", Errno::EIO));
            }
        }

        let transient = self.config.transient_dequeue;
        let queue = self.queue_mut(direction);
        if queue.owes_eagain {
            queue.owes_eagain = false;
            return Err(DeviceError::ioctl("VIDIOC_DQBUF", Errno::EAGAIN));
        }

        if !self.process_until_done(direction) {
            return Err(DeviceError::ioctl("VIDIOC_DQBUF", Errno::EAGAIN));
        }

        let queue = self.queue_mut(direction);
        let Some(buffer) = queue.done.pop_front() else {
            return Err(DeviceError::ioctl("VIDIOC_DQBUF", Errno::EAGAIN));
        };
        queue.device_owned[buffer.index as usize] = false;
        queue.dequeues += 1;
        queue.owes_eagain = transient;

        let mut counters = self.probe.0.borrow_mut();
        match direction {
            Direction::Output => counters.output_dequeues += 1,
            Direction::Capture => counters.capture_dequeues += 1,
        }

        Ok(buffer)
    }

    fn stream_on(&mut self, direction: Direction) -> Result<(), DeviceError> {
        let queue = self.queue_mut(direction);
        if queue.num_buffers == 0 {
            return Err(DeviceError::ioctl("VIDIOC_STREAMON", Errno::EINVAL));
        }
        queue.streaming = true;

        if self.output.streaming && self.capture.streaming {
            // The mode is latched when the whole pipeline starts.
            self.applied_mode = self.pending_mode;
            self.jobs = 0;
            self.input_base = 0;
            log::debug!("dummy: streaming in mode {}", self.applied_mode);
        }
        Ok(())
    }

    fn get_control(&mut self, id: u32) -> Result<i32, DeviceError> {
        match id {
            CID_DEINT_MODE => Ok(self.applied_mode as i32),
            CID_MIN_BUFFERS_FOR_CAPTURE => Ok(self.config.min_buffers_for_capture),
            CID_MIN_BUFFERS_FOR_OUTPUT => Err(DeviceError::ioctl("VIDIOC_G_CTRL", Errno::EINVAL)),
            _ => Err(DeviceError::ioctl("VIDIOC_G_CTRL", Errno::EINVAL)),
        }
    }

    fn set_control(&mut self, id: u32, value: i32) -> Result<(), DeviceError> {
        match id {
            CID_DEINT_MODE => {
                let mode = DeintMode::n(value)
                    .ok_or(DeviceError::ioctl("VIDIOC_S_CTRL", Errno::ERANGE))?;
                self.pending_mode = mode;
                if self.output.streaming && self.capture.streaming {
                    self.applied_mode = mode;
                }
                Ok(())
            }
            _ => Err(DeviceError::ioctl("VIDIOC_S_CTRL", Errno::EINVAL)),
        }
    }

    fn wait_ready(&mut self, direction: Direction) -> Result<(), DeviceError> {
        if self.process_until_done(direction) {
            Ok(())
        } else {
            Err(DeviceError::Stalled(direction))
        }
    }
}
