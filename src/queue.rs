// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! One direction of an M2M device.
//!
//! A [`Queue`] owns the [`BufferPool`] of its direction and tracks which side holds each buffer.
//! It does not own the device: every operation borrows it, so both queues of a session can share
//! one device handle.

use thiserror::Error;

use crate::buffer::Buffer;
use crate::buffer::BufferPool;
use crate::device::DeviceError;
use crate::device::Direction;
use crate::device::M2mDevice;
use crate::device::PlaneMapping;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("{direction} buffer {index} does not exist")]
    InvalidIndex { direction: Direction, index: u32 },

    #[error("{direction} buffer {index} is held by the device")]
    NotCallerOwned { direction: Direction, index: u32 },

    #[error("failed to queue {direction} buffer {index}: {source}")]
    Submit {
        direction: Direction,
        index: u32,
        source: DeviceError,
    },

    #[error("failed to wait for a {direction} buffer: {source}")]
    Wait {
        direction: Direction,
        source: DeviceError,
    },

    #[error("failed to dequeue a {direction} buffer: {source}")]
    Dequeue {
        direction: Direction,
        source: DeviceError,
    },

    #[error("device returned {direction} buffer {index}, which it did not hold")]
    UnexpectedBuffer { direction: Direction, index: u32 },

    #[error("{0} queue started before all its buffers were queued once")]
    NotPrimed(Direction),

    #[error("failed to start {direction} queue: {source}")]
    StreamOn {
        direction: Direction,
        source: DeviceError,
    },
}

/// What a successful [`Queue::dequeue`] hands back to the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dequeued {
    /// Pool index of the buffer, which is now owned by the caller.
    pub index: u32,
    /// Value of the queue's sequence counter after this dequeue.
    pub sequence: u32,
    pub bytes_used: u64,
}

impl Dequeued {
    /// A buffer with no payload, which the device uses to signal the end of the stream.
    pub fn is_empty(&self) -> bool {
        self.bytes_used == 0
    }
}

pub struct Queue<M: PlaneMapping> {
    direction: Direction,
    pool: BufferPool<M>,
    /// Buffers that have been submitted at least once.
    primed: Vec<bool>,
    sequence: u32,
    streaming: bool,
}

impl<M: PlaneMapping> Queue<M> {
    pub fn new(pool: BufferPool<M>) -> Self {
        Self {
            direction: pool.direction(),
            primed: vec![false; pool.len()],
            pool,
            sequence: 0,
            streaming: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn pool(&self) -> &BufferPool<M> {
        &self.pool
    }

    pub fn num_buffers(&self) -> u32 {
        self.pool.granted()
    }

    /// Number of successful dequeues so far.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Whether every buffer of the pool went to the device at least once.
    pub fn is_primed(&self) -> bool {
        self.primed.iter().all(|&p| p)
    }

    pub fn num_queued(&self) -> usize {
        self.pool.iter().filter(|b| !b.is_caller_owned()).count()
    }

    pub fn buffer(&self, index: u32) -> Option<&Buffer<M>> {
        self.pool.get(index)
    }

    /// Buffer `index`, if it exists and the caller holds it.
    pub fn buffer_mut(&mut self, index: u32) -> Option<&mut Buffer<M>> {
        self.pool.get_mut(index).filter(|b| b.is_caller_owned())
    }

    /// Hands buffer `index` to the device.
    pub fn submit<D>(&mut self, device: &mut D, index: u32) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        let direction = self.direction;
        let buffer = self
            .pool
            .get_mut(index)
            .ok_or(QueueError::InvalidIndex { direction, index })?;

        if !buffer.is_caller_owned() {
            return Err(QueueError::NotCallerOwned { direction, index });
        }

        // Announce the whole plane as payload.
        let bytes_used = buffer.plane_lengths();
        device
            .queue_buffer(
                direction,
                index,
                buffer.field(),
                buffer.layout(),
                &bytes_used,
            )
            .map_err(|source| QueueError::Submit {
                direction,
                index,
                source,
            })?;

        buffer.hand_to_device();
        self.primed[index as usize] = true;
        log::trace!("{direction}: queued buffer {index}");

        Ok(())
    }

    /// Blocks until the device returns a buffer, and takes it back.
    ///
    /// The device is waited on before every attempt. Transient errors just lead to another
    /// wait, anything else is returned.
    pub fn dequeue<D>(&mut self, device: &mut D) -> Result<Dequeued, QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        let direction = self.direction;

        let dequeued = loop {
            device
                .wait_ready(direction)
                .map_err(|source| QueueError::Wait { direction, source })?;

            match device.dequeue_buffer(direction) {
                Ok(dequeued) => break dequeued,
                Err(err) if err.is_transient() => {
                    log::trace!("{direction}: dequeue not ready ({err}), waiting again");
                    continue;
                }
                Err(source) => return Err(QueueError::Dequeue { direction, source }),
            }
        };

        let index = dequeued.index;
        let buffer = match self.pool.get_mut(index) {
            Some(buffer) if !buffer.is_caller_owned() => buffer,
            _ => return Err(QueueError::UnexpectedBuffer { direction, index }),
        };

        self.sequence += 1;
        buffer.hand_to_caller(dequeued.bytes_used, self.sequence);
        let bytes_used = buffer.total_bytes_used();

        log::trace!(
            "{direction}: dequeued buffer {index}, sequence {} (driver {}), {bytes_used} bytes",
            self.sequence,
            dequeued.sequence
        );

        Ok(Dequeued {
            index,
            sequence: self.sequence,
            bytes_used,
        })
    }

    /// Starts streaming. Every buffer must have been submitted once before.
    pub fn start<D>(&mut self, device: &mut D) -> Result<(), QueueError>
    where
        D: M2mDevice<Mapping = M>,
    {
        let direction = self.direction;
        if !self.is_primed() {
            return Err(QueueError::NotPrimed(direction));
        }

        device
            .stream_on(direction)
            .map_err(|source| QueueError::StreamOn { direction, source })?;
        self.streaming = true;
        log::debug!("{direction}: streaming");

        Ok(())
    }

    pub fn into_pool(self) -> BufferPool<M> {
        self.pool
    }
}
