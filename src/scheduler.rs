// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Drives a session through a number of frames, following the dequeue and requeue cadence of
//! the active deinterlacing mode.
//!
//! The device keeps a mode dependent number of input fields resident:
//!
//! * Progressive: one CAPTURE buffer per OUTPUT buffer.
//! * Three fields: the first input stays with the device for one extra cycle. The first frame
//!   yields one CAPTURE buffer and no OUTPUT buffer, every later frame one OUTPUT buffer and
//!   two CAPTURE buffers.
//! * Two fields: two CAPTURE buffers per input. The OUTPUT buffer is only taken back once both
//!   were retrieved.
//!
//! On the last frame every buffer is dequeued but none is handed back to the device.

use thiserror::Error;

use crate::device::DeintMode;
use crate::device::Direction;
use crate::device::M2mDevice;
use crate::session::Session;
use crate::session::SessionError;

/// Dequeue pattern of a deinterlacing mode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Cadence {
    Progressive,
    ThreeField,
    TwoField,
}

impl From<DeintMode> for Cadence {
    fn from(mode: DeintMode) -> Self {
        match mode {
            DeintMode::Progressive => Cadence::Progressive,
            DeintMode::Adaptive2d3d | DeintMode::Fixed3d => Cadence::ThreeField,
            DeintMode::Fixed2d | DeintMode::PreviousField | DeintMode::NextField => {
                Cadence::TwoField
            }
        }
    }
}

impl Cadence {
    /// OUTPUT and CAPTURE dequeues a run of `num_frames` frames performs.
    pub fn expected_dequeues(&self, num_frames: u32) -> (u32, u32) {
        match self {
            Cadence::Progressive => (num_frames, num_frames),
            Cadence::TwoField => (num_frames, 2 * num_frames),
            Cadence::ThreeField => match num_frames {
                0 => (0, 0),
                n => (n - 1, 2 * (n - 1) + 1),
            },
        }
    }

    /// Queues to take a buffer from, in order, for frame `frame` (counted from 1).
    fn steps(&self, frame: u32) -> &'static [Direction] {
        use Direction::*;

        match self {
            Cadence::Progressive => &[Output, Capture],
            Cadence::ThreeField if frame == 1 => &[Capture],
            Cadence::ThreeField => &[Output, Capture, Capture],
            Cadence::TwoField => &[Capture, Capture, Output],
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Buffers are being submitted for the first time.
    Priming,
    /// Both queues are active.
    Streaming,
    /// Processing the last frame. Nothing is resubmitted anymore.
    Draining,
    Done { failed: bool },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cannot {operation} while {state:?}")]
    WrongState {
        operation: &'static str,
        state: SchedulerState,
    },

    #[error("{direction} buffer {index} is not available for priming")]
    Unavailable { direction: Direction, index: u32 },

    #[error("failed to prime queues: {0}")]
    Prime(SessionError),

    #[error("failed to start streaming: {0}")]
    Start(SessionError),

    #[error("frame {frame}: {source}")]
    Frame { frame: u32, source: SessionError },
}

/// What a completed run went through.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    pub frames: u32,
    pub output_dequeues: u32,
    pub capture_dequeues: u32,
    /// Sequence numbers of the OUTPUT dequeues, in order.
    pub output_sequences: Vec<u32>,
    /// Sequence numbers of the CAPTURE dequeues, in order.
    pub capture_sequences: Vec<u32>,
    /// CAPTURE buffers that came back without payload.
    pub empty_captures: u32,
}

pub struct FrameScheduler {
    cadence: Cadence,
    num_frames: u32,
    state: SchedulerState,
    report: RunReport,
}

impl FrameScheduler {
    pub fn new(cadence: Cadence, num_frames: u32) -> Self {
        Self {
            cadence,
            num_frames,
            state: SchedulerState::Priming,
            report: Default::default(),
        }
    }

    pub fn cadence(&self) -> Cadence {
        self.cadence
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    fn expect_state(
        &mut self,
        expected: SchedulerState,
        operation: &'static str,
    ) -> Result<(), SchedulerError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SchedulerError::WrongState {
                operation,
                state: self.state,
            })
        }
    }

    fn fail<T>(&mut self, err: SchedulerError) -> Result<T, SchedulerError> {
        log::error!("{err}");
        self.state = SchedulerState::Done { failed: true };
        Err(err)
    }

    /// Fills every OUTPUT buffer with the test pattern, clears every CAPTURE buffer and
    /// submits them all once.
    pub fn prime<D: M2mDevice>(&mut self, session: &mut Session<D>) -> Result<(), SchedulerError> {
        self.expect_state(SchedulerState::Priming, "prime")?;

        for direction in [Direction::Output, Direction::Capture] {
            for index in 0..session.queue(direction).num_buffers() {
                let Some(buffer) = session.buffer_mut(direction, index) else {
                    return self.fail(SchedulerError::Unavailable { direction, index });
                };
                match direction {
                    Direction::Output => buffer.fill_pattern(),
                    Direction::Capture => buffer.clear(),
                };

                if let Err(err) = session.submit(direction, index) {
                    return self.fail(SchedulerError::Prime(err));
                }
            }
        }

        log::debug!(
            "primed {} OUTPUT and {} CAPTURE buffers",
            session.queue(Direction::Output).num_queued(),
            session.queue(Direction::Capture).num_queued()
        );
        Ok(())
    }

    /// Starts the OUTPUT queue, then the CAPTURE queue.
    pub fn start<D: M2mDevice>(&mut self, session: &mut Session<D>) -> Result<(), SchedulerError> {
        self.expect_state(SchedulerState::Priming, "start")?;

        for direction in [Direction::Output, Direction::Capture] {
            if let Err(err) = session.stream_on(direction) {
                return self.fail(SchedulerError::Start(err));
            }
        }

        self.state = SchedulerState::Streaming;
        Ok(())
    }

    /// Runs every scheduled frame. The first failure aborts the run.
    pub fn run<D: M2mDevice>(
        &mut self,
        session: &mut Session<D>,
    ) -> Result<RunReport, SchedulerError> {
        self.expect_state(SchedulerState::Streaming, "run")?;
        log::debug!(
            "running {} frames with {:?} cadence",
            self.num_frames,
            self.cadence
        );

        for frame in 1..=self.num_frames {
            let last = frame == self.num_frames;
            if last {
                self.state = SchedulerState::Draining;
            }

            if let Err(source) = self.run_frame(session, frame, !last) {
                return self.fail(SchedulerError::Frame { frame, source });
            }
            self.report.frames = frame;
        }

        self.state = SchedulerState::Done { failed: false };
        Ok(std::mem::take(&mut self.report))
    }

    fn run_frame<D: M2mDevice>(
        &mut self,
        session: &mut Session<D>,
        frame: u32,
        requeue: bool,
    ) -> Result<(), SessionError> {
        for &direction in self.cadence.steps(frame) {
            self.cycle(session, direction, requeue)?;
        }
        Ok(())
    }

    /// Takes one buffer back from `direction` and, if `requeue` is set, refills and resubmits
    /// it.
    fn cycle<D: M2mDevice>(
        &mut self,
        session: &mut Session<D>,
        direction: Direction,
        requeue: bool,
    ) -> Result<(), SessionError> {
        let dequeued = session.dequeue(direction)?;

        match direction {
            Direction::Output => {
                self.report.output_dequeues += 1;
                self.report.output_sequences.push(dequeued.sequence);
            }
            Direction::Capture => {
                self.report.capture_dequeues += 1;
                self.report.capture_sequences.push(dequeued.sequence);
                if dequeued.is_empty() {
                    log::debug!("CAPTURE buffer {} carries no payload", dequeued.index);
                    self.report.empty_captures += 1;
                } else if log::log_enabled!(log::Level::Trace) {
                    if let Some(plane) = session
                        .buffer(direction, dequeued.index)
                        .and_then(|b| b.plane(0))
                    {
                        log::trace!(
                            "CAPTURE buffer {} sequence {}: crc32 {:08x}",
                            dequeued.index,
                            dequeued.sequence,
                            crc32fast::hash(plane)
                        );
                    }
                }
            }
        }

        if !requeue {
            return Ok(());
        }

        if let Some(buffer) = session.buffer_mut(direction, dequeued.index) {
            match direction {
                Direction::Output => buffer.fill_pattern(),
                Direction::Capture => buffer.clear(),
            };
        }
        session.submit(direction, dequeued.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::dummy::DummyConfig;
    use crate::device::dummy::DummyDevice;
    use crate::device::dummy::DummyProbe;
    use crate::queue::QueueError;
    use crate::session::SessionParams;
    use crate::FieldOrder;

    fn session(config: DummyConfig, mode: DeintMode) -> (Session<DummyDevice>, DummyProbe) {
        let device = DummyDevice::new(config);
        let probe = device.probe();
        let params = SessionParams {
            output_field: if mode == DeintMode::Progressive {
                FieldOrder::None
            } else {
                FieldOrder::Interlaced
            },
            ..Default::default()
        };
        let mut session = Session::new(device, &params).unwrap();
        session.set_deint_mode(mode).unwrap();
        (session, probe)
    }

    fn run(
        config: DummyConfig,
        mode: DeintMode,
        num_frames: u32,
    ) -> (Result<RunReport, SchedulerError>, FrameScheduler, DummyProbe) {
        let (mut session, probe) = session(config, mode);
        let mut scheduler = FrameScheduler::new(Cadence::from(mode), num_frames);
        scheduler.prime(&mut session).unwrap();
        scheduler.start(&mut session).unwrap();
        let report = scheduler.run(&mut session);
        session.close();
        (report, scheduler, probe)
    }

    #[test]
    fn progressive() {
        let (report, scheduler, probe) = run(Default::default(), DeintMode::Progressive, 6);
        let report = report.unwrap();

        assert_eq!(report.frames, 6);
        assert_eq!(report.output_dequeues, 6);
        assert_eq!(report.capture_dequeues, 6);
        assert_eq!(report.capture_sequences, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(report.output_sequences, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(report.empty_captures, 0);
        assert_eq!(scheduler.state(), SchedulerState::Done { failed: false });
        assert_eq!(probe.dequeues(Direction::Capture), 6);
        assert_eq!(probe.live_mappings(), 0);
    }

    #[test]
    fn two_field() {
        for mode in [
            DeintMode::Fixed2d,
            DeintMode::PreviousField,
            DeintMode::NextField,
        ] {
            let (report, _, _) = run(Default::default(), mode, 10);
            let report = report.unwrap();
            assert_eq!(report.output_dequeues, 10);
            assert_eq!(report.capture_dequeues, 20);
            assert_eq!(report.capture_sequences, (1..=20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn three_field() {
        for mode in [DeintMode::Adaptive2d3d, DeintMode::Fixed3d] {
            let (report, _, _) = run(Default::default(), mode, 10);
            let report = report.unwrap();
            assert_eq!(report.output_dequeues, 9);
            assert_eq!(report.capture_dequeues, 19);
            assert_eq!(report.output_sequences, (1..=9).collect::<Vec<_>>());
        }
    }

    #[test]
    fn counts_match_cadence() {
        for mode in DeintMode::INTERLACED
            .into_iter()
            .chain([DeintMode::Progressive])
        {
            for num_frames in [1, 2, 5, 30] {
                let (report, _, _) = run(Default::default(), mode, num_frames);
                let report = report.unwrap();
                let expected = Cadence::from(mode).expected_dequeues(num_frames);
                assert_eq!(
                    (report.output_dequeues, report.capture_dequeues),
                    expected,
                    "{mode} with {num_frames} frames"
                );
            }
        }
    }

    #[test]
    fn transient_errors_do_not_change_counts() {
        for mode in [
            DeintMode::Progressive,
            DeintMode::Fixed3d,
            DeintMode::NextField,
        ] {
            let (plain, _, _) = run(Default::default(), mode, 8);
            let config = DummyConfig {
                transient_dequeue: true,
                ..Default::default()
            };
            let (transient, _, _) = run(config, mode, 8);
            assert_eq!(plain.unwrap(), transient.unwrap());
        }
    }

    #[test]
    fn aborted_job_does_not_change_counts() {
        for (mode, direction) in [
            (DeintMode::Progressive, Direction::Capture),
            (DeintMode::Fixed3d, Direction::Capture),
            (DeintMode::NextField, Direction::Output),
        ] {
            let (plain, _, _) = run(Default::default(), mode, 8);
            let config = DummyConfig {
                abort_dequeue_at: Some((direction, 2)),
                ..Default::default()
            };
            let (aborted, scheduler, probe) = run(config, mode, 8);
            assert_eq!(plain.unwrap(), aborted.unwrap());
            assert_eq!(scheduler.state(), SchedulerState::Done { failed: false });
            assert_eq!(probe.live_mappings(), 0);
        }
    }

    #[test]
    fn failure_aborts_run() {
        let config = DummyConfig {
            fail_dequeue_at: Some((Direction::Capture, 3)),
            ..Default::default()
        };
        let (report, scheduler, probe) = run(config, DeintMode::Progressive, 10);

        assert!(matches!(
            report,
            Err(SchedulerError::Frame {
                frame: 4,
                source: SessionError::Queue(QueueError::Dequeue {
                    direction: Direction::Capture,
                    ..
                }),
            })
        ));
        assert_eq!(scheduler.state(), SchedulerState::Done { failed: true });
        assert_eq!(probe.live_mappings(), 0);
        assert_eq!(probe.closes(), 1);
    }

    #[test]
    fn mode_verified_after_start() {
        let (mut session, _probe) = session(Default::default(), DeintMode::Fixed3d);
        assert_eq!(session.deint_mode().unwrap(), DeintMode::Progressive);

        let mut scheduler = FrameScheduler::new(Cadence::ThreeField, 2);
        scheduler.prime(&mut session).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Priming);
        scheduler.start(&mut session).unwrap();
        assert_eq!(scheduler.state(), SchedulerState::Streaming);
        assert_eq!(session.deint_mode().unwrap(), DeintMode::Fixed3d);
    }

    #[test]
    fn out_of_order_calls() {
        let (mut session, _probe) = session(Default::default(), DeintMode::Progressive);
        let mut scheduler = FrameScheduler::new(Cadence::Progressive, 2);

        assert!(matches!(
            scheduler.run(&mut session),
            Err(SchedulerError::WrongState {
                operation: "run",
                state: SchedulerState::Priming,
            })
        ));

        // Starting without priming is refused by the queues.
        assert!(matches!(
            scheduler.start(&mut session),
            Err(SchedulerError::Start(SessionError::Queue(
                QueueError::NotPrimed(Direction::Output)
            )))
        ));
        assert_eq!(scheduler.state(), SchedulerState::Done { failed: true });
    }

    #[test]
    fn last_frame_buffers_stay_with_caller() {
        let (mut session, _probe) = session(Default::default(), DeintMode::Progressive);
        let mut scheduler = FrameScheduler::new(Cadence::Progressive, 1);
        scheduler.prime(&mut session).unwrap();

        let output = session.buffer(Direction::Output, 0).unwrap();
        assert!(output.plane(0).is_none());

        scheduler.start(&mut session).unwrap();
        scheduler.run(&mut session).unwrap();

        // Last frame: buffers stay with the caller.
        let output = session.buffer(Direction::Output, 0).unwrap();
        assert_eq!(&output.plane(0).unwrap()[..4], b"ABCD");
        let capture = session.buffer(Direction::Capture, 0).unwrap();
        assert!(capture.plane(0).unwrap().iter().all(|&b| b == 0xff));
    }
}
