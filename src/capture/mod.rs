//! Multi-side capture state machine.
//!
//! One object on the staging area, `images_per_object` sides per object. Each
//! tick reads a frame, publishes it as live preview and reacts:
//!
//! ```text
//! IdleWaitObject/SideArmed --motion--> Settle --shot--> CapturedSide
//! CapturedSide --object complete--> flush, IdleWaitObject (next object id)
//! CapturedSide --more sides--> AwaitNextSide
//! AwaitNextSide --stable && distinct--> SideArmed (retake drops the last side)
//! AwaitNextSide --side timeout--> side discarded, SideArmed/IdleWaitObject
//! any --inactivity timeout--> EscalateWaiting --resume--> previous phase
//! any --frame read failure--> TerminalError
//! ```
//!
//! A completed object is flushed immediately but stays buffered until the
//! first side of the next object is accepted, so a full-object retake can
//! still withdraw it.

mod supervisor;

pub use supervisor::{run_capture, CaptureSupervisor};

use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::clock::{Clock, SystemClock};
use crate::config::CaptureConfig;
use crate::error::CaptureError;
use crate::frame::Frame;
use crate::ingest::FrameSource;
use crate::input::{retake_mailbox, RetakeMailbox, RetakeSender};
use crate::notify::{Notifier, SilentNotifier};
use crate::remote::{NullChannel, RemoteChannel};
use crate::session::{CompletedObject, ObjectSession};
use crate::sink::ImageSink;
use crate::state::{status_cell, CaptureStatus, RemoteState, ResumeWait, StatusHandle, StatusOwner};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapturePhase {
    IdleWaitObject,
    SideArmed,
    Settle,
    CapturedSide,
    AwaitNextSide,
    EscalateWaiting,
    TerminalError,
}

/// Something that happened during one tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureEvent {
    SideAccepted { object_id: u64, side: usize },
    /// The object was turned and has settled; the next side is armed.
    NextSideReady { object_id: u64, side: usize },
    SideTimedOut { object_id: u64, side: usize },
    SideRetaken { object_id: u64, side: usize },
    ObjectCompleted { object_id: u64, sides: usize },
    ObjectRetaken { object_id: u64 },
    Escalated,
    Resumed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub sides_accepted: u64,
    pub sides_timed_out: u64,
    pub retakes: u64,
    pub objects_completed: u64,
    pub escalations: u64,
}

impl RunSummary {
    fn record(&mut self, events: &[CaptureEvent]) {
        self.ticks += 1;
        for event in events {
            match event {
                CaptureEvent::SideAccepted { .. } => self.sides_accepted += 1,
                CaptureEvent::SideTimedOut { .. } => self.sides_timed_out += 1,
                CaptureEvent::SideRetaken { .. } | CaptureEvent::ObjectRetaken { .. } => {
                    self.retakes += 1
                }
                CaptureEvent::ObjectCompleted { .. } => self.objects_completed += 1,
                CaptureEvent::Escalated => self.escalations += 1,
                _ => {}
            }
        }
    }
}

enum NextSide {
    Ready,
    TimedOut,
    Retaken,
    Cancelled,
}

pub struct CaptureStateMachine {
    config: CaptureConfig,
    source: Box<dyn FrameSource>,
    sink: Box<dyn ImageSink>,
    channel: Box<dyn RemoteChannel>,
    notifier: Box<dyn Notifier>,
    clock: Box<dyn Clock>,
    status: StatusOwner,
    retakes: RetakeMailbox,
    retake_sender: RetakeSender,
    shutdown: Arc<AtomicBool>,
    phase: CapturePhase,
    session: ObjectSession,
    buffered: Option<CompletedObject>,
    baseline: Option<Frame>,
    /// Set once the object has been turned to its next side; a retake then
    /// drops the last accepted side.
    next_side_armed: bool,
    last_capture: Instant,
    released: bool,
    summary: RunSummary,
}

impl CaptureStateMachine {
    pub fn new(
        config: CaptureConfig,
        source: Box<dyn FrameSource>,
        sink: Box<dyn ImageSink>,
    ) -> Self {
        let (status, _) = status_cell(RemoteState::default());
        let (retake_sender, retakes) = retake_mailbox();
        let clock: Box<dyn Clock> = Box::new(SystemClock);
        let last_capture = clock.now();
        let session = ObjectSession::new(0, config.images_per_object);
        Self {
            config,
            source,
            sink,
            channel: Box::new(NullChannel),
            notifier: Box::new(SilentNotifier),
            clock,
            status,
            retakes,
            retake_sender,
            shutdown: Arc::new(AtomicBool::new(false)),
            phase: CapturePhase::IdleWaitObject,
            session,
            buffered: None,
            baseline: None,
            next_side_armed: false,
            last_capture,
            released: false,
            summary: RunSummary::default(),
        }
    }

    pub fn with_channel(mut self, channel: Box<dyn RemoteChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.last_capture = clock.now();
        self.clock = clock;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Start numbering objects at `object_id`.
    pub fn starting_at(mut self, object_id: u64) -> Self {
        self.session = ObjectSession::new(object_id, self.config.images_per_object);
        self.status.update(|s| s.object_id = object_id);
        self
    }

    pub fn status_handle(&self) -> StatusHandle {
        self.status.handle()
    }

    pub fn retake_sender(&self) -> RetakeSender {
        self.retake_sender.clone()
    }

    pub fn phase(&self) -> CapturePhase {
        self.phase
    }

    pub fn state(&self) -> RemoteState {
        self.status.snapshot()
    }

    pub fn session(&self) -> &ObjectSession {
        &self.session
    }

    pub fn buffered(&self) -> Option<&CompletedObject> {
        self.buffered.as_ref()
    }

    pub fn summary(&self) -> RunSummary {
        self.summary
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Connect the camera and take the first baseline frame.
    pub fn prime(&mut self) -> Result<()> {
        if let Err(err) = self.source.connect() {
            self.fail();
            return Err(CaptureError::device(format!("camera unavailable: {err:#}")).into());
        }
        self.released = false;
        let first = self.read_frame("baseline")?;
        self.baseline = Some(first);
        self.last_capture = self.clock.now();
        self.phase = self.armed_phase();
        self.publish_status(CaptureStatus::Ready);
        log::info!(
            "capture ready on {}: object {}, {} sides per object",
            self.source.stats().source,
            self.session.object_id(),
            self.config.images_per_object
        );
        Ok(())
    }

    /// Run ticks until cancelled or a fatal error. The camera is released on
    /// every exit path.
    pub fn run(&mut self) -> Result<RunSummary> {
        let result = self.run_ticks();
        let stats = self.source.stats();
        self.release();
        match &result {
            Ok(summary) => log::info!(
                "capture stopped after {} frames from {}: {} objects, {} sides accepted, {} timeouts, {} retakes",
                stats.frames_captured,
                stats.source,
                summary.objects_completed,
                summary.sides_accepted,
                summary.sides_timed_out,
                summary.retakes
            ),
            Err(err) => log::error!("capture aborted: {:#}", err),
        }
        result
    }

    fn run_ticks(&mut self) -> Result<RunSummary> {
        if self.baseline.is_none() {
            self.prime()?;
        }
        loop {
            let events = self.tick()?;
            if events.contains(&CaptureEvent::Cancelled) {
                return Ok(self.summary);
            }
        }
    }

    /// One pass of the main loop.
    pub fn tick(&mut self) -> Result<Vec<CaptureEvent>> {
        let mut events = Vec::new();
        if self.baseline.is_none() {
            self.prime()?;
        }
        if self.phase == CapturePhase::TerminalError {
            return Err(anyhow!("capture already failed"));
        }
        if self.cancelled() {
            events.push(CaptureEvent::Cancelled);
            self.summary.record(&events);
            return Ok(events);
        }

        if self.retakes.take().is_some() {
            self.apply_retake(&mut events);
        }

        let frame = self.read_frame("preview")?;
        self.send_live(&frame);

        if self.clock.now().duration_since(self.last_capture) > self.config.inactivity_timeout {
            self.escalate(&mut events);
            self.last_capture = self.clock.now();
            self.baseline = Some(frame);
            self.summary.record(&events);
            return Ok(events);
        }

        let moved = match &self.baseline {
            Some(baseline) => self.config.detector.has_motion(baseline, &frame),
            None => false,
        };
        let next_baseline = if moved {
            let shot = self.capture_side(&mut events)?;
            self.last_capture = self.clock.now();
            shot
        } else {
            frame
        };
        self.baseline = Some(next_baseline);

        if !events.contains(&CaptureEvent::Cancelled) {
            self.clock.sleep(self.config.poll_interval);
        }
        self.summary.record(&events);
        Ok(events)
    }

    fn capture_side(&mut self, events: &mut Vec<CaptureEvent>) -> Result<Frame> {
        self.phase = CapturePhase::Settle;
        self.clock.sleep(self.config.settle_delay);
        let shot = self.read_frame("side")?;
        self.phase = CapturePhase::CapturedSide;
        self.send_captured(&shot);
        self.cue();

        if self.session.is_empty() {
            if let Some(previous) = self.buffered.take() {
                log::debug!("object {} committed", previous.object_id);
            }
        }
        let object_id = self.session.object_id();
        let side = self.session.accept(shot.clone())?;
        log::info!(
            "object {} side {}/{} captured",
            object_id,
            side,
            self.config.images_per_object
        );
        events.push(CaptureEvent::SideAccepted { object_id, side });

        if self.session.is_complete() {
            self.complete_object(events)?;
            return Ok(shot);
        }

        self.publish_status(CaptureStatus::Capturing);
        self.phase = CapturePhase::AwaitNextSide;
        log::info!("turn object {} to side {}", object_id, side + 1);
        self.clock.sleep(self.config.next_side_delay);
        match self.await_next_side(&shot)? {
            NextSide::Ready => {
                self.phase = CapturePhase::SideArmed;
                self.next_side_armed = true;
                log::info!("object {} side {} in position", object_id, side + 1);
                events.push(CaptureEvent::NextSideReady {
                    object_id,
                    side: side + 1,
                });
            }
            NextSide::TimedOut => {
                self.session.discard_last();
                self.next_side_armed = false;
                self.phase = self.armed_phase();
                log::warn!(
                    "failed to capture side {} of object {}, please try again",
                    side + 1,
                    object_id
                );
                self.publish_status(self.idle_status());
                events.push(CaptureEvent::SideTimedOut { object_id, side });
            }
            NextSide::Retaken => {
                self.session.discard_last();
                self.next_side_armed = false;
                self.phase = self.armed_phase();
                log::info!("retaking side {} of object {}", side, object_id);
                self.publish_status(self.idle_status());
                events.push(CaptureEvent::SideRetaken { object_id, side });
            }
            NextSide::Cancelled => events.push(CaptureEvent::Cancelled),
        }
        Ok(shot)
    }

    /// Sample until the object is stable and shows a new side, the side
    /// timeout elapses, a retake arrives or the run is cancelled.
    fn await_next_side(&mut self, reference: &Frame) -> Result<NextSide> {
        let started = self.clock.now();
        let stall_after = self.config.side_timeout / 2;
        let mut stall_sent = false;
        let mut last = reference.clone();
        while self.clock.now().duration_since(started) < self.config.side_timeout {
            self.clock.sleep(self.config.check_interval);
            if self.cancelled() {
                return Ok(NextSide::Cancelled);
            }
            if self.retakes.take().is_some() {
                return Ok(NextSide::Retaken);
            }
            let frame = self.read_frame("next side")?;
            if !stall_sent && self.clock.now().duration_since(started) > stall_after {
                self.send_live(&frame);
                stall_sent = true;
            }
            if self
                .config
                .detector
                .is_settled_new_side(&last, reference, &frame)
            {
                return Ok(NextSide::Ready);
            }
            last = frame;
        }
        Ok(NextSide::TimedOut)
    }

    fn complete_object(&mut self, events: &mut Vec<CaptureEvent>) -> Result<()> {
        let object_id = self.session.object_id();
        let sides = self.session.len();
        self.publish_status(CaptureStatus::Processing);
        let receipt = match self.sink.flush(&self.session) {
            Ok(receipt) => receipt,
            Err(err) => {
                self.fail();
                return Err(err.context(format!("save object {object_id}")));
            }
        };
        let next = self.session.successor();
        let done = std::mem::replace(&mut self.session, next);
        self.buffered = Some(CompletedObject::new(done, receipt));
        self.phase = CapturePhase::IdleWaitObject;
        self.next_side_armed = false;
        self.cue();
        log::info!(
            "all {} sides of object {} captured, place the next object",
            sides,
            object_id
        );
        events.push(CaptureEvent::ObjectCompleted { object_id, sides });
        self.publish_status(CaptureStatus::Ready);
        Ok(())
    }

    fn apply_retake(&mut self, events: &mut Vec<CaptureEvent>) {
        let object_id = self.session.object_id();
        if self.next_side_armed && !self.session.is_empty() {
            let side = self.session.len();
            self.session.discard_last();
            self.next_side_armed = false;
            self.phase = self.armed_phase();
            log::info!("retaking side {} of object {}", side, object_id);
            events.push(CaptureEvent::SideRetaken { object_id, side });
        } else if let Some(previous) = self.buffered.take() {
            if let Err(err) = self.sink.retract(&previous.receipt) {
                log::error!("withdraw object {}: {:#}", previous.object_id, err);
            }
            self.session = ObjectSession::new(previous.object_id, self.config.images_per_object);
            self.phase = CapturePhase::IdleWaitObject;
            log::info!("retaking object {}", previous.object_id);
            events.push(CaptureEvent::ObjectRetaken {
                object_id: previous.object_id,
            });
        } else {
            log::debug!("retake ignored: no side awaiting its successor and no buffered object");
            return;
        }
        self.last_capture = self.clock.now();
        self.publish_status(self.idle_status());
    }

    fn escalate(&mut self, events: &mut Vec<CaptureEvent>) {
        let resume_phase = self.phase;
        self.phase = CapturePhase::EscalateWaiting;
        self.publish_status(CaptureStatus::Waiting);
        events.push(CaptureEvent::Escalated);
        log::info!("no activity, waiting for resume from the display");
        match self
            .status
            .wait_for_resume(self.config.check_interval, &self.shutdown)
        {
            ResumeWait::Resumed => {
                self.phase = resume_phase;
                let state = self.status.snapshot();
                self.publish(&state);
                log::info!("resumed");
                events.push(CaptureEvent::Resumed);
            }
            ResumeWait::Cancelled => events.push(CaptureEvent::Cancelled),
        }
    }

    fn armed_phase(&self) -> CapturePhase {
        if self.session.is_empty() {
            CapturePhase::IdleWaitObject
        } else {
            CapturePhase::SideArmed
        }
    }

    fn idle_status(&self) -> CaptureStatus {
        if self.session.is_empty() {
            CaptureStatus::Ready
        } else {
            CaptureStatus::Capturing
        }
    }

    fn read_frame(&mut self, what: &str) -> Result<Frame> {
        match self.source.next_frame() {
            Ok(frame) => Ok(frame),
            Err(err) => {
                self.fail();
                Err(CaptureError::device(format!("failed to grab {what} frame: {err:#}")).into())
            }
        }
    }

    fn fail(&mut self) {
        self.phase = CapturePhase::TerminalError;
        self.publish_status(CaptureStatus::Error);
    }

    fn publish_status(&mut self, status: CaptureStatus) {
        let object_id = self.session.object_id();
        let image_number = self.session.len() as u32;
        let state = self.status.update(|s| {
            s.object_id = object_id;
            s.image_number = image_number;
            s.status = status;
        });
        self.publish(&state);
    }

    fn publish(&mut self, state: &RemoteState) {
        if let Err(err) = self.channel.publish_state(state) {
            log::debug!("state update not delivered: {}", err);
        }
    }

    fn send_live(&mut self, frame: &Frame) {
        if let Err(err) = self.channel.publish_live(frame) {
            log::trace!("live preview not delivered: {}", err);
        }
    }

    fn send_captured(&mut self, frame: &Frame) {
        if let Err(err) = self.channel.publish_captured(frame) {
            log::debug!("capture preview not delivered: {}", err);
        }
    }

    fn cue(&mut self) {
        if let Err(err) = self.notifier.cue() {
            log::debug!("capture cue failed: {:#}", err);
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.source.release();
            self.channel.close();
            self.released = true;
        }
    }
}

impl Drop for CaptureStateMachine {
    fn drop(&mut self) {
        self.release();
    }
}
