//! Playback Scheduler: stitches decoded buffers onto one output timeline.
//!
//! ```text
//! start_time      = max(output.current_time(), next_start_time)
//! next_start_time = start_time + buffer.duration()
//! ```
//!
//! Every buffer handed to [`PlaybackScheduler::schedule`] lands in the
//! ScheduledPlayback set until its own `Ended` notification arrives or a
//! [`flush`](PlaybackScheduler::flush) stops it.  The scheduler is the only
//! writer of `next_start_time` and the only caller of the output device.

use crate::audio::{DecodedBuffer, DeviceError, OutputDevice, PlaybackId};

/// One buffer on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledPlayback {
    pub id: PlaybackId,
    /// Start time on the output clock, in seconds.
    pub start_time: f64,
    /// Duration in seconds.
    pub duration: f64,
}

impl ScheduledPlayback {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn OutputDevice>,
    next_start_time: f64,
    scheduled: Vec<ScheduledPlayback>,
    next_id: u64,
    flushes: u64,
}

impl PlaybackScheduler {
    /// Wrap an already-opened output device.
    pub fn new(output: Box<dyn OutputDevice>) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            scheduled: Vec::new(),
            next_id: 0,
            flushes: 0,
        }
    }

    /// Place `buffer` directly after everything already scheduled, or at the
    /// current output time if the timeline has run dry.
    pub fn schedule(&mut self, buffer: DecodedBuffer) -> Result<ScheduledPlayback, DeviceError> {
        let start_time = self.output.current_time().max(self.next_start_time);
        let duration = buffer.duration();
        let id = PlaybackId(self.next_id);

        self.output.start(id, buffer, start_time)?;

        self.next_id += 1;
        self.next_start_time = start_time + duration;
        let entry = ScheduledPlayback {
            id,
            start_time,
            duration,
        };
        self.scheduled.push(entry);
        log::trace!(
            "scheduler: buffer {} at {:.3}s for {:.3}s",
            id.0,
            start_time,
            duration
        );
        Ok(entry)
    }

    /// Playback-completion notification from the output device.
    pub fn on_ended(&mut self, id: PlaybackId) {
        self.scheduled.retain(|entry| entry.id != id);
    }

    /// Stop every scheduled buffer, clear the set and reset the cursor to 0.
    ///
    /// Returns the number of buffers stopped.  A no-op on an empty set.
    pub fn flush(&mut self) -> usize {
        let stopped = self.scheduled.len();
        for entry in self.scheduled.drain(..) {
            self.output.stop(entry.id);
        }
        self.next_start_time = 0.0;
        if stopped > 0 {
            self.flushes += 1;
            log::debug!("scheduler: flushed {stopped} buffer(s)");
        }
        stopped
    }

    /// Flush and release the output device.
    pub async fn close(&mut self) {
        self.flush();
        self.output.close().await;
    }

    /// Next safe start time in seconds.
    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    /// The ScheduledPlayback set, in arrival order.
    pub fn scheduled(&self) -> &[ScheduledPlayback] {
        &self.scheduled
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }
}
