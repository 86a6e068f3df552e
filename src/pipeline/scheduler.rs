use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::audio::output::{BufferSource, OutputDevice, faulted};
use crate::audio::segment::AudioSegment;
use crate::error::{RecitalError, Result};

/// Where a segment landed on the device clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub index: usize,
    pub start: f64,
    pub duration: f64,
}

struct Scheduled {
    source: Box<dyn BufferSource>,
    start: f64,
    duration: f64,
}

/// Places segments back to back on the output clock.
///
/// Each segment starts at the later of the playback cursor and the device
/// clock plus the lead-in, so segments never overlap and never start in the
/// past. Finished sources are reported through [`Scheduler::next_ended`],
/// which also surfaces a device fault as an error.
pub struct Scheduler {
    device: Arc<dyn OutputDevice>,
    fault: watch::Receiver<Option<String>>,
    lead_in: f64,
    cursor: f64,
    last_index: Option<usize>,
    active: BTreeMap<usize, Scheduled>,
    ended_tx: mpsc::UnboundedSender<usize>,
    ended_rx: mpsc::UnboundedReceiver<usize>,
}

impl Scheduler {
    pub fn new(device: Arc<dyn OutputDevice>, lead_in: f64) -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();
        Self {
            fault: device.fault(),
            device,
            lead_in,
            cursor: 0.0,
            last_index: None,
            active: BTreeMap::new(),
            ended_tx,
            ended_rx,
        }
    }

    /// Hand a segment to the device and start it right after the previous one.
    pub fn schedule_next(&mut self, segment: AudioSegment) -> Result<Placement> {
        let index = segment.index;
        if let Some(message) = self.fault.borrow().as_ref() {
            return Err(RecitalError::Audio(message.clone()));
        }
        debug_assert!(
            self.last_index.is_none_or(|last| index > last),
            "segment {index} scheduled out of order"
        );

        let duration = segment.duration_secs;
        let start = self
            .cursor
            .max(self.device.current_time() + self.lead_in);

        let mut source = self.device.create_source(segment)?;
        let ended_tx = self.ended_tx.clone();
        source.start(
            start,
            Box::new(move || {
                let _ = ended_tx.send(index);
            }),
        )?;

        self.cursor = start + duration;
        self.last_index = Some(index);
        self.active.insert(
            index,
            Scheduled {
                source,
                start,
                duration,
            },
        );

        tracing::debug!("segment {index} scheduled at {start:.3}s for {duration:.2}s");

        Ok(Placement {
            index,
            start,
            duration,
        })
    }

    /// Wait until a scheduled segment finishes playing and return its index.
    ///
    /// Fails once the device reports a fault, since nothing scheduled on it
    /// will finish after that.
    pub async fn next_ended(&mut self) -> Result<usize> {
        loop {
            let index = tokio::select! {
                ended = self.ended_rx.recv() => match ended {
                    Some(index) => index,
                    None => std::future::pending().await,
                },
                message = faulted(&mut self.fault) => {
                    return Err(RecitalError::Audio(message));
                }
            };

            // Stale notifications from flushed sources are dropped.
            if self.active.remove(&index).is_some() {
                tracing::debug!("segment {index} ended");
                return Ok(index);
            }
        }
    }

    /// Segments scheduled that have not finished playing.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.active.len()
    }

    /// The earliest segment that has not finished: the one playing, or the
    /// one about to start.
    #[must_use]
    pub fn current(&self) -> Option<usize> {
        self.active.keys().next().copied()
    }

    /// Whether a scheduled segment is audible right now.
    #[must_use]
    pub fn is_audible(&self) -> bool {
        let now = self.device.current_time();
        self.active
            .values()
            .any(|s| now >= s.start && now < s.start + s.duration)
    }

    /// Time until the earliest pending segment becomes audible, if it has
    /// not started yet.
    #[must_use]
    pub fn until_audible(&self) -> Option<Duration> {
        let start = self.active.values().next()?.start;
        let wait = start - self.device.current_time();
        (wait > 0.0).then(|| Duration::from_secs_f64(wait))
    }

    /// Stop every scheduled source and reset the cursor.
    pub fn flush(&mut self) {
        let active = std::mem::take(&mut self.active);
        if !active.is_empty() {
            tracing::debug!("stopping {} scheduled segment(s)", active.len());
        }
        for (_, mut scheduled) in active {
            scheduled.source.stop();
        }

        while self.ended_rx.try_recv().is_ok() {}
        self.cursor = 0.0;
        self.last_index = None;
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.flush();
    }
}
