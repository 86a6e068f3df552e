use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::audio::segment::AudioSegment;
use crate::error::{RecitalError, Result};

use super::{BufferSource, EndedCallback, OutputDevice, faulted};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Created,
    Started,
    Ended,
    Stopped,
}

/// What happened to one source handed out by a [`VirtualOutput`].
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub index: usize,
    pub start: Option<f64>,
    pub duration: f64,
    pub state: SourceState,
}

type SourceLog = Arc<Mutex<Vec<SourceRecord>>>;

/// A silent output device driven by the tokio clock.
///
/// Sources "play" by sleeping for their duration. Every source is logged, which
/// makes this device useful for dry runs and for observing the scheduler.
pub struct VirtualOutput {
    origin: Instant,
    log: SourceLog,
    fault: watch::Sender<Option<String>>,
}

impl VirtualOutput {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            log: Arc::new(Mutex::new(Vec::new())),
            fault: watch::Sender::new(None),
        }
    }

    /// Put the device into a failed state. Started sources stall and never
    /// report completion, like a stream whose hardware went away.
    pub fn fail(&self, message: &str) {
        self.fault.send_replace(Some(message.to_string()));
    }

    /// Snapshot of every source created so far, in creation order.
    #[must_use]
    pub fn sources(&self) -> Vec<SourceRecord> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for VirtualOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputDevice for VirtualOutput {
    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn create_source(&self, segment: AudioSegment) -> Result<Box<dyn BufferSource>> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.push(SourceRecord {
            index: segment.index,
            start: None,
            duration: segment.duration_secs,
            state: SourceState::Created,
        });

        Ok(Box::new(VirtualSource {
            slot: log.len() - 1,
            duration: segment.duration_secs,
            origin: self.origin,
            log: Arc::clone(&self.log),
            fault: self.fault.subscribe(),
            task: None,
        }))
    }

    fn name(&self) -> &'static str {
        "virtual"
    }

    fn fault(&self) -> watch::Receiver<Option<String>> {
        self.fault.subscribe()
    }
}

struct VirtualSource {
    slot: usize,
    duration: f64,
    origin: Instant,
    log: SourceLog,
    fault: watch::Receiver<Option<String>>,
    task: Option<JoinHandle<()>>,
}

impl BufferSource for VirtualSource {
    fn start(&mut self, when: f64, on_ended: EndedCallback) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|e| {
            RecitalError::Audio(format!("virtual output requires a tokio runtime: {e}"))
        })?;

        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            let record = &mut log[self.slot];
            if record.state != SourceState::Created {
                return Err(RecitalError::Audio(format!(
                    "source for segment {} started twice",
                    record.index
                )));
            }
            record.state = SourceState::Started;
            record.start = Some(when);
        }

        let deadline = self.origin + Duration::from_secs_f64((when + self.duration).max(0.0));
        let log = Arc::clone(&self.log);
        let slot = self.slot;
        let mut fault = self.fault.clone();

        self.task = Some(handle.spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(deadline) => {}
                // A faulted device stalls; only `stop` retires the source.
                _ = faulted(&mut fault) => return,
            }

            let ended = {
                let mut log = log.lock().unwrap_or_else(PoisonError::into_inner);
                let record = &mut log[slot];
                if record.state == SourceState::Started {
                    record.state = SourceState::Ended;
                    true
                } else {
                    false
                }
            };

            if ended {
                on_ended();
            }
        }));

        Ok(())
    }

    fn stop(&mut self) {
        {
            let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
            let record = &mut log[self.slot];
            if matches!(record.state, SourceState::Created | SourceState::Started) {
                record.state = SourceState::Stopped;
            }
        }

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
