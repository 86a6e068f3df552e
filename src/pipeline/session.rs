use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::audio::output::OutputDevice;
use crate::chunker::TextChunk;
use crate::config::PlaybackConfig;
use crate::error::RecitalError;
use crate::synth::Synthesizer;

use super::fetcher::{Fetcher, Settled};
use super::scheduler::Scheduler;
use super::{PlaybackEvent, PlaybackState, PlaybackStatus};

/// How a playback session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Finished,
    /// Stopped from outside; the owner publishes the final state.
    Cancelled,
    Failed(String),
}

/// One run of the pipeline over a chunked text.
///
/// Interleaves fetching and scheduling: it keeps at most one synthesis
/// request in flight, hands decoded segments to the scheduler as soon as
/// they are ready, and finishes once every chunk has been fetched and every
/// scheduled segment has played.
pub struct PlaybackSession<S> {
    fetcher: Fetcher<S>,
    scheduler: Scheduler,
    chunks: usize,
    cancel: CancellationToken,
    status: Arc<watch::Sender<PlaybackStatus>>,
    events: broadcast::Sender<PlaybackEvent>,
    failure: Option<RecitalError>,
    started: bool,
    audible: bool,
}

impl<S: Synthesizer> PlaybackSession<S> {
    pub fn new(
        synth: Arc<S>,
        chunks: Vec<TextChunk>,
        device: Arc<dyn OutputDevice>,
        settings: &PlaybackConfig,
        cancel: CancellationToken,
        status: Arc<watch::Sender<PlaybackStatus>>,
        events: broadcast::Sender<PlaybackEvent>,
    ) -> Self {
        let count = chunks.len();
        Self {
            fetcher: Fetcher::new(
                synth,
                chunks,
                settings.prefetch_depth,
                cancel.child_token(),
            ),
            scheduler: Scheduler::new(device, settings.lead_in_secs()),
            chunks: count,
            cancel,
            status,
            events,
            failure: None,
            started: false,
            audible: false,
        }
    }

    pub async fn run(mut self) -> SessionOutcome {
        let outcome = self.drive().await;

        self.fetcher.cancel();
        self.scheduler.flush();

        match &outcome {
            SessionOutcome::Finished => {
                tracing::info!("playback finished ({} chunk(s))", self.chunks);
                self.finish(PlaybackState::Idle, PlaybackEvent::Finished);
            }
            SessionOutcome::Failed(message) => {
                tracing::error!("playback failed: {message}");
                self.finish(
                    PlaybackState::Error(message.clone()),
                    PlaybackEvent::Failed {
                        message: message.clone(),
                    },
                );
            }
            SessionOutcome::Cancelled => tracing::debug!("playback session cancelled"),
        }

        outcome
    }

    async fn drive(&mut self) -> SessionOutcome {
        loop {
            self.schedule_ready();
            self.fetcher.prefetch_next(self.scheduler.pending());
            if !self.audible && self.scheduler.is_audible() {
                self.audible = true;
                tracing::debug!("first segment audible");
            }
            self.publish();

            if self.scheduler.pending() == 0 && self.fetcher.is_exhausted() {
                return match self.failure.take() {
                    Some(e) => SessionOutcome::Failed(e.to_string()),
                    None => SessionOutcome::Finished,
                };
            }

            // Wake when the first segment starts sounding so `loading` clears
            // on time. At least a millisecond, so the clock moves.
            let audible_in = if self.audible {
                None
            } else {
                self.scheduler
                    .until_audible()
                    .map(|wait| wait.max(Duration::from_millis(1)))
            };

            tokio::select! {
                biased;

                () = self.cancel.cancelled() => return SessionOutcome::Cancelled,

                settled = self.fetcher.settle(), if self.fetcher.is_fetching() => match settled {
                    Ok(Settled::Skipped { index, reason }) => {
                        self.emit(PlaybackEvent::ChunkSkipped { index, reason });
                    }
                    Ok(Settled::Queued(_) | Settled::Discarded(_)) => {}
                    Err(e) => {
                        tracing::error!("synthesis failed, no further chunks will be fetched: {e}");
                        self.failure = Some(e);
                    }
                },

                ended = self.scheduler.next_ended() => match ended {
                    Ok(index) => {
                        self.audible = true;
                        self.emit(PlaybackEvent::SegmentEnded { index });
                    }
                    Err(e) => {
                        tracing::error!("output device failed: {e}");
                        return SessionOutcome::Failed(e.to_string());
                    }
                },

                () = tokio::time::sleep(audible_in.unwrap_or_default()), if audible_in.is_some() => {}
            }
        }
    }

    fn schedule_ready(&mut self) {
        while let Some(segment) = self.fetcher.pop_ready() {
            let index = segment.index;
            match self.scheduler.schedule_next(segment) {
                Ok(placement) => {
                    if !self.started {
                        self.started = true;
                        tracing::info!("playback started");
                    }
                    self.emit(PlaybackEvent::SegmentScheduled {
                        index: placement.index,
                        start: placement.start,
                        duration: placement.duration,
                    });
                }
                Err(e) => {
                    tracing::error!("failed to schedule segment {index}: {e}");
                    self.fetcher.cancel();
                    self.failure.get_or_insert(e);
                    return;
                }
            }
        }
    }

    /// Publish the current state unless the session has been cancelled.
    fn publish(&self) {
        let next = PlaybackStatus {
            state: if self.started {
                PlaybackState::Playing
            } else {
                PlaybackState::Starting
            },
            loading: !self.audible || self.scheduler.pending() == 0,
            chunk: self.scheduler.current(),
            chunks: self.chunks,
        };

        self.status.send_if_modified(|current| {
            if self.cancel.is_cancelled() || *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn finish(&self, state: PlaybackState, event: PlaybackEvent) {
        self.status.send_replace(PlaybackStatus {
            state,
            loading: false,
            chunk: None,
            chunks: self.chunks,
        });
        self.emit(event);
    }

    fn emit(&self, event: PlaybackEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
