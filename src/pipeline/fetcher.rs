use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::audio::segment::{AudioSegment, decode_payload};
use crate::chunker::TextChunk;
use crate::error::Result;
use crate::synth::Synthesizer;

use super::SkipReason;

type SynthesisRequest = Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send>>;

struct InFlight {
    index: usize,
    request: SynthesisRequest,
}

/// How an in-flight fetch resolved.
#[derive(Debug, PartialEq, Eq)]
pub enum Settled {
    Queued(usize),
    Skipped { index: usize, reason: SkipReason },
    /// The fetch finished after cancellation and its result was dropped.
    Discarded(usize),
}

/// Synthesizes chunks strictly in order, one request at a time, into a
/// bounded queue of decoded segments.
pub struct Fetcher<S> {
    synth: Arc<S>,
    chunks: Vec<TextChunk>,
    next: usize,
    depth: usize,
    queue: VecDeque<AudioSegment>,
    in_flight: Option<InFlight>,
    halted: bool,
    cancel: CancellationToken,
}

impl<S: Synthesizer> Fetcher<S> {
    pub fn new(
        synth: Arc<S>,
        chunks: Vec<TextChunk>,
        depth: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            synth,
            chunks,
            next: 0,
            depth: depth.max(1),
            queue: VecDeque::new(),
            in_flight: None,
            halted: false,
            cancel,
        }
    }

    /// Start synthesizing the next chunk if the lookahead allows it.
    ///
    /// `backlog` is the number of segments already handed to the scheduler
    /// that have not finished playing. Returns whether a request was started.
    pub fn prefetch_next(&mut self, backlog: usize) -> bool {
        if self.halted || self.cancel.is_cancelled() || self.in_flight.is_some() {
            return false;
        }

        if self.queue.len() >= self.depth || self.queue.len() + backlog > self.depth {
            return false;
        }

        while let Some(chunk) = self.chunks.get(self.next) {
            self.next += 1;

            if chunk.is_blank() {
                tracing::debug!("chunk {} is blank, skipping", chunk.index);
                continue;
            }

            let index = chunk.index;
            let text = chunk.text.clone();
            let synth = Arc::clone(&self.synth);
            tracing::debug!(
                "fetching chunk {index}/{} ({} chars)",
                self.chunks.len(),
                text.chars().count()
            );

            self.in_flight = Some(InFlight {
                index,
                request: Box::pin(async move { synth.synthesize(&text).await }),
            });
            return true;
        }

        false
    }

    /// Wait for the in-flight request and resolve it.
    ///
    /// Never completes when nothing is in flight. Transport failures are
    /// returned and halt the fetcher; empty or undecodable payloads skip the
    /// chunk.
    pub async fn settle(&mut self) -> Result<Settled> {
        let Some(in_flight) = self.in_flight.as_mut() else {
            return std::future::pending().await;
        };

        let index = in_flight.index;
        let result = in_flight.request.as_mut().await;
        self.in_flight = None;

        if self.cancel.is_cancelled() {
            return Ok(Settled::Discarded(index));
        }

        match result {
            Ok(Some(payload)) if !payload.is_empty() => match decode_payload(index, &payload) {
                Ok(segment) if segment.is_empty() => {
                    tracing::debug!("chunk {index} decoded to no audio, skipping");
                    Ok(Settled::Skipped {
                        index,
                        reason: SkipReason::Empty,
                    })
                }
                Ok(segment) => {
                    tracing::debug!(
                        "chunk {index} ready: {:.2}s of audio",
                        segment.duration_secs
                    );
                    self.queue.push_back(segment);
                    Ok(Settled::Queued(index))
                }
                Err(e) => {
                    tracing::warn!("chunk {index} skipped: {e}");
                    Ok(Settled::Skipped {
                        index,
                        reason: SkipReason::Undecodable(e.to_string()),
                    })
                }
            },
            Ok(_) => {
                tracing::warn!("chunk {index} returned no audio, skipping");
                Ok(Settled::Skipped {
                    index,
                    reason: SkipReason::Empty,
                })
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!("chunk {index} skipped: {e}");
                Ok(Settled::Skipped {
                    index,
                    reason: SkipReason::Undecodable(e.to_string()),
                })
            }
            Err(e) => {
                self.halted = true;
                Err(e)
            }
        }
    }

    pub fn pop_ready(&mut self) -> Option<AudioSegment> {
        self.queue.pop_front()
    }

    /// Drop any in-flight request and queued audio; fetch nothing more.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.halted = true;
        if let Some(in_flight) = self.in_flight.take() {
            tracing::debug!("aborted fetch of chunk {}", in_flight.index);
        }
        self.queue.clear();
    }

    #[must_use]
    pub const fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Every chunk has been fetched or skipped, or fetching was halted.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.in_flight.is_none() && (self.halted || self.next >= self.chunks.len())
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}
