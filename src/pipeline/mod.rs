//! The speech playback pipeline: fetch, decode and schedule narration chunks.

pub mod fetcher;
pub mod scheduler;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    Starting,
    Playing,
    Stopping,
    Error(String),
}

impl PlaybackState {
    /// Starting or playing; a listen toggle in this state stops playback.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Playing)
    }
}

/// Snapshot published to observers on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    /// No segment is audible yet, or the queue ran dry while a fetch lags.
    pub loading: bool,
    /// Index of the chunk currently playing.
    pub chunk: Option<usize>,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The synthesizer had nothing to say for this chunk.
    Empty,
    Undecodable(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Started { chunks: usize },
    SegmentScheduled { index: usize, start: f64, duration: f64 },
    SegmentEnded { index: usize },
    ChunkSkipped { index: usize, reason: SkipReason },
    Finished,
    Stopped,
    Failed { message: String },
}
