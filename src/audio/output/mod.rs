//! Audio output boundary.
//!
//! An [`OutputDevice`] exposes a clock and hands out [`BufferSource`]s, one per
//! decoded segment. A source is started at an absolute time on the device clock
//! and reports completion through a callback. Stopping a source silences it
//! immediately and drops its callback without running it.
//!
//! A device that stops playing (unplugged, stream torn down) publishes a fault
//! message. Sources on a faulted device never report completion.

pub mod clock;
pub mod speaker;

use tokio::sync::watch;

use crate::audio::segment::AudioSegment;
use crate::error::Result;

/// Invoked once when a started source has played to its end.
pub type EndedCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait OutputDevice: Send + Sync {
    /// Device clock in seconds.
    fn current_time(&self) -> f64;

    /// Take ownership of a segment and wrap it in a schedulable source.
    fn create_source(&self, segment: AudioSegment) -> Result<Box<dyn BufferSource>>;

    fn name(&self) -> &str;

    /// `Some(message)` once the device can no longer play.
    fn fault(&self) -> watch::Receiver<Option<String>>;
}

pub trait BufferSource: Send {
    /// Begin playback at `when` seconds on the device clock.
    fn start(&mut self, when: f64, on_ended: EndedCallback) -> Result<()>;

    /// Stop playback. Safe to call more than once, or before `start`.
    fn stop(&mut self);
}

/// Wait until the device reports a fault and return its message.
pub async fn faulted(fault: &mut watch::Receiver<Option<String>>) -> String {
    loop {
        if let Some(message) = fault.borrow_and_update().clone() {
            return message;
        }
        if fault.changed().await.is_err() {
            return "output device closed".to_string();
        }
    }
}
