//! A scripted synthesizer for driving the pipeline under paused time.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::audio::segment::SAMPLE_RATE;
use crate::error::{RecitalError, Result};
use crate::synth::Synthesizer;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Reply {
    /// Silence of the given length, as raw PCM16.
    Audio(f64),
    Empty,
    Garbled,
    Fail(&'static str),
}

/// Answers each call with the next scripted reply after a fixed delay.
/// Once the script runs out every call gets one second of audio.
pub(crate) struct ScriptedSynth {
    delay: Duration,
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedSynth {
    pub(crate) fn new(delay_ms: u64, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::from_millis(delay_ms),
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn pcm_silence(secs: f64) -> Vec<u8> {
    let frames = (secs * f64::from(SAMPLE_RATE)).round() as usize;
    vec![0u8; frames * 2]
}

impl Synthesizer for ScriptedSynth {
    async fn synthesize(&self, text: &str) -> Result<Option<Vec<u8>>> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(Reply::Audio(1.0));

        tokio::time::sleep(self.delay).await;

        match reply {
            Reply::Audio(secs) => Ok(Some(pcm_silence(secs))),
            Reply::Empty => Ok(None),
            Reply::Garbled => Ok(Some(vec![1, 2, 3])),
            Reply::Fail(msg) => Err(RecitalError::Synthesis(msg.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
