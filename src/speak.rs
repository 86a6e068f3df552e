use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;

use crate::audio::output::clock::VirtualOutput;
use crate::config::Config;
use crate::error::{RecitalError, Result};
use crate::narrator::Narrator;
use crate::pipeline::{PlaybackEvent, PlaybackState};
use crate::synth::{self, Synthesizer};

/// Read `text` aloud in the foreground until it finishes or Ctrl+C.
///
/// With `silent` set, audio is scheduled on a virtual clock instead of the
/// speaker, which exercises the synthesizer and the pipeline without sound.
pub async fn run_speak(config: Config, text: &str, silent: bool) -> Result<()> {
    let synth = Arc::new(synth::create_backend(&config.synthesis)?);
    tracing::info!("speaking with {} backend", synth.name());

    let narrator = if silent {
        tracing::info!("silent mode: audio will not be played");
        Narrator::with_device(synth, config.playback, Arc::new(VirtualOutput::new()))
    } else {
        Narrator::with_speaker(synth, config.playback, config.audio)
    };

    narrate(narrator, text, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received Ctrl+C, stopping...");
    })
    .await
}

/// Drive one narration to completion, stopping early when `interrupt` fires.
pub async fn narrate<S: Synthesizer>(
    mut narrator: Narrator<S>,
    text: &str,
    interrupt: impl Future<Output = ()>,
) -> Result<()> {
    let mut status = narrator.subscribe();
    let mut events = narrator.events();
    tokio::pin!(interrupt);

    narrator.play(text).await?;

    let result = loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
                let state = status.borrow_and_update().state.clone();
                match state {
                    PlaybackState::Idle => break Ok(()),
                    PlaybackState::Error(message) => break Err(RecitalError::Other(message)),
                    _ => {}
                }
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => tracing::debug!("missed {missed} playback events"),
                Err(RecvError::Closed) => break Ok(()),
            },
            () = &mut interrupt => {
                narrator.stop().await;
                break Ok(());
            }
        }
    };

    narrator.shutdown().await;
    result
}

fn log_event(event: &PlaybackEvent) {
    match event {
        PlaybackEvent::Started { chunks } => tracing::info!("reading {chunks} chunk(s)"),
        PlaybackEvent::SegmentScheduled {
            index,
            start,
            duration,
        } => tracing::debug!("chunk {index}: {duration:.1}s of audio at {start:.2}s"),
        PlaybackEvent::SegmentEnded { index } => tracing::info!("finished chunk {index}"),
        PlaybackEvent::ChunkSkipped { index, reason } => {
            tracing::debug!("chunk {index} skipped: {reason:?}");
        }
        PlaybackEvent::Finished | PlaybackEvent::Stopped | PlaybackEvent::Failed { .. } => {}
    }
}
