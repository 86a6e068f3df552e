//! The playback controller: one narration at a time, with observable state.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::output::OutputDevice;
use crate::audio::output::speaker::SpeakerOutput;
use crate::chunker;
use crate::config::{AudioConfig, PlaybackConfig};
use crate::error::Result;
use crate::pipeline::session::{PlaybackSession, SessionOutcome};
use crate::pipeline::{PlaybackEvent, PlaybackState, PlaybackStatus};
use crate::synth::Synthesizer;

/// Opens the output device the first time something is played.
pub type DeviceFactory = Box<dyn Fn() -> Result<Arc<dyn OutputDevice>> + Send + Sync>;

const EVENT_CAPACITY: usize = 64;

struct ActiveSession {
    cancel: CancellationToken,
    task: JoinHandle<SessionOutcome>,
}

/// Reads text aloud through a synthesizer and an output device.
///
/// Starting a new narration stops the previous one first. State changes are
/// published on a watch channel and notable moments on a broadcast channel.
pub struct Narrator<S: Synthesizer> {
    synth: Arc<S>,
    settings: PlaybackConfig,
    open_device: DeviceFactory,
    device: Option<Arc<dyn OutputDevice>>,
    active: Option<ActiveSession>,
    status: Arc<watch::Sender<PlaybackStatus>>,
    events: broadcast::Sender<PlaybackEvent>,
}

impl<S: Synthesizer> Narrator<S> {
    pub fn new(synth: Arc<S>, settings: PlaybackConfig, open_device: DeviceFactory) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            synth,
            settings,
            open_device,
            device: None,
            active: None,
            status: Arc::new(watch::Sender::new(PlaybackStatus::default())),
            events,
        }
    }

    /// A narrator that plays through the configured speaker.
    pub fn with_speaker(synth: Arc<S>, settings: PlaybackConfig, audio: AudioConfig) -> Self {
        Self::new(
            synth,
            settings,
            Box::new(move || -> Result<Arc<dyn OutputDevice>> {
                Ok(Arc::new(SpeakerOutput::open(&audio)?))
            }),
        )
    }

    /// A narrator that plays through an already open device.
    pub fn with_device(
        synth: Arc<S>,
        settings: PlaybackConfig,
        device: Arc<dyn OutputDevice>,
    ) -> Self {
        Self::new(
            synth,
            settings,
            Box::new(move || -> Result<Arc<dyn OutputDevice>> { Ok(Arc::clone(&device)) }),
        )
    }

    /// Toggle: stop if a narration is starting or playing, otherwise read `text`.
    pub async fn listen(&mut self, text: &str) -> Result<()> {
        if self.is_playing() {
            self.stop().await;
            return Ok(());
        }
        self.play(text).await
    }

    /// Stop anything in progress and start reading `text`.
    pub async fn play(&mut self, text: &str) -> Result<()> {
        self.stop().await;

        let device = match self.device() {
            Ok(device) => device,
            Err(e) => {
                let message = e.to_string();
                self.status.send_replace(PlaybackStatus {
                    state: PlaybackState::Error(message.clone()),
                    ..PlaybackStatus::default()
                });
                let _ = self.events.send(PlaybackEvent::Failed { message });
                return Err(e);
            }
        };

        let chunks = chunker::split(text, self.settings.chunk_chars);
        let count = chunks.len();
        tracing::info!(
            "narrating {} characters in {count} chunk(s) with {}",
            text.chars().count(),
            self.synth.name()
        );

        self.status.send_replace(PlaybackStatus {
            state: PlaybackState::Starting,
            loading: true,
            chunk: None,
            chunks: count,
        });
        let _ = self.events.send(PlaybackEvent::Started { chunks: count });

        let cancel = CancellationToken::new();
        let session = PlaybackSession::new(
            Arc::clone(&self.synth),
            chunks,
            device,
            &self.settings,
            cancel.clone(),
            Arc::clone(&self.status),
            self.events.clone(),
        );

        self.active = Some(ActiveSession {
            cancel,
            task: tokio::spawn(session.run()),
        });
        Ok(())
    }

    /// Stop playback and wait for the session to wind down. No-op when idle.
    pub async fn stop(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };

        if active.task.is_finished() {
            let _ = active.task.await;
            return;
        }

        active.cancel.cancel();
        self.status.send_if_modified(|status| {
            if !status.state.is_active() {
                return false;
            }
            status.state = PlaybackState::Stopping;
            true
        });

        match active.task.await {
            Ok(SessionOutcome::Cancelled) => {
                tracing::info!("playback stopped");
                self.publish_idle();
                let _ = self.events.send(PlaybackEvent::Stopped);
            }
            // Ran to completion before the cancellation landed.
            Ok(_) => {}
            Err(e) => {
                tracing::error!("playback session task failed: {e}");
                self.publish_idle();
            }
        }
    }

    /// Stop playback and release the output device.
    pub async fn shutdown(mut self) {
        self.stop().await;
        if let Some(device) = self.device.take() {
            tracing::debug!("closing output device '{}'", device.name());
        }
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.status.borrow().state.is_active()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.status.borrow().loading
    }

    #[must_use]
    pub fn status(&self) -> PlaybackStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackStatus> {
        self.status.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<PlaybackEvent> {
        self.events.subscribe()
    }

    fn device(&mut self) -> Result<Arc<dyn OutputDevice>> {
        if let Some(device) = &self.device {
            if device.fault().borrow().is_none() {
                return Ok(Arc::clone(device));
            }
            tracing::warn!("output device '{}' failed, reopening", device.name());
            self.device = None;
        }

        let device = (self.open_device)()?;
        tracing::info!("output device '{}' ready", device.name());
        self.device = Some(Arc::clone(&device));
        Ok(device)
    }

    fn publish_idle(&self) {
        self.status.send_modify(|status| {
            status.state = PlaybackState::Idle;
            status.loading = false;
            status.chunk = None;
        });
    }
}

impl<S: Synthesizer> Drop for Narrator<S> {
    fn drop(&mut self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::audio::output::clock::{SourceState, VirtualOutput};
    use crate::error::RecitalError;
    use crate::pipeline::SkipReason;
    use crate::pipeline::testing::{Reply, ScriptedSynth};

    const THREE_SENTENCES: &str =
        "First sentence is here. Second sentence here. Third sentence here.";

    fn settings(chunk_chars: usize, prefetch_depth: usize) -> PlaybackConfig {
        PlaybackConfig {
            chunk_chars,
            prefetch_depth,
            lead_in_ms: 50,
        }
    }

    fn narrator(
        synth: &Arc<ScriptedSynth>,
        settings: PlaybackConfig,
    ) -> (Arc<VirtualOutput>, Narrator<ScriptedSynth>) {
        let device = Arc::new(VirtualOutput::new());
        let narrator = Narrator::with_device(
            Arc::clone(synth),
            settings,
            Arc::clone(&device) as Arc<dyn OutputDevice>,
        );
        (device, narrator)
    }

    async fn wait_until(
        narrator: &Narrator<ScriptedSynth>,
        done: impl FnMut(&PlaybackStatus) -> bool,
    ) {
        narrator
            .subscribe()
            .wait_for(done)
            .await
            .map(|_| ())
            .unwrap_or_else(|e| panic!("{e}"));
    }

    fn drain(rx: &mut broadcast::Receiver<PlaybackEvent>) -> Vec<PlaybackEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    fn assert_back_to_back(device: &VirtualOutput) {
        let sources = device.sources();
        for pair in sources.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(a.index < b.index);
            let a_end = a.start.unwrap_or_else(|| panic!("unstarted")) + a.duration;
            let b_start = b.start.unwrap_or_else(|| panic!("unstarted"));
            assert!(b_start >= a_end - 1e-9, "segment {} overlaps {}", b.index, a.index);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn single_chunk_plays_to_idle() {
        let synth = ScriptedSynth::new(200, vec![Reply::Audio(1.0)]);
        let (device, mut narrator) = narrator(&synth, settings(1000, 2));
        let started = Instant::now();

        narrator
            .listen("Hello world.")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        let status = narrator.status();
        assert_eq!(status.state, PlaybackState::Starting);
        assert!(status.loading);
        assert_eq!(status.chunks, 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(narrator.status().state, PlaybackState::Playing);
        assert!(!narrator.is_loading());
        assert_eq!(narrator.status().chunk, Some(0));

        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;
        assert!(started.elapsed() >= Duration::from_millis(1250));

        let sources = device.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].state, SourceState::Ended);
        let start = sources[0].start.unwrap_or_else(|| panic!("unstarted"));
        assert!(start >= 0.2 - 1e-9);
        assert_eq!(synth.calls(), vec!["Hello world."]);
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_finishes_scheduled_audio_then_fails() {
        let synth = ScriptedSynth::new(
            100,
            vec![Reply::Audio(1.0), Reply::Fail("quota exceeded"), Reply::Audio(1.0)],
        );
        let (device, mut narrator) = narrator(&synth, settings(25, 2));
        let mut events = narrator.events();

        narrator
            .listen(THREE_SENTENCES)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(narrator.status().chunks, 3);

        wait_until(&narrator, |s| matches!(s.state, PlaybackState::Error(_))).await;

        // The first chunk played out in full before the error surfaced.
        assert!(device.current_time() >= 1.15 - 1e-6);
        let sources = device.sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].state, SourceState::Ended);

        // The third chunk was never requested.
        assert_eq!(synth.calls().len(), 2);

        let status = narrator.status();
        assert!(!status.loading);
        assert!(!narrator.is_playing());
        assert!(
            matches!(&status.state, PlaybackState::Error(m) if m.contains("quota exceeded"))
        );

        let events = drain(&mut events);
        assert!(matches!(events.first(), Some(PlaybackEvent::Started { chunks: 3 })));
        assert!(matches!(events.last(), Some(PlaybackEvent::Failed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_during_first_fetch_stops() {
        let synth = ScriptedSynth::new(500, vec![]);
        let (device, mut narrator) = narrator(&synth, settings(1000, 2));
        let mut events = narrator.events();

        narrator
            .listen("Some words.")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(narrator.is_loading());

        narrator
            .listen("Some words.")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(narrator.status().state, PlaybackState::Idle);
        assert!(!narrator.is_loading());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(device.sources().is_empty());
        assert_eq!(synth.calls().len(), 1);
        assert_eq!(narrator.status().state, PlaybackState::Idle);

        let events = drain(&mut events);
        assert_eq!(events.last(), Some(&PlaybackEvent::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_text_finishes_without_requests() {
        let synth = ScriptedSynth::new(100, vec![]);
        let (device, mut narrator) = narrator(&synth, settings(1000, 2));
        let mut events = narrator.events();

        narrator.listen("").await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(narrator.status().state, PlaybackState::Starting);

        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;

        assert!(synth.calls().is_empty());
        assert!(device.sources().is_empty());
        let events = drain(&mut events);
        assert_eq!(
            events,
            vec![PlaybackEvent::Started { chunks: 1 }, PlaybackEvent::Finished]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn chunks_play_in_order_without_overlap() {
        let synth = ScriptedSynth::new(
            300,
            vec![Reply::Audio(0.4), Reply::Audio(1.0), Reply::Audio(0.2)],
        );
        let (device, mut narrator) = narrator(&synth, settings(25, 2));

        narrator
            .play(THREE_SENTENCES)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;

        assert_eq!(
            synth.calls(),
            vec![
                "First sentence is here.",
                " Second sentence here.",
                " Third sentence here."
            ]
        );
        let sources = device.sources();
        assert_eq!(sources.len(), 3);
        assert!(sources.iter().all(|s| s.state == SourceState::Ended));
        assert_back_to_back(&device);
    }

    #[tokio::test(start_paused = true)]
    async fn prefetch_depth_bounds_lookahead() {
        let synth = ScriptedSynth::new(50, vec![]);
        let (_device, mut narrator) = narrator(&synth, settings(5, 1));

        narrator
            .play("One. Two. Six. Ten.")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(600)).await;

        // Chunk 0 is playing and chunk 1 is scheduled behind it.
        assert_eq!(synth.calls().len(), 2);

        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;
        assert_eq!(synth.calls().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_chunks_do_not_stop_playback() {
        let synth = ScriptedSynth::new(
            50,
            vec![Reply::Audio(0.5), Reply::Garbled, Reply::Empty],
        );
        let (device, mut narrator) = narrator(&synth, settings(25, 2));
        let mut events = narrator.events();

        narrator
            .play(&format!("{THREE_SENTENCES} Fourth one here."))
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;

        let played: Vec<usize> = device.sources().iter().map(|s| s.index).collect();
        assert_eq!(played, vec![0, 3]);
        assert_back_to_back(&device);

        let skipped: Vec<(usize, SkipReason)> = drain(&mut events)
            .into_iter()
            .filter_map(|e| match e {
                PlaybackEvent::ChunkSkipped { index, reason } => Some((index, reason)),
                _ => None,
            })
            .collect();
        assert_eq!(skipped.len(), 2);
        assert!(matches!(skipped[0], (1, SkipReason::Undecodable(_))));
        assert_eq!(skipped[1], (2, SkipReason::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_mid_playback_silences_scheduled_audio() {
        let synth = ScriptedSynth::new(50, vec![]);
        let (device, mut narrator) = narrator(&synth, settings(25, 2));

        narrator
            .play(THREE_SENTENCES)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(narrator.is_playing());
        assert_eq!(device.sources().len(), 3);

        narrator.stop().await;
        assert_eq!(narrator.status().state, PlaybackState::Idle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(
            device
                .sources()
                .iter()
                .all(|s| s.state == SourceState::Stopped)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_when_idle_is_a_no_op() {
        let synth = ScriptedSynth::new(50, vec![]);
        let (_device, mut narrator) = narrator(&synth, settings(1000, 2));
        let mut events = narrator.events();

        narrator.stop().await;
        narrator.stop().await;

        assert_eq!(narrator.status(), PlaybackStatus::default());
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn play_replaces_current_narration() {
        let synth = ScriptedSynth::new(50, vec![]);
        let (device, mut narrator) = narrator(&synth, settings(25, 2));

        narrator
            .play(THREE_SENTENCES)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(500)).await;

        narrator
            .play("Something else.")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(narrator.status().chunks, 1);
        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;

        let sources = device.sources();
        assert_eq!(sources.len(), 4);
        assert!(sources[..3].iter().all(|s| s.state == SourceState::Stopped));
        assert_eq!(sources[3].state, SourceState::Ended);
        assert!(sources[3].start.unwrap_or_default() >= 0.5);
        assert_eq!(synth.calls().last().map(String::as_str), Some("Something else."));
    }

    #[tokio::test(start_paused = true)]
    async fn listen_after_error_starts_again() {
        let synth = ScriptedSynth::new(50, vec![Reply::Fail("unavailable")]);
        let (_device, mut narrator) = narrator(&synth, settings(1000, 2));

        narrator.listen("Hi.").await.unwrap_or_else(|e| panic!("{e}"));
        wait_until(&narrator, |s| matches!(s.state, PlaybackState::Error(_))).await;

        narrator.listen("Hi.").await.unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(narrator.status().state, PlaybackState::Starting);
        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;
        assert_eq!(synth.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn device_opened_once() {
        let synth = ScriptedSynth::new(10, vec![]);
        let device = Arc::new(VirtualOutput::new());
        let opened = Arc::new(AtomicUsize::new(0));

        let factory_device = Arc::clone(&device);
        let factory_opened = Arc::clone(&opened);
        let mut narrator = Narrator::new(
            Arc::clone(&synth),
            settings(1000, 2),
            Box::new(move || -> Result<Arc<dyn OutputDevice>> {
                factory_opened.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::clone(&factory_device) as Arc<dyn OutputDevice>)
            }),
        );
        assert_eq!(opened.load(Ordering::SeqCst), 0);

        for _ in 0..2 {
            narrator.play("Again.").await.unwrap_or_else(|e| panic!("{e}"));
            wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;
        }
        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(device.sources().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn device_failure_is_reported() {
        let synth = ScriptedSynth::new(10, vec![]);
        let mut narrator = Narrator::new(
            Arc::clone(&synth),
            settings(1000, 2),
            Box::new(|| -> Result<Arc<dyn OutputDevice>> {
                Err(RecitalError::Audio("no output device available".to_string()))
            }),
        );

        let err = narrator
            .play("Hello.")
            .await
            .err()
            .unwrap_or_else(|| panic!("expected failure"));
        assert!(matches!(err, RecitalError::Audio(_)));
        assert!(matches!(narrator.status().state, PlaybackState::Error(_)));
        assert!(synth.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_narrator_stops_playback() {
        let synth = ScriptedSynth::new(50, vec![]);
        let (device, mut narrator) = narrator(&synth, settings(25, 2));

        narrator
            .play(THREE_SENTENCES)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(narrator);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let sources = device.sources();
        assert!(!sources.is_empty());
        assert!(sources.iter().all(|s| s.state == SourceState::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn loading_until_first_segment_is_audible() {
        let synth = ScriptedSynth::new(200, vec![Reply::Audio(1.0)]);
        let (_device, mut narrator) = narrator(&synth, settings(1000, 2));

        narrator
            .play("Hello world.")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        // Scheduled at 0.2s, audible after the 50ms lead-in.
        tokio::time::sleep(Duration::from_millis(220)).await;
        assert_eq!(narrator.status().state, PlaybackState::Playing);
        assert!(narrator.is_loading());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!narrator.is_loading());
        assert!(narrator.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn output_fault_ends_playback_with_error() {
        let synth = ScriptedSynth::new(50, vec![Reply::Audio(10.0)]);
        let (device, mut narrator) = narrator(&synth, settings(1000, 2));
        let mut events = narrator.events();

        narrator
            .play("A long one.")
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(narrator.is_playing());

        device.fail("device unplugged");
        wait_until(&narrator, |s| matches!(s.state, PlaybackState::Error(_))).await;

        assert!(device.current_time() < 1.5);
        assert!(!narrator.is_playing());
        assert!(!narrator.is_loading());
        assert!(
            matches!(&narrator.status().state, PlaybackState::Error(m) if m.contains("device unplugged"))
        );
        assert_eq!(device.sources()[0].state, SourceState::Stopped);
        assert!(matches!(
            drain(&mut events).last(),
            Some(PlaybackEvent::Failed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn faulted_device_is_reopened() {
        let synth = ScriptedSynth::new(10, vec![]);
        let opened: Arc<std::sync::Mutex<Vec<Arc<VirtualOutput>>>> = Arc::default();

        let factory_opened = Arc::clone(&opened);
        let mut narrator = Narrator::new(
            Arc::clone(&synth),
            settings(1000, 2),
            Box::new(move || -> Result<Arc<dyn OutputDevice>> {
                let device = Arc::new(VirtualOutput::new());
                factory_opened
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .push(Arc::clone(&device));
                Ok(device as Arc<dyn OutputDevice>)
            }),
        );

        narrator.play("First.").await.unwrap_or_else(|e| panic!("{e}"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let first = Arc::clone(&opened.lock().unwrap_or_else(std::sync::PoisonError::into_inner)[0]);
        first.fail("device unplugged");
        wait_until(&narrator, |s| matches!(s.state, PlaybackState::Error(_))).await;

        narrator.play("Second.").await.unwrap_or_else(|e| panic!("{e}"));
        wait_until(&narrator, |s| s.state == PlaybackState::Idle).await;

        let opened = opened.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        assert_eq!(opened.len(), 2);
        assert_eq!(opened[1].sources().len(), 1);
        assert_eq!(opened[1].sources()[0].state, SourceState::Ended);
    }
}
