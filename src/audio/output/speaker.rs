use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use crossbeam_channel::{Sender, bounded};
use tokio::sync::watch;

use crate::audio::resample::resample;
use crate::audio::segment::AudioSegment;
use crate::config::AudioConfig;
use crate::error::{RecitalError, Result};

use super::{BufferSource, EndedCallback, OutputDevice};

struct Voice {
    id: u64,
    start_frame: u64,
    samples: Vec<f32>,
    position: usize,
    on_ended: Option<EndedCallback>,
}

/// Sums every started voice into the output buffer and keeps the frame clock.
#[derive(Default)]
struct Mixer {
    frame: u64,
    next_id: u64,
    voices: Vec<Voice>,
}

impl Mixer {
    /// Render one interleaved buffer, returning callbacks of voices that finished.
    fn render(&mut self, out: &mut [f32], channels: usize) -> Vec<EndedCallback> {
        let frames = out.len() / channels;

        for (offset, frame) in out.chunks_exact_mut(channels).enumerate() {
            let now = self.frame + offset as u64;
            let mut sum = 0.0f32;
            for voice in &mut self.voices {
                if now >= voice.start_frame && voice.position < voice.samples.len() {
                    sum += voice.samples[voice.position];
                    voice.position += 1;
                }
            }
            frame.fill(sum.clamp(-1.0, 1.0));
        }

        self.frame += frames as u64;

        let mut finished = Vec::new();
        self.voices.retain_mut(|voice| {
            if voice.position >= voice.samples.len() {
                if let Some(cb) = voice.on_ended.take() {
                    finished.push(cb);
                }
                false
            } else {
                true
            }
        });
        finished
    }
}

type SharedMixer = Arc<Mutex<Mixer>>;
type Fault = Arc<watch::Sender<Option<String>>>;

/// Plays segments on a cpal output device.
///
/// The cpal stream lives on a dedicated thread for the lifetime of this value;
/// dropping it closes the device.
pub struct SpeakerOutput {
    name: String,
    sample_rate: u32,
    mixer: SharedMixer,
    fault: Fault,
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SpeakerOutput {
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let mixer: SharedMixer = Arc::new(Mutex::new(Mixer::default()));
        let fault: Fault = Arc::new(watch::Sender::new(None));
        let (ready_tx, ready_rx) = bounded::<Result<(String, u32)>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let device_name = config.device.clone();
        let thread_mixer = Arc::clone(&mixer);
        let thread_fault = Arc::clone(&fault);

        let thread = std::thread::Builder::new()
            .name("recital-output".to_string())
            .spawn(move || {
                let stream = match build_stream(device_name.as_deref(), thread_mixer, thread_fault) {
                    Ok((stream, name, rate)) => {
                        let _ = ready_tx.send(Ok((name, rate)));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Parked until shutdown is requested or the sender is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                tracing::debug!("output stream thread exiting");
            })?;

        let (name, sample_rate) = ready_rx
            .recv()
            .map_err(|_| RecitalError::Audio("output stream thread exited early".to_string()))??;

        tracing::info!("opened output device '{name}' at {sample_rate}Hz");

        Ok(Self {
            name,
            sample_rate,
            mixer,
            fault,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("output stream thread panicked");
        }
    }
}

impl OutputDevice for SpeakerOutput {
    fn current_time(&self) -> f64 {
        let frame = self
            .mixer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .frame;
        frame as f64 / f64::from(self.sample_rate)
    }

    fn create_source(&self, segment: AudioSegment) -> Result<Box<dyn BufferSource>> {
        let samples = resample(&segment.samples, segment.sample_rate, self.sample_rate)?;
        Ok(Box::new(SpeakerSource {
            mixer: Arc::clone(&self.mixer),
            sample_rate: self.sample_rate,
            samples: Some(samples),
            id: None,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn fault(&self) -> watch::Receiver<Option<String>> {
        self.fault.subscribe()
    }
}

struct SpeakerSource {
    mixer: SharedMixer,
    sample_rate: u32,
    samples: Option<Vec<f32>>,
    id: Option<u64>,
}

impl BufferSource for SpeakerSource {
    fn start(&mut self, when: f64, on_ended: EndedCallback) -> Result<()> {
        let samples = self
            .samples
            .take()
            .ok_or_else(|| RecitalError::Audio("source already started".to_string()))?;

        let start_frame = (when.max(0.0) * f64::from(self.sample_rate)).round() as u64;

        let mut mixer = self.mixer.lock().unwrap_or_else(PoisonError::into_inner);
        let id = mixer.next_id;
        mixer.next_id += 1;
        mixer.voices.push(Voice {
            id,
            start_frame,
            samples,
            position: 0,
            on_ended: Some(on_ended),
        });
        self.id = Some(id);
        Ok(())
    }

    fn stop(&mut self) {
        self.samples = None;
        if let Some(id) = self.id.take() {
            self.mixer
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .voices
                .retain(|v| v.id != id);
        }
    }
}

fn find_device(host: &cpal::Host, name: Option<&str>) -> Result<Device> {
    if let Some(name) = name {
        host.output_devices()
            .map_err(|e| RecitalError::Audio(format!("failed to enumerate output devices: {e}")))?
            .find(|d| device_name(d).as_deref() == Some(name))
            .ok_or_else(|| RecitalError::Audio(format!("output device not found: {name}")))
    } else {
        host.default_output_device()
            .ok_or_else(|| RecitalError::Audio("no default output device available".to_string()))
    }
}

fn device_name(device: &Device) -> Option<String> {
    device
        .description()
        .ok()
        .map(|desc| desc.name().to_string())
}

fn build_stream(
    name: Option<&str>,
    mixer: SharedMixer,
    fault: Fault,
) -> Result<(Stream, String, u32)> {
    let host = cpal::default_host();
    let device = find_device(&host, name)?;

    let supported = device
        .default_output_config()
        .map_err(|e| RecitalError::Audio(format!("failed to get default output config: {e}")))?;

    let sample_rate = supported.sample_rate();
    let channels = supported.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate,
        buffer_size: cpal::BufferSize::Default,
    };

    // The frame clock stops with the stream, so every error is terminal.
    let err_fn = move |err: cpal::StreamError| {
        tracing::error!("audio output stream error: {err}");
        report_fault(&fault, format!("audio output stream error: {err}"));
    };

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                let finished = mixer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .render(data, channels as usize);
                for cb in finished {
                    cb();
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| RecitalError::Audio(format!("failed to build output stream: {e}")))?;

    stream
        .play()
        .map_err(|e| RecitalError::Audio(format!("failed to start output stream: {e}")))?;

    let name = device_name(&device).unwrap_or_else(|| "default".to_string());
    Ok((stream, name, sample_rate))
}

/// Record the first fault; later ones are only logged.
fn report_fault(fault: &Fault, message: String) {
    fault.send_if_modified(|current| {
        if current.is_some() {
            return false;
        }
        *current = Some(message);
        true
    });
}

/// Names of every output device the default host reports.
pub fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| RecitalError::Audio(format!("failed to enumerate output devices: {e}")))?;
    Ok(devices.filter_map(|d| device_name(&d)).collect())
}

#[must_use]
pub fn default_output_device_name() -> Option<String> {
    cpal::default_host()
        .default_output_device()
        .and_then(|d| device_name(&d))
}
