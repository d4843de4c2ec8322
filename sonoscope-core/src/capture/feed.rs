//! Wav-file capture backend.
//!
//! Replays a wav file through the normal backend contract at real-time pace,
//! which makes the whole pipeline runnable without any audio hardware. Used
//! by the demo binary; delivery simply stops at end of file (the worker's
//! idle detection takes over) unless looping is enabled.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info};

use crate::capture::backend::{CaptureBackend, StreamState};
use crate::capture::resample::RateConverter;
use crate::capture::CaptureTap;
use crate::error::{Result, SonoscopeError};
use crate::{CHUNK_SIZE, SAMPLE_RATE};

pub struct WavFeedBackend {
    path: PathBuf,
    looping: bool,
    stop: Arc<AtomicBool>,
    feeder: Option<JoinHandle<()>>,
}

impl WavFeedBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            looping: false,
            stop: Arc::new(AtomicBool::new(false)),
            feeder: None,
        }
    }

    /// Restart from the beginning at end of file instead of going silent.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }
}

impl CaptureBackend for WavFeedBackend {
    fn open(&mut self, tap: CaptureTap) -> Result<()> {
        let samples = Arc::new(load_wav_mono_i16(&self.path)?);
        info!(
            path = %self.path.display(),
            samples = samples.len(),
            "wav feed loaded"
        );

        self.stop.store(false, Ordering::Relaxed);
        let stop = Arc::clone(&self.stop);
        let looping = self.looping;
        let pace = Duration::from_secs_f64(CHUNK_SIZE as f64 / SAMPLE_RATE as f64);

        let feeder = std::thread::Builder::new()
            .name("wav-feed".into())
            .spawn(move || {
                tap.stream_state(StreamState::Streaming);
                loop {
                    for chunk in samples.chunks(CHUNK_SIZE) {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        tap.deliver(chunk);
                        std::thread::sleep(pace);
                    }
                    if !looping {
                        debug!("wav feed reached end of file");
                        return;
                    }
                }
            })?;

        self.feeder = Some(feeder);
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
    }
}

impl Drop for WavFeedBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Decodes a wav file to mono `i16` at the pipeline rate.
fn load_wav_mono_i16(path: &std::path::Path) -> Result<Vec<i16>> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| SonoscopeError::AudioStream(format!("wav open: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let mono: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => downmix(
            reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| SonoscopeError::AudioStream(format!("wav decode: {e}")))?,
            channels,
        ),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            downmix(
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| SonoscopeError::AudioStream(format!("wav decode: {e}")))?,
                channels,
            )
        }
    };

    let mut converter = RateConverter::new(spec.sample_rate)?;
    let mut samples = Vec::with_capacity(mono.len());
    converter.convert(&mono, &mut samples);
    Ok(samples)
}

fn downmix(interleaved: Vec<f32>, channels: usize) -> Vec<f32> {
    if channels == 1 {
        return interleaved;
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
