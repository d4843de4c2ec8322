//! Capture backend contract and the cpal implementation.
//!
//! A backend owns the platform stream. It is handed a [`CaptureTap`] on
//! `open` and from then on pushes mono `i16` samples at the pipeline rate
//! through it, reporting stream transitions through the same tap. Anything
//! satisfying these two callback shapes is pluggable; tests script one and
//! [`WavFeedBackend`](crate::capture::feed::WavFeedBackend) replays files.
//!
//! `cpal::Stream` is `!Send`, so backends are created and dropped on the
//! worker thread via a `Send + Sync` [`BackendFactory`].

use std::sync::Arc;

use crate::capture::CaptureTap;
use crate::error::Result;

/// Stream transition reported by a backend through the tap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// The backend is (re)establishing its stream.
    Negotiating,
    /// Samples are flowing.
    Streaming,
    /// The stream failed; the worker decides whether to re-negotiate.
    Failed(String),
}

/// Platform audio source driven by the capture worker.
pub trait CaptureBackend {
    /// Opens the stream and begins delivery through `tap` on the backend's
    /// own thread. Returns once negotiation succeeded or failed.
    fn open(&mut self, tap: CaptureTap) -> Result<()>;

    /// Tears the stream down. In-flight callbacks complete or are discarded;
    /// no delivery happens after this returns.
    fn close(&mut self);
}

/// Creates a backend on the worker thread.
pub type BackendFactory = Arc<dyn Fn() -> Result<Box<dyn CaptureBackend>> + Send + Sync>;

#[cfg(feature = "audio-cpal")]
pub use cpal_backend::CpalBackend;

#[cfg(feature = "audio-cpal")]
mod cpal_backend {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
    use tracing::info;

    use super::{CaptureBackend, StreamState};
    use crate::capture::device::select_capture_device;
    use crate::capture::resample::RateConverter;
    use crate::capture::CaptureTap;
    use crate::error::{Result, SonoscopeError};

    /// System-audio capture through cpal, preferring loopback-style devices.
    #[derive(Default)]
    pub struct CpalBackend {
        stream: Option<Stream>,
    }

    impl CpalBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl CaptureBackend for CpalBackend {
        fn open(&mut self, tap: CaptureTap) -> Result<()> {
            let host = cpal::default_host();
            let device = select_capture_device(&host)?;
            let supported = device
                .default_input_config()
                .map_err(|e| SonoscopeError::AudioDevice(e.to_string()))?;

            let device_rate = supported.sample_rate().0;
            let channels = supported.channels();
            info!(
                device = device.name().unwrap_or_default().as_str(),
                device_rate, channels, "opening capture device"
            );

            let config = StreamConfig {
                channels,
                sample_rate: supported.sample_rate(),
                buffer_size: cpal::BufferSize::Default,
            };
            let converter = RateConverter::new(device_rate)?;

            let stream = match supported.sample_format() {
                SampleFormat::F32 => {
                    build_stream::<f32>(&device, &config, converter, tap.clone())
                }
                SampleFormat::I16 => {
                    build_stream::<i16>(&device, &config, converter, tap.clone())
                }
                SampleFormat::U16 => {
                    build_stream::<u16>(&device, &config, converter, tap.clone())
                }
                other => Err(SonoscopeError::AudioStream(format!(
                    "unsupported sample format {other:?}"
                ))),
            }?;

            stream
                .play()
                .map_err(|e| SonoscopeError::AudioStream(e.to_string()))?;
            tap.stream_state(StreamState::Streaming);
            self.stream = Some(stream);
            Ok(())
        }

        fn close(&mut self) {
            self.stream.take();
        }
    }

    /// Builds an input stream whose callback downmixes to mono, resamples to
    /// the pipeline rate and delivers `i16` chunks. No locks are taken on
    /// the audio callback.
    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        mut converter: RateConverter,
        tap: CaptureTap,
    ) -> Result<Stream>
    where
        T: SizedSample,
        f32: FromSample<T>,
    {
        let channels = config.channels as usize;
        let err_tap = tap.clone();
        let mut mono: Vec<f32> = Vec::new();
        let mut out: Vec<i16> = Vec::new();

        device
            .build_input_stream(
                config,
                move |data: &[T], _info| {
                    let frames = data.len() / channels;
                    mono.clear();
                    for frame in 0..frames {
                        let base = frame * channels;
                        let mut sum = 0f32;
                        for c in 0..channels {
                            sum += f32::from_sample(data[base + c]);
                        }
                        mono.push(sum / channels as f32);
                    }

                    out.clear();
                    converter.convert(&mono, &mut out);
                    if !out.is_empty() {
                        tap.deliver(&out);
                    }
                },
                move |err| err_tap.stream_state(StreamState::Failed(err.to_string())),
                None,
            )
            .map_err(|e| SonoscopeError::AudioStream(e.to_string()))
    }
}
