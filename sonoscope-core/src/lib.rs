//! sonoscope-core — system-audio capture and spectrum-bar analysis.
//!
//! The pipeline captures system output audio on a dedicated worker thread,
//! hands samples to readers through a lock-free double buffer, and derives a
//! smoothed, normalized bar spectrum at a fixed 60 Hz cadence:
//!
//! ```text
//!   capture backend (cpal / wav feed / scripted)
//!        │  mono i16 @ 44.1 kHz
//!        ▼
//!   CaptureTap ──► CaptureBuffer (double buffer, atomic swap)
//!                        │ readLatest
//!                        ▼
//!   CadencedLoop @ 60 Hz ──► SpectrumAnalyzer (FFT, log bands, smoothing)
//!                                  │
//!                                  ▼
//!                  broadcast SpectrumFrame { seq, bars: [0.0, 1.0] }
//! ```
//!
//! Both services are reference counted: the first holder starts the threads,
//! the last one stops them. The spectrum service holds its own reference on
//! the capture service, so a consumer only ever refs the spectrum.
//!
//! ```no_run
//! use sonoscope_core::{ServiceRef, Sonoscope};
//!
//! # fn main() -> sonoscope_core::Result<()> {
//! let engine = Sonoscope::with_system_audio()?;
//! let _hold = ServiceRef::acquire(&engine.spectrum_service())?;
//! let mut frames = engine.spectrum().subscribe();
//! while let Ok(frame) = frames.blocking_recv() {
//!     println!("{:?}", frame.bars);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod buffering;
pub mod capture;
pub mod error;
pub mod events;
pub mod processor;
pub mod service;
pub mod spectrum;

use std::sync::Arc;

use crate::capture::backend::BackendFactory;
use crate::capture::{CaptureConfig, CaptureService};
use crate::spectrum::SpectrumService;

pub use crate::error::{Result, SonoscopeError};
pub use crate::events::{CaptureStatus, CaptureStatusEvent, SpectrumFrame};
pub use crate::service::{HolderId, Service, ServiceRef};

/// Fixed pipeline sample rate in Hz.
pub const SAMPLE_RATE: u32 = 44_100;
/// Nominal backend delivery size in samples. Deliveries of any size are
/// accepted; this is the pacing unit.
pub const CHUNK_SIZE: usize = 512;

/// Process-scoped engine handle owning the capture service and one spectrum
/// service. Explicitly constructed and passed by `Arc` — there is no global
/// instance.
pub struct Sonoscope {
    capture: Arc<CaptureService>,
    spectrum: Arc<SpectrumService>,
}

impl Sonoscope {
    /// Builds an engine over an arbitrary capture backend.
    pub fn new(factory: BackendFactory, config: CaptureConfig, bars: usize) -> Result<Arc<Self>> {
        let capture = CaptureService::new(factory, config);
        let spectrum = SpectrumService::new(Arc::clone(&capture), bars)?;
        Ok(Arc::new(Self { capture, spectrum }))
    }

    /// Builds an engine capturing live system audio through cpal, with
    /// default tuning and bar count.
    #[cfg(feature = "audio-cpal")]
    pub fn with_system_audio() -> Result<Arc<Self>> {
        let capture = CaptureService::with_system_audio(CaptureConfig::default());
        let spectrum = SpectrumService::new(Arc::clone(&capture), spectrum::DEFAULT_BARS)?;
        Ok(Arc::new(Self { capture, spectrum }))
    }

    pub fn capture(&self) -> &Arc<CaptureService> {
        &self.capture
    }

    pub fn spectrum(&self) -> &Arc<SpectrumService> {
        &self.spectrum
    }

    /// The spectrum service as a refable [`Service`] handle.
    pub fn spectrum_service(&self) -> Arc<dyn Service> {
        self.spectrum.clone()
    }

    /// Force-stops both services regardless of outstanding holders. For
    /// process teardown.
    pub fn shutdown(&self) {
        self.spectrum.shutdown();
        self.capture.shutdown();
    }
}
