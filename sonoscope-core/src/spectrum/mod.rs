//! Spectrum service: 60 Hz analysis over the capture buffer.
//!
//! `SpectrumService` is ref-counted like the capture service. While held it
//! keeps its own [`ServiceRef`] on the capture service (consumer → spectrum →
//! capture, never the other way) and runs a [`CadencedLoop`] that reads the
//! latest capture window, analyzes it and broadcasts a [`SpectrumFrame`]
//! per tick.
//!
//! Bar-count changes are staged in an atomic and applied at the next tick
//! boundary, so a tick never observes half-resized working buffers.

pub mod analyzer;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::buffering::CaptureBuffer;
use crate::capture::CaptureService;
use crate::error::{Result, SonoscopeError};
use crate::events::SpectrumFrame;
use crate::processor::{CadencedLoop, Processor};
use crate::service::{RefRegistry, Service, ServiceRef};
use crate::spectrum::analyzer::{window_for_bars, SpectrumAnalyzer, MAX_BARS};

pub use analyzer::DEFAULT_BARS;

/// Ref-counted spectrum-bar producer.
pub struct SpectrumService {
    registry: RefRegistry,
    capture: Arc<CaptureService>,
    /// Requested bar count; the tick loop applies it at the next boundary.
    requested_bars: Arc<AtomicUsize>,
    frames_tx: broadcast::Sender<SpectrumFrame>,
    latest: Arc<Mutex<Option<SpectrumFrame>>>,
    runner: Mutex<Option<CadencedLoop>>,
    capture_ref: Mutex<Option<ServiceRef>>,
}

impl SpectrumService {
    pub fn new(capture: Arc<CaptureService>, bars: usize) -> Result<Arc<Self>> {
        if bars == 0 || bars > MAX_BARS {
            return Err(SonoscopeError::InvalidBarCount(bars));
        }
        let (frames_tx, _) = broadcast::channel(64);
        Ok(Arc::new(Self {
            registry: RefRegistry::new(),
            capture,
            requested_bars: Arc::new(AtomicUsize::new(bars)),
            frames_tx,
            latest: Arc::new(Mutex::new(None)),
            runner: Mutex::new(None),
            capture_ref: Mutex::new(None),
        }))
    }

    /// Currently requested bar count.
    pub fn bars(&self) -> usize {
        self.requested_bars.load(Ordering::Acquire)
    }

    /// Requests a new bar count, applied at the next tick boundary. Invalid
    /// counts are rejected and the prior configuration is retained.
    pub fn set_bars(&self, bars: usize) -> Result<()> {
        if bars == 0 || bars > MAX_BARS {
            return Err(SonoscopeError::InvalidBarCount(bars));
        }
        self.requested_bars.store(bars, Ordering::Release);
        debug!(bars, "bar count requested");
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SpectrumFrame> {
        self.frames_tx.subscribe()
    }

    /// Most recent frame, for pull-style consumers.
    pub fn latest(&self) -> Option<SpectrumFrame> {
        self.latest.lock().clone()
    }
}

impl Service for SpectrumService {
    fn name(&self) -> &str {
        "spectrum"
    }

    fn registry(&self) -> &RefRegistry {
        &self.registry
    }

    fn on_start(&self) -> Result<()> {
        let bars = self.requested_bars.load(Ordering::Acquire);
        self.capture.set_window(window_for_bars(bars))?;

        let capture_service: Arc<dyn Service> = self.capture.clone();
        let guard = ServiceRef::acquire(&capture_service)?;

        let ticker = SpectrumTicker {
            buffer: self.capture.buffer(),
            capture: Arc::clone(&self.capture),
            analyzer: SpectrumAnalyzer::new(bars)?,
            requested_bars: Arc::clone(&self.requested_bars),
            frames_tx: self.frames_tx.clone(),
            latest: Arc::clone(&self.latest),
            window_buf: Vec::new(),
            seq: 0,
        };
        let runner = CadencedLoop::spawn("spectrum", ticker)?;

        *self.runner.lock() = Some(runner);
        *self.capture_ref.lock() = Some(guard);
        Ok(())
    }

    fn on_stop(&self) {
        if let Some(mut runner) = self.runner.lock().take() {
            runner.stop();
        }
        self.capture_ref.lock().take();
        self.latest.lock().take();
    }
}

struct SpectrumTicker {
    buffer: Arc<CaptureBuffer>,
    capture: Arc<CaptureService>,
    analyzer: SpectrumAnalyzer,
    requested_bars: Arc<AtomicUsize>,
    frames_tx: broadcast::Sender<SpectrumFrame>,
    latest: Arc<Mutex<Option<SpectrumFrame>>>,
    window_buf: Vec<f32>,
    seq: u64,
}

impl Processor for SpectrumTicker {
    fn tick(&mut self) {
        let requested = self.requested_bars.load(Ordering::Acquire);
        if requested != self.analyzer.bars() {
            match SpectrumAnalyzer::new(requested) {
                Ok(analyzer) => {
                    if let Err(e) = self.capture.set_window(analyzer.window()) {
                        warn!(error = %e, "capture re-window failed");
                    }
                    self.analyzer = analyzer;
                    debug!(bars = requested, "bar count applied");
                }
                Err(e) => warn!(error = %e, "ignoring invalid bar count"),
            }
        }

        self.buffer
            .read_latest_f32(&mut self.window_buf, self.analyzer.window());
        let bars = self.analyzer.analyze(&self.window_buf);

        self.seq += 1;
        let frame = SpectrumFrame {
            seq: self.seq,
            bars: bars.to_vec(),
        };
        *self.latest.lock() = Some(frame.clone());
        let _ = self.frames_tx.send(frame);
    }
}
