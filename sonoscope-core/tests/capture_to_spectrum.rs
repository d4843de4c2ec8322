//! End-to-end pipeline tests over a scripted generator backend: capture
//! worker → double buffer → 60 Hz spectrum loop → broadcast frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use sonoscope_core::capture::backend::{BackendFactory, CaptureBackend, StreamState};
use sonoscope_core::capture::{CaptureConfig, CaptureTap};
use sonoscope_core::{Result, ServiceRef, Sonoscope, SpectrumFrame, CHUNK_SIZE, SAMPLE_RATE};

/// Backend that synthesizes chunks from a generator function on its own
/// thread, standing in for a platform stream.
struct GeneratorBackend {
    generator: Arc<dyn Fn(u64) -> Vec<i16> + Send + Sync>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureBackend for GeneratorBackend {
    fn open(&mut self, tap: CaptureTap) -> Result<()> {
        let generator = Arc::clone(&self.generator);
        let stop = Arc::clone(&self.stop);
        self.stop.store(false, Ordering::Relaxed);
        self.thread = Some(std::thread::spawn(move || {
            tap.stream_state(StreamState::Streaming);
            let mut chunk_index = 0u64;
            while !stop.load(Ordering::Relaxed) {
                tap.deliver(&generator(chunk_index));
                chunk_index += 1;
                std::thread::sleep(Duration::from_millis(5));
            }
        }));
        Ok(())
    }

    fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn generator_factory(generator: impl Fn(u64) -> Vec<i16> + Send + Sync + 'static) -> BackendFactory {
    let generator: Arc<dyn Fn(u64) -> Vec<i16> + Send + Sync> = Arc::new(generator);
    Arc::new(move || {
        Ok(Box::new(GeneratorBackend {
            generator: Arc::clone(&generator),
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }) as Box<dyn CaptureBackend>)
    })
}

fn silence_factory() -> BackendFactory {
    generator_factory(|_| vec![0i16; CHUNK_SIZE])
}

fn sine_factory(freq: f32, amplitude: f32) -> BackendFactory {
    generator_factory(move |chunk_index| {
        let base = chunk_index * CHUNK_SIZE as u64;
        (0..CHUNK_SIZE as u64)
            .map(|i| {
                let t = (base + i) as f32 / SAMPLE_RATE as f32;
                (amplitude * (std::f32::consts::TAU * freq * t).sin() * 32767.0) as i16
            })
            .collect()
    })
}

fn recv_frame_with_timeout(
    rx: &mut broadcast::Receiver<SpectrumFrame>,
    timeout: Duration,
) -> Option<SpectrumFrame> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(frame) => return Some(frame),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(broadcast::error::TryRecvError::Closed) => return None,
            Err(broadcast::error::TryRecvError::Empty) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        }
    }
}

/// Skips ahead to the newest frame available after `settle`.
fn settled_frame(
    rx: &mut broadcast::Receiver<SpectrumFrame>,
    settle: Duration,
) -> Option<SpectrumFrame> {
    std::thread::sleep(settle);
    let mut frame = None;
    while let Ok(f) = rx.try_recv() {
        frame = Some(f);
    }
    frame.or_else(|| recv_frame_with_timeout(rx, Duration::from_secs(1)))
}

#[test]
fn silence_produces_zero_bars() {
    let engine = Sonoscope::new(silence_factory(), CaptureConfig::default(), 8).unwrap();
    let hold = ServiceRef::acquire(&engine.spectrum_service()).unwrap();
    let mut frames = engine.spectrum().subscribe();

    let frame = settled_frame(&mut frames, Duration::from_millis(400)).expect("no frame");
    assert_eq!(frame.bars.len(), 8);
    assert!(
        frame.bars.iter().all(|&v| v < 1e-3),
        "silence produced energy: {:?}",
        frame.bars
    );

    drop(hold);
    engine.shutdown();
}

#[test]
fn sine_elevates_the_matching_bar() {
    let engine = Sonoscope::new(sine_factory(1000.0, 0.8), CaptureConfig::default(), 16).unwrap();
    let hold = ServiceRef::acquire(&engine.spectrum_service()).unwrap();
    let mut frames = engine.spectrum().subscribe();

    let frame = settled_frame(&mut frames, Duration::from_millis(800)).expect("no frame");
    let argmax = frame
        .bars
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap();
    // 1 kHz maps to bar ~9 of 16 across the 50 Hz – 10 kHz log range.
    assert!(
        (8..=10).contains(&argmax),
        "peak at bar {argmax}: {:?}",
        frame.bars
    );
    assert!(frame.bars[argmax] > 0.3);

    drop(hold);
    engine.shutdown();
}

#[test]
fn bar_count_change_applies_to_a_following_frame() {
    let engine = Sonoscope::new(silence_factory(), CaptureConfig::default(), 64).unwrap();
    let hold = ServiceRef::acquire(&engine.spectrum_service()).unwrap();
    let mut frames = engine.spectrum().subscribe();

    let before = recv_frame_with_timeout(&mut frames, Duration::from_secs(2)).expect("no frame");
    assert_eq!(before.bars.len(), 64);

    engine.spectrum().set_bars(32).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let frame = recv_frame_with_timeout(&mut frames, Duration::from_secs(1))
            .expect("frames stopped after set_bars");
        if frame.bars.len() == 32 {
            break;
        }
        assert_eq!(frame.bars.len(), 64, "unexpected frame width");
        assert!(Instant::now() < deadline, "new bar count never applied");
    }

    // Invalid requests are rejected and change nothing.
    assert!(engine.spectrum().set_bars(0).is_err());
    let after = settled_frame(&mut frames, Duration::from_millis(100)).expect("no frame");
    assert_eq!(after.bars.len(), 32);

    drop(hold);
    engine.shutdown();
}

#[test]
fn frames_are_sequenced_and_paced() {
    let engine = Sonoscope::new(silence_factory(), CaptureConfig::default(), 8).unwrap();
    let hold = ServiceRef::acquire(&engine.spectrum_service()).unwrap();
    let mut frames = engine.spectrum().subscribe();

    let mut collected = Vec::new();
    let deadline = Instant::now() + Duration::from_millis(500);
    while Instant::now() < deadline {
        if let Some(frame) = recv_frame_with_timeout(&mut frames, Duration::from_millis(100)) {
            collected.push(frame.seq);
        }
    }

    assert!(
        collected.len() >= 15 && collected.len() <= 45,
        "expected ~30 frames in 500 ms, got {}",
        collected.len()
    );
    for pair in collected.windows(2) {
        assert!(pair[0] < pair[1], "sequence not increasing: {collected:?}");
    }

    drop(hold);
    engine.shutdown();
}

#[test]
fn latest_frame_is_cached_while_running() {
    let engine = Sonoscope::new(silence_factory(), CaptureConfig::default(), 8).unwrap();
    assert!(engine.spectrum().latest().is_none());

    let hold = ServiceRef::acquire(&engine.spectrum_service()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while engine.spectrum().latest().is_none() {
        assert!(Instant::now() < deadline, "no cached frame");
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(engine.spectrum().latest().unwrap().bars.len(), 8);

    drop(hold);
    engine.shutdown();
}
