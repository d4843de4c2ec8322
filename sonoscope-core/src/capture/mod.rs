//! System-audio capture service.
//!
//! `CaptureService` owns the capture buffer and, while at least one holder
//! references it, a dedicated `audio-capture` worker thread. The worker
//! creates the backend (on its own thread, since platform streams are
//! `!Send`), negotiates with bounded retry/backoff, supervises delivery and
//! idle detection, and broadcasts [`CaptureStatusEvent`]s on every state
//! transition:
//!
//! ```text
//! Idle → Negotiating → Streaming → (Idle on silence timeout | Stopped)
//!              └─ bounded retries exhausted → Unavailable
//! ```
//!
//! Backends never see the service; they get a [`CaptureTap`] and push mono
//! `i16` samples at the pipeline rate through it.

pub mod backend;
pub mod device;
pub mod feed;
pub mod resample;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::buffering::CaptureBuffer;
use crate::capture::backend::{BackendFactory, CaptureBackend, StreamState};
use crate::error::Result;
use crate::events::{CaptureStatus, CaptureStatusEvent};
use crate::service::{RefRegistry, Service};

/// Capture tuning. The defaults match live operation; tests shrink the
/// timeouts.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Capture buffer capacity in samples (rounded to a power of two).
    pub window: usize,
    /// Silence period after which the worker goes idle.
    pub idle_timeout: Duration,
    /// Bounded negotiation retry budget.
    pub negotiation_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub initial_backoff: Duration,
    /// Supervision poll period (idle checks, stop responsiveness).
    pub poll_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            window: crate::CHUNK_SIZE,
            idle_timeout: Duration::from_millis(1500),
            negotiation_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            poll_interval: Duration::from_millis(100),
        }
    }
}

pub(crate) enum WorkerEvent {
    Stop,
    Resumed,
    State(StreamState),
}

/// Delivery endpoint handed to backends.
///
/// `deliver` runs on the backend's callback thread and takes no locks: it
/// stamps the delivery time and publishes into the lock-free buffer. The
/// buffer allows exactly one writer, and the worker publishes a silence
/// window when the stream goes idle — so while the idle flag is raised,
/// `deliver` drops the chunk and only signals `Resumed`; the worker clears
/// the flag once the silence publish is behind it.
#[derive(Clone)]
pub struct CaptureTap {
    buffer: Arc<CaptureBuffer>,
    idle: Arc<AtomicBool>,
    last_delivery_us: Arc<AtomicU64>,
    epoch: Instant,
    events: Sender<WorkerEvent>,
}

impl CaptureTap {
    pub(crate) fn new(buffer: Arc<CaptureBuffer>, events: Sender<WorkerEvent>) -> Self {
        Self {
            buffer,
            idle: Arc::new(AtomicBool::new(false)),
            last_delivery_us: Arc::new(AtomicU64::new(0)),
            epoch: Instant::now(),
            events,
        }
    }

    /// Pushes one chunk of mono samples at the pipeline rate. Dropped (with
    /// a `Resumed` signal) while the idle flag is raised, since the worker
    /// may be writing the silence window.
    pub fn deliver(&self, samples: &[i16]) {
        self.touch();
        if self.idle.load(Ordering::SeqCst) {
            let _ = self.events.send(WorkerEvent::Resumed);
            return;
        }
        self.buffer.publish(samples);
    }

    /// Reports a stream transition to the supervising worker.
    pub fn stream_state(&self, state: StreamState) {
        let _ = self.events.send(WorkerEvent::State(state));
    }

    // The stamp store / idle load in `deliver` and the idle store / stamp
    // load in the worker form a store-buffer pair: SeqCst on all four keeps
    // one side from missing the other, so the worker and a racing callback
    // can never both decide to publish.
    fn touch(&self) {
        self.last_delivery_us
            .store(self.epoch.elapsed().as_micros() as u64, Ordering::SeqCst);
    }

    fn mark_idle(&self) {
        self.idle.store(true, Ordering::SeqCst);
    }

    fn clear_idle(&self) {
        self.idle.store(false, Ordering::SeqCst);
    }

    fn elapsed_since_delivery(&self) -> Duration {
        let last = Duration::from_micros(self.last_delivery_us.load(Ordering::SeqCst));
        self.epoch.elapsed().saturating_sub(last)
    }
}

#[derive(Clone)]
struct StatusSink {
    current: Arc<Mutex<CaptureStatus>>,
    tx: broadcast::Sender<CaptureStatusEvent>,
}

impl StatusSink {
    fn get(&self) -> CaptureStatus {
        *self.current.lock()
    }

    fn set(&self, status: CaptureStatus, detail: Option<String>) {
        {
            let mut current = self.current.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        info!(?status, "capture status");
        let _ = self.tx.send(CaptureStatusEvent { status, detail });
    }
}

struct WorkerHandle {
    events: Sender<WorkerEvent>,
    thread: JoinHandle<()>,
}

/// Ref-counted system-audio capture.
pub struct CaptureService {
    registry: RefRegistry,
    buffer: Arc<CaptureBuffer>,
    factory: BackendFactory,
    config: Mutex<CaptureConfig>,
    worker: Mutex<Option<WorkerHandle>>,
    status: StatusSink,
}

impl CaptureService {
    pub fn new(factory: BackendFactory, config: CaptureConfig) -> Arc<Self> {
        let buffer = Arc::new(CaptureBuffer::new(config.window));
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            registry: RefRegistry::new(),
            buffer,
            factory,
            config: Mutex::new(config),
            worker: Mutex::new(None),
            status: StatusSink {
                current: Arc::new(Mutex::new(CaptureStatus::Stopped)),
                tx,
            },
        })
    }

    /// Live capture through the default cpal backend.
    #[cfg(feature = "audio-cpal")]
    pub fn with_system_audio(config: CaptureConfig) -> Arc<Self> {
        Self::new(
            Arc::new(|| Ok(Box::new(backend::CpalBackend::new()) as Box<dyn CaptureBackend>)),
            config,
        )
    }

    /// The shared sample buffer analyzers read from.
    pub fn buffer(&self) -> Arc<CaptureBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn status(&self) -> CaptureStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<CaptureStatusEvent> {
        self.status.tx.subscribe()
    }

    /// Re-windows the capture buffer, restarting the worker if it is running
    /// (the buffer may only be reconfigured with no active writer). Returns
    /// the effective capacity.
    pub fn set_window(&self, samples: usize) -> Result<usize> {
        let mut worker = self.worker.lock();
        if let Some(handle) = worker.take() {
            stop_worker(handle);
            let effective = self.buffer.configure(samples);
            self.config.lock().window = effective;
            *worker = Some(self.spawn_worker()?);
            debug!(capacity = effective, "capture window changed (worker restarted)");
            Ok(effective)
        } else {
            let effective = self.buffer.configure(samples);
            self.config.lock().window = effective;
            Ok(effective)
        }
    }

    fn spawn_worker(&self) -> Result<WorkerHandle> {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let ctx = WorkerContext {
            buffer: Arc::clone(&self.buffer),
            factory: Arc::clone(&self.factory),
            config: self.config.lock().clone(),
            events: events_rx,
            tap: CaptureTap::new(Arc::clone(&self.buffer), events_tx.clone()),
            status: self.status.clone(),
        };
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || run_worker(ctx))?;
        Ok(WorkerHandle {
            events: events_tx,
            thread,
        })
    }
}

impl Service for CaptureService {
    fn name(&self) -> &str {
        "capture"
    }

    fn registry(&self) -> &RefRegistry {
        &self.registry
    }

    fn on_start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_none() {
            *worker = Some(self.spawn_worker()?);
        }
        Ok(())
    }

    fn on_stop(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            stop_worker(handle);
        }
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        self.on_stop();
    }
}

fn stop_worker(handle: WorkerHandle) {
    let _ = handle.events.send(WorkerEvent::Stop);
    if handle.thread.join().is_err() {
        error!("capture worker thread panicked");
    }
}

struct WorkerContext {
    buffer: Arc<CaptureBuffer>,
    factory: BackendFactory,
    config: CaptureConfig,
    events: Receiver<WorkerEvent>,
    tap: CaptureTap,
    status: StatusSink,
}

enum Negotiation {
    Open,
    Unavailable,
    StopRequested,
}

fn run_worker(ctx: WorkerContext) {
    debug!("capture worker starting");
    let mut backend = match (ctx.factory)() {
        Ok(backend) => backend,
        Err(e) => {
            error!(error = %e, "capture backend construction failed");
            ctx.status
                .set(CaptureStatus::Unavailable, Some(e.to_string()));
            wait_for_stop(&ctx.events);
            ctx.status.set(CaptureStatus::Stopped, None);
            return;
        }
    };

    match negotiate(backend.as_mut(), &ctx) {
        Negotiation::Open => supervise(backend.as_mut(), &ctx),
        Negotiation::Unavailable => wait_for_stop(&ctx.events),
        Negotiation::StopRequested => {}
    }

    backend.close();
    ctx.status.set(CaptureStatus::Stopped, None);
    debug!("capture worker stopped");
}

/// Opens the backend with bounded, doubling backoff. Backoff sleeps double
/// as the stop channel's wait, so shutdown stays prompt mid-retry.
fn negotiate(backend: &mut dyn CaptureBackend, ctx: &WorkerContext) -> Negotiation {
    let mut backoff = ctx.config.initial_backoff;
    let attempts = ctx.config.negotiation_attempts.max(1);
    for attempt in 1..=attempts {
        ctx.status.set(CaptureStatus::Negotiating, None);
        match backend.open(ctx.tap.clone()) {
            Ok(()) => {
                ctx.tap.touch();
                return Negotiation::Open;
            }
            Err(e) => {
                warn!(attempt, error = %e, "capture negotiation failed");
                if attempt == attempts {
                    ctx.status
                        .set(CaptureStatus::Unavailable, Some(e.to_string()));
                    return Negotiation::Unavailable;
                }
                match ctx.events.recv_timeout(backoff) {
                    Ok(WorkerEvent::Stop) | Err(RecvTimeoutError::Disconnected) => {
                        return Negotiation::StopRequested;
                    }
                    _ => {}
                }
                backoff *= 2;
            }
        }
    }
    Negotiation::Unavailable
}

fn supervise(backend: &mut dyn CaptureBackend, ctx: &WorkerContext) {
    loop {
        match ctx.events.recv_timeout(ctx.config.poll_interval) {
            Ok(WorkerEvent::Stop) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(WorkerEvent::Resumed) => {
                ctx.tap.clear_idle();
                ctx.status.set(CaptureStatus::Streaming, None);
            }
            Ok(WorkerEvent::State(StreamState::Streaming)) => {
                ctx.status.set(CaptureStatus::Streaming, None);
            }
            Ok(WorkerEvent::State(StreamState::Negotiating)) => {
                ctx.status.set(CaptureStatus::Negotiating, None);
            }
            Ok(WorkerEvent::State(StreamState::Failed(message))) => {
                warn!(error = %message, "capture stream failed, re-negotiating");
                backend.close();
                match negotiate(backend, ctx) {
                    Negotiation::Open => {}
                    Negotiation::Unavailable => {}
                    Negotiation::StopRequested => return,
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if ctx.status.get() == CaptureStatus::Streaming
                    && ctx.tap.elapsed_since_delivery() > ctx.config.idle_timeout
                {
                    ctx.tap.mark_idle();
                    // Re-check the stamp after raising the flag: a delivery
                    // that slipped past the first check published normally,
                    // so the silence write must wait for the next poll.
                    if ctx.tap.elapsed_since_delivery() <= ctx.config.idle_timeout {
                        ctx.tap.clear_idle();
                        continue;
                    }
                    debug!("capture idle timeout, publishing silence");
                    ctx.buffer.clear();
                    let zeros = vec![0i16; ctx.buffer.capacity()];
                    ctx.buffer.publish(&zeros);
                    ctx.status.set(CaptureStatus::Idle, None);
                }
            }
        }
    }
}

fn wait_for_stop(events: &Receiver<WorkerEvent>) {
    loop {
        match events.recv() {
            Ok(WorkerEvent::Stop) | Err(_) => return,
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SonoscopeError;
    use crate::service::HolderId;

    /// Backend that delivers scripted `(delay, chunk)` steps on its own
    /// thread, like a real platform stream would.
    struct ScriptedBackend {
        plan: Vec<(Duration, Vec<i16>)>,
        stop: Arc<AtomicBool>,
        thread: Option<JoinHandle<()>>,
    }

    impl ScriptedBackend {
        fn new(plan: Vec<(Duration, Vec<i16>)>) -> Self {
            Self {
                plan,
                stop: Arc::new(AtomicBool::new(false)),
                thread: None,
            }
        }
    }

    impl CaptureBackend for ScriptedBackend {
        fn open(&mut self, tap: CaptureTap) -> Result<()> {
            let plan = self.plan.clone();
            let stop = Arc::clone(&self.stop);
            self.thread = Some(std::thread::spawn(move || {
                tap.stream_state(StreamState::Streaming);
                for (delay, chunk) in plan {
                    let deadline = Instant::now() + delay;
                    while Instant::now() < deadline {
                        if stop.load(Ordering::Relaxed) {
                            return;
                        }
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    tap.deliver(&chunk);
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

    struct FailingBackend;

    impl CaptureBackend for FailingBackend {
        fn open(&mut self, _tap: CaptureTap) -> Result<()> {
            Err(SonoscopeError::NoCaptureDevice)
        }

        fn close(&mut self) {}
    }

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            window: 512,
            idle_timeout: Duration::from_millis(40),
            negotiation_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            poll_interval: Duration::from_millis(10),
        }
    }

    fn scripted_factory(plan: Vec<(Duration, Vec<i16>)>) -> BackendFactory {
        Arc::new(move || {
            Ok(Box::new(ScriptedBackend::new(plan.clone())) as Box<dyn CaptureBackend>)
        })
    }

    fn wait_for_status(
        rx: &mut broadcast::Receiver<CaptureStatusEvent>,
        want: CaptureStatus,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match rx.try_recv() {
                Ok(event) if event.status == want => return true,
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(broadcast::error::TryRecvError::Empty) => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(broadcast::error::TryRecvError::Closed) => return false,
            }
        }
        false
    }

    #[test]
    fn streaming_delivers_into_the_buffer() {
        let plan = (0..20)
            .map(|_| (Duration::from_millis(5), vec![1000i16; 256]))
            .collect();
        let service = CaptureService::new(scripted_factory(plan), test_config());
        let mut status = service.subscribe_status();

        let holder = HolderId::next();
        service.add_ref(holder).unwrap();
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Streaming,
            Duration::from_secs(1)
        ));

        // Wait for at least one full window (512 samples) to publish.
        let mut window = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(1);
        loop {
            service.buffer().read_latest_f32(&mut window, 0);
            if window.iter().any(|&v| v != 0.0) {
                break;
            }
            assert!(Instant::now() < deadline, "no samples reached the buffer");
            std::thread::sleep(Duration::from_millis(5));
        }

        service.remove_ref(holder);
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Stopped,
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn negotiation_exhaustion_reports_unavailable() {
        let factory: BackendFactory =
            Arc::new(|| Ok(Box::new(FailingBackend) as Box<dyn CaptureBackend>));
        let service = CaptureService::new(factory, test_config());
        let mut status = service.subscribe_status();

        let holder = HolderId::next();
        service.add_ref(holder).unwrap();
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Unavailable,
            Duration::from_secs(1)
        ));
        assert_eq!(service.status(), CaptureStatus::Unavailable);

        // The service keeps running and still stops cleanly.
        service.remove_ref(holder);
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Stopped,
            Duration::from_secs(1)
        ));
    }

    #[test]
    fn idle_timeout_silences_the_buffer() {
        // Two quick deliveries, then nothing.
        let plan = vec![
            (Duration::from_millis(2), vec![2000i16; 512]),
            (Duration::from_millis(2), vec![2000i16; 512]),
        ];
        let service = CaptureService::new(scripted_factory(plan), test_config());
        let mut status = service.subscribe_status();

        let holder = HolderId::next();
        service.add_ref(holder).unwrap();
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Idle,
            Duration::from_secs(2)
        ));

        let mut window = Vec::new();
        service.buffer().read_latest_f32(&mut window, 0);
        assert!(window.iter().all(|&v| v == 0.0), "idle buffer not silent");

        service.remove_ref(holder);
    }

    #[test]
    fn idle_tap_drops_deliveries_and_signals_resume() {
        let buffer = Arc::new(CaptureBuffer::new(512));
        let (tx, rx) = crossbeam_channel::unbounded();
        let tap = CaptureTap::new(Arc::clone(&buffer), tx);

        // While the idle flag is raised the worker owns the buffer: a
        // delivery must not publish, only ask to resume.
        tap.mark_idle();
        tap.deliver(&[1234i16; 512]);
        let mut window = Vec::new();
        buffer.read_latest_f32(&mut window, 0);
        assert!(
            window.iter().all(|&v| v == 0.0),
            "idle delivery reached the buffer"
        );
        assert!(matches!(rx.try_recv(), Ok(WorkerEvent::Resumed)));

        // Once the worker clears the flag, deliveries publish again.
        tap.clear_idle();
        tap.deliver(&[1234i16; 512]);
        buffer.read_latest_f32(&mut window, 0);
        assert!(window.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn renewed_delivery_resumes_streaming() {
        let pause = test_config().idle_timeout * 3;
        let plan = vec![
            (Duration::from_millis(2), vec![500i16; 512]),
            (pause, vec![500i16; 512]),
            (Duration::from_millis(2), vec![500i16; 512]),
        ];
        let service = CaptureService::new(scripted_factory(plan), test_config());
        let mut status = service.subscribe_status();

        let holder = HolderId::next();
        service.add_ref(holder).unwrap();

        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Idle,
            Duration::from_secs(2)
        ));
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Streaming,
            Duration::from_secs(2)
        ));

        service.remove_ref(holder);
    }

    #[test]
    fn set_window_restarts_a_running_worker() {
        let plan = (0..200)
            .map(|_| (Duration::from_millis(5), vec![100i16; 256]))
            .collect();
        let service = CaptureService::new(scripted_factory(plan), test_config());
        let mut status = service.subscribe_status();

        let holder = HolderId::next();
        service.add_ref(holder).unwrap();
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Streaming,
            Duration::from_secs(1)
        ));

        assert_eq!(service.set_window(2048).unwrap(), 2048);
        assert_eq!(service.buffer().capacity(), 2048);

        // The restarted worker streams again.
        assert!(wait_for_status(
            &mut status,
            CaptureStatus::Streaming,
            Duration::from_secs(2)
        ));

        service.remove_ref(holder);
    }

    #[test]
    fn set_window_while_stopped_needs_no_worker() {
        let service = CaptureService::new(scripted_factory(Vec::new()), test_config());
        assert_eq!(service.set_window(1000).unwrap(), 1024);
        assert_eq!(service.buffer().capacity(), 1024);
    }
}
