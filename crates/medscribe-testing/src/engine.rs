use async_trait::async_trait;
use medscribe_residency::{EngineError, EngineHandle, EngineResult, InferenceRequest};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};

/// What a fake engine was doing when it recorded an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Evict,
    Restore,
    Infer,
}

/// One entry or exit of an engine call.
#[derive(Debug, Clone)]
pub struct EngineEvent {
    pub engine: String,
    pub phase: Phase,
    pub entered: bool,
    pub at: Instant,
}

/// A closed `[start, end]` window of one engine call.
#[derive(Debug, Clone)]
pub struct CallWindow {
    pub engine: String,
    pub phase: Phase,
    pub start: Instant,
    pub end: Instant,
}

impl CallWindow {
    pub fn overlaps(&self, other: &CallWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Shared, ordered record of every call made to a group of fake engines.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<EngineEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, engine: &str, phase: Phase, entered: bool) {
        self.events.lock().push(EngineEvent {
            engine: engine.to_string(),
            phase,
            entered,
            at: Instant::now(),
        });
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Number of completed calls of `phase` on `engine`.
    pub fn count(&self, engine: &str, phase: Phase) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.engine == engine && e.phase == phase && !e.entered)
            .count()
    }

    /// Number of completed evict and restore calls on any engine.
    pub fn transitions(&self) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.phase != Phase::Infer && !e.entered)
            .count()
    }

    /// Completed call windows matching `filter`, in start order.
    pub fn windows(&self, filter: impl Fn(Phase) -> bool) -> Vec<CallWindow> {
        let events = self.events.lock();
        let mut windows = Vec::new();
        for (i, start) in events.iter().enumerate() {
            if !start.entered || !filter(start.phase) {
                continue;
            }
            let end = events[i + 1..]
                .iter()
                .find(|e| !e.entered && e.engine == start.engine && e.phase == start.phase);
            if let Some(end) = end {
                windows.push(CallWindow {
                    engine: start.engine.clone(),
                    phase: start.phase,
                    start: start.at,
                    end: end.at,
                });
            }
        }
        windows
    }

    /// Evict and restore windows.
    pub fn transition_windows(&self) -> Vec<CallWindow> {
        self.windows(|phase| phase != Phase::Infer)
    }

    /// Pairs of windows on different engines that overlap in time.
    pub fn overlapping(windows: &[CallWindow]) -> Vec<(CallWindow, CallWindow)> {
        let mut pairs = Vec::new();
        for (i, a) in windows.iter().enumerate() {
            for b in &windows[i + 1..] {
                if a.engine != b.engine && a.overlaps(b) {
                    pairs.push((a.clone(), b.clone()));
                }
            }
        }
        pairs
    }
}

/// Counts fake engines currently holding the accelerator.
#[derive(Clone, Default)]
pub struct GpuMeter {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl GpuMeter {
    pub fn new() -> Self {
        Self::default()
    }

    fn acquire(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn release(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// Engines resident right now
    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Highest number ever resident at once
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct FakeState {
    name: String,
    uses_gpu: bool,
    log: EventLog,
    meter: GpuMeter,
    resident: AtomicBool,
    fail_evicts: AtomicUsize,
    fail_restores: AtomicUsize,
    fail_infer: AtomicBool,
    transition_delay: Mutex<Duration>,
    infer_delay: Mutex<Duration>,
    late_ack: AtomicBool,
    gated: AtomicBool,
    gate: Semaphore,
    infer_started: Notify,
    infer_while_dormant: AtomicUsize,
}

/// Instrumented engine handle.
///
/// Clones share state, so a test keeps one clone for assertions and hands
/// another to the manager. Every call is recorded in the shared [`EventLog`];
/// residency is tracked in the shared [`GpuMeter`].
#[derive(Clone)]
pub struct FakeEngine {
    inner: Arc<FakeState>,
}

impl FakeEngine {
    pub fn new(name: impl Into<String>, log: EventLog, meter: GpuMeter) -> Self {
        Self {
            inner: Arc::new(FakeState {
                name: name.into(),
                uses_gpu: true,
                log,
                meter,
                resident: AtomicBool::new(false),
                fail_evicts: AtomicUsize::new(0),
                fail_restores: AtomicUsize::new(0),
                fail_infer: AtomicBool::new(false),
                transition_delay: Mutex::new(Duration::ZERO),
                infer_delay: Mutex::new(Duration::ZERO),
                late_ack: AtomicBool::new(false),
                gated: AtomicBool::new(false),
                gate: Semaphore::new(0),
                infer_started: Notify::new(),
                infer_while_dormant: AtomicUsize::new(0),
            }),
        }
    }

    /// A fake with its own log and meter.
    pub fn standalone(name: impl Into<String>) -> Self {
        Self::new(name, EventLog::new(), GpuMeter::new())
    }

    /// Sleep this long inside every evict and restore.
    pub fn with_transition_delay(self, delay: Duration) -> Self {
        *self.inner.transition_delay.lock() = delay;
        self
    }

    /// Sleep this long inside every inference call.
    pub fn with_infer_delay(self, delay: Duration) -> Self {
        *self.inner.infer_delay.lock() = delay;
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_resident(&self) -> bool {
        self.inner.resident.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> &EventLog {
        &self.inner.log
    }

    /// Fail the next `n` evict calls.
    pub fn fail_next_evicts(&self, n: usize) {
        self.inner.fail_evicts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` restore calls.
    pub fn fail_next_restores(&self, n: usize) {
        self.inner.fail_restores.store(n, Ordering::SeqCst);
    }

    /// Apply evict and restore as soon as the call starts and spend the
    /// transition delay before replying, like a server that has already
    /// switched when a slow response is abandoned.
    pub fn acknowledge_late(&self) {
        self.inner.late_ack.store(true, Ordering::SeqCst);
    }

    pub fn fail_inference(&self, fail: bool) {
        self.inner.fail_infer.store(fail, Ordering::SeqCst);
    }

    /// Block every inference call until [`release_inference`](Self::release_inference).
    pub fn hold_inference(&self) {
        self.inner.gated.store(true, Ordering::SeqCst);
    }

    /// Let `n` held inference calls finish.
    pub fn release_inference(&self, n: usize) {
        self.inner.gate.add_permits(n);
    }

    /// Resolves once an inference call has entered the engine.
    pub async fn inference_started(&self) {
        self.inner.infer_started.notified().await;
    }

    /// Inference calls that arrived while the engine was not resident.
    pub fn infer_while_dormant(&self) -> usize {
        self.inner.infer_while_dormant.load(Ordering::SeqCst)
    }

    /// Put the engine in its post-initialization state.
    pub(crate) fn reset_to_dormant(&self) {
        if self.inner.resident.swap(false, Ordering::SeqCst) {
            self.inner.meter.release();
        }
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Shared body of evict and restore. `apply` runs only when no fault is
    /// injected, before or after the delay depending on `late_ack`.
    async fn transition(
        &self,
        phase: Phase,
        faults: &AtomicUsize,
        apply: impl FnOnce(&FakeState),
    ) -> EngineResult<()> {
        let state = &self.inner;
        state.log.record(&state.name, phase, true);
        let delay = *state.transition_delay.lock();
        let late_ack = state.late_ack.load(Ordering::SeqCst);

        let result = if Self::take_fault(faults) {
            self.pause(delay).await;
            let step = if phase == Phase::Evict { "evict" } else { "restore" };
            Err(EngineError::Other(format!("{}: injected {step} failure", state.name)))
        } else if late_ack {
            apply(state);
            self.pause(delay).await;
            Ok(())
        } else {
            self.pause(delay).await;
            apply(state);
            Ok(())
        };

        state.log.record(&state.name, phase, false);
        result
    }
}

#[async_trait]
impl EngineHandle for FakeEngine {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn uses_gpu(&self) -> bool {
        self.inner.uses_gpu
    }

    async fn evict(&self) -> EngineResult<()> {
        self.transition(Phase::Evict, &self.inner.fail_evicts, |state| {
            if state.resident.swap(false, Ordering::SeqCst) {
                state.meter.release();
            }
        })
        .await
    }

    async fn restore(&self) -> EngineResult<()> {
        self.transition(Phase::Restore, &self.inner.fail_restores, |state| {
            if !state.resident.swap(true, Ordering::SeqCst) {
                state.meter.acquire();
            }
        })
        .await
    }

    async fn infer(&self, request: &InferenceRequest) -> EngineResult<String> {
        let state = &self.inner;
        state.log.record(&state.name, Phase::Infer, true);
        state.infer_started.notify_one();

        if !state.resident.load(Ordering::SeqCst) {
            state.infer_while_dormant.fetch_add(1, Ordering::SeqCst);
            state.log.record(&state.name, Phase::Infer, false);
            return Err(EngineError::NotResident(state.name.clone()));
        }

        if state.gated.load(Ordering::SeqCst) {
            let permit = state
                .gate
                .acquire()
                .await
                .map_err(|e| EngineError::Other(e.to_string()))?;
            permit.forget();
        }
        let delay = *state.infer_delay.lock();
        self.pause(delay).await;

        let result = if state.fail_infer.load(Ordering::SeqCst) {
            Err(EngineError::Other(format!("{}: injected inference failure", state.name)))
        } else {
            Ok(match request {
                InferenceRequest::Generate(req) => format!("{}: {}", state.name, req.prompt),
                InferenceRequest::Transcribe(clip) => {
                    format!("{}: {} samples", state.name, clip.samples().len())
                }
            })
        };

        state.log.record(&state.name, Phase::Infer, false);
        result
    }
}
