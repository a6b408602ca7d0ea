//! Residency manager
//!
//! Keeps at most one GPU-backed model resident and switches between them on
//! demand. A single async mutex guards the active model and every slot, and
//! it is held for the whole of a request: the transition (if any) **and** the
//! inference call that follows. Requests for different models are therefore
//! fully serialized and a model is never evicted while it is answering.
//! Status reads take the same lock and wait for in-flight requests.
//!
//! ```text
//!  unloaded ──init──▶ dormant ◀──evict / restore──▶ resident
//! ```
//!
//! Transitions always evict the outgoing model before restoring the incoming
//! one, so the GPU budget is never exceeded, at the cost of a short window
//! with nothing resident.
//!
//! Cancellation: a token that fires while the caller is still waiting for the
//! lock aborts with [`ResidencyError::Cancelled`] and no side effects. Once
//! the lock is held the transition always runs to completion; only the
//! inference call is abandoned. Transitions run on their own task holding an
//! owned guard, so dropping the caller's future mid-transition (a timeout, a
//! disconnected client) does not leave the bookkeeping behind the engines.

use crate::audio::AudioInput;
use crate::engine::{GenerateRequest, InferenceRequest};
use crate::error::{EngineError, ResidencyError, ResidencyResult, TransitionStep};
use crate::model::ModelName;
use crate::slot::ModelSlot;
use crate::status::StatusSnapshot;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything the lock protects.
struct ResidencyState {
    slots: BTreeMap<ModelName, ModelSlot>,
    active: Option<ModelName>,
}

impl ResidencyState {
    fn slot(&self, name: ModelName) -> ResidencyResult<&ModelSlot> {
        self.slots
            .get(&name)
            .ok_or(ResidencyError::ModelUnavailable(name))
    }

    fn slot_mut(&mut self, name: ModelName) -> ResidencyResult<&mut ModelSlot> {
        self.slots
            .get_mut(&name)
            .ok_or(ResidencyError::ModelUnavailable(name))
    }

    /// Make `name` the active model, evicting the current one first.
    async fn activate(&mut self, name: ModelName) -> ResidencyResult<()> {
        // Refuse before touching anything.
        self.slot(name)?.engine()?;

        let started = Instant::now();
        let previous = self.active;

        if let Some(previous) = previous {
            if let Err(source) = self.slot_mut(previous)?.evict().await {
                error!(model = %previous, target = %name, error = %source, "evict failed");
                return Err(ResidencyError::Transition {
                    model: previous,
                    step: TransitionStep::Evict,
                    source,
                });
            }
            self.active = None;
        }

        if let Err(source) = self.slot_mut(name)?.restore().await {
            error!(model = %name, error = %source, "restore failed, nothing resident");
            return Err(ResidencyError::Transition {
                model: name,
                step: TransitionStep::Restore,
                source,
            });
        }
        self.active = Some(name);

        info!(
            from = ?previous,
            to = %name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "residency transition complete"
        );
        Ok(())
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            active: self.active,
            models: self
                .slots
                .iter()
                .map(|(name, slot)| (*name, slot.snapshot()))
                .collect(),
        }
    }
}

/// Owns every model slot and enforces the single-resident invariant.
///
/// Construct once per process (see [`crate::bootstrap`]) and share it behind
/// an `Arc`.
pub struct ResidencyManager {
    state: Arc<Mutex<ResidencyState>>,
}

type StateGuard = OwnedMutexGuard<ResidencyState>;

impl ResidencyManager {
    /// Build a manager from initialized slots. Models without a slot are
    /// registered as unloaded. Nothing is resident afterwards except
    /// software-only stand-ins.
    pub fn new(slots: impl IntoIterator<Item = ModelSlot>) -> Self {
        let mut by_name: BTreeMap<ModelName, ModelSlot> =
            slots.into_iter().map(|slot| (slot.name(), slot)).collect();
        for name in ModelName::ALL {
            by_name
                .entry(name)
                .or_insert_with(|| ModelSlot::unloaded(name));
        }

        Self {
            state: Arc::new(Mutex::new(ResidencyState {
                slots: by_name,
                active: None,
            })),
        }
    }

    async fn lock(
        &self,
        model: Option<ModelName>,
        cancel: Option<&CancellationToken>,
    ) -> ResidencyResult<StateGuard> {
        let state = Arc::clone(&self.state);
        let Some(token) = cancel else {
            return Ok(state.lock_owned().await);
        };

        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(model = ?model, "cancelled while waiting for residency lock");
                Err(ResidencyError::Cancelled { model })
            }
            guard = state.lock_owned() => Ok(guard),
        }
    }

    /// Run the transition to `name` on a detached task that owns the guard,
    /// and hand the guard back once it is done.
    ///
    /// The task finishes even if the caller stops polling, so the lock is
    /// only released once `active` matches what the engines actually did.
    async fn transition(mut state: StateGuard, name: ModelName) -> ResidencyResult<StateGuard> {
        if state.active == Some(name) {
            debug!(model = %name, "already active");
            return Ok(state);
        }

        let task = tokio::spawn(async move {
            let result = state.activate(name).await;
            (state, result)
        });

        match task.await {
            Ok((state, result)) => result.map(|()| state),
            Err(join) => {
                error!(model = %name, error = %join, "transition task failed");
                Err(ResidencyError::Transition {
                    model: name,
                    step: TransitionStep::Restore,
                    source: EngineError::Other(format!("transition task failed: {join}")),
                })
            }
        }
    }

    /// Make `name` the resident model.
    ///
    /// Returns immediately if it already is. Otherwise the active model is
    /// evicted and `name` restored. If the restore fails no model is left
    /// active and the error is retryable.
    pub async fn ensure_active(
        &self,
        name: ModelName,
        cancel: Option<&CancellationToken>,
    ) -> ResidencyResult<()> {
        let state = self.lock(Some(name), cancel).await?;
        Self::transition(state, name).await?;
        Ok(())
    }

    /// Generate with the reasoning model.
    pub async fn infer_reasoning(
        &self,
        request: GenerateRequest,
        cancel: Option<&CancellationToken>,
    ) -> ResidencyResult<String> {
        self.run(
            ModelName::Reasoning,
            InferenceRequest::Generate(request),
            cancel,
        )
        .await
    }

    /// Generate with the routing model. Output is trimmed.
    pub async fn infer_routing(
        &self,
        request: GenerateRequest,
        cancel: Option<&CancellationToken>,
    ) -> ResidencyResult<String> {
        let output = self
            .run(ModelName::Routing, InferenceRequest::Generate(request), cancel)
            .await?;
        Ok(output.trim().to_string())
    }

    /// Transcribe audio with the speech model. The audio is normalised to
    /// 16 kHz before the lock is taken.
    pub async fn transcribe(
        &self,
        audio: AudioInput,
        cancel: Option<&CancellationToken>,
    ) -> ResidencyResult<String> {
        let clip = audio.into_clip()?;
        self.run(ModelName::Speech, InferenceRequest::Transcribe(clip), cancel)
            .await
    }

    async fn run(
        &self,
        name: ModelName,
        request: InferenceRequest,
        cancel: Option<&CancellationToken>,
    ) -> ResidencyResult<String> {
        let state = self.lock(Some(name), cancel).await?;
        let state = Self::transition(state, name).await?;

        let engine = state.slot(name)?.engine()?;
        debug!(model = %name, engine = engine.name(), operation = request.operation(), "inference");

        let inference = engine.infer(&request);
        let result = match cancel {
            None => inference.await,
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(model = %name, "inference cancelled");
                    return Err(ResidencyError::Cancelled { model: Some(name) });
                }
                result = inference => result,
            },
        };

        result.map_err(|source| ResidencyError::Inference {
            model: name,
            source,
        })
    }

    /// Snapshot of every slot and the active model, taken under the
    /// transition lock so a half-finished transition is never observed.
    pub async fn status(&self) -> StatusSnapshot {
        self.state.lock().await.snapshot()
    }

    /// [`status`](Self::status) that gives up if `cancel` fires first.
    pub async fn status_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> ResidencyResult<StatusSnapshot> {
        let state = self.lock(None, Some(cancel)).await?;
        Ok(state.snapshot())
    }

    /// Snapshot without waiting; `None` while a request holds the lock.
    pub fn try_status(&self) -> Option<StatusSnapshot> {
        self.state.try_lock().ok().map(|state| state.snapshot())
    }
}

impl std::fmt::Debug for ResidencyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidencyManager").finish_non_exhaustive()
    }
}
