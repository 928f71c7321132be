//! Engine lifecycle management
//!
//! Owns the single engine + codec pair and its init/failure state. Loading is
//! exactly-once under concurrent callers: the first caller performs the load
//! while later callers poll until it settles or a bounded wait runs out.
//!
//! The lock guards state transitions only. It is released while a backend
//! loads, and it is never held during generation. Callers take an
//! [`EngineLease`], an `Arc` to the handles of one load, so a reload swaps
//! handles without pulling them out from under in-flight jobs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::inference::engine::{
    Credential, EngineBackend, EngineError, GenerationEngine, LoadSpec, TemplateSource,
    TextCodec,
};

/// Lifecycle state of the shared engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed,
}

/// Handles produced by one successful load
pub struct EngineHandles {
    pub engine: Arc<dyn GenerationEngine>,
    pub codec: Arc<dyn TextCodec>,
    /// Load counter value these handles were installed under
    pub generation: u64,
}

/// Borrow of the handles for the duration of one call
pub type EngineLease = Arc<EngineHandles>;

/// Point-in-time view of the manager, for probes
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub status: EngineStatus,
    pub generation: u64,
    pub last_error: Option<String>,
}

/// How the manager loads and waits
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub model_id: String,
    pub cache_dir: std::path::PathBuf,
    /// Environment variables searched for a credential, in priority order
    pub credential_env_vars: Vec<String>,
    /// Pause between checks while another caller initializes
    pub poll_interval: Duration,
    /// Checks before a waiter gives up
    pub max_polls: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            cache_dir: std::env::temp_dir().join("finserve"),
            credential_env_vars: vec![
                "HF_TOKEN_LC2".to_string(),
                "HF_TOKEN_LC".to_string(),
                "HF_TOKEN".to_string(),
                "HUGGING_FACE_HUB_TOKEN".to_string(),
            ],
            poll_interval: Duration::from_secs(1),
            max_polls: 300,
        }
    }
}

struct EngineState {
    status: EngineStatus,
    handles: Option<EngineLease>,
    last_error: Option<EngineError>,
    generation: u64,
}

/// Owns the shared engine handle and its state machine
pub struct EngineLifecycleManager {
    backend: Arc<dyn EngineBackend>,
    templates: Arc<dyn TemplateSource>,
    config: LifecycleConfig,
    state: Mutex<EngineState>,
}

/// Marks the state Failed if a load unwinds before it settles
struct InitGuard<'a> {
    manager: &'a EngineLifecycleManager,
    settled: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        tracing::error!("Engine load aborted before completion");
        let mut state = self.manager.lock();
        state.handles = None;
        state.status = EngineStatus::Failed;
        state.last_error = Some(EngineError::init_failure("engine load aborted"));
    }
}

impl EngineLifecycleManager {
    pub fn new(
        backend: Arc<dyn EngineBackend>,
        templates: Arc<dyn TemplateSource>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            backend,
            templates,
            config,
            state: Mutex::new(EngineState {
                status: EngineStatus::Uninitialized,
                handles: None,
                last_error: None,
                generation: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Initializes the engine, or reloads it when `force_reload` is set.
    ///
    /// Blocks the calling thread; async callers go through
    /// `spawn_blocking`.
    pub fn init(&self, force_reload: bool) -> Result<(), EngineError> {
        let mut state = self.lock();
        let mut polls = 0u32;
        let mut waited = false;

        loop {
            match state.status {
                EngineStatus::Ready if waited => return Ok(()),
                EngineStatus::Ready if !force_reload && state.handles.is_some() => return Ok(()),
                EngineStatus::Failed if waited => {
                    return Err(state
                        .last_error
                        .clone()
                        .unwrap_or_else(|| EngineError::init_failure("initialization failed")));
                }
                EngineStatus::Initializing => {
                    if polls == 0 {
                        tracing::warn!("Engine initialization already in progress, waiting...");
                    }
                    if polls >= self.config.max_polls {
                        tracing::error!("Engine initialization timeout after {} polls", polls);
                        return Err(EngineError::InitializationTimeout { polls });
                    }
                    drop(state);
                    thread::sleep(self.config.poll_interval);
                    polls += 1;
                    waited = true;
                    state = self.lock();
                }
                _ => break,
            }
        }

        if state.status == EngineStatus::Ready {
            tracing::info!(
                "Forced reload requested, reclaiming engine generation {}",
                state.generation
            );
            self.reclaim_locked(&mut state);
            state.status = EngineStatus::Uninitialized;
        } else if state.status == EngineStatus::Failed {
            // Leftovers of the failed attempt go before anything new is loaded
            self.reclaim_locked(&mut state);
        }

        state.status = EngineStatus::Initializing;
        state.last_error = None;
        drop(state);

        let mut guard = InitGuard {
            manager: self,
            settled: false,
        };
        let result = self.load();

        let mut state = self.lock();
        guard.settled = true;
        match result {
            Ok((engine, codec)) => {
                state.generation += 1;
                state.handles = Some(Arc::new(EngineHandles {
                    engine,
                    codec,
                    generation: state.generation,
                }));
                state.status = EngineStatus::Ready;
                tracing::info!(
                    "Engine ready: {} via {} (generation {})",
                    self.config.model_id,
                    self.backend.name(),
                    state.generation
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!("Error initializing engine: {}", err);
                if let EngineError::InitializationFailure {
                    kind: crate::inference::engine::InitFailureKind::Auth,
                    ..
                } = &err
                {
                    tracing::error!(
                        "Authentication error detected: check that a valid token is set in one of {:?} and has access to {}",
                        self.config.credential_env_vars,
                        self.config.model_id
                    );
                }
                self.reclaim_locked(&mut state);
                state.status = EngineStatus::Failed;
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Loads codec then engine. Runs without the state lock.
    fn load(&self) -> Result<(Arc<dyn GenerationEngine>, Arc<dyn TextCodec>), EngineError> {
        let spec = LoadSpec {
            model_id: self.config.model_id.clone(),
            credential: self.acquire_credential(),
            cache_dir: self.config.cache_dir.clone(),
        };

        tracing::info!(
            "Loading codec for {} (backend: {})",
            spec.model_id,
            self.backend.name()
        );
        let mut codec = self.backend.load_codec(&spec).map_err(classify_load_error)?;

        if codec.chat_template().is_none() {
            tracing::info!("Codec has no chat template, fetching fallback template");
            match self.templates.fetch(&spec) {
                Ok(Some(template)) => {
                    codec.set_chat_template(template);
                    tracing::info!("Fallback chat template applied");
                }
                Ok(None) => tracing::warn!("No fallback chat template available"),
                Err(e) => tracing::warn!("Could not load fallback template, using default: {}", e),
            }
        }

        // Give back cached memory before the big allocation
        self.backend.purge_accelerator_cache();

        tracing::info!("Loading engine for {}", spec.model_id);
        let engine = self
            .backend
            .load_engine(&spec, codec.as_ref())
            .map_err(classify_load_error)?;

        Ok((engine, Arc::from(codec)))
    }

    fn acquire_credential(&self) -> Option<Credential> {
        let found = self.config.credential_env_vars.iter().find_map(|name| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
                .map(|token| Credential {
                    token,
                    source: name.clone(),
                })
        });

        match &found {
            Some(credential) => tracing::info!(
                "{} found (length: {})",
                credential.source,
                credential.token.len()
            ),
            None => tracing::warn!(
                "No access token found in environment (checked {:?}); gated models may fail to load",
                self.config.credential_env_vars
            ),
        }
        found
    }

    /// Best-effort release of the installed handles.
    ///
    /// Safe to call with nothing installed. Outstanding leases keep their
    /// handles alive until they are dropped.
    pub fn reclaim(&self) {
        let mut state = self.lock();
        self.reclaim_locked(&mut state);
        if state.status == EngineStatus::Ready {
            state.status = EngineStatus::Uninitialized;
        }
    }

    fn reclaim_locked(&self, state: &mut EngineState) {
        if let Some(handles) = state.handles.take() {
            let outstanding = Arc::strong_count(&handles) - 1;
            if outstanding > 0 {
                tracing::debug!(
                    "Engine generation {} still leased by {} caller(s)",
                    handles.generation,
                    outstanding
                );
            }
            drop(handles);
        }
        self.backend.purge_accelerator_cache();
    }

    /// Initializes if not Ready. Cheap when Ready.
    pub fn ensure_ready(&self) -> Result<(), EngineError> {
        if self.is_ready() {
            return Ok(());
        }
        self.init(false)
    }

    pub fn is_ready(&self) -> bool {
        let state = self.lock();
        state.status == EngineStatus::Ready && state.handles.is_some()
    }

    /// Current handles, for the duration of one call.
    pub fn lease(&self) -> Result<EngineLease, EngineError> {
        let state = self.lock();
        match (&state.status, &state.handles) {
            (EngineStatus::Ready, Some(handles)) => Ok(Arc::clone(handles)),
            _ => Err(EngineError::NotReady),
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.lock().status
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.lock();
        EngineSnapshot {
            status: state.status,
            generation: state.generation,
            last_error: state.last_error.as_ref().map(|e| e.public_message().to_string()),
        }
    }
}

/// Ensures backend errors leave this module as classified init failures.
fn classify_load_error(err: EngineError) -> EngineError {
    match err {
        EngineError::InitializationFailure { .. } | EngineError::InitializationTimeout { .. } => err,
        other => EngineError::init_failure(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::engine::{InitFailureKind, NoTemplateSource, SamplingParams};
    use crate::inference::scripted::{ScriptedBackend, ScriptedReply};
    use std::sync::Barrier;

    fn fast_config() -> LifecycleConfig {
        LifecycleConfig {
            model_id: "test/model".to_string(),
            credential_env_vars: vec!["FINSERVE_TEST_UNSET_TOKEN".to_string()],
            poll_interval: Duration::from_millis(5),
            max_polls: 400,
            ..Default::default()
        }
    }

    fn manager(backend: Arc<ScriptedBackend>) -> EngineLifecycleManager {
        EngineLifecycleManager::new(backend, Arc::new(NoTemplateSource), fast_config())
    }

    #[test]
    fn test_new_manager_is_uninitialized() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedReply::Fixed("ok".into())));
        let manager = manager(backend);
        assert_eq!(manager.status(), EngineStatus::Uninitialized);
        assert!(!manager.is_ready());
        assert!(matches!(manager.lease(), Err(EngineError::NotReady)));
    }

    #[test]
    fn test_init_loads_once() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedReply::Fixed("ok".into())));
        let manager = manager(backend.clone());

        manager.ensure_ready().unwrap();
        manager.ensure_ready().unwrap();
        manager.init(false).unwrap();

        assert!(manager.is_ready());
        assert_eq!(backend.engine_loads(), 1);
        assert_eq!(manager.lease().unwrap().generation, 1);
    }

    #[test]
    fn test_concurrent_callers_share_one_load() {
        let backend = Arc::new(
            ScriptedBackend::new(ScriptedReply::Fixed("ok".into()))
                .with_load_delay(Duration::from_millis(100)),
        );
        let manager = Arc::new(manager(backend.clone()));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.ensure_ready()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(backend.engine_loads(), 1);
        assert_eq!(manager.status(), EngineStatus::Ready);
    }

    #[test]
    fn test_concurrent_callers_share_one_failure() {
        let backend = Arc::new(
            ScriptedBackend::new(ScriptedReply::Fixed("ok".into()))
                .with_load_delay(Duration::from_millis(100))
                .failing_loads(1, "401 Client Error: Unauthorized"),
        );
        let manager = Arc::new(manager(backend.clone()));
        let barrier = Arc::new(Barrier::new(6));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    manager.ensure_ready()
                })
            })
            .collect();

        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(
                err,
                EngineError::InitializationFailure {
                    kind: InitFailureKind::Auth,
                    ..
                }
            ));
        }
        assert_eq!(backend.codec_loads(), 1);
        assert_eq!(manager.status(), EngineStatus::Failed);
        assert!(!manager.is_ready());
    }

    #[test]
    fn test_failed_state_is_retryable() {
        let backend = Arc::new(
            ScriptedBackend::new(ScriptedReply::Fixed("ok".into()))
                .failing_loads(1, "connection reset during download"),
        );
        let manager = manager(backend.clone());

        let err = manager.ensure_ready().unwrap_err();
        assert!(matches!(
            err,
            EngineError::InitializationFailure {
                kind: InitFailureKind::Download,
                ..
            }
        ));
        assert_eq!(manager.snapshot().last_error.as_deref(), Some("model download failed"));

        manager.ensure_ready().unwrap();
        assert!(manager.is_ready());
        assert!(manager.snapshot().last_error.is_none());
        // The failed attempt was reclaimed before the retry loaded
        assert!(backend.purges() >= 2);
    }

    #[test]
    fn test_waiter_times_out() {
        let backend = Arc::new(
            ScriptedBackend::new(ScriptedReply::Fixed("ok".into()))
                .with_load_delay(Duration::from_millis(300)),
        );
        let config = LifecycleConfig {
            max_polls: 3,
            ..fast_config()
        };
        let manager = Arc::new(EngineLifecycleManager::new(
            backend.clone(),
            Arc::new(NoTemplateSource),
            config,
        ));

        let loader = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.init(false))
        };
        while manager.status() != EngineStatus::Initializing {
            thread::sleep(Duration::from_millis(1));
        }

        let err = manager.ensure_ready().unwrap_err();
        assert!(matches!(err, EngineError::InitializationTimeout { polls: 3 }));
        assert_eq!(err.public_message(), "initialization timed out");

        loader.join().unwrap().unwrap();
        assert_eq!(backend.engine_loads(), 1);
    }

    #[test]
    fn test_force_reload_reclaims_before_install() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedReply::Fixed("ok".into())));
        let manager = manager(backend.clone());
        manager.ensure_ready().unwrap();
        let first = manager.lease().unwrap();
        let first_engine = Arc::downgrade(&first.engine);
        drop(first);

        manager.init(true).unwrap();

        let events = backend.events();
        let dropped = events.iter().position(|e| e == "drop_engine").unwrap();
        let second_load = events.iter().rposition(|e| e == "load_engine").unwrap();
        let first_load = events.iter().position(|e| e == "load_engine").unwrap();
        assert!(first_load < dropped);
        assert!(dropped < second_load);

        assert!(first_engine.upgrade().is_none());
        assert_eq!(manager.lease().unwrap().generation, 2);
        assert_eq!(backend.engine_loads(), 2);
    }

    #[test]
    fn test_reload_keeps_inflight_lease_stable() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedReply::Fixed("four".into())));
        let manager = manager(backend.clone());
        manager.ensure_ready().unwrap();

        let inflight = manager.lease().unwrap();
        manager.init(true).unwrap();

        // The job started before the reload still talks to its own handles
        assert_eq!(inflight.generation, 1);
        let out = inflight
            .engine
            .generate("prompt", &SamplingParams::default())
            .unwrap();
        assert_eq!(out.text, "four");
        assert_eq!(manager.lease().unwrap().generation, 2);
    }

    #[test]
    fn test_reclaim_is_safe_without_handles() {
        let backend = Arc::new(ScriptedBackend::new(ScriptedReply::Fixed("ok".into())));
        let manager = manager(backend.clone());
        manager.reclaim();
        manager.reclaim();
        assert_eq!(manager.status(), EngineStatus::Uninitialized);

        manager.ensure_ready().unwrap();
        manager.reclaim();
        assert!(!manager.is_ready());
        assert_eq!(manager.status(), EngineStatus::Uninitialized);
    }

    #[test]
    fn test_panicking_load_leaves_failed_state() {
        let backend = Arc::new(
            ScriptedBackend::new(ScriptedReply::Fixed("ok".into())).panicking_loads(1),
        );
        let manager = Arc::new(manager(backend.clone()));

        let result = {
            let manager = Arc::clone(&manager);
            thread::spawn(move || manager.init(false)).join()
        };
        assert!(result.is_err());
        assert_eq!(manager.status(), EngineStatus::Failed);

        manager.ensure_ready().unwrap();
        assert!(manager.is_ready());
    }
}
