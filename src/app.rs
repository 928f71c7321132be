//! Service assembly
//!
//! Builds the backend, lifecycle manager and chat service from settings,
//! installs logging and runs the startup warm-up.

use std::sync::Arc;

use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter, Registry};

use crate::compose::{LexicalLocaleDetector, LocaleDetector, NoLocaleDetector, PromptComposer};
use crate::config::{BackendKind, ConfigError, ServiceSettings};
use crate::inference::engine::{EngineBackend, NoTemplateSource, TemplateSource};
use crate::inference::lifecycle::EngineLifecycleManager;
use crate::inference::scripted::{ScriptedBackend, ScriptedReply};
use crate::inference::streaming::StreamingBridge;
use crate::inference::template::HubTemplateSource;
use crate::postprocess::ResponsePostProcessor;
use crate::service::ChatService;

/// Handle for swapping the log filter once settings are known
pub type LogFilterHandle = reload::Handle<EnvFilter, Registry>;

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::new(format!("finserve={},tower_http=info", level))
}

/// Installs the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `finserve=info` until
/// [`apply_log_level`] is called.
pub fn init_tracing() -> LogFilterHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| filter_for("info"));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
    handle
}

/// Applies the configured level unless `RUST_LOG` overrides it.
pub fn apply_log_level(handle: &LogFilterHandle, level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    if let Err(e) = handle.reload(filter_for(level)) {
        tracing::warn!("Failed to apply log level {}: {}", level, e);
    }
}

/// Engine backend selected by the settings
pub fn build_backend(settings: &ServiceSettings) -> Result<Arc<dyn EngineBackend>, ConfigError> {
    match settings.backend {
        BackendKind::Scripted => {
            tracing::warn!("Using the scripted backend; replies are canned");
            Ok(Arc::new(ScriptedBackend::new(ScriptedReply::Fixed(
                settings.scripted_reply.clone(),
            ))))
        }
        #[cfg(feature = "llama")]
        BackendKind::Llama => {
            Ok(Arc::new(crate::inference::llama::LlamaCppBackend::new(
                settings.gpu_layers,
                settings.context_size,
            )))
        }
        #[cfg(not(feature = "llama"))]
        BackendKind::Llama => Err(ConfigError::InvalidValue {
            key: "backend".to_string(),
            value: "llama (built without the `llama` feature)".to_string(),
        }),
    }
}

fn build_locale_detector() -> Arc<dyn LocaleDetector> {
    match LexicalLocaleDetector::french() {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::warn!("Locale detection disabled: {}", e);
            Arc::new(NoLocaleDetector)
        }
    }
}

/// Chat service over the given backend
///
/// Chat templates are fetched from the hub for real backends only.
pub fn build_service_with(settings: &ServiceSettings, backend: Arc<dyn EngineBackend>) -> ChatService {
    let templates: Arc<dyn TemplateSource> = match settings.backend {
        BackendKind::Llama => Arc::new(HubTemplateSource::new(settings.template_endpoint.clone())),
        BackendKind::Scripted => Arc::new(NoTemplateSource),
    };
    let manager = EngineLifecycleManager::new(backend, templates, settings.lifecycle_config());
    let bridge = StreamingBridge::new(
        settings.stream_channel_capacity,
        settings.max_concurrent_generations,
    );

    ChatService::new(
        Arc::new(manager),
        bridge,
        PromptComposer::new(build_locale_detector()),
        ResponsePostProcessor::default(),
        settings.sampling.clone(),
    )
}

/// Chat service over the backend named in the settings
pub fn build_service(settings: &ServiceSettings) -> Result<ChatService, ConfigError> {
    let backend = build_backend(settings)?;
    tracing::info!("Backend: {}, model: {}", backend.name(), settings.model);
    Ok(build_service_with(settings, backend))
}

/// Initializes the engine on the blocking pool without holding up startup.
pub fn spawn_warm_up(
    manager: Arc<EngineLifecycleManager>,
    force_reload: bool,
) -> tokio::task::JoinHandle<()> {
    if force_reload {
        tracing::info!("Force model reload enabled (FORCE_MODEL_RELOAD=true)");
    }
    tracing::info!("Initializing model in background");

    tokio::task::spawn_blocking(move || match manager.init(force_reload) {
        Ok(()) => tracing::info!("Model ready: {}", manager.model_id()),
        Err(e) => tracing::error!("Background model initialization failed: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::lifecycle::EngineStatus;

    fn scripted_settings() -> ServiceSettings {
        ServiceSettings {
            backend: BackendKind::Scripted,
            scripted_reply: "4.".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_scripted_service() {
        let service = build_service(&scripted_settings()).unwrap();
        assert_eq!(service.backend_name(), "scripted");
        assert_eq!(service.model_id(), crate::config::settings::DEFAULT_MODEL);
        assert_eq!(service.default_sampling().max_tokens, 1000);
    }

    #[cfg(not(feature = "llama"))]
    #[test]
    fn test_llama_backend_requires_feature() {
        let settings = ServiceSettings {
            backend: BackendKind::Llama,
            ..Default::default()
        };
        assert!(matches!(
            build_backend(&settings),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn test_warm_up_initializes_engine() {
        let service = build_service(&scripted_settings()).unwrap();
        spawn_warm_up(Arc::clone(service.manager()), false).await.unwrap();
        assert_eq!(service.manager().status(), EngineStatus::Ready);
    }
}
