//! Provider library logic: procedures, the transaction engine and the HTTP
//! transport that starts transactions and serves staged attributes.

pub mod api;
pub mod background;
pub mod config;
pub mod procedure;
pub mod transaction;

use attest_bridge::{BridgeHandle, PollingBridge};
use attest_node::NodeApi;
use attest_services::{AttesterService, Clock, VerifierService};
use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use config::Config;
use procedure::{ProcedureRegistry, RegistryError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use transaction::{EngineSettings, TransactionEngine};

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Runs transactions and holds the staged attributes.
    pub engine: Arc<TransactionEngine>,
    /// Procedures offered by this Provider.
    pub procedures: Arc<ProcedureRegistry>,
}

/// Converts whole seconds from config into a chrono duration, saturating.
pub(crate) fn seconds(value: u64) -> chrono::Duration {
    const MAX_SECONDS: u64 = (i64::MAX / 1000) as u64;
    chrono::Duration::seconds(value.min(MAX_SECONDS) as i64)
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/init",
            get(api::initiate_query_handler).post(api::initiate_handler),
        )
        .route("/data", get(api::staged_data_handler))
        .route("/transactions/{id}", get(api::transaction_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}

impl From<&config::AttestationConfig> for EngineSettings {
    fn from(config: &config::AttestationConfig) -> Self {
        Self {
            attestation_timeout: seconds(config.timeout_seconds),
            verification_timeout: config.verification_timeout_seconds.map(Duration::from_secs),
            verification_max_age: config.verification_max_age_seconds.map(seconds),
        }
    }
}

/// The Provider's services wired onto one node.
pub struct Provider {
    pub bridge: Arc<PollingBridge>,
    pub attester: Arc<AttesterService>,
    pub verifier: Arc<VerifierService>,
    pub engine: Arc<TransactionEngine>,
    pub procedures: Arc<ProcedureRegistry>,
}

/// Background tasks of a started [`Provider`].
pub struct ProviderHandle {
    bridge: BridgeHandle,
    attester: JoinHandle<()>,
}

impl ProviderHandle {
    pub fn stop(&self) {
        self.attester.abort();
        self.bridge.stop();
    }
}

impl Provider {
    pub fn new(
        node: Arc<dyn NodeApi>,
        procedures: ProcedureRegistry,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
        settings: EngineSettings,
    ) -> Self {
        let bridge = Arc::new(PollingBridge::with_interval(node, poll_interval));
        let attester = Arc::new(AttesterService::new(bridge.clone(), clock.clone()));
        let verifier = Arc::new(VerifierService::new(bridge.clone(), clock.clone()));
        let engine = Arc::new(TransactionEngine::new(
            verifier.clone(),
            attester.clone(),
            clock,
            settings,
        ));

        attester.on_non_staged_request(|request| {
            tracing::info!(
                holder = %request.holder,
                attribute_name = %request.attribute_name,
                "ignoring attestation request with nothing staged"
            );
        });

        Self {
            bridge,
            attester,
            verifier,
            engine,
            procedures: Arc::new(procedures),
        }
    }

    /// Builds the Provider from config. Fails if a procedure entry is invalid.
    pub fn from_config(
        node: Arc<dyn NodeApi>,
        clock: Arc<dyn Clock>,
        config: &Config,
    ) -> Result<Self, RegistryError> {
        let procedures = ProcedureRegistry::from_config(&config.procedures)?;
        Ok(Self::new(
            node,
            procedures,
            clock,
            Duration::from_millis(config.node.poll_interval_ms),
            EngineSettings::from(&config.attestation),
        ))
    }

    /// Starts the polling bridge and the attester loop.
    pub fn start(&self) -> ProviderHandle {
        ProviderHandle {
            bridge: self.bridge.start(),
            attester: self.attester.start(),
        }
    }

    pub fn state(&self) -> AppState {
        AppState {
            engine: self.engine.clone(),
            procedures: self.procedures.clone(),
        }
    }

    pub fn router(&self) -> Router {
        app(self.state())
    }
}
