use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api_rest::{router, AppState};
use rcapi_core::{core_config_from_lookup, Backends, FileJobStore, Orchestrator};

/// Main entry point for the RC-API server
///
/// Resolves configuration once, opens the job store, builds the backend clients and serves the
/// REST API with its OpenAPI/Swagger UI.
///
/// # Environment Variables
/// - `RCAPI_REST_ADDR`: REST server address (default: "0.0.0.0:8000")
/// - `LOG_LEVEL`: default log directive for the service crates (default: "info")
/// - `CQF_RULER_R4`, `EXTERNAL_FHIR_SERVER_URL`: required backend base URLs
/// - `EXTERNAL_FHIR_SERVER_AUTH`, `NLPAAS_URL`, `DEPLOY_URL`, `JOB_DATA_DIR`,
///   `MAX_CONCURRENT_REQUESTS`: optional, see `rcapi_core::config`
///
/// # Errors
/// Returns an error if:
/// - the logging/tracing configuration cannot be initialised,
/// - a required setting is missing or malformed,
/// - the job store directory cannot be created,
/// - the server address cannot be bound, or
/// - the HTTP server fails while running.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("rcapi_run={log_level}").parse()?)
                .add_directive(format!("rcapi_core={log_level}").parse()?)
                .add_directive(format!("api_rest={log_level}").parse()?),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = core_config_from_lookup(|key| std::env::var(key).ok())?;
    if !cfg.text_analytics_enabled() {
        tracing::warn!(
            "NLPAAS_URL not defined in environmental variables, no NLP jobs will be completed"
        );
    }

    let store = FileJobStore::open(cfg.job_data_dir())?;
    let backends = Backends::from_config(&cfg);
    let orchestrator = Arc::new(Orchestrator::new(&cfg, backends, Arc::new(store)));

    let rest_addr = std::env::var("RCAPI_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:8000".into());
    tracing::info!("++ Starting RC-API REST on {}", rest_addr);

    let app = router(AppState { orchestrator });
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
