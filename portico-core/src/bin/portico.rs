//! Portico coordinator binary

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use portico_core::agent::HttpAgentClient;
use portico_core::config::{AuthConfig, CoordinationBackend, PorticoConfig};
use portico_core::coordination::{
    ConnectionState, CoordinationClient, EtcdCoordination, MemoryEnsemble,
};
use portico_core::coordinator::{LeaderElector, WorkerScheduler};
use portico_core::elb::{AlbClient, ElbClient};
use portico_core::runtime::ShutdownSignal;
use portico_core::store::{LoadBalancerKind, RequestStore};
use portico_core::worker::{ElbSyncWorker, PurgeWorker, RequestWorker, RetryPolicy};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "portico", about = "Load balancer configuration orchestrator")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "PORTICO_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Clone)]
struct AppState {
    client: Arc<dyn CoordinationClient>,
    elector: Arc<LeaderElector>,
    scheduler: Arc<WorkerScheduler>,
    auth: AuthConfig,
}

#[derive(Deserialize)]
struct AuthQuery {
    authkey: Option<String>,
}

async fn healthcheck(State(state): State<AppState>) -> (StatusCode, &'static str) {
    let connection = *state.client.connection_events().borrow();
    match connection {
        ConnectionState::Connected(_) => (StatusCode::OK, "OK"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "coordination not connected"),
    }
}

async fn status(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
) -> Result<Json<Value>, StatusCode> {
    if !state.auth.permits(query.authkey.as_deref()) {
        return Err(StatusCode::FORBIDDEN);
    }

    let leader = match state.elector.leader_info().await {
        Ok(info) => json!(info),
        Err(e) => {
            warn!("Failed to read leader info: {}", e);
            Value::Null
        }
    };
    let workers: Vec<Value> = state
        .scheduler
        .status()
        .into_iter()
        .map(|w| json!({ "name": w.name, "lastStarted": w.last_started }))
        .collect();

    Ok(Json(json!({
        "hostname": state.elector.hostname(),
        "leader": state.elector.is_leader(),
        "session": state.elector.state().session,
        "lockHolder": leader,
        "workers": workers,
    })))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => PorticoConfig::load(path),
        None => {
            let mut config = PorticoConfig::default();
            config.apply_env_overrides();
            config.validate().map(|_| config)
        }
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Starting Portico coordinator");
    let shutdown = ShutdownSignal::new();

    let mut etcd = None;
    let client: Arc<dyn CoordinationClient> = match config.coordination.backend {
        CoordinationBackend::Etcd => {
            info!("Connecting to etcd at {:?}", config.coordination.endpoints);
            let connection = Arc::new(EtcdCoordination::connect(&config.coordination).await?);
            etcd = Some(connection.clone());
            connection
        }
        CoordinationBackend::Memory => {
            warn!("Using the in-memory coordination backend; leadership is local to this process");
            Arc::new(MemoryEnsemble::new().connect())
        }
    };

    let store = RequestStore::new(client.clone());
    let elector = LeaderElector::new(client.clone(), config.server.advertised_host());
    let mut scheduler = WorkerScheduler::new(&elector, config.worker.initial_delay());

    let agents = Arc::new(HttpAgentClient::new(&config.agent)?);
    scheduler.add_worker(Arc::new(RequestWorker::new(
        store.clone(),
        agents,
        elector.clone(),
        &config.agent,
        &config.worker,
    )));

    if let Some(elb) = &config.elb {
        let clients = ElbClient::new(elb).and_then(|classic| Ok((classic, AlbClient::new(elb)?)));
        let (classic, application) = match clients {
            Ok(clients) => clients,
            Err(e) => {
                error!("Cloud load balancer sync is configured but unusable: {}", e);
                return Err(e.into());
            }
        };
        let worker = ElbSyncWorker::new(
            store.clone(),
            Arc::new(classic),
            elector.clone(),
            RetryPolicy::from_agent_config(&config.agent),
            elb.drain_period(),
            config.worker.elb_interval(),
        )
        .with_api(LoadBalancerKind::Application, Arc::new(application))
        .allow_empty_deregistration(elb.allow_empty_deregistration);
        scheduler.add_worker(Arc::new(worker));
    } else {
        info!("No [elb] section, cloud load balancer sync disabled");
    }

    scheduler.add_worker(Arc::new(PurgeWorker::new(
        store,
        elector.clone(),
        config.worker.purge_retention(),
        config.worker.purge_interval(),
    )));

    let scheduler = Arc::new(scheduler);
    let worker_handles = scheduler.start(&shutdown);
    let elector_handle = tokio::spawn(elector.clone().run(shutdown.clone()));

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.trigger_on_ctrl_c().await });

    let app = Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/status", get(status))
        .route("/metrics", get(|| async { portico_core::metrics::gather_system_metrics() }))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState {
            client,
            elector,
            scheduler,
            auth: config.auth.clone(),
        });

    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!("HTTP server listening on {}", config.server.bind_addr);

    let server_shutdown = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.wait().await })
        .await
    {
        warn!("HTTP server error: {}", e);
        shutdown.shutdown();
    }

    if let Err(e) = elector_handle.await {
        warn!("Leader election task failed: {}", e);
    }
    for handle in worker_handles {
        let _ = handle.await;
    }
    if let Some(etcd) = etcd {
        etcd.close().await;
    }

    info!("Portico coordinator stopped");
    Ok(())
}
