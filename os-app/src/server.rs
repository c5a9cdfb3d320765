//! calgate server: Telegram callback dispatch, expiry sweeper and the HTTP
//! ingestion surface, plus the one-shot CLI commands.

use crate::config::CalgateConfig;
use crate::proposals::{
    ApprovalPresenter, CallbackRouter, ExpirySweeper, InFlightClaims, ProposalService,
    ProposalStatus, ProposalStore, ProposalValidator, SqliteProposalStore,
};
use crate::routes;
use anyhow::Result;
use axum::Extension;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use os_calendar::{CalendarClient, CredentialManager};
use os_channels::{ChannelAdapter, InboundAction, TelegramAdapter};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

const INBOUND_QUEUE_CAPACITY: usize = 256;

pub struct AppState {
    pub service: Arc<ProposalService>,
    pub store: Arc<dyn ProposalStore>,
    pub ingest_token: Option<String>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = CalgateConfig::load(config_path).await?;
    let time_zone = cfg.time_zone()?;
    let store = open_store(&cfg)?;
    let pending = store.list(Some(ProposalStatus::Pending)).await?;

    let credentials = CredentialManager::new(
        cfg.credentials_path(),
        cfg.calendar.token_endpoint.clone(),
        cfg.calendar_timeout(),
    )?;
    let credential = credentials.load().await?;
    tracing::info!(
        time_zone = %time_zone,
        telegram_enabled = cfg.telegram.enabled,
        server_enabled = cfg.server.enabled,
        database_path = %cfg.database_path().display(),
        pending_count = pending.len(),
        credentials_path = %credentials.path().display(),
        access_token_expires_at = ?credential.access_token_expires_at,
        "config ok"
    );
    Ok(())
}

pub async fn sweep(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = CalgateConfig::load(config_path).await?;
    let store = open_store(&cfg)?;
    let sweeper = ExpirySweeper::new(store, InFlightClaims::new(), cfg.expiry_window());
    let report = sweeper.sweep_once().await?;
    println!("{}", serde_json::to_string(&report)?);
    Ok(())
}

pub async fn list(config_path: Option<PathBuf>, status: Option<ProposalStatus>) -> Result<()> {
    let cfg = CalgateConfig::load(config_path).await?;
    let store = open_store(&cfg)?;
    for proposal in store.list(status).await? {
        println!("{}", serde_json::to_string(&proposal)?);
    }
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = CalgateConfig::load(config_path).await?;
    if !cfg.telegram.enabled {
        return Err(anyhow::anyhow!(
            "serve needs an approval channel; enable [telegram] or set TELEGRAM_BOT_TOKEN"
        ));
    }
    let time_zone = cfg.time_zone()?;
    tracing::info!(
        time_zone = %time_zone,
        database_path = %cfg.database_path().display(),
        credentials_path = %cfg.credentials_path().display(),
        calendar_id = %cfg.calendar.calendar_id,
        expiry_hours = cfg.proposals.expiry_hours,
        sweep_interval_seconds = cfg.proposals.sweep_interval_seconds,
        allowed_user_count = cfg.telegram.allowed_user_ids.len(),
        server_enabled = cfg.server.enabled,
        ingest_token_configured = cfg.server.ingest_token.is_some(),
        "server configuration loaded"
    );

    let store = open_store(&cfg)?;
    let credentials = Arc::new(CredentialManager::new(
        cfg.credentials_path(),
        cfg.calendar.token_endpoint.clone(),
        cfg.calendar_timeout(),
    )?);
    let writer = Arc::new(CalendarClient::new(
        credentials,
        &cfg.calendar.api_base_url,
        &cfg.calendar.calendar_id,
        time_zone,
        cfg.calendar_timeout(),
    )?);
    let channel: Arc<dyn ChannelAdapter> = Arc::new(TelegramAdapter::new(&cfg.telegram.bot_token)?);

    let presenter = ApprovalPresenter::new(channel.clone(), time_zone);
    let claims = InFlightClaims::new();
    let router = Arc::new(
        CallbackRouter::new(
            store.clone(),
            writer,
            presenter.clone(),
            claims.clone(),
            cfg.expiry_window(),
        )
        .with_allowed_senders(cfg.allowed_sender_ids()),
    );
    let sweeper = Arc::new(ExpirySweeper::new(
        store.clone(),
        claims,
        cfg.expiry_window(),
    ));
    let service = Arc::new(ProposalService::new(
        ProposalValidator::new(time_zone)?,
        store.clone(),
        presenter,
    ));

    let shutdown = CancellationToken::new();
    let sweeper_handle = sweeper.spawn(cfg.sweep_interval(), shutdown.child_token());

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
    channel.start(tx).await?;
    tracing::info!(channel = channel.channel_id(), "approval channel started");
    let dispatch_handle = spawn_dispatcher(router, rx, shutdown.child_token());

    if cfg.server.enabled {
        let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server address: {e}"))?;
        let listener = preflight_bind_listener(addr).await?;
        let state = Arc::new(AppState {
            service,
            store,
            ingest_token: cfg.server.ingest_token.clone(),
        });
        let app = build_app(state, &cfg);

        tracing::info!(%addr, "calgate serving");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
            .await?;
        tracing::info!("http server shutdown completed");
    } else {
        tracing::info!("http ingestion disabled; waiting for shutdown signal");
        shutdown_signal(shutdown.clone()).await;
    }

    shutdown.cancel();
    for (name, handle) in [("sweeper", sweeper_handle), ("dispatcher", dispatch_handle)] {
        match handle.await {
            Ok(()) => tracing::info!(task = name, "shutdown completed"),
            Err(e) => tracing::error!(task = name, error = %e, "task join failed during shutdown"),
        }
    }
    Ok(())
}

fn open_store(cfg: &CalgateConfig) -> Result<Arc<dyn ProposalStore>> {
    let path = cfg.database_path();
    let store = SqliteProposalStore::open(&path)
        .map_err(|e| anyhow::anyhow!("open proposal store {}: {e}", path.display()))?;
    Ok(Arc::new(store))
}

/// Each inbound tap is handled on its own task; the router serialises
/// work per proposal.
fn spawn_dispatcher(
    router: Arc<CallbackRouter>,
    mut rx: mpsc::Receiver<InboundAction>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("callback dispatcher received shutdown signal");
                    break;
                }
                action = rx.recv() => {
                    let Some(action) = action else {
                        tracing::warn!("inbound action queue closed");
                        break;
                    };
                    let router = router.clone();
                    tokio::spawn(async move {
                        router.handle_action(action).await;
                    });
                }
            }
        }
    })
}

fn build_app(state: Arc<AppState>, cfg: &CalgateConfig) -> axum::Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    routes::router()
        .layer(Extension(state))
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            cfg.server_timeout(),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "listener bound");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "failed to install SIGTERM handler; falling back to ctrl_c only"
                );
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}
