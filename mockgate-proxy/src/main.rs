//! mockgate - transparent gRPC proxy that answers selected calls from
//! registered cases and relays everything else to the real backend.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use hyper::body::Incoming;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use mockgate_core::config::{self, MockGateDefaults, find_config_file, load_and_validate};
use mockgate_core::control::ControlPlane;
use mockgate_core::lifecycle::{DrainResult, LifecycleConfig, LifecycleManager};
use mockgate_core::matching::MatchEngine;
use mockgate_core::reload::Reloader;
use mockgate_core::schema::ReflectionResolver;
use mockgate_core::snapshot::SnapshotHandle;
use mockgate_core::store::{CaseStore, MemoryCaseStore};
use mockgate_core::telemetry::MockGateMetrics;
use mockgate_core::upstream::BackendPool;
use mockgate_proxy::admin::{AdminServer, AdminServerConfig};
use mockgate_proxy::ports::{admin_port, proxy_port};
use mockgate_proxy::proxy_config::ProxyConfig;
use mockgate_proxy::proxy_service::ProxyService;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// gRPC listen address; defaults to 0.0.0.0 on MOCKGATE_PROXY_PORT
    #[arg(short, long)]
    bind: Option<String>,

    /// YAML configuration file.
    /// If not specified, searches: MOCKGATE_CONFIG env, /etc/mockgate/config.yaml, ./config.yaml
    #[arg(long, env = "MOCKGATE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard flushes buffered log lines on exit.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let proxy_config = ProxyConfig::from_env();

    let defaults = MockGateDefaults::from_env();
    if let Err(msg) = defaults.validate() {
        error!(reason = %msg, "Invalid process defaults, refusing to start");
        std::process::exit(1);
    }

    let file_config = match find_config_file(cli.config.as_deref())? {
        Some(path) => {
            let (cfg, validation) = load_and_validate(&path)?;
            for warning in &validation.warnings {
                warn!(config = %path.display(), "{}", warning);
            }
            info!(
                config = %path.display(),
                upstreams = cfg.upstreams.len(),
                cases = cfg.cases.len(),
                "Configuration loaded"
            );
            cfg
        }
        None => {
            info!("No configuration file found, starting with defaults");
            config::Config::default()
        }
    };

    let lifecycle_config = LifecycleConfig::from_defaults(&defaults);

    let mut prom_registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(MockGateMetrics::new(&mut prom_registry));
    let prom_registry = Arc::new(prom_registry);

    let shutdown = CancellationToken::new();

    // Seeds go straight into the store; the first rebuild resolves them.
    let store = Arc::new(MemoryCaseStore::new());
    for upstream in &file_config.upstreams {
        store.add_upstream(upstream.clone()).await?;
    }
    for case in &file_config.cases {
        store.set_case(case.clone()).await?;
    }

    let snapshot = SnapshotHandle::default();
    let schema = Arc::new(ReflectionResolver::new(file_config.max_frame_bytes));
    let pool = BackendPool::new(&proxy_config.pool_settings())?;
    let reloader = Arc::new(
        Reloader::new(
            store.clone(),
            schema.clone(),
            pool.clone(),
            snapshot.clone(),
            file_config.reload_settings(&defaults),
        )
        .with_metrics(metrics.clone()),
    );
    let control = Arc::new(ControlPlane::new(store, schema, pool, reloader.clone()));

    let lifecycle = Arc::new(LifecycleManager::new(lifecycle_config, snapshot.clone()));
    lifecycle.mark_config_loaded();

    tokio::spawn(reloader.clone().run(shutdown.clone()));

    let admin = AdminServer::with_config(
        lifecycle.clone(),
        prom_registry,
        control,
        AdminServerConfig::with_port(admin_port()),
    );
    let admin_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = admin.run(admin_shutdown).await {
            error!(error = %e, "Admin server failed");
        }
    });

    setup_signal_handlers(shutdown.clone(), lifecycle.clone());

    let engine = MatchEngine::new(
        file_config.matching.keys.clone().normalized(),
        file_config.matching.enums_as_ints,
    );
    let service = ProxyService::new(snapshot, engine, file_config.max_frame_bytes)
        .with_metrics(metrics.clone());

    let bind = cli
        .bind
        .unwrap_or_else(|| format!("0.0.0.0:{}", proxy_port()));
    let listener = TcpListener::bind(&bind).await?;
    info!(
        addr = %bind,
        max_connections = proxy_config.max_concurrent_streams,
        "gRPC listener ready"
    );

    let semaphore = Arc::new(Semaphore::new(proxy_config.max_concurrent_streams));
    lifecycle.mark_ready();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let Some(request_guard) = lifecycle.track_request() else {
                            debug!(peer = %peer_addr, "Rejected connection: shutting down");
                            continue;
                        };

                        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                            warn!(
                                peer = %peer_addr,
                                max_connections = proxy_config.max_concurrent_streams,
                                "Rejected connection: connection limit reached"
                            );
                            continue;
                        };

                        if let Err(e) = configure_tcp_stream(&stream, &proxy_config) {
                            error!(error = %e, "Failed to configure socket");
                        }

                        metrics.connections_active.inc();
                        let service = service.clone();
                        let conn_shutdown = shutdown.clone();
                        let conn_metrics = metrics.clone();

                        tokio::spawn(async move {
                            handle_connection(stream, peer_addr, service, conn_shutdown).await;
                            conn_metrics.connections_active.dec();
                            drop(request_guard);
                            drop(permit);
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }

            _ = shutdown.cancelled() => {
                info!("Shutdown signal received, stopping new connections");
                break;
            }
        }
    }

    info!(
        active_connections = lifecycle.active_request_count(),
        drain_timeout_secs = lifecycle.config().drain_timeout.as_secs(),
        "Waiting for active connections to drain"
    );

    let drain_result = lifecycle.drain_requests().await;
    lifecycle.mark_stopped();

    match drain_result {
        DrainResult::Complete => {
            info!("All connections drained, shutting down cleanly");
            Ok(())
        }
        DrainResult::Timeout { remaining } => Err(format!(
            "Drain timeout exceeded with {} remaining connections",
            remaining
        )
        .into()),
    }
}

fn setup_signal_handlers(shutdown: CancellationToken, lifecycle: Arc<LifecycleManager>) {
    let shutdown_sigint = shutdown.clone();
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT, initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
                shutdown_sigint.cancel();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    {
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating graceful shutdown");
                    lifecycle.begin_shutdown();
                    shutdown.cancel();
                }
                Err(e) => {
                    error!(error = %e, "Failed to listen for SIGTERM");
                }
            }
        });
    }

    #[cfg(not(unix))]
    let _ = (shutdown, lifecycle);
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    service: ProxyService,
    shutdown: CancellationToken,
) {
    let io = TokioIo::new(stream);

    let svc_fn = hyper::service::service_fn(move |req: Request<Incoming>| {
        let service = service.clone();
        async move { Ok::<_, Infallible>(service.handle(req).await) }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, svc_fn);
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(peer = %peer_addr, error = %e, "Connection closed with error");
            }
        }
        _ = shutdown.cancelled() => {
            debug!(peer = %peer_addr, "Gracefully closing connection");
            conn.as_mut().graceful_shutdown();
            let _ = tokio::time::timeout(Duration::from_secs(5), conn).await;
        }
    }
}

fn configure_tcp_stream(stream: &TcpStream, config: &ProxyConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    let socket = socket2::SockRef::from(stream);

    let keepalive =
        socket2::TcpKeepalive::new().with_time(Duration::from_secs(config.tcp_keepalive_secs));
    socket.set_tcp_keepalive(&keepalive)?;

    socket.set_recv_buffer_size(config.socket_buffer_size)?;
    socket.set_send_buffer_size(config.socket_buffer_size)?;

    Ok(())
}
