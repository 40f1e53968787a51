use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::CoreConfig;
use crate::metrics::Metrics;
use crate::request::RequestBuilder;
use crate::server::{self, AdminState};
use crate::AdmissionCore;

const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub admin_listen: String,
}

/// Core lifecycle: load config → spawn C2..C5 via `AdmissionCore::new` →
/// serve admin HTTP → wait for a shutdown signal → drain.
///
/// This binary demonstrates the admission core end-to-end (it admits a
/// trickle of synthetic load and serves `/admin/*`); it does not
/// implement an HTTP ingress/proxy data plane.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let config = CoreConfig::load(&args.config_path)?;
    let metrics = Arc::new(Metrics::install());
    let core = AdmissionCore::new(config)
        .map_err(|e| anyhow::anyhow!("failed to start admission core: {e}"))?;

    let demo_shutdown = Arc::new(tokio::sync::Notify::new());
    spawn_demo_load(core.clone(), demo_shutdown.clone());

    let (admin_shutdown_tx, admin_shutdown_rx) = tokio::sync::oneshot::channel();
    let admin_state = AdminState {
        core: core.clone(),
        metrics,
    };
    let admin_listen = args.admin_listen.clone();
    let admin_handle = tokio::spawn(async move {
        if let Err(e) = server::run_admin_server(&admin_listen, admin_state, admin_shutdown_rx).await
        {
            tracing::error!("server: admin failed, error={}", e);
        }
    });

    tracing::info!("admission_core: ready, admin_listen={}", args.admin_listen);

    wait_for_shutdown().await;

    demo_shutdown.notify_waiters();
    let _ = admin_shutdown_tx.send(());
    core.shutdown(SHUTDOWN_DRAIN_TIMEOUT).await;
    let _ = admin_handle.await;

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Submits a low-rate trickle of synthetic requests across priorities so
/// the admin surface has something to show — not part of the core's
/// contract, purely a demonstration loop for this binary.
fn spawn_demo_load(core: AdmissionCore, shutdown: Arc<tokio::sync::Notify>) {
    tokio::spawn(async move {
        let levels = core.num_priority_levels();
        let mut priority = 0usize;
        loop {
            // Jittered so a freshly started process doesn't line its demo
            // traffic up in lockstep with the scheduler tick.
            let jitter = Duration::from_millis(rand::random::<u64>() % 100);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(250) + jitter) => {}
                _ = shutdown.notified() => return,
            }

            let (req, rx) = RequestBuilder::new(priority % levels.max(1))
                .estimated_tokens(100)
                .ttl(Duration::from_secs(30))
                .build();
            priority = priority.wrapping_add(1);

            let req_id = req.id;
            match core.submit(req).await {
                Ok(()) => {
                    let core = core.clone();
                    tokio::spawn(async move {
                        if let Ok(result) = rx.await {
                            tracing::debug!(
                                request_id = %req_id,
                                accepted = result.accepted,
                                reason = %result.reason,
                                "demo_load: result delivered"
                            );
                            if result.accepted {
                                tokio::time::sleep(Duration::from_millis(50)).await;
                                core.release(req_id);
                            }
                        }
                    });
                }
                Err(e) => tracing::debug!(request_id = %req_id, error = %e, "demo_load: submit failed"),
            }
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
