//! Admin HTTP surface and process bootstrap.
//!
//! The data-plane HTTP ingress (accepting inference requests over the
//! wire, OpenAI/Anthropic protocol translation, SSE) is out of scope —
//! this module only serves the time-rule admin endpoints
//! (`/admin/time-rules/status`, `/admin/time-rules/apply`) plus the
//! ambient `/health`, `/ready`, `/metrics` every admin surface in this
//! service family carries.

mod admin;
pub mod bootstrap;
pub mod runtime;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::metrics::Metrics;
use crate::AdmissionCore;

/// Everything the admin handlers need, cheaply cloneable — scoped down
/// to what an admin-only surface actually touches.
#[derive(Clone)]
pub struct AdminState {
    pub core: AdmissionCore,
    pub metrics: Arc<Metrics>,
}

/// Serve the admin HTTP surface until `shutdown` resolves. Each
/// connection is handled on its own task (no TLS, no connection
/// draining — admin traffic is low-volume and local).
pub async fn run_admin_server(
    listen: &str,
    state: AdminState,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let addr: SocketAddr = listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: admin listening, addr={}", addr);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = &mut shutdown => {
                info!("server: admin: shutdown signal received");
                return Ok(());
            }
        };

        let (stream, _) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("server: admin: accept failed, error={}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state.clone();
                async move { admin::handle_admin(req, state).await }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!("server: admin: connection error, error={}", e);
                }
            }
        });
    }
}
