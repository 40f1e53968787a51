use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response};

use super::AdminState;

type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

fn json(status: u16, body: impl Into<Bytes>) -> Result<Response<BoxBody>, hyper::Error> {
    Ok(Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap())
}

/// `GET /admin/time-rules/status`, `POST /admin/time-rules/apply`, plus
/// the ambient `/health`, `/ready`, `/metrics` every admin surface in
/// this service family carries regardless of feature scope.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: AdminState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match (req.method().clone(), req.uri().path()) {
        (Method::GET, "/health" | "/healthz") => {
            json(200, r#"{"status":"ok"}"#)
        }

        (Method::GET, "/ready" | "/readyz") => {
            json(
                200,
                format!(
                    r#"{{"status":"ready","priority_levels":{},"policy":"{:?}"}}"#,
                    state.core.num_priority_levels(),
                    state.core.policy(),
                ),
            )
        }

        (Method::GET, "/metrics") => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap()),

        (Method::GET, "/admin/stats") => {
            let stats = state.core.stats().await;
            let body = serde_json::to_string(&stats).unwrap_or_default();
            json(200, body)
        }

        (Method::GET, "/admin/time-rules/status") => {
            let rules = state.core.rule_engine().status().await;
            let body = serde_json::json!({
                "enabled": true,
                "count": rules.len(),
                "rules": rules,
            });
            json(200, serde_json::to_string(&body).unwrap_or_default())
        }

        (Method::POST, "/admin/time-rules/apply") => {
            state.core.rule_engine().apply().await;
            json(200, r#"{"status":"applied"}"#)
        }

        _ => json(404, r#"{"error":"not found"}"#),
    }
}
