//! Turns a [`policy::Decision`] into response headers and, on rejection, a
//! JSON error body, per SPEC_FULL.md §6.

use axum::body::Body;
use http::{HeaderName, HeaderValue, Response, StatusCode, header::RETRY_AFTER};
use policy::Decision;
use serde::Serialize;

/// `RateLimit-*` headers, set unconditionally whenever a policy was
/// evaluated (admit or reject alike).
fn rate_limit_headers(decision: &Decision) -> Vec<(&'static str, String)> {
    let details = &decision.details;
    let mut headers = vec![
        ("RateLimit-Limit", details.limit.to_string()),
        ("RateLimit-Remaining", details.remaining.max(0.0).to_string()),
        ("RateLimit-Reset", details.reset_in_seconds.to_string()),
    ];

    if let Some(burst) = details.burst_tokens {
        headers.push(("RateLimit-Burst-Remaining", burst.to_string()));
    }

    headers
}

/// Attach the `RateLimit-*` headers for `decision` onto an already-built
/// response, whatever its status.
pub fn apply_rate_headers(response: &mut Response<Body>, decision: &Decision) {
    for (name, value) in rate_limit_headers(decision) {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::from_str(&value)) {
            response.headers_mut().insert(name, value);
        }
    }
}

/// JSON body for a rejected request.
#[derive(Debug, Serialize)]
struct RejectionBody {
    ok: bool,
    reason: &'static str,
    message: String,
    retry_after_seconds: u64,
    used: f64,
    allowed: f64,
    plan: String,
    endpoint: String,
}

/// Build the `429` response for a blocked policy decision.
pub fn block_response(decision: &Decision, plan: &str, endpoint: &str) -> Response<Body> {
    let reason = decision.reason.unwrap_or("rate_limited");
    let retry_after = decision.retry_after_seconds.unwrap_or(1);

    let body = RejectionBody {
        ok: false,
        reason,
        message: format!("{reason} for {endpoint}"),
        retry_after_seconds: retry_after,
        used: decision.details.used,
        allowed: decision.details.limit,
        plan: plan.to_string(),
        endpoint: endpoint.to_string(),
    };

    let mut response = json_response(StatusCode::TOO_MANY_REQUESTS, &body);

    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        response.headers_mut().insert(RETRY_AFTER, value);
    }

    apply_rate_headers(&mut response, decision);
    response
}

/// Build the `429` response for a concurrency-limit rejection (queue full,
/// queue timeout, queue cleared, or immediate block-mode rejection), per
/// SPEC_FULL.md §7: all four map to 429 with `retry_after_seconds = 1`.
pub fn concurrency_rejected_response(endpoint: &str) -> Response<Body> {
    let body = RejectionBody {
        ok: false,
        reason: "concurrency_limited",
        message: format!("too many concurrent requests for {endpoint}"),
        retry_after_seconds: 1,
        used: 0.0,
        allowed: 0.0,
        plan: String::new(),
        endpoint: endpoint.to_string(),
    };

    let mut response = json_response(StatusCode::TOO_MANY_REQUESTS, &body);
    response.headers_mut().insert(RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

/// `403` body for an IP blocked before any policy was evaluated.
#[derive(Debug, Serialize)]
struct IpBlockedBody {
    ok: bool,
    reason: &'static str,
    message: String,
}

/// Build the `403` response for a blocklisted caller IP.
pub fn ip_blocked_response() -> Response<Body> {
    let body = IpBlockedBody {
        ok: false,
        reason: "ip_blocked",
        message: "client ip is blocklisted".to_string(),
    };

    json_response(StatusCode::FORBIDDEN, &body)
}

/// `503` body for a fatal counter-store failure under `onError = fail-closed`.
#[derive(Debug, Serialize)]
struct UnavailableBody {
    ok: bool,
    reason: &'static str,
    message: String,
}

/// Build the `503` response for a propagated fatal store error.
pub fn store_unavailable_response() -> Response<Body> {
    let body = UnavailableBody {
        ok: false,
        reason: "store_unavailable",
        message: "counter store is unavailable".to_string(),
    };

    json_response(StatusCode::SERVICE_UNAVAILABLE, &body)
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Body> {
    let payload = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());

    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(payload))
        .expect("status and headers are always valid")
}
