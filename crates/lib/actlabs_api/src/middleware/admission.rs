//! Admission gate: bearer-token verification fused with bad-request throttling.
//!
//! Every request that fails authentication counts once against its client IP.
//! Once an IP exceeds the limit inside its window, it receives 429 for the
//! rest of that window, valid credentials or not.

use std::net::SocketAddr;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use tracing::{debug, error, warn};

use actlabs_core::auth::{AuthError, bearer_token};
use actlabs_core::models::AuthClaim;
use actlabs_core::rate_limit::{BAD_REQUEST_LIMIT, BAD_REQUEST_WINDOW};

use crate::AppState;
use crate::error::AppError;

/// Largest request body the gate buffers.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Rate-limit key for peers whose address is unknown.
const UNKNOWN_CLIENT: &str = "unknown";

/// Verified claims of the caller, stored in request extensions.
#[derive(Debug, Clone)]
pub struct AuthenticatedCaller(pub AuthClaim);

/// Why a request was turned away before reaching a handler.
enum Rejection {
    /// Body could not be read or is not a JSON object.
    BadBody(String),
    /// Credential missing, malformed or not valid for the claimed principal.
    Unauthenticated(AuthError),
}

impl Rejection {
    fn into_error(self) -> AppError {
        match self {
            Rejection::BadBody(m) => AppError::BadRequest(m),
            Rejection::Unauthenticated(e) => AppError::Unauthorized(e.to_string()),
        }
    }
}

/// Rate-limit key of the request: the peer IP, or the first
/// `X-Forwarded-For` entry when the proxy is trusted.
pub fn client_key(request: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// `userPrincipalId` claimed by the body, if any.
fn claimed_subject(body: &Bytes) -> Result<Option<String>, Rejection> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| Rejection::BadBody(format!("invalid request body: {e}")))?;
    let Value::Object(fields) = value else {
        return Err(Rejection::BadBody(
            "invalid request body: expected a JSON object".into(),
        ));
    };
    Ok(fields
        .get("userPrincipalId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string))
}

/// The header is checked before the body is buffered.
async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    body: Body,
) -> Result<(AuthClaim, Bytes), Rejection> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(Rejection::Unauthenticated(AuthError::MissingToken))?
        .to_str()
        .map_err(|_| Rejection::Unauthenticated(AuthError::NotBearer))?;
    let token = bearer_token(header).map_err(Rejection::Unauthenticated)?;
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Rejection::BadBody(format!("failed to read request body: {e}")))?;
    let subject = claimed_subject(&bytes)?;
    let claim = state
        .verifier
        .verify(token, subject.as_deref())
        .await
        .map_err(Rejection::Unauthenticated)?;
    Ok((claim, bytes))
}

/// Axum middleware: authenticates the caller, throttles clients that keep
/// failing, and injects [`AuthenticatedCaller`] into request extensions.
pub async fn admit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = client_key(&request, state.config.trust_forwarded_for);
    let (mut parts, body) = request.into_parts();

    let outcome = authenticate(&state, &parts.headers, body).await;

    match outcome {
        Err(rejection) => {
            match state
                .rate_limiter
                .allow(&key, BAD_REQUEST_LIMIT, BAD_REQUEST_WINDOW)
                .await
            {
                Ok(decision) if !decision.allowed => {
                    warn!(client = %key, count = decision.count, "too many bad requests");
                    return Err(AppError::TooManyRequests);
                }
                Ok(decision) => {
                    debug!(client = %key, count = decision.count, "bad request counted")
                }
                Err(e) => error!(client = %key, error = %e, "rate limiter unavailable"),
            }
            let err = rejection.into_error();
            warn!(client = %key, method = %parts.method, uri = %parts.uri, error = %err, "request rejected");
            Err(err)
        }
        Ok((claim, bytes)) => {
            match state.rate_limiter.peek(&key, BAD_REQUEST_LIMIT).await {
                Ok(Some(decision)) if !decision.allowed => {
                    warn!(client = %key, count = decision.count, "client is throttled");
                    return Err(AppError::TooManyRequests);
                }
                Ok(_) => {}
                Err(e) => error!(client = %key, error = %e, "rate limiter unavailable"),
            }
            debug!(client = %key, subject = claim.subject(), "request admitted");
            parts.extensions.insert(AuthenticatedCaller(claim));
            Ok(next.run(Request::from_parts(parts, Body::from(bytes))).await)
        }
    }
}
