//! Gateway middleware: ticket authentication and rate-limit admission
//!
//! The gateway applies these as axum layers in order: session auth
//! populates the request's [`AuthContext`], then rate limiting consults
//! the engine with a partition derived from that context (user id) or
//! from the client address. Rate-limit infrastructure failures reject
//! the request; admission never fails open.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::{header, HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

use crate::error::Error;
use crate::ratelimit::{RateLimitDecision, RateLimiter};
use crate::session::{SessionRecord, SessionStore};

static HEADER_POLICY: HeaderName = HeaderName::from_static("x-rate-limit-policy");
static HEADER_BUCKET: HeaderName = HeaderName::from_static("x-rate-limit-bucket");

/// Authenticated request context injected by the session middleware
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated user
    pub user_id: Uuid,
    /// Granted roles
    pub roles: Vec<String>,
    /// Whether the session carries admin privileges
    pub is_admin: bool,
    /// The validated ticket
    pub ticket: String,
}

impl From<SessionRecord> for AuthContext {
    fn from(record: SessionRecord) -> Self {
        Self {
            user_id: record.user_id,
            roles: record.roles,
            is_admin: record.is_admin,
            ticket: record.ticket_id,
        }
    }
}

/// Extract the bearer ticket from `Authorization: Bearer {ticket}` or the
/// `access_token` query parameter (WebSocket upgrades cannot set headers)
pub fn bearer_ticket(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION) {
        if let Ok(value) = value.to_str() {
            if let Some(ticket) = value.strip_prefix("Bearer ") {
                let ticket = ticket.trim();
                if !ticket.is_empty() {
                    return Some(ticket.to_string());
                }
            }
        }
    }
    let query = query?;
    for pair in query.split('&') {
        if let Some(ticket) = pair.strip_prefix("access_token=") {
            if !ticket.is_empty() {
                return Some(ticket.to_string());
            }
        }
    }
    None
}

/// Best-effort client address: `X-Forwarded-For` first hop, then the
/// socket address recorded by the listener
pub fn remote_ip(request: &Request) -> String {
    if let Some(forwarded) = request.headers().get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Rate-limit partition for a request: user id when authenticated, the
/// client address otherwise. The second element is the bucket prefix
/// surfaced in the deny headers.
pub fn partition_key(auth: Option<&AuthContext>, ip: &str) -> (String, &'static str) {
    match auth {
        Some(auth) => (format!("user:{}", auth.user_id), "Account"),
        None => (format!("ip:{ip}"), "Ip"),
    }
}

/// Require a valid session ticket; rejects with 401 otherwise
pub async fn session_auth(
    State(store): State<SessionStore>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    let ticket = bearer_ticket(request.headers(), request.uri().query())
        .ok_or_else(|| Error::Unauthorized("missing bearer ticket".into()))?;
    let session = store.validate(&ticket).await?;
    request.extensions_mut().insert(AuthContext::from(session));
    Ok(next.run(request).await)
}

/// Validate a ticket when present, pass through anonymously when absent.
/// A presented-but-invalid ticket still rejects.
pub async fn optional_session_auth(
    State(store): State<SessionStore>,
    mut request: Request,
    next: Next,
) -> Result<Response, Error> {
    if let Some(ticket) = bearer_ticket(request.headers(), request.uri().query()) {
        let session = store.validate(&ticket).await?;
        request.extensions_mut().insert(AuthContext::from(session));
    }
    Ok(next.run(request).await)
}

/// Require an admin session; apply after [`session_auth`]
pub async fn require_admin(request: Request, next: Next) -> Result<Response, Error> {
    match request.extensions().get::<AuthContext>() {
        Some(auth) if auth.is_admin => Ok(next.run(request).await),
        Some(_) => Err(Error::Forbidden("admin role required".into())),
        None => Err(Error::Unauthorized("missing bearer ticket".into())),
    }
}

/// Admission check against the rate-limit engine.
///
/// Denials return 429 with `Retry-After` plus the `X-Rate-Limit-*`
/// headers; engine failures (Redis down, configuration missing) reject
/// the request rather than silently admitting it.
pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, Error> {
    let auth = request.extensions().get::<AuthContext>().cloned();
    let ip = remote_ip(&request);
    let (partition, bucket) = partition_key(auth.as_ref(), &ip);
    let path = request.uri().path().to_string();

    match limiter.check(&partition, &path).await? {
        RateLimitDecision::Allowed => Ok(next.run(request).await),
        RateLimitDecision::Denied {
            policy,
            retry_after_secs,
        } => {
            let mut response = Error::RateLimited {
                policy: policy.clone(),
                retry_after_secs,
            }
            .into_response();
            let headers = response.headers_mut();
            if let Ok(value) = HeaderValue::from_str(&policy) {
                headers.insert(HEADER_POLICY.clone(), value);
            }
            headers.insert(HEADER_BUCKET.clone(), HeaderValue::from_static(bucket));
            Ok(response)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_auth(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_header_wins() {
        let headers = headers_with_auth("Bearer abc123");
        assert_eq!(bearer_ticket(&headers, None).as_deref(), Some("abc123"));
    }

    #[test]
    fn access_token_query_covers_websocket_upgrades() {
        let headers = HeaderMap::new();
        assert_eq!(
            bearer_ticket(&headers, Some("foo=1&access_token=tkt&bar=2")).as_deref(),
            Some("tkt")
        );
    }

    #[test]
    fn malformed_auth_is_rejected() {
        assert_eq!(bearer_ticket(&HeaderMap::new(), None), None);
        assert_eq!(bearer_ticket(&headers_with_auth("Basic abc"), None), None);
        assert_eq!(bearer_ticket(&headers_with_auth("Bearer "), None), None);
        assert_eq!(bearer_ticket(&HeaderMap::new(), Some("access_token=")), None);
    }

    #[test]
    fn partition_prefers_user_over_ip() {
        let user_id = Uuid::new_v4();
        let auth = AuthContext {
            user_id,
            roles: vec![],
            is_admin: false,
            ticket: "t".into(),
        };
        assert_eq!(
            partition_key(Some(&auth), "10.0.0.1"),
            (format!("user:{user_id}"), "Account")
        );
        assert_eq!(
            partition_key(None, "10.0.0.1"),
            ("ip:10.0.0.1".to_string(), "Ip")
        );
    }
}
