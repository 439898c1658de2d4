//! Gateway client library
//!
//! Typed grain proxies plus the middleware pipeline gateways put in
//! front of them: auth → rate limit → invoke.

pub mod middleware;
pub mod proxy;

pub use middleware::{
    bearer_ticket, optional_session_auth, partition_key, rate_limit, remote_ip, require_admin,
    session_auth, AuthContext,
};
pub use proxy::GrainClient;
