//! Inter-silo invocation transport
//!
//! Calls between silos travel as length-prefixed prost envelopes. The
//! in-process network backs single-process clusters and the test suite;
//! the TCP transport backs real deployments. Both surface delivery
//! failures as transient errors so the invocation layer can retry against
//! a refreshed membership view.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identity::{GrainIdentity, GrainKey};
use crate::runtime::grain::{GrainCall, TxnContext};

/// Upper bound for one envelope; anything larger is a protocol violation
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

// Wire error codes; part of the cross-silo protocol
const CODE_TRANSIENT: u32 = 1;
const CODE_APPLICATION: u32 = 2;
const CODE_NOT_FOUND: u32 = 3;
const CODE_BAD_REQUEST: u32 = 4;
const CODE_UNAUTHORIZED: u32 = 5;
const CODE_FORBIDDEN: u32 = 6;
const CODE_RATE_LIMITED: u32 = 7;
const CODE_SYSTEM: u32 = 8;

/// Grain identity on the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireIdentity {
    #[prost(string, tag = "1")]
    pub grain_type: String,
    #[prost(uint32, tag = "2")]
    pub key_kind: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub key_guid: Vec<u8>,
    #[prost(string, tag = "4")]
    pub key_text: String,
}

impl From<&GrainIdentity> for WireIdentity {
    fn from(identity: &GrainIdentity) -> Self {
        let (key_kind, key_guid, key_text) = match &identity.key {
            GrainKey::Guid(id) => (1, id.as_bytes().to_vec(), String::new()),
            GrainKey::Text(s) => (2, Vec::new(), s.clone()),
            GrainKey::GuidCompound(id, suffix) => (3, id.as_bytes().to_vec(), suffix.clone()),
        };
        Self {
            grain_type: identity.grain_type.clone(),
            key_kind,
            key_guid,
            key_text,
        }
    }
}

impl TryFrom<&WireIdentity> for GrainIdentity {
    type Error = Error;

    fn try_from(wire: &WireIdentity) -> Result<Self> {
        let guid = || -> Result<Uuid> {
            Uuid::from_slice(&wire.key_guid)
                .map_err(|e| Error::Decode(format!("bad key guid: {e}")))
        };
        let key = match wire.key_kind {
            1 => GrainKey::Guid(guid()?),
            2 => GrainKey::Text(wire.key_text.clone()),
            3 => GrainKey::GuidCompound(guid()?, wire.key_text.clone()),
            other => return Err(Error::Decode(format!("unknown key kind {other}"))),
        };
        Ok(GrainIdentity {
            grain_type: wire.grain_type.clone(),
            key,
        })
    }
}

/// Transaction scope on the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireTxn {
    #[prost(bytes = "vec", tag = "1")]
    pub txid: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub read_ts: u64,
}

/// One inter-silo invocation
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationRequest {
    #[prost(message, optional, tag = "1")]
    pub target: Option<WireIdentity>,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
    /// Milliseconds the caller is still willing to wait
    #[prost(uint64, tag = "4")]
    pub deadline_ms: u64,
    /// Request fingerprint for tracing
    #[prost(string, tag = "5")]
    pub request_id: String,
    #[prost(message, optional, tag = "6")]
    pub txn: Option<WireTxn>,
}

impl InvocationRequest {
    /// Build a request envelope for a call
    pub fn new(
        identity: &GrainIdentity,
        call: &GrainCall,
        deadline_ms: u64,
        request_id: String,
    ) -> Self {
        Self {
            target: Some(WireIdentity::from(identity)),
            method: call.method.clone(),
            body: call.body.clone(),
            deadline_ms,
            request_id,
            txn: call.txn.map(|t| WireTxn {
                txid: t.txid.as_bytes().to_vec(),
                read_ts: t.read_ts,
            }),
        }
    }

    /// Recover the target identity and call from the envelope
    pub fn unpack(&self) -> Result<(GrainIdentity, GrainCall)> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| Error::Decode("invocation without target".into()))?;
        let identity = GrainIdentity::try_from(target)?;
        let txn = match &self.txn {
            Some(wire) => Some(TxnContext {
                txid: Uuid::from_slice(&wire.txid)
                    .map_err(|e| Error::Decode(format!("bad txid: {e}")))?,
                read_ts: wire.read_ts,
            }),
            None => None,
        };
        let call = GrainCall {
            method: self.method.clone(),
            body: self.body.clone(),
            txn,
        };
        Ok((identity, call))
    }
}

/// Typed failure crossing the wire
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireError {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(uint64, tag = "3")]
    pub retry_after_secs: u64,
    #[prost(string, tag = "4")]
    pub policy: String,
}

impl From<&Error> for WireError {
    fn from(error: &Error) -> Self {
        let (code, retry_after_secs, policy) = match error {
            Error::NotFound(_) => (CODE_NOT_FOUND, 0, String::new()),
            Error::BadRequest(_) => (CODE_BAD_REQUEST, 0, String::new()),
            Error::Application(_) => (CODE_APPLICATION, 0, String::new()),
            Error::Unauthorized(_) => (CODE_UNAUTHORIZED, 0, String::new()),
            Error::Forbidden(_) => (CODE_FORBIDDEN, 0, String::new()),
            Error::RateLimited {
                policy,
                retry_after_secs,
            } => (CODE_RATE_LIMITED, *retry_after_secs, policy.clone()),
            e if e.is_retryable() => (CODE_TRANSIENT, 0, String::new()),
            _ => (CODE_SYSTEM, 0, String::new()),
        };
        Self {
            code,
            message: error.to_string(),
            retry_after_secs,
            policy,
        }
    }
}

impl From<WireError> for Error {
    fn from(wire: WireError) -> Self {
        match wire.code {
            CODE_TRANSIENT => Error::Transient(wire.message),
            CODE_APPLICATION => Error::Application(wire.message),
            CODE_NOT_FOUND => Error::NotFound(wire.message),
            CODE_BAD_REQUEST => Error::BadRequest(wire.message),
            CODE_UNAUTHORIZED => Error::Unauthorized(wire.message),
            CODE_FORBIDDEN => Error::Forbidden(wire.message),
            CODE_RATE_LIMITED => Error::RateLimited {
                policy: wire.policy,
                retry_after_secs: wire.retry_after_secs,
            },
            _ => Error::Internal(wire.message),
        }
    }
}

/// Response to an invocation: a body or a typed error
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvocationResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub body: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub error: Option<WireError>,
}

impl InvocationResponse {
    /// Wrap a handler result
    pub fn from_result(result: Result<Vec<u8>>) -> Self {
        match result {
            Ok(body) => Self { body, error: None },
            Err(e) => Self {
                body: Vec::new(),
                error: Some(WireError::from(&e)),
            },
        }
    }

    /// Unwrap into a handler result
    pub fn into_result(self) -> Result<Vec<u8>> {
        match self.error {
            Some(wire) => Err(Error::from(wire)),
            None => Ok(self.body),
        }
    }
}

/// Server-side entry point a transport delivers decoded requests into
pub type InvocationHandler =
    Arc<dyn Fn(InvocationRequest) -> BoxFuture<'static, InvocationResponse> + Send + Sync>;

/// Delivery of an envelope to a remote silo
#[async_trait::async_trait]
pub trait SiloTransport: Send + Sync + 'static {
    /// Send `request` to the silo at `endpoint` and await its response
    async fn invoke(&self, endpoint: &str, request: InvocationRequest)
        -> Result<InvocationResponse>;
}

/// Shared in-process wiring for single-process clusters and tests
#[derive(Default)]
pub struct InProcessNetwork {
    handlers: DashMap<String, InvocationHandler>,
}

impl InProcessNetwork {
    /// Create an empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a silo's dispatcher under its endpoint
    pub fn register(&self, endpoint: String, handler: InvocationHandler) {
        self.handlers.insert(endpoint, handler);
    }

    /// Detach a silo; subsequent deliveries fail transient, like a crash
    pub fn deregister(&self, endpoint: &str) {
        self.handlers.remove(endpoint);
    }
}

/// Transport over an [`InProcessNetwork`]
#[derive(Clone)]
pub struct InProcessTransport {
    network: Arc<InProcessNetwork>,
}

impl InProcessTransport {
    /// Bind a transport to the shared network
    pub fn new(network: Arc<InProcessNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait::async_trait]
impl SiloTransport for InProcessTransport {
    async fn invoke(
        &self,
        endpoint: &str,
        request: InvocationRequest,
    ) -> Result<InvocationResponse> {
        let handler = self
            .network
            .handlers
            .get(endpoint)
            .map(|h| h.value().clone())
            .ok_or_else(|| Error::transient(format!("silo {endpoint} unavailable")))?;
        Ok(handler(request).await)
    }
}

/// TCP transport with length-prefixed prost frames
pub struct TcpTransport;

impl TcpTransport {
    /// Create the transport
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl SiloTransport for TcpTransport {
    async fn invoke(
        &self,
        endpoint: &str,
        request: InvocationRequest,
    ) -> Result<InvocationResponse> {
        let deadline = Duration::from_millis(request.deadline_ms.max(1));
        let result = tokio::time::timeout(deadline, async {
            let mut stream = TcpStream::connect(endpoint)
                .await
                .map_err(|e| Error::transient(format!("connect {endpoint}: {e}")))?;
            write_frame(&mut stream, &request.encode_to_vec()).await?;
            let bytes = read_frame(&mut stream).await?;
            InvocationResponse::decode(bytes.as_slice()).map_err(Error::from)
        })
        .await;
        match result {
            Ok(response) => response,
            Err(_) => Err(Error::DeadlineExceeded(deadline)),
        }
    }
}

/// Accept loop for the silo's external listener
pub async fn serve(listener: TcpListener, handler: InvocationHandler, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        debug!(peer = %peer, "silo connection accepted");
        let handler = handler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, handler, cancel).await {
                debug!(peer = %peer, error = %e, "silo connection closed");
            }
        });
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: InvocationHandler,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => frame?,
        };
        let request = InvocationRequest::decode(bytes.as_slice())?;
        let response = handler(request).await;
        write_frame(&mut stream, &response.encode_to_vec()).await?;
    }
}

async fn write_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::Internal("frame exceeds u32 length".into()))?;
    if len > MAX_FRAME_BYTES {
        return Err(Error::Internal(format!("frame of {len} bytes exceeds limit")));
    }
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Decode(format!("frame of {len} bytes exceeds limit")));
    }
    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips_through_the_wire() {
        let cases = vec![
            GrainIdentity::guid("character", Uuid::new_v4()),
            GrainIdentity::text("rate-limit-config", "default"),
            GrainIdentity::compound("inventory", Uuid::new_v4(), "season-7"),
        ];
        for identity in cases {
            let wire = WireIdentity::from(&identity);
            let back = GrainIdentity::try_from(&wire).unwrap();
            assert_eq!(back, identity);
        }
    }

    #[test]
    fn errors_keep_their_kind_across_the_wire() {
        let cases = vec![
            Error::transient("host unavailable"),
            Error::Application("cannot trade SSF character".into()),
            Error::NotFound("item".into()),
            Error::Unauthorized("ticket expired".into()),
            Error::RateLimited {
                policy: "Auth".into(),
                retry_after_secs: 120,
            },
            Error::Internal("schema mismatch".into()),
        ];
        for error in cases {
            let kind = error.kind();
            let round_tripped = Error::from(WireError::from(&error));
            assert_eq!(round_tripped.kind(), kind, "{error}");
        }
    }

    #[test]
    fn txn_scope_survives_unpack() {
        let identity = GrainIdentity::guid("inventory", Uuid::new_v4());
        let mut call = GrainCall::new("reserve", vec![1, 2, 3]);
        let txid = Uuid::new_v4();
        call.txn = Some(TxnContext {
            txid,
            read_ts: 42_000_000,
        });

        let request = InvocationRequest::new(&identity, &call, 5_000, "req-1".into());
        let (target, unpacked) = request.unpack().unwrap();
        assert_eq!(target, identity);
        assert_eq!(unpacked.method, "reserve");
        assert_eq!(unpacked.txn.unwrap().txid, txid);
    }

    #[tokio::test]
    async fn in_process_network_simulates_silo_loss() {
        let network = InProcessNetwork::new();
        let handler: InvocationHandler = Arc::new(|_req| {
            Box::pin(async { InvocationResponse::from_result(Ok(vec![7])) })
        });
        network.register("a:1".to_string(), handler);
        let transport = InProcessTransport::new(network.clone());

        let identity = GrainIdentity::guid("counter", Uuid::new_v4());
        let call = GrainCall::new("incr", Vec::new());
        let request = InvocationRequest::new(&identity, &call, 1_000, "req".into());

        let ok = transport.invoke("a:1", request.clone()).await.unwrap();
        assert_eq!(ok.into_result().unwrap(), vec![7]);

        network.deregister("a:1");
        let err = transport.invoke("a:1", request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
