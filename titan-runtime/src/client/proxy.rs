//! Typed grain proxies for gateway code
//!
//! A [`GrainClient`] wraps a runtime handle with the typed call surface
//! gateways use. Every call gets a fresh request fingerprint, the
//! configured deadline, and transparent bounded retries on transient
//! failures; the proxy is safe for concurrent use and cheap to clone.

use prost::Message;
use uuid::Uuid;

use crate::error::Result;
use crate::identity::GrainIdentity;
use crate::runtime::grain::GrainCall;
use crate::runtime::RuntimeHandle;
use crate::session::connection::{
    ConnectionTicket, CreateTicketRequest, TicketAck, CONNECTION_TICKET_GRAIN,
};
use crate::session::ticket::generate_ticket;

/// Typed, concurrency-safe entry point into the grain cluster
#[derive(Clone)]
pub struct GrainClient {
    runtime: RuntimeHandle,
}

impl GrainClient {
    /// Wrap a runtime handle
    pub fn new(runtime: RuntimeHandle) -> Self {
        Self { runtime }
    }

    /// The underlying runtime handle
    pub fn runtime(&self) -> &RuntimeHandle {
        &self.runtime
    }

    /// Invoke a grain with typed request and response
    pub async fn call<Req, Resp>(
        &self,
        identity: &GrainIdentity,
        method: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Message,
        Resp: Message + Default,
    {
        self.runtime.invoke_typed(identity, method, request).await
    }

    /// Invoke a grain with raw bytes
    pub async fn call_raw(
        &self,
        identity: &GrainIdentity,
        method: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>> {
        self.runtime
            .invoke(identity, GrainCall::new(method, body))
            .await
    }

    /// Mint a one-shot connection ticket for a WebSocket handoff and
    /// return its id
    pub async fn create_connection_ticket(
        &self,
        user_id: Uuid,
        roles: Vec<String>,
    ) -> Result<String> {
        let ticket_id = generate_ticket();
        let identity = GrainIdentity::text(CONNECTION_TICKET_GRAIN, ticket_id.clone());
        let _: TicketAck = self
            .call(
                &identity,
                "create",
                &CreateTicketRequest {
                    user_id: user_id.as_bytes().to_vec(),
                    roles,
                },
            )
            .await?;
        Ok(ticket_id)
    }

    /// Validate and consume a connection ticket during a handshake
    pub async fn consume_connection_ticket(&self, ticket_id: &str) -> Result<ConnectionTicket> {
        let identity = GrainIdentity::text(CONNECTION_TICKET_GRAIN, ticket_id);
        self.call(&identity, "consume", &TicketAck {}).await
    }
}
