//! One-shot connection tickets for WebSocket handoff
//!
//! The gateway creates a short-lived ticket grain when a client asks to
//! open a real-time channel. The first validation consumes the ticket
//! and opens a handshake window during which retries from the same
//! upgrade succeed; when the window closes the activation deactivates and
//! the ticket is gone. Nothing is persisted.

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Duration;

use crate::codec;
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::runtime::grain::{Grain, GrainCall, GrainContext};

/// Well-known type name of the connection ticket grain; keys are the
/// ticket ids themselves
pub const CONNECTION_TICKET_GRAIN: &str = "connection-ticket";

const EXPIRE_TIMER: &str = "expire";
const HANDSHAKE_TIMER: &str = "handshake-window";

/// Payload handed back to the gateway on validation
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectionTicket {
    #[prost(bytes = "vec", tag = "1")]
    pub user_id: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub roles: Vec<String>,
    /// Unix milliseconds after which the unconsumed ticket is dead
    #[prost(uint64, tag = "3")]
    pub expires_at_ms: u64,
}

/// Request to mint a ticket into this grain
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateTicketRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub user_id: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub roles: Vec<String>,
}

/// Empty acknowledgement
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TicketAck {}

/// In-memory one-shot ticket holder
pub struct ConnectionTicketGrain {
    config: SessionConfig,
    ticket: Option<ConnectionTicket>,
    consumed: bool,
}

impl ConnectionTicketGrain {
    /// Create the grain with the deployment's session tuning
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            ticket: None,
            consumed: false,
        }
    }
}

#[async_trait]
impl Grain for ConnectionTicketGrain {
    async fn handle(&mut self, ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
        match call.method.as_str() {
            "create" => {
                if self.ticket.is_some() {
                    return Err(Error::Application("connection ticket already exists".into()));
                }
                let request: CreateTicketRequest = call.request()?;
                let ttl = self.config.connection_ticket_ttl_secs;
                self.ticket = Some(ConnectionTicket {
                    user_id: request.user_id,
                    roles: request.roles,
                    expires_at_ms: (Utc::now().timestamp_millis() as u64)
                        + ttl * 1000,
                });
                // Unconsumed tickets evaporate with the activation
                ctx.register_timer(EXPIRE_TIMER, Duration::from_secs(ttl), None);
                Ok(codec::encode(&TicketAck {}))
            }
            "consume" => {
                let Some(ticket) = self.ticket.clone() else {
                    return Err(Error::Unauthorized("unknown connection ticket".into()));
                };
                if ticket.expires_at_ms < Utc::now().timestamp_millis() as u64 {
                    ctx.deactivate();
                    return Err(Error::Unauthorized("connection ticket expired".into()));
                }
                if !self.consumed {
                    // First consumption opens the handshake window
                    self.consumed = true;
                    ctx.cancel_timer(EXPIRE_TIMER);
                    ctx.register_timer(
                        HANDSHAKE_TIMER,
                        Duration::from_secs(self.config.handshake_window_secs),
                        None,
                    );
                }
                Ok(codec::encode(&ticket))
            }
            other => Err(Error::BadRequest(format!(
                "unknown connection-ticket method {other:?}"
            ))),
        }
    }

    async fn on_timer(&mut self, ctx: &mut GrainContext, timer: &str) -> Result<()> {
        match timer {
            EXPIRE_TIMER | HANDSHAKE_TIMER => ctx.deactivate(),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::GrainClient;
    use crate::error::ErrorKind;
    use crate::testkit::TestCluster;
    use std::time::Duration as StdDuration;
    use uuid::Uuid;

    async fn ticket_cluster(handshake_secs: u64, ttl_secs: u64) -> TestCluster {
        TestCluster::start(
            1,
            move |config| {
                config.session.handshake_window_secs = handshake_secs;
                config.session.connection_ticket_ttl_secs = ttl_secs;
            },
            Vec::new,
        )
        .await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn consume_succeeds_within_the_handshake_window_then_dies() {
        let cluster = ticket_cluster(2, 30).await;
        let client = GrainClient::new(cluster.runtime(0));
        let user = Uuid::new_v4();

        let ticket_id = client
            .create_connection_ticket(user, vec!["player".into()])
            .await
            .unwrap();

        // First validation consumes the ticket
        let ticket = client.consume_connection_ticket(&ticket_id).await.unwrap();
        assert_eq!(ticket.user_id, user.as_bytes().to_vec());
        assert_eq!(ticket.roles, vec!["player".to_string()]);

        // Retries from the same handshake succeed inside the window
        tokio::time::sleep(StdDuration::from_millis(500)).await;
        client.consume_connection_ticket(&ticket_id).await.unwrap();

        // After the window closes the activation is gone and with it the ticket
        tokio::time::sleep(StdDuration::from_millis(2500)).await;
        let err = client
            .consume_connection_ticket(&ticket_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unconsumed_tickets_expire() {
        let cluster = ticket_cluster(10, 1).await;
        let client = GrainClient::new(cluster.runtime(0));

        let ticket_id = client
            .create_connection_ticket(Uuid::new_v4(), vec![])
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(2200)).await;
        let err = client
            .consume_connection_ticket(&ticket_id)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        cluster.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_ticket_is_rejected() {
        let cluster = ticket_cluster(10, 30).await;
        let client = GrainClient::new(cluster.runtime(0));

        let err = client
            .consume_connection_ticket("never-created")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);

        cluster.stop().await;
    }
}
