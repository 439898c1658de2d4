//! Session tickets
//!
//! [`store`] is the Redis-backed ticket store shared by every gateway
//! instance, [`ticket`] generates the high-entropy ids, and
//! [`connection`] holds the one-shot WebSocket handoff grain.

pub mod connection;
pub mod store;
pub mod ticket;

pub use connection::{
    ConnectionTicket, ConnectionTicketGrain, CreateTicketRequest, CONNECTION_TICKET_GRAIN,
};
pub use store::{SessionRecord, SessionStore};
pub use ticket::generate_ticket;
