//! Cross-grain ACID transactions
//!
//! A minimal two-phase-commit implementation: a coordinator grain keyed
//! by transaction id drives enrollment, prepare, and commit/abort over a
//! set of participant grains. Participants buffer writes against a
//! snapshot taken at the transaction's read timestamp and persist a
//! pending log at prepare; the coordinator's durable commit record is the
//! commit point. Recovery replays commits for transactions with a record
//! and aborts the rest.

pub mod coordinator;
pub mod state;

use prost::Message;
use uuid::Uuid;

use crate::error::Result;
use crate::identity::GrainIdentity;
use crate::runtime::transport::WireIdentity;
use crate::runtime::RuntimeHandle;

pub use coordinator::{TransactionCoordinatorGrain, TXN_COORDINATOR_GRAIN};
pub use state::TransactionalState;

/// Reserved method: persist pending writes and vote
pub const METHOD_PREPARE: &str = "txn/prepare";
/// Reserved method: apply pending writes durably
pub const METHOD_COMMIT: &str = "txn/commit";
/// Reserved method: discard pending writes
pub const METHOD_ABORT: &str = "txn/abort";
/// Reserved method: query a coordinator's outcome
pub const METHOD_STATUS: &str = "txn/status";

/// Empty acknowledgement for protocol calls
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnAck {}

/// Prepare request sent to each participant
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnPrepare {
    #[prost(string, tag = "1")]
    pub txid: String,
}

/// Commit or abort decision sent to each participant
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnDecision {
    #[prost(string, tag = "1")]
    pub txid: String,
    /// Commit timestamp in microseconds; zero for aborts
    #[prost(uint64, tag = "2")]
    pub commit_ts: u64,
}

/// Status query against a coordinator
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnStatusRequest {}

/// Transaction outcomes a coordinator reports
pub mod outcome {
    /// No record: the transaction never reached its commit point
    pub const ABORTED: u32 = 0;
    /// Commit record durable, deliveries may still be in flight
    pub const COMMITTED: u32 = 1;
    /// All participants acknowledged the commit
    pub const COMPLETED: u32 = 2;
}

/// Status response from a coordinator
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnStatusResponse {
    #[prost(uint32, tag = "1")]
    pub outcome: u32,
    /// Commit timestamp when committed, zero otherwise
    #[prost(uint64, tag = "2")]
    pub commit_ts: u64,
}

/// One operation inside a transaction
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnStep {
    #[prost(message, optional, tag = "1")]
    pub target: Option<WireIdentity>,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(bytes = "vec", tag = "3")]
    pub body: Vec<u8>,
}

impl TxnStep {
    /// Build a step with a typed request body
    pub fn typed<M: Message>(target: &GrainIdentity, method: impl Into<String>, request: &M) -> Self {
        Self {
            target: Some(WireIdentity::from(target)),
            method: method.into(),
            body: crate::codec::encode(request),
        }
    }
}

/// The designation a caller hands to a coordinator
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxnRunRequest {
    #[prost(message, repeated, tag = "1")]
    pub steps: Vec<TxnStep>,
}

/// Run `steps` as one atomic transaction: either every step's writes land
/// or none do. Errors from a participant's business logic surface
/// verbatim after the abort.
pub async fn run_transaction(runtime: &RuntimeHandle, steps: Vec<TxnStep>) -> Result<Uuid> {
    let txid = Uuid::new_v4();
    let coordinator = GrainIdentity::guid(TXN_COORDINATOR_GRAIN, txid);
    runtime
        .invoke_typed::<_, TxnAck>(&coordinator, "run", &TxnRunRequest { steps })
        .await?;
    Ok(txid)
}
