//! Transactional participant state
//!
//! [`TransactionalState`] wraps a grain's persistent state with a
//! read-committed snapshot plus a pending-writes log per enrolled
//! transaction. The grain routes the reserved `txn/*` protocol methods
//! into [`TransactionalState::handle_protocol`] and enrolls its own
//! business mutations through [`TransactionalState::enlist`].

use uuid::Uuid;

use crate::codec::{self, GrainState};
use crate::error::{Error, Result};
use crate::runtime::grain::{GrainCall, GrainContext, PersistentState, TxnContext};
use crate::txn::{
    outcome, TxnAck, TxnDecision, TxnPrepare, TxnStatusRequest, TxnStatusResponse,
    METHOD_ABORT, METHOD_COMMIT, METHOD_PREPARE, METHOD_STATUS, TXN_COORDINATOR_GRAIN,
};

/// Durable participant log: the committed payload plus at most one
/// pending record. Field tags are a storage format.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParticipantLog {
    #[prost(bytes = "vec", tag = "1")]
    pub committed_payload: Vec<u8>,
    /// Commit timestamp of the committed payload, microseconds
    #[prost(uint64, tag = "2")]
    pub commit_ts: u64,
    /// Idempotence guard for re-delivered commits
    #[prost(string, tag = "3")]
    pub last_committed_txid: String,
    #[prost(message, optional, tag = "4")]
    pub pending: Option<PendingRecord>,
}

/// A prepared transaction's buffered payload
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PendingRecord {
    #[prost(string, tag = "1")]
    pub txid: String,
    #[prost(uint64, tag = "2")]
    pub read_ts: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
}

struct PendingTxn<S> {
    txid: Uuid,
    read_ts: u64,
    staged: S,
}

/// Versioned snapshot state with transactional enrollment
pub struct TransactionalState<S: GrainState> {
    log: PersistentState<ParticipantLog>,
    committed: S,
    pending: Option<PendingTxn<S>>,
}

impl<S: GrainState> TransactionalState<S> {
    /// Load the participant log and resolve any pending record left by a
    /// crash: the coordinator's durable outcome decides commit or abort.
    pub async fn load(ctx: &GrainContext) -> Result<Self> {
        let mut log = PersistentState::<ParticipantLog>::load(ctx).await?;

        if let Some(pending) = log.get().pending.clone() {
            let txid = pending
                .txid
                .parse::<Uuid>()
                .map_err(|e| Error::Decode(format!("bad pending txid: {e}")))?;
            let coordinator =
                crate::identity::GrainIdentity::guid(TXN_COORDINATOR_GRAIN, txid);
            let status: TxnStatusResponse = ctx
                .runtime()
                .invoke_typed(&coordinator, METHOD_STATUS, &TxnStatusRequest {})
                .await?;

            let entry = log.get_mut();
            if status.outcome == outcome::ABORTED {
                tracing::warn!(txid = %txid, "dropping pending writes of aborted transaction");
                entry.pending = None;
            } else {
                tracing::info!(txid = %txid, "replaying committed pending writes after restart");
                entry.committed_payload = pending.payload;
                entry.commit_ts = status
                    .commit_ts
                    .max(entry.commit_ts)
                    .max(pending.read_ts + 1);
                entry.last_committed_txid = pending.txid;
                entry.pending = None;
            }
            log.save(ctx).await?;
        }

        let committed = codec::decode(&log.get().committed_payload)?;
        Ok(Self {
            log,
            committed,
            pending: None,
        })
    }

    /// Snapshot read at the transaction's read timestamp.
    ///
    /// Rejects enrollment when an already-committed version is newer than
    /// the snapshot; the coordinator aborts and the caller may retry.
    pub fn read(&self, txn: TxnContext) -> Result<&S> {
        if self.log.get().commit_ts > txn.read_ts {
            return Err(Error::transient(format!(
                "snapshot at {} invalidated by commit at {}",
                txn.read_ts,
                self.log.get().commit_ts
            )));
        }
        Ok(&self.committed)
    }

    /// The committed state, outside any transaction
    pub fn committed(&self) -> &S {
        &self.committed
    }

    /// Buffer a mutation against the transaction's snapshot.
    ///
    /// One transaction at a time: a second concurrent enrollment is
    /// rejected transient so its coordinator aborts cleanly.
    pub fn enlist<F>(&mut self, txn: TxnContext, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut S) -> Result<()>,
    {
        if let Some(pending) = &self.pending {
            if pending.txid != txn.txid {
                return Err(Error::transient(format!(
                    "participant busy with transaction {}",
                    pending.txid
                )));
            }
        }
        if self.log.get().commit_ts > txn.read_ts {
            return Err(Error::transient(format!(
                "snapshot at {} invalidated by commit at {}",
                txn.read_ts,
                self.log.get().commit_ts
            )));
        }

        let mut staged = match &self.pending {
            Some(pending) => pending.staged.clone(),
            None => self.committed.clone(),
        };
        mutate(&mut staged)?;
        self.pending = Some(PendingTxn {
            txid: txn.txid,
            read_ts: txn.read_ts,
            staged,
        });
        Ok(())
    }

    async fn prepare(&mut self, ctx: &GrainContext, txid: Uuid) -> Result<()> {
        let Some(pending) = &self.pending else {
            return Err(Error::Application(format!(
                "nothing enrolled for transaction {txid}"
            )));
        };
        if pending.txid != txid {
            return Err(Error::Application(format!(
                "prepare for unknown transaction {txid}"
            )));
        }

        self.log.get_mut().pending = Some(PendingRecord {
            txid: txid.to_string(),
            read_ts: pending.read_ts,
            payload: codec::encode(&pending.staged),
        });
        self.log.save(ctx).await
    }

    async fn commit(&mut self, ctx: &GrainContext, txid: Uuid, commit_ts: u64) -> Result<()> {
        if self.log.get().last_committed_txid == txid.to_string() {
            // Re-delivered commit
            return Ok(());
        }

        let staged = match self.pending.take() {
            Some(pending) if pending.txid == txid => pending.staged,
            _ => match &self.log.get().pending {
                // Recovery path: apply the durable pending payload
                Some(record) if record.txid == txid.to_string() => {
                    codec::decode(&record.payload)?
                }
                _ => {
                    return Err(Error::Application(format!(
                        "commit for unprepared transaction {txid}"
                    )))
                }
            },
        };

        let entry = self.log.get_mut();
        entry.committed_payload = codec::encode(&staged);
        entry.commit_ts = commit_ts;
        entry.last_committed_txid = txid.to_string();
        entry.pending = None;
        self.log.save(ctx).await?;
        self.committed = staged;
        Ok(())
    }

    async fn abort(&mut self, ctx: &GrainContext, txid: Uuid) -> Result<()> {
        if let Some(pending) = &self.pending {
            if pending.txid == txid {
                self.pending = None;
            }
        }
        let durable = self
            .log
            .get()
            .pending
            .as_ref()
            .is_some_and(|p| p.txid == txid.to_string());
        if durable {
            self.log.get_mut().pending = None;
            self.log.save(ctx).await?;
        }
        Ok(())
    }

    /// Route the reserved `txn/*` protocol methods. Returns `None` for
    /// every other method so the grain handles it as a business call.
    pub async fn handle_protocol(
        &mut self,
        ctx: &GrainContext,
        call: &GrainCall,
    ) -> Option<Result<Vec<u8>>> {
        match call.method.as_str() {
            METHOD_PREPARE => Some(self.protocol_prepare(ctx, call).await),
            METHOD_COMMIT => Some(self.protocol_commit(ctx, call).await),
            METHOD_ABORT => Some(self.protocol_abort(ctx, call).await),
            _ => None,
        }
    }

    async fn protocol_prepare(&mut self, ctx: &GrainContext, call: &GrainCall) -> Result<Vec<u8>> {
        let request: TxnPrepare = call.request()?;
        let txid = parse_txid(&request.txid)?;
        self.prepare(ctx, txid).await?;
        Ok(codec::encode(&TxnAck {}))
    }

    async fn protocol_commit(&mut self, ctx: &GrainContext, call: &GrainCall) -> Result<Vec<u8>> {
        let request: TxnDecision = call.request()?;
        let txid = parse_txid(&request.txid)?;
        self.commit(ctx, txid, request.commit_ts).await?;
        Ok(codec::encode(&TxnAck {}))
    }

    async fn protocol_abort(&mut self, ctx: &GrainContext, call: &GrainCall) -> Result<Vec<u8>> {
        let request: TxnDecision = call.request()?;
        let txid = parse_txid(&request.txid)?;
        self.abort(ctx, txid).await?;
        Ok(codec::encode(&TxnAck {}))
    }
}

fn parse_txid(raw: &str) -> Result<Uuid> {
    raw.parse::<Uuid>()
        .map_err(|e| Error::Decode(format!("bad txid {raw:?}: {e}")))
}
