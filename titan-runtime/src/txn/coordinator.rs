//! Transaction coordinator grain
//!
//! One coordinator activation exists per transaction, keyed by the txid
//! guid. It enrolls participants by forwarding the designated steps with
//! the transaction scope attached, drives prepare with a timeout, writes
//! its durable commit record (the commit point), and then delivers
//! commits. On reactivation it replays deliveries for transactions whose
//! commit record is present; everything else reads as aborted.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::codec;
use crate::config::TransactionConfig;
use crate::error::{Error, Result};
use crate::identity::{GrainIdentity, GrainKey};
use crate::runtime::grain::{Grain, GrainCall, GrainContext, PersistentState, TxnContext};
use crate::runtime::transport::WireIdentity;
use crate::txn::{
    outcome, TxnAck, TxnDecision, TxnPrepare, TxnRunRequest, TxnStatusResponse, METHOD_ABORT,
    METHOD_COMMIT, METHOD_PREPARE, METHOD_STATUS,
};

/// Well-known type name of the coordinator grain
pub const TXN_COORDINATOR_GRAIN: &str = "txn-coordinator";

/// Retry timer armed when commit deliveries are incomplete
const REDELIVER_TIMER: &str = "redeliver-commits";
const REDELIVER_AFTER: Duration = Duration::from_secs(5);

/// Durable coordinator record; its presence with a committing/committed
/// phase is the transaction's commit point
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CoordinatorLog {
    /// 0 = no record, 1 = committing, 2 = completed
    #[prost(uint32, tag = "1")]
    pub phase: u32,
    #[prost(message, repeated, tag = "2")]
    pub participants: Vec<WireIdentity>,
    #[prost(uint64, tag = "3")]
    pub read_ts: u64,
    #[prost(uint64, tag = "4")]
    pub commit_ts: u64,
}

const PHASE_NONE: u32 = 0;
const PHASE_COMMITTING: u32 = 1;
const PHASE_COMPLETED: u32 = 2;

/// Two-phase-commit coordinator for one transaction
pub struct TransactionCoordinatorGrain {
    config: TransactionConfig,
    log: Option<PersistentState<CoordinatorLog>>,
}

impl TransactionCoordinatorGrain {
    /// Create a coordinator with the silo's transaction tuning
    pub fn new(config: TransactionConfig) -> Self {
        Self { config, log: None }
    }

    fn txid(ctx: &GrainContext) -> Result<Uuid> {
        match &ctx.identity().key {
            GrainKey::Guid(id) => Ok(*id),
            other => Err(Error::Internal(format!(
                "coordinator keyed by non-guid key {other}"
            ))),
        }
    }

    fn log_mut(&mut self) -> &mut PersistentState<CoordinatorLog> {
        self.log.as_mut().expect("coordinator log loaded on activation")
    }

    fn log_ref(&self) -> &PersistentState<CoordinatorLog> {
        self.log.as_ref().expect("coordinator log loaded on activation")
    }

    async fn run(&mut self, ctx: &mut GrainContext, call: &GrainCall) -> Result<Vec<u8>> {
        let request: TxnRunRequest = call.request()?;
        let txid = Self::txid(ctx)?;

        // A re-delivered run for a decided transaction only finishes
        // deliveries; an aborted attempt may run again (the common case is
        // the caller's transparent retry after a transient abort)
        if matches!(
            self.log_ref().get().phase,
            PHASE_COMMITTING | PHASE_COMPLETED
        ) {
            self.replay_commits(ctx).await?;
            return Ok(codec::encode(&TxnAck {}));
        }

        if request.steps.is_empty() {
            return Err(Error::BadRequest("transaction with no steps".into()));
        }

        let read_ts = now_micros();
        let scope = TxnContext { txid, read_ts };

        let mut participants: Vec<GrainIdentity> = Vec::new();
        for step in &request.steps {
            let target = step
                .target
                .as_ref()
                .ok_or_else(|| Error::BadRequest("transaction step without target".into()))?;
            let identity = GrainIdentity::try_from(target)?;

            let mut enroll = GrainCall::new(step.method.clone(), step.body.clone());
            enroll.txn = Some(scope);
            if !participants.contains(&identity) {
                participants.push(identity.clone());
            }

            if let Err(e) = ctx.runtime().invoke(&identity, enroll).await {
                tracing::warn!(txid = %txid, grain = %identity, error = %e,
                    "transaction step failed, aborting");
                self.abort_participants(ctx, txid, &participants).await;
                return Err(e);
            }
        }

        // Phase 1: prepare everyone, bounded by the prepare timeout
        let prepare_deadline = Duration::from_secs(self.config.prepare_timeout_secs);
        for identity in &participants {
            let prepare = GrainCall::typed(
                METHOD_PREPARE,
                &TxnPrepare {
                    txid: txid.to_string(),
                },
            );
            let vote = tokio::time::timeout(
                prepare_deadline,
                ctx.runtime().invoke(identity, prepare),
            )
            .await;
            let failed = match vote {
                Ok(Ok(_)) => None,
                Ok(Err(e)) => Some(e),
                Err(_) => Some(Error::DeadlineExceeded(prepare_deadline)),
            };
            if let Some(e) = failed {
                tracing::warn!(txid = %txid, grain = %identity, error = %e,
                    "prepare failed, aborting");
                self.abort_participants(ctx, txid, &participants).await;
                return Err(e);
            }
        }

        // Commit point: the durable record decides the outcome
        let commit_ts = now_micros();
        {
            let entry = self.log_mut();
            entry.get_mut().phase = PHASE_COMMITTING;
            entry.get_mut().participants =
                participants.iter().map(WireIdentity::from).collect();
            entry.get_mut().read_ts = read_ts;
            entry.get_mut().commit_ts = commit_ts;
        }
        self.log_mut().save(ctx).await?;
        tracing::debug!(txid = %txid, participants = participants.len(), "commit record written");

        self.replay_commits(ctx).await?;
        Ok(codec::encode(&TxnAck {}))
    }

    /// Deliver commits to every participant; partial delivery keeps the
    /// committing phase and arms a retry timer.
    async fn replay_commits(&mut self, ctx: &mut GrainContext) -> Result<()> {
        let record = self.log_ref().get().clone();
        if record.phase != PHASE_COMMITTING {
            return Ok(());
        }
        let txid = Self::txid(ctx)?;
        let commit_deadline = Duration::from_secs(self.config.commit_timeout_secs);

        let mut all_delivered = true;
        for wire in &record.participants {
            let identity = GrainIdentity::try_from(wire)?;
            let commit = GrainCall::typed(
                METHOD_COMMIT,
                &TxnDecision {
                    txid: txid.to_string(),
                    commit_ts: record.commit_ts,
                },
            );
            let delivered =
                tokio::time::timeout(commit_deadline, ctx.runtime().invoke(&identity, commit))
                    .await;
            match delivered {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    tracing::warn!(txid = %txid, grain = %identity, error = %e,
                        "commit delivery failed, will redeliver");
                    all_delivered = false;
                }
                Err(_) => {
                    tracing::warn!(txid = %txid, grain = %identity,
                        "commit delivery timed out, will redeliver");
                    all_delivered = false;
                }
            }
        }

        if all_delivered {
            self.log_mut().get_mut().phase = PHASE_COMPLETED;
            self.log_mut().save(ctx).await?;
            ctx.cancel_timer(REDELIVER_TIMER);
        } else {
            ctx.register_timer(REDELIVER_TIMER, REDELIVER_AFTER, None);
        }
        Ok(())
    }

    /// Best-effort aborts; a participant that misses one resolves through
    /// the status query when it next loads its pending log
    async fn abort_participants(
        &self,
        ctx: &GrainContext,
        txid: Uuid,
        participants: &[GrainIdentity],
    ) {
        for identity in participants {
            let abort = GrainCall::typed(
                METHOD_ABORT,
                &TxnDecision {
                    txid: txid.to_string(),
                    commit_ts: 0,
                },
            );
            if let Err(e) = ctx.runtime().invoke(identity, abort).await {
                tracing::warn!(txid = %txid, grain = %identity, error = %e,
                    "abort delivery failed");
            }
        }
    }

    fn status(&self) -> TxnStatusResponse {
        let record = self.log_ref().get();
        match record.phase {
            PHASE_COMMITTING => TxnStatusResponse {
                outcome: outcome::COMMITTED,
                commit_ts: record.commit_ts,
            },
            PHASE_COMPLETED => TxnStatusResponse {
                outcome: outcome::COMPLETED,
                commit_ts: record.commit_ts,
            },
            _ => TxnStatusResponse {
                outcome: outcome::ABORTED,
                commit_ts: 0,
            },
        }
    }
}

#[async_trait]
impl Grain for TransactionCoordinatorGrain {
    async fn on_activate(&mut self, ctx: &mut GrainContext) -> Result<()> {
        self.log = Some(PersistentState::load(ctx).await?);
        // Crash recovery: finish deliveries for a recorded commit
        if self.log_ref().get().phase == PHASE_COMMITTING {
            let txid = Self::txid(ctx)?;
            tracing::info!(txid = %txid, "recovering transaction with durable commit record");
            self.replay_commits(ctx).await?;
        }
        Ok(())
    }

    async fn handle(&mut self, ctx: &mut GrainContext, call: GrainCall) -> Result<Vec<u8>> {
        match call.method.as_str() {
            "run" => self.run(ctx, &call).await,
            METHOD_STATUS => Ok(codec::encode(&self.status())),
            other => Err(Error::BadRequest(format!(
                "unknown coordinator method {other:?}"
            ))),
        }
    }

    async fn on_timer(&mut self, ctx: &mut GrainContext, timer: &str) -> Result<()> {
        if timer == REDELIVER_TIMER {
            self.replay_commits(ctx).await?;
        }
        Ok(())
    }
}

fn now_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}
