//! Activation turn loop
//!
//! Each activation is one tokio task draining a bounded mailbox. Exactly
//! one message is processed at a time, in arrival order; timers fire on
//! the same loop, so a grain never observes concurrency with itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::identity::GrainIdentity;
use crate::runtime::grain::{ActivationCommand, Grain, GrainCall, GrainContext};
use crate::runtime::RuntimeHandle;

static NEXT_ACTIVATION_ID: AtomicU64 = AtomicU64::new(1);

/// Messages deliverable to an activation mailbox
pub(crate) enum ActivationMessage {
    /// A grain call awaiting a response
    Invoke {
        call: GrainCall,
        /// Absolute point after which the caller has given up; expired
        /// entries are dropped instead of burning a turn
        deadline: Instant,
        reply: oneshot::Sender<Result<Vec<u8>>>,
    },
    /// A persistent reminder came due
    Reminder { name: String },
    /// Drain and destroy the activation
    Stop,
}

/// Sending half of an activation, stored in the catalog
#[derive(Clone)]
pub(crate) struct ActivationHandle {
    pub identity: GrainIdentity,
    pub activation_id: u64,
    tx: mpsc::Sender<ActivationMessage>,
}

impl ActivationHandle {
    /// Deliver a message, waiting for mailbox capacity.
    ///
    /// Fails transient when the activation has already shut down; the
    /// catalog recreates and retries once.
    pub async fn send(&self, message: ActivationMessage) -> Result<()> {
        self.tx
            .send(message)
            .await
            .map_err(|_| Error::transient(format!("activation {} mailbox closed", self.identity)))
    }

    /// Best-effort delivery without waiting, used during shutdown
    pub fn try_send(&self, message: ActivationMessage) -> bool {
        self.tx.try_send(message).is_ok()
    }
}

struct TimerEntry {
    name: String,
    due: Instant,
    period: Option<Duration>,
}

/// What the loop should do after processing one event
enum TurnOutcome {
    Continue,
    Deactivate,
}

pub(crate) struct ActivationSpec {
    pub identity: GrainIdentity,
    pub grain: Box<dyn Grain>,
    pub idle_timeout: Duration,
    pub mailbox_capacity: usize,
    pub cancel: CancellationToken,
}

/// Spawn the activation task; `on_exit` runs exactly once when the loop
/// ends so the catalog can drop its entry.
pub(crate) fn spawn_activation(
    runtime: RuntimeHandle,
    spec: ActivationSpec,
    on_exit: impl FnOnce(&GrainIdentity, u64) + Send + 'static,
) -> ActivationHandle {
    let activation_id = NEXT_ACTIVATION_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(spec.mailbox_capacity);
    let handle = ActivationHandle {
        identity: spec.identity.clone(),
        activation_id,
        tx,
    };

    tokio::spawn(async move {
        let identity = spec.identity.clone();
        run_activation(runtime, spec, rx).await;
        on_exit(&identity, activation_id);
    });

    handle
}

async fn run_activation(
    runtime: RuntimeHandle,
    spec: ActivationSpec,
    mut rx: mpsc::Receiver<ActivationMessage>,
) {
    let ActivationSpec {
        identity,
        mut grain,
        idle_timeout,
        cancel,
        ..
    } = spec;

    let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel();
    let mut ctx = GrainContext::new(identity.clone(), runtime, cmd_tx);

    if let Err(e) = grain.on_activate(&mut ctx).await {
        error!(grain = %identity, error = %e, "activation failed");
        // Reject everything already queued so callers fail fast
        while let Ok(message) = rx.try_recv() {
            if let ActivationMessage::Invoke { reply, .. } = message {
                let _ = reply.send(Err(Error::transient(format!(
                    "activation of {identity} failed: {e}"
                ))));
            }
        }
        return;
    }
    debug!(grain = %identity, "activated");

    let mut timers: Vec<TimerEntry> = Vec::new();
    let mut last_activity = Instant::now();
    let mut deactivating = false;

    loop {
        // Apply commands issued by the previous turn
        while let Ok(command) = cmd_rx.try_recv() {
            apply_command(&mut timers, &mut deactivating, command);
        }
        if deactivating {
            break;
        }

        let idle_deadline = last_activity + idle_timeout;
        let next_timer = timers.iter().map(|t| t.due).min();
        let wake = next_timer.map_or(idle_deadline, |t| t.min(idle_deadline));

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => TurnOutcome::Deactivate,
            message = rx.recv() => match message {
                Some(message) => {
                    last_activity = Instant::now();
                    process_message(grain.as_mut(), &mut ctx, &identity, message).await
                }
                None => TurnOutcome::Deactivate,
            },
            _ = sleep_until(wake) => {
                if next_timer.is_some_and(|t| t <= idle_deadline) {
                    last_activity = Instant::now();
                    fire_due_timers(grain.as_mut(), &mut ctx, &identity, &mut timers).await
                } else {
                    debug!(grain = %identity, "idle timeout, collecting activation");
                    TurnOutcome::Deactivate
                }
            }
        };

        if matches!(outcome, TurnOutcome::Deactivate) {
            break;
        }
    }

    if let Err(e) = grain.on_deactivate(&mut ctx).await {
        warn!(grain = %identity, error = %e, "deactivation hook failed");
    }
    debug!(grain = %identity, "deactivated");
}

fn apply_command(timers: &mut Vec<TimerEntry>, deactivating: &mut bool, command: ActivationCommand) {
    match command {
        ActivationCommand::RegisterTimer {
            name,
            due_in,
            period,
        } => {
            timers.retain(|t| t.name != name);
            timers.push(TimerEntry {
                name,
                due: Instant::now() + due_in,
                period,
            });
        }
        ActivationCommand::CancelTimer { name } => {
            timers.retain(|t| t.name != name);
        }
        ActivationCommand::Deactivate => *deactivating = true,
    }
}

async fn process_message(
    grain: &mut dyn Grain,
    ctx: &mut GrainContext,
    identity: &GrainIdentity,
    message: ActivationMessage,
) -> TurnOutcome {
    match message {
        ActivationMessage::Invoke {
            call,
            deadline,
            reply,
        } => {
            if Instant::now() > deadline {
                // Caller is gone; skip the turn instead of doing dead work
                let _ = reply.send(Err(Error::DeadlineExceeded(Duration::ZERO)));
                return TurnOutcome::Continue;
            }

            let method = call.method.clone();
            let result = grain.handle(ctx, call).await;
            let fatal = matches!(
                &result,
                Err(Error::VersionConflict { .. }) | Err(Error::Internal(_))
            );
            if let Err(e) = &result {
                if fatal {
                    error!(grain = %identity, method = %method, error = %e,
                        "hard error in turn, discarding activation");
                }
            }
            let _ = reply.send(result);
            if fatal {
                TurnOutcome::Deactivate
            } else {
                TurnOutcome::Continue
            }
        }
        ActivationMessage::Reminder { name } => {
            if let Err(e) = grain.on_reminder(ctx, &name).await {
                warn!(grain = %identity, reminder = %name, error = %e, "reminder handler failed");
            }
            TurnOutcome::Continue
        }
        ActivationMessage::Stop => TurnOutcome::Deactivate,
    }
}

async fn fire_due_timers(
    grain: &mut dyn Grain,
    ctx: &mut GrainContext,
    identity: &GrainIdentity,
    timers: &mut Vec<TimerEntry>,
) -> TurnOutcome {
    let now = Instant::now();
    let mut due: Vec<String> = Vec::new();
    for timer in timers.iter_mut() {
        if timer.due <= now {
            due.push(timer.name.clone());
            match timer.period {
                Some(period) => timer.due = now + period,
                None => timer.due = now, // removed below
            }
        }
    }
    // Drop fired one-shot timers
    timers.retain(|t| t.period.is_some() || t.due > now);

    for name in due {
        if let Err(e) = grain.on_timer(ctx, &name).await {
            warn!(grain = %identity, timer = %name, error = %e, "timer handler failed");
        }
    }
    TurnOutcome::Continue
}
