//! Routing of provider events to per-call workers.
//!
//! Each active call owns one worker task fed by a bounded queue. The
//! registry holds only the sending side; the supervisor spawned next to each
//! worker removes the entry when the worker exits, whether it returned or
//! panicked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use callflow_calls::{get_call, record_activity, save_call, ActivityKind, Command};
use callflow_types::{CallStatus, ProviderEvent};
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::with_conn;
use crate::telephony::with_timeout;
use crate::worker::{CallWorker, WorkerContext, WorkerStart};

struct Entry {
    tx: mpsc::Sender<ProviderEvent>,
    generation: u64,
}

pub struct CallRegistry {
    queue_capacity: usize,
    workers: Mutex<HashMap<String, Entry>>,
    next_generation: AtomicU64,
}

impl CallRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            queue_capacity: queue_capacity.max(1),
            workers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts the worker for a call. Returns `false` if one is already running.
    pub fn spawn(self: &Arc<Self>, ctx: &Arc<WorkerContext>, start: WorkerStart) -> bool {
        let call_id = start.call.call_id.clone();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        {
            let mut workers = self.lock();
            if workers.contains_key(&call_id) {
                return false;
            }
            workers.insert(call_id.clone(), Entry { tx, generation });
        }

        let worker = CallWorker::new(Arc::clone(ctx), start);
        let handle = tokio::spawn(worker.run(rx));

        let registry = Arc::clone(self);
        let ctx = Arc::clone(ctx);
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(call_id = %call_id, "call worker panicked; failing the call");
                    abandon_call(&ctx, &call_id).await;
                    ctx.hub.close(&call_id, CallStatus::Failed);
                } else {
                    tracing::warn!(call_id = %call_id, error = %e, "call worker cancelled");
                }
            }
            registry.remove(&call_id, generation);
        });
        true
    }

    /// Hands an event to the call's worker without waiting.
    ///
    /// A full queue defers the send to a background task so the webhook
    /// caller is never blocked; per-call order is preserved only among events
    /// that did not hit a full queue. Returns the event back when no worker
    /// is running for the call.
    pub fn send(&self, call_id: &str, event: ProviderEvent) -> Result<(), ProviderEvent> {
        let tx = match self.lock().get(call_id) {
            Some(entry) => entry.tx.clone(),
            None => return Err(event),
        };
        match tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) => {
                tracing::warn!(call_id, "call queue full; deferring event");
                let call_id = call_id.to_string();
                tokio::spawn(async move {
                    if tx.send(event).await.is_err() {
                        tracing::warn!(call_id = %call_id, "call worker stopped before deferred event was delivered");
                    }
                });
                Ok(())
            }
            Err(TrySendError::Closed(event)) => {
                let mut workers = self.lock();
                if workers.get(call_id).is_some_and(|e| e.tx.is_closed()) {
                    workers.remove(call_id);
                }
                Err(event)
            }
        }
    }

    fn remove(&self, call_id: &str, generation: u64) {
        let mut workers = self.lock();
        if workers.get(call_id).is_some_and(|e| e.generation == generation) {
            workers.remove(call_id);
            tracing::debug!(call_id, "call worker released");
        }
    }

    pub fn is_running(&self, call_id: &str) -> bool {
        self.lock().contains_key(call_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Marks a call whose worker panicked as failed and hangs up its live legs,
/// so later provider events for it are treated as belonging to a finished
/// call.
async fn abandon_call(ctx: &WorkerContext, call_id: &str) {
    let id = call_id.to_string();
    let abandoned = with_conn(&ctx.pool, move |conn| {
        let mut call = get_call(conn, &id)?;
        let outcome = call.abandon(Utc::now());
        if outcome.changed() {
            save_call(conn, &call)?;
            for transition in &outcome.transitions {
                record_activity(
                    conn,
                    &id,
                    ActivityKind::StatusChanged,
                    &json!({
                        "from": transition.from,
                        "to": transition.to,
                        "reason": "worker_failed",
                    }),
                )?;
            }
        }
        Ok(outcome.commands)
    })
    .await;

    let commands = match abandoned {
        Ok(commands) => commands,
        Err(e) => {
            tracing::error!(call_id, error = %e, "failed to mark abandoned call as failed");
            return;
        }
    };
    for command in commands {
        let Command::HangupLeg { leg_id } = command else {
            continue;
        };
        let hangup = ctx.telephony.hangup(&leg_id);
        if let Err(e) = with_timeout("hangup", ctx.settings.command_timeout, hangup).await {
            tracing::warn!(call_id, leg_id = %leg_id, error = %e, "failed to hang up leg of abandoned call");
        }
    }
}
