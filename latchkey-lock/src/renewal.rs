//! Background lease renewal.
//!
//! A held lock spawns one renewal task that re-arms the lease at two thirds
//! of its length. Single-owner records renew with a compare-and-expire
//! script; owner sets (semaphore permits, shared holds) renew with a
//! membership check that also re-arms the keys living alongside the set.
//! The task stops when its handle is dropped, when the renewal script
//! reports the lease lost or when the shutdown channel flips. Failures are
//! logged, never raised.

use latchkey_core::OwnerToken;
use latchkey_storage::{AtomicScript, SharedRemote};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Renewal period for a lease.
pub fn renewal_period(lease: Duration) -> Duration {
    (lease * 2 / 3).max(Duration::from_millis(1))
}

#[derive(Debug, Default)]
struct RenewalState {
    renewals: AtomicU64,
    failures: AtomicU64,
    lost: AtomicBool,
}

/// Owns a running renewal task. Dropping it stops the task.
#[derive(Debug)]
pub struct RenewalHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
    state: Arc<RenewalState>,
}

impl RenewalHandle {
    /// Start renewing `key` for `token` every two thirds of `lease`.
    pub fn spawn(remote: SharedRemote, key: String, token: OwnerToken, lease: Duration) -> Self {
        let script = AtomicScript::CompareAndExpire {
            key: key.clone(),
            token,
            ttl: lease,
        };
        Self::spawn_script(remote, key, script, lease)
    }

    /// Keep `token`'s membership of `set_key` alive, re-arming `keys` with it.
    pub fn spawn_membership(
        remote: SharedRemote,
        set_key: String,
        keys: Vec<String>,
        token: OwnerToken,
        lease: Duration,
    ) -> Self {
        let script = AtomicScript::RenewMembership {
            set_key: set_key.clone(),
            keys,
            token,
            ttl: lease,
        };
        Self::spawn_script(remote, set_key, script, lease)
    }

    /// Run `script` every two thirds of `lease`; a reply other than 1 means
    /// the lease was lost. `label` names the lease in logs.
    pub fn spawn_script(
        remote: SharedRemote,
        label: String,
        script: AtomicScript,
        lease: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let state = Arc::new(RenewalState::default());
        let task = tokio::spawn(renew_loop(
            remote,
            label,
            script,
            lease,
            shutdown_rx,
            state.clone(),
        ));
        Self {
            shutdown_tx,
            task,
            state,
        }
    }

    pub fn renewals(&self) -> u64 {
        self.state.renewals.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.state.failures.load(Ordering::Relaxed)
    }

    /// Whether a renewal found the lease owned by someone else.
    pub fn lease_lost(&self) -> bool {
        self.state.lost.load(Ordering::Acquire)
    }
}

impl Drop for RenewalHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
    }
}

async fn renew_loop(
    remote: SharedRemote,
    key: String,
    script: AtomicScript,
    lease: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    state: Arc<RenewalState>,
) {
    let period = renewal_period(lease);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::debug!(key = %key, period_ms = period.as_millis() as u64, "Lease renewal started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                let renewed = match remote.run_script(&script).await {
                    Ok(reply) => reply.into_flag(script.name()).map_err(Into::into),
                    Err(e) => Err(e),
                };
                match renewed {
                    Ok(true) => {
                        state.renewals.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(false) => {
                        state.lost.store(true, Ordering::Release);
                        tracing::warn!(key = %key, "Lease lost before renewal; stopping renewal");
                        break;
                    }
                    Err(e) => {
                        state.failures.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(key = %key, error = %e, "Lease renewal failed");
                    }
                }
            }
        }
    }

    tracing::debug!(key = %key, "Lease renewal stopped");
}
