//! Supervisor - restarts faulted actors with fresh state
//!
//! Each incarnation of an actor runs in its own task, so a panic or a returned
//! fault never reaches the pool or sibling actors. A faulted actor is started
//! again from scratch after a backoff, within a restart budget per time window.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::{queue_metrics, signalled, Result};

/// Bounded restarts per time window
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub max_restarts: u32,
    pub window: Duration,
    pub backoff: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_restarts: 5,
            window: Duration::from_secs(60),
            backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Supervisor {
    policy: RestartPolicy,
    shutdown: watch::Receiver<bool>,
}

impl Supervisor {
    pub fn new(policy: RestartPolicy, shutdown: watch::Receiver<bool>) -> Self {
        Self { policy, shutdown }
    }

    pub fn policy(&self) -> &RestartPolicy {
        &self.policy
    }

    /// Shutdown flag shared by every supervised actor
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.clone()
    }

    /// Supervise the actor produced by `start`.
    ///
    /// Supervision ends when an incarnation returns `Ok`, on shutdown, or once
    /// the restart budget is spent.
    pub fn spawn<F, Fut>(&self, actor: impl Into<String>, mut start: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let actor = actor.into();
        let policy = self.policy.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut restarts: VecDeque<Instant> = VecDeque::new();

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let reason = match tokio::spawn(start()).await {
                    Ok(Ok(())) => {
                        debug!(actor = %actor, "Actor stopped");
                        break;
                    }
                    Ok(Err(e)) => e.to_string(),
                    Err(e) if e.is_panic() => "actor panicked".to_string(),
                    Err(_) => {
                        debug!(actor = %actor, "Actor cancelled");
                        break;
                    }
                };

                if *shutdown.borrow() {
                    debug!(actor = %actor, reason = %reason, "Actor exited during shutdown");
                    break;
                }

                error!(actor = %actor, reason = %reason, "Actor fault");

                let now = Instant::now();
                while let Some(oldest) = restarts.front() {
                    if now.duration_since(*oldest) > policy.window {
                        restarts.pop_front();
                    } else {
                        break;
                    }
                }

                if restarts.len() >= policy.max_restarts as usize {
                    error!(
                        actor = %actor,
                        max_restarts = policy.max_restarts,
                        window_secs = policy.window.as_secs(),
                        "Restart budget exhausted, actor stays down"
                    );
                    break;
                }

                restarts.push_back(now);
                queue_metrics::record_actor_restart(&actor);
                warn!(
                    actor = %actor,
                    restart = restarts.len(),
                    backoff_ms = policy.backoff.as_millis() as u64,
                    "Restarting actor"
                );

                tokio::select! {
                    _ = tokio::time::sleep(policy.backoff) => {}
                    _ = signalled(&mut shutdown) => break,
                }
            }
        })
    }
}
