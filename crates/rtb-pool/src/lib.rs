//! ResourcePool - bounded pool of reusable worker handles
//!
//! Shared by the event-processing workers and the broker channel workers:
//! - Pre-warmed start count, lazy growth up to a fixed maximum
//! - Checkout with a bounded number of immediate retries
//! - Leases that return their handle to the pool when dropped
//! - Dead handles discarded on return so capacity is rebuilt lazily

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

pub mod registry;

pub use registry::PoolRegistry;

/// Checkout attempts before a pool reports exhaustion
pub const DEFAULT_CHECKOUT_ATTEMPTS: u32 = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool exhausted: {pool} (no worker after {attempts} attempts)")]
    Exhausted { pool: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// A handle that can live in a [`ResourcePool`].
pub trait Poolable: Send + 'static {
    /// Whether the worker behind this handle is still running.
    fn is_alive(&self) -> bool {
        true
    }
}

type Constructor<W> = Box<dyn Fn(usize) -> W + Send + Sync>;

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    pub max_count: usize,
    pub created: usize,
    pub available: usize,
    pub checked_out: usize,
}

/// Bounded pool of worker handles.
///
/// A handle is either in `available` or held by exactly one [`PooledWorker`].
pub struct ResourcePool<W: Poolable> {
    name: String,
    max_count: usize,
    checkout_attempts: u32,

    /// Idle handles
    available: Mutex<Vec<W>>,

    /// Handles currently in existence (idle + leased)
    created: AtomicUsize,

    /// Monotonic id handed to the constructor
    next_id: AtomicUsize,

    constructor: Constructor<W>,
}

impl<W: Poolable> ResourcePool<W> {
    /// Create a pool with `init_count` pre-warmed handles and room for `max_count`.
    pub fn new<F>(name: impl Into<String>, max_count: usize, init_count: usize, constructor: F) -> Arc<Self>
    where
        F: Fn(usize) -> W + Send + Sync + 'static,
    {
        Self::with_checkout_attempts(name, max_count, init_count, DEFAULT_CHECKOUT_ATTEMPTS, constructor)
    }

    pub fn with_checkout_attempts<F>(
        name: impl Into<String>,
        max_count: usize,
        init_count: usize,
        checkout_attempts: u32,
        constructor: F,
    ) -> Arc<Self>
    where
        F: Fn(usize) -> W + Send + Sync + 'static,
    {
        let name = name.into();
        let init_count = init_count.min(max_count);

        let pool = Self {
            name,
            max_count,
            checkout_attempts: checkout_attempts.max(1),
            available: Mutex::new(Vec::with_capacity(max_count)),
            created: AtomicUsize::new(0),
            next_id: AtomicUsize::new(0),
            constructor: Box::new(constructor),
        };

        {
            let mut available = pool.available.lock();
            for _ in 0..init_count {
                let id = pool.next_id.fetch_add(1, Ordering::SeqCst);
                available.push((pool.constructor)(id));
                pool.created.fetch_add(1, Ordering::SeqCst);
            }
        }

        info!(
            pool = %pool.name,
            max_count = max_count,
            init_count = init_count,
            "Created resource pool"
        );

        Arc::new(pool)
    }

    /// Check out a worker, retrying immediately up to the configured attempt count.
    pub fn checkout(self: &Arc<Self>) -> Result<PooledWorker<W>> {
        for attempt in 1..=self.checkout_attempts {
            if let Some(lease) = self.try_checkout() {
                if attempt > 1 {
                    debug!(pool = %self.name, attempt = attempt, "Checked out worker after retry");
                }
                return Ok(lease);
            }

            warn!(
                pool = %self.name,
                attempt = attempt,
                max_attempts = self.checkout_attempts,
                "No worker available in pool"
            );
        }

        Err(PoolError::Exhausted {
            pool: self.name.clone(),
            attempts: self.checkout_attempts,
        })
    }

    /// Single checkout attempt with no retry.
    pub fn try_checkout(self: &Arc<Self>) -> Option<PooledWorker<W>> {
        self.take_worker().map(|worker| PooledWorker {
            pool: Arc::clone(self),
            worker: Some(worker),
        })
    }

    fn take_worker(&self) -> Option<W> {
        // Idle handles first; anything that died while idle is dropped here
        loop {
            let idle = self.available.lock().pop();
            match idle {
                Some(worker) if worker.is_alive() => return Some(worker),
                Some(_) => {
                    self.created.fetch_sub(1, Ordering::SeqCst);
                    warn!(pool = %self.name, "Discarded dead idle worker");
                }
                None => break,
            }
        }

        // Grow lazily up to max_count
        let mut created = self.created.load(Ordering::SeqCst);
        while created < self.max_count {
            match self.created.compare_exchange(created, created + 1, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    debug!(pool = %self.name, worker_id = id, "Constructing new pool worker");
                    return Some((self.constructor)(id));
                }
                Err(current) => created = current,
            }
        }

        None
    }

    fn checkin(&self, worker: W) {
        if worker.is_alive() {
            self.available.lock().push(worker);
        } else {
            self.created.fetch_sub(1, Ordering::SeqCst);
            warn!(pool = %self.name, "Discarded dead worker on return");
        }
    }

    fn forget(&self) {
        self.created.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    pub fn checkout_attempts(&self) -> u32 {
        self.checkout_attempts
    }

    pub fn available_count(&self) -> usize {
        self.available.lock().len()
    }

    pub fn stats(&self) -> PoolStats {
        let created = self.created.load(Ordering::SeqCst);
        let available = self.available.lock().len();
        PoolStats {
            name: self.name.clone(),
            max_count: self.max_count,
            created,
            available,
            checked_out: created.saturating_sub(available),
        }
    }
}

impl<W: Poolable> fmt::Debug for ResourcePool<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.name)
            .field("max_count", &self.max_count)
            .field("created", &self.created.load(Ordering::SeqCst))
            .finish()
    }
}

/// Exclusive lease on a pooled worker.
///
/// Dropping the lease returns the worker to its pool, so every code path that
/// finishes with the worker gives it back exactly once.
pub struct PooledWorker<W: Poolable> {
    pool: Arc<ResourcePool<W>>,
    worker: Option<W>,
}

impl<W: Poolable> PooledWorker<W> {
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    /// Return the worker to the pool now.
    pub fn release(self) {
        drop(self);
    }

    /// Drop the worker instead of returning it; the pool may construct a replacement.
    pub fn discard(mut self) {
        if self.worker.take().is_some() {
            self.pool.forget();
            debug!(pool = %self.pool.name(), "Worker discarded by lease holder");
        }
    }
}

impl<W: Poolable> Deref for PooledWorker<W> {
    type Target = W;

    fn deref(&self) -> &W {
        match self.worker.as_ref() {
            Some(worker) => worker,
            None => unreachable!("lease holds its worker until dropped"),
        }
    }
}

impl<W: Poolable> DerefMut for PooledWorker<W> {
    fn deref_mut(&mut self) -> &mut W {
        match self.worker.as_mut() {
            Some(worker) => worker,
            None => unreachable!("lease holds its worker until dropped"),
        }
    }
}

impl<W: Poolable> Drop for PooledWorker<W> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.pool.checkin(worker);
        }
    }
}

impl<W: Poolable + fmt::Debug> fmt::Debug for PooledWorker<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledWorker")
            .field("pool", &self.pool.name())
            .field("worker", &self.worker)
            .finish()
    }
}
