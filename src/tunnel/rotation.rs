//! Round-robin endpoint rotation on a fixed timer

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::error::{Result, TunnelError};
use crate::models::Endpoint;

/// Owns the endpoint pool and the cursor new sessions read from
///
/// The pool is immutable after construction; only the cursor moves, and it
/// is an atomic so a session starting mid-rotation never sees a torn value.
pub struct Rotator {
    pool: Arc<[Endpoint]>,
    cursor: AtomicUsize,
    rotations: AtomicU64,
}

impl Rotator {
    pub fn new(pool: Vec<Endpoint>) -> Result<Self> {
        if pool.is_empty() {
            return Err(TunnelError::EmptyEndpointPool);
        }
        Ok(Self {
            pool: pool.into(),
            cursor: AtomicUsize::new(0),
            rotations: AtomicU64::new(0),
        })
    }

    /// Endpoint new sessions should dial
    pub fn current(&self) -> Endpoint {
        self.pool[self.cursor()].clone()
    }

    pub fn cursor(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Move the cursor one step, wrapping at the end of the pool
    pub fn advance(&self) -> Endpoint {
        let len = self.pool.len();
        let previous = self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| Some((c + 1) % len))
            .unwrap_or_else(|c| c);
        self.rotations.fetch_add(1, Ordering::Relaxed);
        self.pool[(previous + 1) % len].clone()
    }

    /// Rewind to the first endpoint
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
        self.rotations.store(0, Ordering::Relaxed);
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    pub fn pool(&self) -> &[Endpoint] {
        &self.pool
    }

    /// Advance once per `period` until the running flag clears
    ///
    /// The first advance happens one full period after the call.
    #[instrument(skip(self, running))]
    pub async fn run(&self, period: Duration, mut running: watch::Receiver<bool>) {
        info!(
            "Starting endpoint rotation every {}s over {} endpoints",
            period.as_secs_f64(),
            self.pool.len()
        );

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if !*running.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    if !*running.borrow() {
                        break;
                    }
                    let endpoint = self.advance();
                    info!("Switched to endpoint {}", endpoint);
                }
                changed = running.changed() => {
                    if changed.is_err() {
                        debug!("Running flag dropped");
                        break;
                    }
                }
            }
        }

        info!("Endpoint rotation stopped");
    }
}
