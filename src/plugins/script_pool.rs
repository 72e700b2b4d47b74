//! A pool of N isolated `rhai` engines, leased out by a single-consumer
//! broker so that callers never touch the free-list directly. Grounded on
//! the request/response actor shape the data store uses for its own
//! command channel: a `tokio::mpsc` feeding a loop that owns all the
//! mutable state, with `oneshot` channels carrying each reply back.

use crate::error::HerdNsError;
use rhai::Engine;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

/// Number of VMs constructed at load. Fixed per the pool's design: no
/// queueing past this bound in this version.
pub const POOL_SIZE: usize = 16;

enum PoolRequest {
    /// Returns a free VM index, or `None` if the pool is fully booked.
    Book { resp: oneshot::Sender<Option<usize>> },
    Release { index: usize },
}

fn build_engine() -> Engine {
    Engine::new()
}

/// Owns `POOL_SIZE` engines and a broker task that hands out exclusive
/// leases on them. `Clone` is cheap: the channel sender and the engine
/// vector are both shared behind reference counting, so every plugin
/// instance can hold its own handle to the same pool.
#[derive(Clone)]
pub struct ScriptPool {
    tx: mpsc::Sender<PoolRequest>,
    engines: Arc<Vec<Engine>>,
}

impl ScriptPool {
    pub fn new() -> Self {
        let engines = Arc::new((0..POOL_SIZE).map(|_| build_engine()).collect::<Vec<_>>());
        let (tx, mut rx) = mpsc::channel::<PoolRequest>(crate::MAX_IN_FLIGHT);

        tokio::spawn(async move {
            let mut free: Vec<usize> = (0..POOL_SIZE).collect();
            while let Some(request) = rx.recv().await {
                match request {
                    PoolRequest::Book { resp } => {
                        let leased = if free.is_empty() {
                            None
                        } else {
                            Some(free.remove(0))
                        };
                        trace!(?leased, remaining = free.len(), "script pool book");
                        let _ = resp.send(leased);
                    }
                    PoolRequest::Release { index } => {
                        if !free.contains(&index) {
                            free.push(index);
                        }
                    }
                }
            }
        });

        ScriptPool { tx, engines }
    }

    /// Leases a VM index. Fails with [HerdNsError::NoFreeInterpreter] if the
    /// pool has nothing free — there is no queueing in this version.
    pub async fn book(&self) -> Result<usize, HerdNsError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.tx
            .send(PoolRequest::Book { resp: resp_tx })
            .await
            .map_err(|e| HerdNsError::SendError(e.to_string()))?;
        resp_rx
            .await
            .map_err(|e| HerdNsError::SendError(e.to_string()))?
            .ok_or(HerdNsError::NoFreeInterpreter)
    }

    pub async fn release(&self, index: usize) {
        let _ = self.tx.send(PoolRequest::Release { index }).await;
    }

    /// Borrows the leased engine. Only sound to call with an index this
    /// caller currently holds the lease for — the broker never hands the
    /// same index to two callers at once.
    pub fn engine(&self, index: usize) -> &Engine {
        &self.engines[index]
    }
}

impl Default for ScriptPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn leases_and_releases_round_trip() {
        let pool = ScriptPool::new();
        let index = pool.book().await.unwrap();
        pool.release(index).await;
        // give the broker task a chance to process the release
        tokio::task::yield_now().await;
        let index2 = pool.book().await.unwrap();
        assert!(index2 < POOL_SIZE);
    }

    #[tokio::test]
    async fn exhausting_the_pool_fails_booking() {
        let pool = ScriptPool::new();
        let mut leased = vec![];
        for _ in 0..POOL_SIZE {
            leased.push(pool.book().await.unwrap());
        }
        let result = pool.book().await;
        assert!(matches!(result, Err(HerdNsError::NoFreeInterpreter)));
    }
}
