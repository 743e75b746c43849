//! Time-bounded, renewable leases for tasks that must run on one instance
//! at a time (scheduled cleanups, periodic reports).
//!
//! Not part of the messaging contract: any shared store can back a
//! [`LeaseManager`]. [`InMemoryLeaseManager`] covers a single process and
//! tests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::LeaseError;

/// Proof of holding a lease until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub token: Uuid,
    pub expires_at: Instant,
}

#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Take the lease `name` for `ttl`, or `None` while someone else holds
    /// an unexpired one.
    async fn acquire(&self, name: &str, holder: &str, ttl: Duration)
        -> Result<Option<Lease>, LeaseError>;

    /// Extend a held lease. `false` when it expired and was taken over.
    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<bool, LeaseError>;

    /// Give the lease up. Releasing a lease that was taken over is a no-op.
    async fn release(&self, lease: &Lease) -> Result<(), LeaseError>;
}

#[derive(Debug, Clone)]
struct Held {
    holder: String,
    token: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct InMemoryLeaseManager {
    leases: Mutex<HashMap<String, Held>>,
}

impl InMemoryLeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `name`, if its lease has not expired.
    pub fn holder(&self, name: &str) -> Option<String> {
        let leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        leases
            .get(name)
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.holder.clone())
    }
}

#[async_trait]
impl LeaseManager for InMemoryLeaseManager {
    async fn acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>, LeaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(held) = leases.get(name) {
            if held.expires_at > now {
                return Ok(None);
            }
        }
        let lease = Lease {
            name: name.to_string(),
            holder: holder.to_string(),
            token: Uuid::new_v4(),
            expires_at: now + ttl,
        };
        leases.insert(
            name.to_string(),
            Held {
                holder: lease.holder.clone(),
                token: lease.token,
                expires_at: lease.expires_at,
            },
        );
        Ok(Some(lease))
    }

    async fn renew(&self, lease: &mut Lease, ttl: Duration) -> Result<bool, LeaseError> {
        let now = Instant::now();
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        match leases.get_mut(&lease.name) {
            Some(held) if held.token == lease.token => {
                held.expires_at = now + ttl;
                lease.expires_at = held.expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().unwrap_or_else(|e| e.into_inner());
        if leases
            .get(&lease.name)
            .is_some_and(|held| held.token == lease.token)
        {
            leases.remove(&lease.name);
        }
        Ok(())
    }
}

/// Run `task` only if the lease `name` can be taken, renewing it every
/// third of `ttl` while the task runs.
///
/// `Ok(None)` when another holder has the lease. If a renewal finds the
/// lease taken over, the task is dropped and [`LeaseError::Lost`] returned.
pub async fn run_exclusive<M, F, Fut, T>(
    manager: &M,
    name: &str,
    holder: &str,
    ttl: Duration,
    task: F,
) -> Result<Option<T>, LeaseError>
where
    M: LeaseManager + ?Sized,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let Some(mut lease) = manager.acquire(name, holder, ttl).await? else {
        debug!(lease = name, "lease held elsewhere, skipping");
        return Ok(None);
    };

    let work = task();
    tokio::pin!(work);
    let mut renew = tokio::time::interval_at(Instant::now() + ttl / 3, ttl / 3);

    loop {
        tokio::select! {
            out = &mut work => {
                manager.release(&lease).await?;
                return Ok(Some(out));
            }
            _ = renew.tick() => {
                if !manager.renew(&mut lease, ttl).await? {
                    warn!(lease = name, holder, "lease lost, abandoning task");
                    return Err(LeaseError::Lost {
                        name: name.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn second_holder_is_refused_until_expiry() {
        let manager = InMemoryLeaseManager::new();
        let lease = manager.acquire("cleanup", "a", TTL).await.unwrap().unwrap();
        assert!(manager.acquire("cleanup", "b", TTL).await.unwrap().is_none());
        assert_eq!(manager.holder("cleanup").as_deref(), Some("a"));

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let taken = manager.acquire("cleanup", "b", TTL).await.unwrap().unwrap();
        assert_ne!(taken.token, lease.token);

        // The stale holder can neither renew nor release the new lease.
        let mut stale = lease;
        assert!(!manager.renew(&mut stale, TTL).await.unwrap());
        manager.release(&stale).await.unwrap();
        assert_eq!(manager.holder("cleanup").as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn release_frees_the_lease() {
        let manager = InMemoryLeaseManager::new();
        let lease = manager.acquire("report", "a", TTL).await.unwrap().unwrap();
        manager.release(&lease).await.unwrap();
        assert!(manager.acquire("report", "b", TTL).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn run_exclusive_runs_once_across_holders() {
        let manager = Arc::new(InMemoryLeaseManager::new());
        let runs = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for holder in ["a", "b", "c"] {
            let manager = Arc::clone(&manager);
            let runs = Arc::clone(&runs);
            tasks.push(tokio::spawn(async move {
                run_exclusive(manager.as_ref(), "nightly", holder, TTL, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                })
                .await
                .unwrap()
            }));
        }
        let mut ran = 0;
        for task in tasks {
            if task.await.unwrap().is_some() {
                ran += 1;
            }
        }
        assert_eq!(ran, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        // Renewed past the original ttl, then released.
        assert!(manager.holder("nightly").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn lost_lease_abandons_the_task() {
        let manager = InMemoryLeaseManager::new();
        let m = &manager;
        let result = run_exclusive(m, "sync", "a", TTL, || async move {
            // Someone clears the lease behind our back.
            m.leases.lock().unwrap().clear();
            m.acquire("sync", "b", TTL).await.unwrap();
            tokio::time::sleep(Duration::from_secs(120)).await;
        })
        .await;
        assert!(matches!(result, Err(LeaseError::Lost { .. })));
        assert_eq!(manager.holder("sync").as_deref(), Some("b"));
    }

    /// A store that cannot be reached.
    struct Unreachable;

    #[async_trait]
    impl LeaseManager for Unreachable {
        async fn acquire(
            &self,
            _name: &str,
            _holder: &str,
            _ttl: Duration,
        ) -> Result<Option<Lease>, LeaseError> {
            Err(LeaseError::Backend("connection refused".into()))
        }

        async fn renew(&self, _lease: &mut Lease, _ttl: Duration) -> Result<bool, LeaseError> {
            Err(LeaseError::Backend("connection refused".into()))
        }

        async fn release(&self, _lease: &Lease) -> Result<(), LeaseError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn backend_failure_skips_the_task() {
        let ran = AtomicUsize::new(0);
        let result = run_exclusive(&Unreachable, "sync", "a", TTL, || async {
            ran.fetch_add(1, Ordering::SeqCst);
        })
        .await;
        assert!(matches!(result, Err(LeaseError::Backend(_))));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
