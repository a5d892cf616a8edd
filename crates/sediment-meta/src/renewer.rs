//! Scoped TTL renewal
//!
//! A `Renewer` keeps a growing set of tracker IDs alive while a long
//! operation runs: a background task re-extends every ID's TTL at half the
//! TTL interval, retrying transient failures with backoff. `with_renewer`
//! scopes the whole thing: when the callback returns (success or failure)
//! renewal stops and the IDs revert to natural expiration.

use crate::tracker::Tracker;
use dashmap::DashMap;
use sediment_common::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A dynamically growable set of tracker IDs being kept alive
pub struct Renewer {
    tracker: Tracker,
    ttl: Duration,
    ids: DashMap<String, ()>,
}

impl Renewer {
    fn new(tracker: Tracker, ttl: Duration) -> Self {
        Self {
            tracker,
            ttl,
            ids: DashMap::new(),
        }
    }

    /// Add an ID to the keep-alive set. New intermediate objects may be
    /// added at any time while the scope runs.
    pub fn add(&self, id: impl Into<String>) {
        self.ids.insert(id.into(), ());
    }

    /// Remove an ID from the keep-alive set
    pub fn remove(&self, id: &str) {
        self.ids.remove(id);
    }

    /// Renew every held ID once. An ID whose record has vanished is
    /// dropped from the set; downstream reads will surface not-found.
    fn renew_all(&self) -> Result<()> {
        let mut gone = Vec::new();
        for entry in self.ids.iter() {
            match self.tracker.set_ttl(entry.key(), self.ttl) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    warn!(id = %entry.key(), "renewal target vanished");
                    gone.push(entry.key().clone());
                }
                Err(e) => return Err(e),
            }
        }
        for id in gone {
            self.ids.remove(&id);
        }
        Ok(())
    }
}

/// Run `f` while renewing its tracked IDs in the background.
///
/// Renewal failures are retried with backoff inside the loop and never
/// abort the scope; the background task is stopped on every exit path.
pub async fn with_renewer<T, F, Fut>(tracker: Tracker, ttl: Duration, f: F) -> Result<T>
where
    F: FnOnce(Arc<Renewer>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let renewer = Arc::new(Renewer::new(tracker, ttl));
    let handle = tokio::spawn(renew_loop(renewer.clone(), ttl));
    // Abort on every exit path, including panics unwinding through the
    // caller's future.
    let _guard = AbortGuard(handle);
    f(renewer).await
}

async fn renew_loop(renewer: Arc<Renewer>, ttl: Duration) {
    let tick = ttl / 2;
    let mut delay = tick;
    loop {
        tokio::time::sleep(delay).await;
        match renewer.renew_all() {
            Ok(()) => {
                delay = tick;
                debug!(ids = renewer.ids.len(), "renewed tracker ids");
            }
            Err(e) => {
                // retry quickly with exponential backoff, never past the tick
                warn!(error = %e, "renewal failed; backing off");
                delay = if delay >= tick {
                    Duration::from_millis(100)
                } else {
                    (delay * 2).min(tick)
                };
            }
        }
    }
}

struct AbortGuard(tokio::task::JoinHandle<()>);

impl Drop for AbortGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::Database;

    fn test_tracker() -> (tempfile::TempDir, Tracker) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::create(dir.path().join("meta.redb")).unwrap());
        (dir, Tracker::new(db).unwrap())
    }

    #[tokio::test]
    async fn test_renewer_keeps_object_alive() {
        let (_dir, tracker) = test_tracker();
        // short TTL so the renew tick fires several times during the scope
        let ttl = Duration::from_millis(100);
        tracker.create("fileset/a", &[], ttl).unwrap();

        let out = with_renewer(tracker.clone(), ttl, |renewer| {
            let tracker = tracker.clone();
            async move {
                renewer.add("fileset/a");
                tokio::time::sleep(Duration::from_millis(400)).await;
                // well past the original TTL, but never expired
                assert!(tracker.expired()?.is_empty());
                Ok(42)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn test_expiry_resumes_after_scope() {
        let (_dir, tracker) = test_tracker();
        let ttl = Duration::from_millis(50);
        tracker.create("fileset/b", &[], ttl).unwrap();

        with_renewer(tracker.clone(), ttl, |renewer| async move {
            renewer.add("fileset/b");
            Ok(())
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(tracker.expired().unwrap(), vec!["fileset/b".to_string()]);
    }

    #[tokio::test]
    async fn test_scope_error_still_stops_renewal() {
        let (_dir, tracker) = test_tracker();
        let ttl = Duration::from_millis(50);
        tracker.create("fileset/c", &[], ttl).unwrap();

        let result: Result<()> = with_renewer(tracker.clone(), ttl, |renewer| async move {
            renewer.add("fileset/c");
            Err(sediment_common::Error::unavailable("boom"))
        })
        .await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!tracker.expired().unwrap().is_empty());
    }
}
