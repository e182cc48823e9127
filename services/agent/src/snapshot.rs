//! Latest desired bundle, shared between the poller and the reconcile loops.
//!
//! Bundles are published as immutable `Arc<Bundle>` values through a watch
//! channel. A reader always gets a whole bundle that the controller
//! returned, either the previous one or the new one.

use std::sync::Arc;

use tokio::sync::watch;

use crate::models::Bundle;

/// Single-writer, many-reader holder of the latest bundle.
#[derive(Debug, Clone)]
pub struct BundleSnapshot {
    tx: Arc<watch::Sender<Option<Arc<Bundle>>>>,
}

impl BundleSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a new bundle, replacing the previous one.
    pub fn store(&self, bundle: Bundle) -> Arc<Bundle> {
        let bundle = Arc::new(bundle);
        self.tx.send_replace(Some(Arc::clone(&bundle)));
        bundle
    }

    /// Current bundle, or `None` if none has been stored yet.
    pub fn load(&self) -> Option<Arc<Bundle>> {
        self.tx.borrow().clone()
    }

    pub fn is_stored(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until a bundle has been stored at least once.
    pub async fn when_first_stored(&self) -> Arc<Bundle> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(bundle) = rx.borrow_and_update().clone() {
                return bundle;
            }
            if rx.changed().await.is_err() {
                // Unreachable while `self` holds the sender.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for BundleSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::models::{Application, ApplicationEntry};

    fn bundle_with_apps(ids: &[&str]) -> Bundle {
        Bundle {
            applications: ids
                .iter()
                .map(|id| ApplicationEntry {
                    application: Application {
                        id: id.parse().unwrap(),
                        name: None,
                        extra: Default::default(),
                    },
                    latest_release: None,
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_until_stored() {
        let snapshot = BundleSnapshot::new();
        assert!(snapshot.load().is_none());
        assert!(!snapshot.is_stored());

        snapshot.store(Bundle::default());
        assert!(snapshot.is_stored());
    }

    #[test]
    fn test_load_returns_latest() {
        let snapshot = BundleSnapshot::new();
        snapshot.store(bundle_with_apps(&["a"]));
        snapshot.store(bundle_with_apps(&["b", "c"]));

        let bundle = snapshot.load().unwrap();
        assert_eq!(bundle.applications.len(), 2);
    }

    #[test]
    fn test_held_snapshot_unaffected_by_store() {
        let snapshot = BundleSnapshot::new();
        snapshot.store(bundle_with_apps(&["a"]));
        let held = snapshot.load().unwrap();

        snapshot.store(bundle_with_apps(&["b", "c", "d"]));

        assert_eq!(held.applications.len(), 1);
        assert_eq!(held.applications[0].application.id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_when_first_stored_waits() {
        let snapshot = BundleSnapshot::new();
        let waiter = tokio::spawn({
            let snapshot = snapshot.clone();
            async move { snapshot.when_first_stored().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        snapshot.store(bundle_with_apps(&["a"]));
        let bundle = waiter.await.unwrap();
        assert_eq!(bundle.applications.len(), 1);
    }

    #[tokio::test]
    async fn test_when_first_stored_immediate_after_store() {
        let snapshot = BundleSnapshot::new();
        snapshot.store(Bundle::default());
        let bundle = snapshot.when_first_stored().await;
        assert!(bundle.applications.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_readers_see_whole_bundles() {
        let snapshot = BundleSnapshot::new();
        snapshot.store(bundle_with_apps(&["x"]));

        let writer = tokio::spawn({
            let snapshot = snapshot.clone();
            async move {
                for i in 0..200 {
                    let ids: Vec<String> = (0..(i % 5 + 1)).map(|n| format!("app{i}-{n}")).collect();
                    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                    snapshot.store(bundle_with_apps(&refs));
                    tokio::task::yield_now().await;
                }
            }
        });

        for _ in 0..200 {
            let bundle = snapshot.load().unwrap();
            // Every app in one bundle comes from the same store call.
            let prefixes: std::collections::BTreeSet<_> = bundle
                .applications
                .iter()
                .map(|a| a.application.id.as_str().split('-').next().unwrap().to_string())
                .collect();
            assert_eq!(prefixes.len(), 1);
            tokio::task::yield_now().await;
        }

        writer.await.unwrap();
    }
}
