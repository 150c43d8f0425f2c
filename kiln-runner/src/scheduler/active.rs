//! Builds currently running on this executor

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared set of in-flight build IDs
///
/// Workers add their build when they start and remove it when they finish;
/// cleanup snapshots it on shutdown.
#[derive(Clone, Default)]
pub struct ActiveBuilds {
    ids: Arc<RwLock<HashSet<i64>>>,
}

impl ActiveBuilds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the build was already present
    pub async fn insert(&self, build_id: i64) -> bool {
        self.ids.write().await.insert(build_id)
    }

    pub async fn remove(&self, build_id: i64) {
        self.ids.write().await.remove(&build_id);
    }

    /// Sorted copy of the current IDs, taken under the read lock
    pub async fn snapshot(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.ids.read().await.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.ids.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ids_appear_once() {
        let active = ActiveBuilds::new();
        assert!(active.insert(2).await);
        assert!(active.insert(1).await);
        assert!(!active.insert(2).await);
        assert_eq!(active.snapshot().await, vec![1, 2]);

        active.remove(2).await;
        active.remove(7).await;
        assert_eq!(active.snapshot().await, vec![1]);
        assert_eq!(active.len().await, 1);
    }
}
