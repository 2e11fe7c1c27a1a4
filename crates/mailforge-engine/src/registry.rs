//! Campaign Registry - In-process view of active campaigns
//!
//! An explicit value owned by the engine and shared with workers, keyed by
//! owner id. One slot per owner: a user has at most one active campaign.

use mailforge_common::types::OwnerId;
use mailforge_store::models::{Campaign, CampaignStatus};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Registry of the latest known campaign per owner
#[derive(Debug, Default)]
pub struct CampaignRegistry {
    inner: RwLock<HashMap<OwnerId, Campaign>>,
}

impl CampaignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the owner's campaign
    pub async fn insert(&self, campaign: Campaign) {
        self.inner.write().await.insert(campaign.owner_id, campaign);
    }

    /// The owner's campaign, if any
    pub async fn get(&self, owner: OwnerId) -> Option<Campaign> {
        self.inner.read().await.get(&owner).cloned()
    }

    /// Drop the owner's campaign from the registry
    pub async fn remove(&self, owner: OwnerId) -> Option<Campaign> {
        self.inner.write().await.remove(&owner)
    }

    /// Whether the owner's campaign is currently running
    pub async fn is_running(&self, owner: OwnerId) -> bool {
        self.inner
            .read()
            .await
            .get(&owner)
            .is_some_and(|c| c.status == CampaignStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mailforge_store::models::CampaignOptions;

    #[tokio::test]
    async fn test_one_slot_per_owner() {
        let registry = CampaignRegistry::new();
        let first = Campaign::new(
            1,
            vec!["a@x.com".into()],
            "s",
            "b",
            CampaignOptions::default(),
            Utc::now(),
        );
        let mut second = first.clone();
        second.id = "1-later".into();

        registry.insert(first).await;
        registry.insert(second.clone()).await;

        assert_eq!(registry.get(1).await.unwrap().id, second.id);
        assert!(registry.get(2).await.is_none());
        assert!(!registry.is_running(1).await);

        second.start(Utc::now()).unwrap();
        registry.insert(second).await;
        assert!(registry.is_running(1).await);

        registry.remove(1).await;
        assert!(registry.get(1).await.is_none());
    }
}
