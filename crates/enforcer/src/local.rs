//! # Local Enforcer
//!
//! Owns a datapath and the secret material in this process. The packet
//! path itself lives behind the [`Datapath`] trait; this handle manages
//! which policies it carries.

use std::sync::Arc;

use async_trait::async_trait;
use cache::Cache;
use shared_types::{FilterQueue, PuInfo, Secrets};
use tracing::{debug, info};

use crate::{EnforcerError, PolicyEnforcer};

/// The per-packet token exchange engine. Out of scope here; the trait
/// is the seam the control plane programs it through.
#[async_trait]
pub trait Datapath: Send + Sync {
    async fn apply_policy(&self, context_id: &str, pu: &PuInfo) -> Result<(), EnforcerError>;
    async fn remove_policy(&self, context_id: &str) -> Result<(), EnforcerError>;
    async fn start(&self) -> Result<(), EnforcerError>;
    async fn stop(&self) -> Result<(), EnforcerError>;
}

/// Datapath that accepts everything and logs. Used until a real packet
/// engine is wired in, and by tests.
#[derive(Debug, Default)]
pub struct NullDatapath;

#[async_trait]
impl Datapath for NullDatapath {
    async fn apply_policy(&self, context_id: &str, _pu: &PuInfo) -> Result<(), EnforcerError> {
        debug!(context_id, "Datapath accepted policy");
        Ok(())
    }

    async fn remove_policy(&self, context_id: &str) -> Result<(), EnforcerError> {
        debug!(context_id, "Datapath dropped policy");
        Ok(())
    }

    async fn start(&self) -> Result<(), EnforcerError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), EnforcerError> {
        Ok(())
    }
}

/// Enforcer handle owning a local datapath.
pub struct LocalEnforcer {
    server_id: String,
    secrets: Arc<dyn Secrets>,
    filter_queue: FilterQueue,
    datapath: Arc<dyn Datapath>,
    contexts: Cache<String, PuInfo>,
}

impl LocalEnforcer {
    #[must_use]
    pub fn new(
        server_id: impl Into<String>,
        secrets: Arc<dyn Secrets>,
        filter_queue: FilterQueue,
        datapath: Arc<dyn Datapath>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            secrets,
            filter_queue,
            datapath,
            contexts: Cache::new(),
        }
    }

    /// The identity this enforcer signs tokens as.
    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// The secret material backing the token exchange.
    #[must_use]
    pub fn secrets(&self) -> Arc<dyn Secrets> {
        Arc::clone(&self.secrets)
    }

    /// The queue layout the supervisor must steer packets into.
    #[must_use]
    pub fn filter_queue(&self) -> FilterQueue {
        self.filter_queue
    }

    /// Number of enforced contexts.
    #[must_use]
    pub fn enforced_count(&self) -> usize {
        self.contexts.size()
    }
}

#[async_trait]
impl PolicyEnforcer for LocalEnforcer {
    async fn enforce(&self, context_id: &str, pu: &PuInfo) -> Result<(), EnforcerError> {
        self.datapath.apply_policy(context_id, pu).await?;
        self.contexts
            .add_or_update(context_id.to_string(), pu.clone());
        info!(context_id, "Policy enforced");
        Ok(())
    }

    async fn unenforce(&self, context_id: &str) -> Result<(), EnforcerError> {
        if self.contexts.remove(&context_id.to_string()).is_err() {
            debug!(context_id, "Unenforce for unknown context");
            return Ok(());
        }
        self.datapath.remove_policy(context_id).await?;
        info!(context_id, "Policy evicted");
        Ok(())
    }

    async fn start(&self) -> Result<(), EnforcerError> {
        self.datapath.start().await
    }

    async fn stop(&self) -> Result<(), EnforcerError> {
        for context_id in self.contexts.keys() {
            let _ = self.unenforce(&context_id).await;
        }
        self.datapath.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{PskSecrets, PuPolicy, PuRuntime};

    fn enforcer() -> LocalEnforcer {
        LocalEnforcer::new(
            "server-1",
            Arc::new(PskSecrets::new(b"key".to_vec())),
            FilterQueue::default(),
            Arc::new(NullDatapath),
        )
    }

    fn pu(context_id: &str) -> PuInfo {
        PuInfo::new(context_id, PuRuntime::default(), PuPolicy::default())
    }

    #[tokio::test]
    async fn test_enforce_unenforce_cycle() {
        let e = enforcer();
        e.enforce("svcA", &pu("svcA")).await.unwrap();
        assert_eq!(e.enforced_count(), 1);
        e.unenforce("svcA").await.unwrap();
        assert_eq!(e.enforced_count(), 0);
    }

    #[tokio::test]
    async fn test_unenforce_unknown_is_ok() {
        let e = enforcer();
        e.unenforce("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn test_reenforce_replaces() {
        let e = enforcer();
        e.enforce("svcA", &pu("svcA")).await.unwrap();
        e.enforce("svcA", &pu("svcA")).await.unwrap();
        assert_eq!(e.enforced_count(), 1);
    }
}
