//! Container lifecycle against one engine endpoint.

use std::sync::Arc;

use futures::StreamExt;

use crate::engine::{ContainerEngine, ContainerIo};
use crate::error::EngineError;
use crate::session::config::ContainerConfig;

/// Drives pull/create/attach/start/resize/remove for sessions on one engine.
///
/// No retries happen here: every failure is returned to the caller as is.
#[derive(Clone)]
pub struct SessionManager {
    engine: Arc<dyn ContainerEngine>,
}

impl SessionManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    pub fn endpoint(&self) -> &str {
        self.engine.endpoint()
    }

    /// Pull `image` unless it is already present. Pull progress goes to the
    /// operator log.
    pub async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        if self.engine.image_exists(image).await? {
            return Ok(());
        }

        tracing::info!(image, endpoint = self.endpoint(), "Pulling image");
        let mut progress = self.engine.pull_image(image);
        while let Some(update) = progress.next().await {
            let update = update?;
            match (&update.id, &update.progress) {
                (Some(id), Some(bar)) => tracing::info!(image, "{}: {} {}", id, update.status, bar),
                (Some(id), None) => tracing::info!(image, "{}: {}", id, update.status),
                _ => tracing::info!(image, "{}", update.status),
            }
        }
        Ok(())
    }

    pub async fn create(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        let id = self.engine.create_container(config).await?;
        tracing::debug!(container = %id, image = %config.image, "Created container");
        Ok(id)
    }

    /// Open the container's I/O channel. Call before [`start`](Self::start)
    /// so no early output is lost.
    pub async fn attach(&self, id: &str) -> Result<ContainerIo, EngineError> {
        self.engine.attach_container(id).await
    }

    pub async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.engine.start_container(id).await
    }

    pub async fn resize(&self, id: &str, height: u16, width: u16) -> Result<(), EngineError> {
        self.engine.resize_container(id, height, width).await
    }

    /// Force-remove the container and its volumes.
    pub async fn remove(&self, id: &str) -> Result<(), EngineError> {
        self.engine.remove_container(id).await?;
        tracing::debug!(container = %id, "Removed container");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::assert_ok;

    use super::*;
    use crate::engine::{EngineCall, EngineVerb, MemoryEngine};
    use crate::session::config::new_container_config;

    #[tokio::test]
    async fn ensure_image_skips_pull_when_present() {
        let engine = Arc::new(MemoryEngine::new().with_image("alpine:latest"));
        let manager = SessionManager::new(engine.clone());
        assert_ok!(manager.ensure_image("alpine:latest").await);
        assert_eq!(
            engine.calls(),
            vec![EngineCall::InspectImage("alpine:latest".to_string())]
        );
    }

    #[tokio::test]
    async fn ensure_image_pulls_when_absent() {
        let engine = Arc::new(MemoryEngine::new());
        let manager = SessionManager::new(engine.clone());
        assert_ok!(manager.ensure_image("busybox").await);
        assert_eq!(engine.count(EngineVerb::PullImage), 1);
    }

    #[tokio::test]
    async fn ensure_image_surfaces_pull_failure() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_on(EngineVerb::PullImage);
        let manager = SessionManager::new(engine.clone());
        let err = manager.ensure_image("busybox").await.unwrap_err();
        assert!(err.to_string().contains("pull_image"));
    }

    #[tokio::test]
    async fn remove_twice_reports_error_the_second_time() {
        let engine = Arc::new(MemoryEngine::new());
        let manager = SessionManager::new(engine.clone());
        let id = manager.create(&new_container_config([], [])).await.unwrap();
        assert_ok!(manager.remove(&id).await);
        assert!(manager.remove(&id).await.is_err());
    }

    #[tokio::test]
    async fn create_surfaces_engine_error() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_on(EngineVerb::Create);
        let manager = SessionManager::new(engine);
        let err = manager
            .create(&new_container_config([], []))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Operation { operation: "create_container", .. }));
    }
}
