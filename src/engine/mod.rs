//! Container engine abstraction.
//!
//! The engine performs the actual isolation; this crate only drives it through
//! a small verb set (inspect, pull, create, attach, start, resize, remove,
//! info). [`DockerEngine`] talks to a Docker daemon through bollard,
//! [`MemoryEngine`] is an in-process stand-in that records every call.
//!
//! ```text
//!                 ┌──────────────┐
//!  userns=enabled │  EnginePool  │ otherwise
//!        ┌────────┤              ├────────┐
//!        ▼        └──────────────┘        ▼
//!  namespaced engine              standard engine
//! ```

pub mod docker;
pub mod memory;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::Stream;
use tokio::io::AsyncWrite;

pub use docker::{DockerEngine, EngineEndpoint, TlsMaterial};
pub use memory::{AttachedContainer, EngineCall, EngineVerb, MemoryEngine};

use crate::error::EngineError;
use crate::session::config::ContainerConfig;

/// Container output, in the order the engine produced it.
pub type OutputStream = Pin<Box<dyn Stream<Item = Result<Bytes, EngineError>> + Send>>;

/// Container stdin.
pub type InputSink = Pin<Box<dyn AsyncWrite + Send>>;

/// The container-facing duplex channel returned by attach.
pub struct ContainerIo {
    pub output: OutputStream,
    pub input: InputSink,
}

impl std::fmt::Debug for ContainerIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerIo").finish_non_exhaustive()
    }
}

/// One status line from an image pull.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub id: Option<String>,
    pub status: String,
    pub progress: Option<String>,
}

/// The engine verb set.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> &str;

    /// Daemon information as JSON.
    async fn info(&self) -> Result<serde_json::Value, EngineError>;

    /// Whether `image` is present locally.
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Pull `image`, yielding progress until the pull completes or fails.
    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, EngineError>>;

    /// Create a container and return its id.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError>;

    /// Open the container's raw I/O channel.
    async fn attach_container(&self, id: &str) -> Result<ContainerIo, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    async fn resize_container(&self, id: &str, height: u16, width: u16)
    -> Result<(), EngineError>;

    /// Force-remove a container and its volumes.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}

/// The two engine endpoints sessions can run against. Cheap to clone; every
/// session shares the same underlying clients.
#[derive(Clone)]
pub struct EnginePool {
    standard: Arc<dyn ContainerEngine>,
    namespaced: Arc<dyn ContainerEngine>,
}

impl EnginePool {
    pub fn new(standard: Arc<dyn ContainerEngine>, namespaced: Arc<dyn ContainerEngine>) -> Self {
        Self {
            standard,
            namespaced,
        }
    }

    /// Pick the user-namespaced engine when `userns` is set.
    pub fn select(&self, userns: bool) -> Arc<dyn ContainerEngine> {
        if userns {
            Arc::clone(&self.namespaced)
        } else {
            Arc::clone(&self.standard)
        }
    }

    pub fn standard(&self) -> &Arc<dyn ContainerEngine> {
        &self.standard
    }

    pub fn namespaced(&self) -> &Arc<dyn ContainerEngine> {
        &self.namespaced
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_selects_by_userns_flag() {
        let standard = Arc::new(MemoryEngine::with_endpoint("memory://standard"));
        let namespaced = Arc::new(MemoryEngine::with_endpoint("memory://userns"));
        let pool = EnginePool::new(standard, namespaced);

        assert_eq!(pool.select(false).endpoint(), "memory://standard");
        assert_eq!(pool.select(true).endpoint(), "memory://userns");
        assert_eq!(pool.standard().endpoint(), "memory://standard");
        assert_eq!(pool.namespaced().endpoint(), "memory://userns");
    }
}
