//! In-process container engine.
//!
//! Records every verb invocation and hands the test side of each attached
//! container back through [`MemoryEngine::next_attached`], so sessions can be
//! driven end to end without a daemon. Failures can be injected per verb.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::{ContainerEngine, ContainerIo, PullProgress};
use crate::error::EngineError;
use crate::session::config::ContainerConfig;

const STDIN_BUFFER: usize = 64 * 1024;

/// Engine verbs, for failure injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineVerb {
    Info,
    InspectImage,
    PullImage,
    Create,
    Attach,
    Start,
    Resize,
    Remove,
}

impl EngineVerb {
    fn operation(self) -> &'static str {
        match self {
            EngineVerb::Info => "info",
            EngineVerb::InspectImage => "inspect_image",
            EngineVerb::PullImage => "pull_image",
            EngineVerb::Create => "create_container",
            EngineVerb::Attach => "attach_container",
            EngineVerb::Start => "start_container",
            EngineVerb::Resize => "resize_container",
            EngineVerb::Remove => "remove_container",
        }
    }
}

/// A recorded engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Info,
    InspectImage(String),
    PullImage(String),
    Create(Box<ContainerConfig>),
    Attach(String),
    Start(String),
    Resize { id: String, height: u16, width: u16 },
    Remove(String),
}

impl EngineCall {
    pub fn verb(&self) -> EngineVerb {
        match self {
            EngineCall::Info => EngineVerb::Info,
            EngineCall::InspectImage(_) => EngineVerb::InspectImage,
            EngineCall::PullImage(_) => EngineVerb::PullImage,
            EngineCall::Create(_) => EngineVerb::Create,
            EngineCall::Attach(_) => EngineVerb::Attach,
            EngineCall::Start(_) => EngineVerb::Start,
            EngineCall::Resize { .. } => EngineVerb::Resize,
            EngineCall::Remove(_) => EngineVerb::Remove,
        }
    }
}

/// The far side of an attached container: write to `output` to emit
/// container output, read `stdin` to see what the session typed.
pub struct AttachedContainer {
    pub id: String,
    pub output: mpsc::UnboundedSender<Result<Bytes, EngineError>>,
    pub stdin: DuplexStream,
}

#[derive(Default)]
struct MemoryState {
    calls: Vec<EngineCall>,
    images: HashSet<String>,
    containers: HashSet<String>,
    failing: HashSet<EngineVerb>,
    next_id: u64,
}

pub struct MemoryEngine {
    endpoint: String,
    state: Mutex<MemoryState>,
    attached_tx: mpsc::UnboundedSender<AttachedContainer>,
    attached_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AttachedContainer>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_endpoint("memory://")
    }

    pub fn with_endpoint(endpoint: impl Into<String>) -> Self {
        let (attached_tx, attached_rx) = mpsc::unbounded_channel();
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(MemoryState::default()),
            attached_tx,
            attached_rx: tokio::sync::Mutex::new(attached_rx),
        }
    }

    /// Mark `image` as already present.
    pub fn with_image(self, image: &str) -> Self {
        self.state().images.insert(image.to_string());
        self
    }

    /// Make every later call of `verb` fail.
    pub fn fail_on(&self, verb: EngineVerb) {
        self.state().failing.insert(verb);
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, verb: EngineVerb) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.verb() == verb)
            .count()
    }

    /// Containers created and not yet removed.
    pub fn live_containers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state().containers.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Wait for the next container to be attached.
    pub async fn next_attached(&self) -> Option<AttachedContainer> {
        self.attached_rx.lock().await.recv().await
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `call` and return the injected failure for its verb, if any.
    fn record(&self, call: EngineCall, target: &str) -> Result<(), EngineError> {
        let verb = call.verb();
        let mut state = self.state();
        state.calls.push(call);
        if state.failing.contains(&verb) {
            return Err(EngineError::operation(
                verb.operation(),
                target,
                "injected failure",
            ));
        }
        Ok(())
    }

    fn ensure_container(&self, id: &str) -> Result<(), EngineError> {
        if self.state().containers.contains(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                what: format!("container: {id}"),
            })
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn info(&self) -> Result<serde_json::Value, EngineError> {
        self.record(EngineCall::Info, &self.endpoint)?;
        let state = self.state();
        Ok(serde_json::json!({
            "Name": self.endpoint,
            "Containers": state.containers.len(),
            "Images": state.images.len(),
        }))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.record(EngineCall::InspectImage(image.to_string()), image)?;
        Ok(self.state().images.contains(image))
    }

    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, EngineError>> {
        if let Err(e) = self.record(EngineCall::PullImage(image.to_string()), image) {
            return stream::once(async move { Err(e) }).boxed();
        }
        self.state().images.insert(image.to_string());

        let progress = vec![
            Ok(PullProgress {
                id: None,
                status: format!("Pulling from {image}"),
                progress: None,
            }),
            Ok(PullProgress {
                id: None,
                status: format!("Status: Downloaded newer image for {image}"),
                progress: None,
            }),
        ];
        stream::iter(progress).boxed()
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        self.record(EngineCall::Create(Box::new(config.clone())), &config.image)?;
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("{:012x}", state.next_id);
        state.containers.insert(id.clone());
        Ok(id)
    }

    async fn attach_container(&self, id: &str) -> Result<ContainerIo, EngineError> {
        self.record(EngineCall::Attach(id.to_string()), id)?;
        self.ensure_container(id)?;

        let (input, stdin) = tokio::io::duplex(STDIN_BUFFER);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let output = stream::unfold(output_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let _ = self.attached_tx.send(AttachedContainer {
            id: id.to_string(),
            output: output_tx,
            stdin,
        });

        Ok(ContainerIo {
            output: Box::pin(output),
            input: Box::pin(input),
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Start(id.to_string()), id)?;
        self.ensure_container(id)
    }

    async fn resize_container(
        &self,
        id: &str,
        height: u16,
        width: u16,
    ) -> Result<(), EngineError> {
        self.record(
            EngineCall::Resize {
                id: id.to_string(),
                height,
                width,
            },
            id,
        )?;
        self.ensure_container(id)
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Remove(id.to_string()), id)?;
        if self.state().containers.remove(id) {
            Ok(())
        } else {
            Err(EngineError::NotFound {
                what: format!("container: {id}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::session::config::new_container_config;

    #[tokio::test]
    async fn records_calls_in_order() {
        let engine = MemoryEngine::new();
        let id = engine
            .create_container(&new_container_config([], []))
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        engine.remove_container(&id).await.unwrap();

        let verbs: Vec<EngineVerb> = engine.calls().iter().map(EngineCall::verb).collect();
        assert_eq!(
            verbs,
            vec![EngineVerb::Create, EngineVerb::Start, EngineVerb::Remove]
        );
        assert!(engine.live_containers().is_empty());
    }

    #[tokio::test]
    async fn second_remove_is_not_found() {
        let engine = MemoryEngine::new();
        let id = engine
            .create_container(&new_container_config([], []))
            .await
            .unwrap();
        engine.remove_container(&id).await.unwrap();
        let err = engine.remove_container(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
        assert_eq!(engine.count(EngineVerb::Remove), 2);
    }

    #[tokio::test]
    async fn injected_failure_is_reported() {
        let engine = MemoryEngine::new();
        engine.fail_on(EngineVerb::Create);
        let err = engine
            .create_container(&new_container_config([], []))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("create_container"));
        assert!(engine.live_containers().is_empty());
    }

    #[tokio::test]
    async fn pull_makes_image_present() {
        let engine = MemoryEngine::new();
        assert!(!engine.image_exists("alpine:latest").await.unwrap());
        let progress: Vec<PullProgress> =
            engine.pull_image("alpine:latest").try_collect().await.unwrap();
        assert_eq!(progress.len(), 2);
        assert!(engine.image_exists("alpine:latest").await.unwrap());
    }

    #[tokio::test]
    async fn attached_container_is_a_duplex() {
        let engine = MemoryEngine::new();
        let id = engine
            .create_container(&new_container_config([], []))
            .await
            .unwrap();
        let mut io = engine.attach_container(&id).await.unwrap();
        let mut far = engine.next_attached().await.unwrap();
        assert_eq!(far.id, id);

        io.input.write_all(b"echo hi\n").await.unwrap();
        let mut buf = [0u8; 8];
        far.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"echo hi\n");

        far.output.send(Ok(Bytes::from_static(b"hi\n"))).unwrap();
        let chunk = io.output.next().await.unwrap().unwrap();
        assert_eq!(chunk, Bytes::from_static(b"hi\n"));

        drop(far);
        assert!(io.output.next().await.is_none());
    }
}
