//! Bidirectional relay between the browser socket and the container.
//!
//! Two pumps run as separate tasks for the life of a session:
//!
//! - **downstream** reads container output and writes `stdout` frames to the
//!   browser, byte for byte and in order;
//! - **upstream** reads browser frames, writes `stdin` payloads to the
//!   container and turns `resize` frames into engine resize calls.
//!
//! Either pump ending calls [`Session::terminate`], which wakes the other pump
//! so both channels close promptly and the container is removed once.

use std::sync::Arc;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use crate::engine::{ContainerIo, InputSink, OutputStream};
use crate::error::RelayError;
use crate::session::message::{MessageKind, RelayMessage};
use crate::session::{Session, SessionPhase};

/// Browser-facing write half.
pub trait BrowserSink: Sink<RelayMessage, Error = RelayError> + Send + Unpin + 'static {}

impl<T> BrowserSink for T where T: Sink<RelayMessage, Error = RelayError> + Send + Unpin + 'static {}

/// Browser-facing read half. Ends when the browser closes the socket.
pub trait BrowserStream:
    Stream<Item = Result<RelayMessage, RelayError>> + Send + Unpin + 'static
{
}

impl<T> BrowserStream for T where
    T: Stream<Item = Result<RelayMessage, RelayError>> + Send + Unpin + 'static
{
}

/// Run both pumps until the session ends. Returns once both have stopped.
pub async fn run<Tx, Rx>(session: Arc<Session>, io: ContainerIo, browser_tx: Tx, browser_rx: Rx)
where
    Tx: BrowserSink,
    Rx: BrowserStream,
{
    session.advance(SessionPhase::Streaming);
    tracing::debug!(
        container = %session.container_id(),
        profile = %session.profile(),
        "Relay started"
    );
    let ContainerIo { output, input } = io;

    let downstream = tokio::spawn(
        pump_downstream(Arc::clone(&session), output, browser_tx).in_current_span(),
    );
    let upstream =
        tokio::spawn(pump_upstream(Arc::clone(&session), browser_rx, input).in_current_span());

    let (downstream, upstream) = tokio::join!(downstream, upstream);
    if let Err(e) = downstream {
        tracing::error!(container = %session.container_id(), "Downstream pump failed: {}", e);
    }
    if let Err(e) = upstream {
        tracing::error!(container = %session.container_id(), "Upstream pump failed: {}", e);
    }
}

/// Container output to browser `stdout` frames.
pub async fn pump_downstream<Tx>(session: Arc<Session>, mut output: OutputStream, mut browser_tx: Tx)
where
    Tx: BrowserSink,
{
    let mut decoder = Utf8Carry::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = session.closed() => break,
            chunk = output.next() => chunk,
        };

        match chunk {
            None => {
                tracing::warn!(container = %session.container_id(), "Container channel closed");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    container = %session.container_id(),
                    "Reading from container channel failed: {}",
                    e
                );
                break;
            }
            Some(Ok(bytes)) => {
                tracing::debug!(bytes = bytes.len(), "Received from container channel");
                let text = decoder.decode(&bytes);
                if text.is_empty() {
                    continue;
                }
                if let Err(e) = browser_tx.send(RelayMessage::stdout(text)).await {
                    tracing::warn!(
                        container = %session.container_id(),
                        "Browser channel rejected write: {}",
                        e
                    );
                    break;
                }
            }
        }
    }

    let tail = decoder.finish();
    if !tail.is_empty() && !session.is_closing() {
        if let Err(e) = browser_tx.send(RelayMessage::stdout(tail)).await {
            tracing::debug!("Flushing trailing output to browser: {}", e);
        }
    }
    if let Err(e) = browser_tx.close().await {
        tracing::debug!("Closing browser channel: {}", e);
    }
    session.terminate("container").await;
}

/// Browser frames to container stdin and engine resize calls.
pub async fn pump_upstream<Rx>(session: Arc<Session>, mut browser_rx: Rx, mut stdin: InputSink)
where
    Rx: BrowserStream,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = session.closed() => break,
            frame = browser_rx.next() => frame,
        };

        let message = match frame {
            None => {
                tracing::warn!(container = %session.container_id(), "Browser channel closed");
                break;
            }
            Some(Err(RelayError::Decode(e))) => {
                tracing::warn!("Ignoring malformed frame from browser: {}", e);
                continue;
            }
            Some(Err(e)) => {
                tracing::warn!(
                    container = %session.container_id(),
                    "Reading from browser channel failed: {}",
                    e
                );
                break;
            }
            Some(Ok(message)) => message,
        };

        match message.kind {
            MessageKind::Stdin => {
                if message.data.is_empty() {
                    continue;
                }
                if let Err(e) = write_stdin(&mut stdin, message.data.as_bytes()).await {
                    tracing::warn!(
                        container = %session.container_id(),
                        "Container channel rejected write: {}",
                        e
                    );
                    break;
                }
                tracing::debug!(bytes = message.data.len(), "Wrote to container channel");
            }
            MessageKind::Resize => resize(&session, &message).await,
            MessageKind::Stdout | MessageKind::Unsupported => {
                tracing::warn!(kind = ?message.kind, "Got unsupported message type from browser");
            }
        }
    }

    if let Err(e) = stdin.shutdown().await {
        tracing::debug!("Closing container stdin: {}", e);
    }
    session.terminate("browser").await;
}

async fn write_stdin(stdin: &mut InputSink, data: &[u8]) -> std::io::Result<()> {
    stdin.write_all(data).await?;
    stdin.flush().await
}

/// Resize failures leave the shell usable, so they are logged and dropped.
async fn resize(session: &Session, message: &RelayMessage) {
    let (Some(height), Some(width)) = (message.height, message.width) else {
        tracing::warn!("Resize frame without dimensions");
        return;
    };
    if let Err(e) = session
        .manager()
        .resize(session.container_id(), height, width)
        .await
    {
        tracing::error!(
            container = %session.container_id(),
            "resize container to height -> {}, width: {} failed: {}",
            height,
            width,
            e
        );
    }
}

/// Decodes container output as UTF-8 without splitting a character across
/// frames: an incomplete sequence at the end of a chunk is held back until
/// the next chunk completes it. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Truncated sequence: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures::channel::mpsc;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::engine::{AttachedContainer, EngineCall, EngineVerb, MemoryEngine};
    use crate::session::SessionManager;
    use crate::session::config::new_container_config;

    struct Browser {
        to_server: mpsc::UnboundedSender<Result<RelayMessage, RelayError>>,
        from_server: mpsc::UnboundedReceiver<RelayMessage>,
    }

    fn browser() -> (Browser, impl BrowserSink, impl BrowserStream) {
        let (to_server, server_rx) = mpsc::unbounded();
        let (server_tx, from_server) = mpsc::unbounded();
        let server_tx = server_tx.sink_map_err(|e| RelayError::Transport(e.to_string()));
        (
            Browser {
                to_server,
                from_server,
            },
            server_tx,
            server_rx,
        )
    }

    async fn live_session(
        engine: &Arc<MemoryEngine>,
    ) -> (Arc<Session>, ContainerIo, AttachedContainer) {
        let manager = SessionManager::new(engine.clone());
        let id = manager.create(&new_container_config([], [])).await.unwrap();
        let io = manager.attach(&id).await.unwrap();
        manager.start(&id).await.unwrap();
        let far = engine.next_attached().await.unwrap();
        (Arc::new(Session::new(id, manager, "default-docker")), io, far)
    }

    #[tokio::test]
    async fn container_output_is_relayed_byte_for_byte() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, far) = live_session(&engine).await;
        let (mut client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        let chunks = ["total 0\n", "a", "b\r\n", "\u{1b}[0m/ # ", "ünïcode\n"];
        for chunk in chunks {
            far.output.send(Ok(Bytes::from(chunk))).unwrap();
        }
        for chunk in chunks {
            assert_eq!(
                client.from_server.next().await.unwrap(),
                RelayMessage::stdout(chunk)
            );
        }

        drop(client.to_server);
        relay.await.unwrap();
        assert_eq!(engine.count(EngineVerb::Remove), 1);
        assert_eq!(session.phase(), SessionPhase::Removed);
        assert!(client.from_server.next().await.is_none());
    }

    #[tokio::test]
    async fn stdin_is_forwarded_verbatim() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, mut far) = live_session(&engine).await;
        let (mut client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        client.to_server.unbounded_send(Ok(RelayMessage::stdin(""))).unwrap();
        client
            .to_server
            .unbounded_send(Ok(RelayMessage::stdin("ls\n")))
            .unwrap();
        let mut buf = [0u8; 3];
        far.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        // Container exits: the relay closes the browser side and removes once.
        drop(far.output);
        relay.await.unwrap();
        assert!(client.from_server.next().await.is_none());
        assert_eq!(engine.count(EngineVerb::Remove), 1);
    }

    #[tokio::test]
    async fn resize_calls_engine_without_data_traffic() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, mut far) = live_session(&engine).await;
        let (mut client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        client
            .to_server
            .unbounded_send(Ok(RelayMessage::resize(40, 120)))
            .unwrap();
        drop(client.to_server);
        relay.await.unwrap();

        let resizes: Vec<EngineCall> = engine
            .calls()
            .into_iter()
            .filter(|call| call.verb() == EngineVerb::Resize)
            .collect();
        assert_eq!(
            resizes,
            vec![EngineCall::Resize {
                id: session.container_id().to_string(),
                height: 40,
                width: 120,
            }]
        );

        let mut typed = Vec::new();
        far.stdin.read_to_end(&mut typed).await.unwrap();
        assert!(typed.is_empty());
        assert!(client.from_server.next().await.is_none());
    }

    #[tokio::test]
    async fn resize_failure_keeps_session_alive() {
        let engine = Arc::new(MemoryEngine::new());
        engine.fail_on(EngineVerb::Resize);
        let (session, io, mut far) = live_session(&engine).await;
        let (client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        client
            .to_server
            .unbounded_send(Ok(RelayMessage::resize(24, 80)))
            .unwrap();
        client
            .to_server
            .unbounded_send(Ok(RelayMessage::stdin("id\n")))
            .unwrap();
        let mut buf = [0u8; 3];
        far.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"id\n");
        assert_eq!(session.phase(), SessionPhase::Streaming);

        drop(client);
        relay.await.unwrap();
        assert_eq!(engine.count(EngineVerb::Remove), 1);
    }

    #[tokio::test]
    async fn unsupported_and_malformed_frames_are_skipped() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, mut far) = live_session(&engine).await;
        let (client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        let bogus = RelayMessage::from_json(r#"{"type":"ping","data":"x"}"#).unwrap();
        let malformed = RelayMessage::from_json("{").unwrap_err();
        client.to_server.unbounded_send(Ok(bogus)).unwrap();
        client
            .to_server
            .unbounded_send(Err(RelayError::Decode(malformed)))
            .unwrap();
        client
            .to_server
            .unbounded_send(Ok(RelayMessage::stdout("echo")))
            .unwrap();
        client
            .to_server
            .unbounded_send(Ok(RelayMessage::stdin("pwd\n")))
            .unwrap();

        let mut buf = [0u8; 4];
        far.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pwd\n");

        drop(client);
        relay.await.unwrap();
        assert_eq!(engine.count(EngineVerb::Remove), 1);
    }

    #[tokio::test]
    async fn transport_error_ends_session() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, _far) = live_session(&engine).await;
        let (client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        client
            .to_server
            .unbounded_send(Err(RelayError::Transport("connection reset".to_string())))
            .unwrap();
        relay.await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Removed);
        assert_eq!(engine.count(EngineVerb::Remove), 1);
    }

    #[tokio::test]
    async fn rejected_browser_write_ends_session() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, far) = live_session(&engine).await;
        let (client, tx, rx) = browser();
        let Browser {
            to_server,
            from_server,
        } = client;
        drop(from_server);
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        far.output.send(Ok(Bytes::from_static(b"hello\n"))).unwrap();
        relay.await.unwrap();
        assert_eq!(engine.count(EngineVerb::Remove), 1);
        drop(to_server);
    }

    #[tokio::test]
    async fn truncated_output_is_flushed_on_container_exit() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, far) = live_session(&engine).await;
        let (mut client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        far.output.send(Ok(Bytes::from_static(b"ok\xe2\x82"))).unwrap();
        drop(far.output);

        assert_eq!(client.from_server.next().await.unwrap(), RelayMessage::stdout("ok"));
        assert_eq!(
            client.from_server.next().await.unwrap(),
            RelayMessage::stdout("\u{fffd}")
        );
        assert!(client.from_server.next().await.is_none());
        relay.await.unwrap();
        assert_eq!(engine.count(EngineVerb::Remove), 1);
    }

    #[tokio::test]
    async fn rejected_trailing_flush_still_removes_once() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, far) = live_session(&engine).await;
        let (client, tx, rx) = browser();
        let Browser {
            to_server,
            from_server,
        } = client;
        drop(from_server);
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        // Held back as an incomplete character, so only the final flush writes.
        far.output.send(Ok(Bytes::from_static(b"\xe2"))).unwrap();
        drop(far.output);

        relay.await.unwrap();
        assert_eq!(session.phase(), SessionPhase::Removed);
        assert_eq!(engine.count(EngineVerb::Remove), 1);
        drop(to_server);
    }

    #[tokio::test]
    async fn both_sides_closing_removes_once() {
        let engine = Arc::new(MemoryEngine::new());
        let (session, io, far) = live_session(&engine).await;
        let (client, tx, rx) = browser();
        let relay = tokio::spawn(run(Arc::clone(&session), io, tx, rx));

        drop(far);
        drop(client);
        relay.await.unwrap();
        session.terminate("endpoint").await;
        assert_eq!(engine.count(EngineVerb::Remove), 1);
        assert!(engine.live_containers().is_empty());
    }

    #[test]
    fn utf8_carry_joins_split_characters() {
        let mut decoder = Utf8Carry::default();
        let bytes = "é".as_bytes();
        assert_eq!(decoder.decode(&bytes[..1]), "");
        assert_eq!(decoder.decode(&bytes[1..]), "é");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn utf8_carry_replaces_invalid_bytes() {
        let mut decoder = Utf8Carry::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{fffd}b");
        assert_eq!(decoder.decode(b"\xe2\x82"), "");
        assert_eq!(decoder.finish(), "\u{fffd}");
    }
}
