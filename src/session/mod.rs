//! Interactive container sessions.
//!
//! A session is one shell in one container, relayed to one browser socket.
//!
//! ```text
//! SessionEndpoint ──▶ SessionRequest::parse ──▶ config::build
//!        │
//!        ▼
//! SessionManager: ensure_image ─▶ create ─▶ attach ─▶ start
//!        │
//!        ▼
//! relay::run ── downstream pump (container ─▶ browser)
//!           └── upstream pump   (browser ─▶ container, resize)
//!        │
//!        ▼
//! Session::terminate ──▶ SessionManager::remove   (exactly once)
//! ```
//!
//! On server shutdown the [`SessionTracker`] signals every live session to
//! terminate and waits for the removals.
//!
//! Sessions never share state. Everything a session needs is owned by the
//! endpoint invocation that created it and by its two pumps.

pub mod config;
mod endpoint;
pub mod manager;
pub mod message;
pub mod relay;
pub mod request;
pub mod tracker;

use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;

pub use endpoint::{SessionEndpoint, SessionOutcome};
pub use manager::SessionManager;
pub use message::{MessageKind, RelayMessage};
pub use request::{HostPort, PORT_RANGE, ProfileQuery, SessionRequest, validate_port};
pub use tracker::{SessionGuard, SessionTracker};

/// Lifecycle of a session. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionPhase {
    Created = 0,
    Started = 1,
    Streaming = 2,
    Terminating = 3,
    Removed = 4,
}

impl SessionPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionPhase::Created,
            1 => SessionPhase::Started,
            2 => SessionPhase::Streaming,
            3 => SessionPhase::Terminating,
            _ => SessionPhase::Removed,
        }
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionPhase::Created => write!(f, "created"),
            SessionPhase::Started => write!(f, "started"),
            SessionPhase::Streaming => write!(f, "streaming"),
            SessionPhase::Terminating => write!(f, "terminating"),
            SessionPhase::Removed => write!(f, "removed"),
        }
    }
}

/// A live session, shared by its endpoint and its two pumps.
///
/// [`terminate`](Self::terminate) is the single-fire guard: whichever caller
/// gets there first closes both channels and removes the container; every
/// later call only observes.
pub struct Session {
    container_id: String,
    profile: String,
    manager: SessionManager,
    phase: AtomicU8,
    closing: watch::Sender<bool>,
}

impl Session {
    pub fn new(
        container_id: impl Into<String>,
        manager: SessionManager,
        profile: impl Into<String>,
    ) -> Self {
        let (closing, _) = watch::channel(false);
        Self {
            container_id: container_id.into(),
            profile: profile.into(),
            manager,
            phase: AtomicU8::new(SessionPhase::Created as u8),
            closing,
        }
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub fn phase(&self) -> SessionPhase {
        SessionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Move forward to `next` unless termination has already begun.
    pub(crate) fn advance(&self, next: SessionPhase) {
        let _ = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < next as u8 && current < SessionPhase::Terminating as u8)
                    .then_some(next as u8)
            });
    }

    pub fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Resolves once termination has begun.
    pub async fn closed(&self) {
        let mut rx = self.closing.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    /// Close both channels and remove the container, once.
    ///
    /// Returns `true` for the call that performed the removal.
    pub async fn terminate(&self, origin: &str) -> bool {
        self.closing.send_replace(true);

        let claimed = self
            .phase
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < SessionPhase::Terminating as u8)
                    .then_some(SessionPhase::Terminating as u8)
            })
            .is_ok();
        if !claimed {
            tracing::debug!(
                container = %self.container_id,
                origin,
                "Session already terminating"
            );
            return false;
        }

        tracing::info!(container = %self.container_id, origin, "Terminating session");
        if let Err(e) = self.manager.remove(&self.container_id).await {
            tracing::error!(
                container = %self.container_id,
                "removing container {} failed: {}",
                self.container_id,
                e
            );
        }
        self.phase
            .store(SessionPhase::Removed as u8, Ordering::Release);
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("container_id", &self.container_id)
            .field("profile", &self.profile)
            .field("endpoint", &self.manager.endpoint())
            .field("phase", &self.phase())
            .finish()
    }
}
