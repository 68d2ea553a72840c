//! Per-connection session driver.

use std::sync::Arc;

use futures::SinkExt;
use tracing::Instrument;
use uuid::Uuid;

use crate::engine::{ContainerIo, EnginePool};
use crate::error::{RequestError, SessionError};
use crate::profiles::ProfileRegistry;
use crate::session::manager::SessionManager;
use crate::session::message::RelayMessage;
use crate::session::relay::{self, BrowserSink, BrowserStream};
use crate::session::request::{ProfileQuery, SessionRequest};
use crate::session::tracker::SessionTracker;
use crate::session::{Session, SessionPhase, config};

/// How a session attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The request failed validation. The engine was never called.
    Rejected,
    /// Establishment failed. A container that was created has been removed.
    Failed { container_id: Option<String> },
    /// The relay ran and the container has been removed.
    Completed { container_id: String },
}

/// Turns one browser connection into one container session.
///
/// Every failure before the relay starts is reported to the browser as a
/// single `stdout` frame, after which the browser channel is closed.
#[derive(Clone)]
pub struct SessionEndpoint {
    registry: Arc<ProfileRegistry>,
    engines: EnginePool,
    tracker: SessionTracker,
}

impl SessionEndpoint {
    pub fn new(registry: Arc<ProfileRegistry>, engines: EnginePool) -> Self {
        Self {
            registry,
            engines,
            tracker: SessionTracker::new(),
        }
    }

    /// Live sessions served by this endpoint and its clones.
    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn engines(&self) -> &EnginePool {
        &self.engines
    }

    /// Run a session for `query` over the given browser channel halves.
    /// Returns once the session is over and its container is gone.
    pub async fn serve<Tx, Rx>(&self, query: &ProfileQuery, mut tx: Tx, rx: Rx) -> SessionOutcome
    where
        Tx: BrowserSink,
        Rx: BrowserStream,
    {
        let request = match SessionRequest::parse(query, &self.registry) {
            Ok(request) => request,
            Err(e) => {
                let err = SessionError::from(e);
                tracing::warn!("{}", err);
                send_diagnostic(&mut tx, err.to_string()).await;
                return SessionOutcome::Rejected;
            }
        };

        // Membership was checked above; a missing definition here is a
        // configuration defect rather than bad input.
        let profile = match self.registry.resolve(&request.profile) {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!(profile = %request.profile, "Profile registry is inconsistent: {}", e);
                let err = SessionError::from(RequestError::from(e));
                send_diagnostic(&mut tx, err.to_string()).await;
                return SessionOutcome::Rejected;
            }
        };

        let container = config::build(&request, &profile);
        let manager = SessionManager::new(self.engines.select(request.userns));

        let span = tracing::info_span!(
            "session",
            id = %Uuid::new_v4(),
            container = tracing::field::Empty,
            profile = %request.profile,
            endpoint = %manager.endpoint(),
            userns = request.userns,
        );
        tracing::debug!(parent: &span, selinux = request.selinux, apparmor = request.apparmor, "Session requested");

        async move {
            let session = match establish(&manager, &container, &request.profile).await {
                Ok(established) => established,
                Err((err, session)) => {
                    tracing::error!("starting container failed: {}", err);
                    send_diagnostic(&mut tx, format!("starting container failed: {err}")).await;
                    let container_id = match session {
                        Some(session) => {
                            session.terminate("establish").await;
                            Some(session.container_id().to_string())
                        }
                        None => None,
                    };
                    return SessionOutcome::Failed { container_id };
                }
            };

            let (session, io) = session;
            tracing::info!("Session started");
            let relay = relay::run(Arc::clone(&session), io, tx, rx);
            tokio::pin!(relay);
            tokio::select! {
                _ = &mut relay => {}
                _ = self.tracker.stopping() => {
                    session.terminate("shutdown").await;
                    relay.await;
                }
            }
            session.terminate("session end").await;
            tracing::info!("Session ended");

            SessionOutcome::Completed {
                container_id: session.container_id().to_string(),
            }
        }
        .instrument(span)
        .await
    }
}

type Established = (Arc<Session>, ContainerIo);

/// Pull, create, attach and start. On failure after create, the session is
/// handed back so the caller can remove the container.
async fn establish(
    manager: &SessionManager,
    container: &config::ContainerConfig,
    profile: &str,
) -> Result<Established, (SessionError, Option<Arc<Session>>)> {
    manager
        .ensure_image(&container.image)
        .await
        .map_err(|source| {
            (
                SessionError::Pull {
                    image: container.image.clone(),
                    source,
                },
                None,
            )
        })?;

    let id = manager
        .create(container)
        .await
        .map_err(|e| (SessionError::Create(e), None))?;
    tracing::Span::current().record("container", id.as_str());
    let session = Arc::new(Session::new(id.clone(), manager.clone(), profile));

    let io = match manager.attach(&id).await {
        Ok(io) => io,
        Err(source) => {
            let err = SessionError::Attach {
                container: id,
                source,
            };
            return Err((err, Some(session)));
        }
    };

    if let Err(source) = manager.start(&id).await {
        let err = SessionError::Start {
            container: id,
            source,
        };
        return Err((err, Some(session)));
    }
    session.advance(SessionPhase::Started);

    Ok((session, io))
}

async fn send_diagnostic<Tx: BrowserSink>(tx: &mut Tx, text: String) {
    if let Err(e) = tx.send(RelayMessage::stdout(text)).await {
        tracing::warn!("writing error message to browser failed: {}", e);
    }
    if let Err(e) = tx.close().await {
        tracing::debug!("Closing browser channel: {}", e);
    }
}
