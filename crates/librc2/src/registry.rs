//! Workspace id to live session, with admission and idle reaping.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use rc2_protocol::model::UserId;
use rc2_protocol::{SessionError, Workspace, WorkspaceId};

use crate::dao::Rc2Dao;
use crate::session::{Session, SessionConfig};
use crate::socket::ClientSocket;

/// Longest pause between reaper passes.
pub const MAX_REAP_INTERVAL: Duration = Duration::from_secs(5);

/// Shortest pause between reaper passes.
pub const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Attempts to attach to a session that was reaped between lookup and attach.
const ATTACH_ATTEMPTS: usize = 3;

type Slot = Arc<OnceCell<Arc<Session>>>;

#[derive(Default)]
struct Sessions {
    slots: HashMap<WorkspaceId, Slot>,
    reaper_running: bool,
}

/// A client admitted to a session.
pub struct Admission {
    pub session: Arc<Session>,
    pub socket: Arc<ClientSocket>,
    /// Encoded responses for the client, in order.
    pub outbound: mpsc::Receiver<Bytes>,
}

pub struct SessionRegistry {
    dao: Arc<dyn Rc2Dao>,
    config: SessionConfig,
    reap_delay: Duration,
    sessions: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new(dao: Arc<dyn Rc2Dao>, config: SessionConfig, reap_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            dao,
            config,
            reap_delay,
            sessions: Mutex::new(Sessions::default()),
        })
    }

    pub fn reap_interval(&self) -> Duration {
        self.reap_delay.clamp(MIN_REAP_INTERVAL, MAX_REAP_INTERVAL)
    }

    /// Check that `user_id` may open `wspace_id`, then attach a new client to
    /// the workspace's session, starting the session if needed.
    pub async fn admit(
        self: &Arc<Self>,
        user_id: Option<UserId>,
        wspace_id: &str,
    ) -> Result<Admission, SessionError> {
        let user_id = user_id.ok_or(SessionError::PermissionDenied)?;
        let wspace_id: WorkspaceId = wspace_id
            .trim()
            .parse()
            .map_err(|_| SessionError::InvalidRequest)?;
        let workspace = self
            .dao
            .get_workspace(wspace_id)
            .await?
            .ok_or(SessionError::InvalidRequest)?;
        if workspace.user_id != user_id {
            warn!(user_id, wspace_id, "workspace not owned by user");
            return Err(SessionError::PermissionDenied);
        }
        let user = self
            .dao
            .get_user(user_id)
            .await?
            .ok_or(SessionError::PermissionDenied)?;

        let (socket, outbound) = ClientSocket::new(user, wspace_id);
        for _ in 0..ATTACH_ATTEMPTS {
            let session = self.session_for(&workspace).await?;
            match session.add_client(socket.clone()).await {
                Ok(()) => {
                    return Ok(Admission {
                        session,
                        socket,
                        outbound,
                    });
                }
                Err(closed) => {
                    debug!(wspace_id, error = %closed, "session closed during admission, retrying");
                    self.discard(wspace_id, &session).await;
                }
            }
        }
        Err(SessionError::FailedToConnectToCompute)
    }

    /// The running session for a workspace, starting one if there is none.
    /// Concurrent callers for the same workspace share a single start. A
    /// session whose compute connection has failed is shut down and replaced.
    async fn session_for(self: &Arc<Self>, workspace: &Workspace) -> Result<Arc<Session>, SessionError> {
        let wspace_id = workspace.id;
        loop {
            let slot = {
                let mut sessions = self.sessions.lock().await;
                sessions.slots.entry(wspace_id).or_default().clone()
            };
            if let Some(dead) = slot.get().filter(|s| s.compute_state().is_terminal()) {
                info!(
                    wspace_id,
                    session_id = dead.session_id(),
                    state = ?dead.compute_state(),
                    "replacing session with failed compute connection"
                );
                self.discard(wspace_id, dead).await;
                dead.shutdown().await;
                continue;
            }
            let started = slot
                .get_or_try_init(|| Session::start(workspace.clone(), self.dao.clone(), &self.config))
                .await
                .cloned();
            return match started {
                Ok(session) => {
                    self.ensure_reaper().await;
                    Ok(session)
                }
                Err(e) => {
                    warn!(wspace_id, error = %e, "session failed to start");
                    let mut sessions = self.sessions.lock().await;
                    let same_slot = sessions
                        .slots
                        .get(&wspace_id)
                        .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized());
                    if same_slot {
                        sessions.slots.remove(&wspace_id);
                    }
                    Err(SessionError::FailedToConnectToCompute)
                }
            };
        }
    }

    /// Drop the slot for `session` if it is still registered.
    async fn discard(&self, wspace_id: WorkspaceId, session: &Arc<Session>) {
        let mut sessions = self.sessions.lock().await;
        let registered = sessions
            .slots
            .get(&wspace_id)
            .and_then(|slot| slot.get())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if registered {
            sessions.slots.remove(&wspace_id);
        }
    }

    pub async fn session(&self, wspace_id: WorkspaceId) -> Option<Arc<Session>> {
        let sessions = self.sessions.lock().await;
        sessions.slots.get(&wspace_id)?.get().cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn reaper_running(&self) -> bool {
        self.sessions.lock().await.reaper_running
    }

    async fn ensure_reaper(self: &Arc<Self>) {
        let mut sessions = self.sessions.lock().await;
        if sessions.reaper_running {
            return;
        }
        sessions.reaper_running = true;
        let interval = self.reap_interval();
        debug!(?interval, "starting session reaper");
        tokio::spawn(reap_loop(Arc::downgrade(self), interval));
    }

    /// Shut down every session idle for at least the reap delay, and every
    /// session whose compute connection has failed. Returns the number
    /// removed.
    pub async fn reap_idle(&self) -> usize {
        self.reap_pass().await.0
    }

    /// One reaper pass. The flag is true when nothing is left, in which case
    /// the reaper has been marked stopped.
    async fn reap_pass(&self) -> (usize, bool) {
        let now = Instant::now();
        let (reaped, empty) = {
            let mut sessions = self.sessions.lock().await;
            let mut expired = Vec::new();
            for (wspace_id, slot) in &sessions.slots {
                if let Some(session) = slot.get() {
                    if session.compute_state().is_terminal()
                        || session.close_if_idle(self.reap_delay, now).await
                    {
                        expired.push((*wspace_id, session.clone()));
                    }
                }
            }
            for (wspace_id, _) in &expired {
                sessions.slots.remove(wspace_id);
            }
            let empty = sessions.slots.is_empty();
            if empty {
                sessions.reaper_running = false;
            }
            (expired, empty)
        };
        for (wspace_id, session) in &reaped {
            info!(
                wspace_id,
                session_id = session.session_id(),
                state = ?session.compute_state(),
                "reaping session"
            );
            session.shutdown().await;
        }
        (reaped.len(), empty)
    }

    /// Shut down every session, for process exit.
    pub async fn shutdown_all(&self) {
        let drained: Vec<Slot> = {
            let mut sessions = self.sessions.lock().await;
            sessions.reaper_running = false;
            sessions.slots.drain().map(|(_, slot)| slot).collect()
        };
        info!(count = drained.len(), "shutting down sessions");
        for slot in drained {
            if let Some(session) = slot.get() {
                session.shutdown().await;
            }
        }
    }
}

async fn reap_loop(registry: Weak<SessionRegistry>, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            return;
        };
        let (_, empty) = registry.reap_pass().await;
        if empty {
            debug!("no sessions left, reaper exiting");
            return;
        }
    }
}
