//! Session manager: owns every live session, its roadmap and its sender lock.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use super::model::{Session, SessionState};
use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::metrics::session as session_metrics;
use crate::store::Database;
use crate::workflow::types::{Classification, ComplianceRoadmap};

/// In-memory session table, write-through to an optional database.
///
/// Memory is authoritative. Database failures are logged and never surface
/// to the caller, except on reads that can only be answered from storage.
pub struct SessionManager {
    config: SessionConfig,
    /// Keyed by sender.
    sessions: RwLock<HashMap<String, Session>>,
    /// Keyed by session id.
    roadmaps: RwLock<HashMap<String, ComplianceRoadmap>>,
    /// Per-sender FIFO locks serializing message handling.
    locks: DashMap<String, Arc<Mutex<()>>>,
    db: Option<Arc<dyn Database>>,
}

impl SessionManager {
    /// Create a memory-only manager.
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self::build(config, None))
    }

    /// Create a manager that persists through `db`.
    pub fn with_db(config: SessionConfig, db: Arc<dyn Database>) -> Arc<Self> {
        Arc::new(Self::build(config, Some(db)))
    }

    fn build(config: SessionConfig, db: Option<Arc<dyn Database>>) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            roadmaps: RwLock::new(HashMap::new()),
            locks: DashMap::new(),
            db,
        }
    }

    /// Return the sender's live session or start a new one in `New`.
    ///
    /// A terminal or expired session is never resumed. Each call counts as
    /// one inbound message and refreshes the inactivity window.
    pub async fn create_or_get(&self, sender: &str) -> Session {
        let now = Utc::now();
        let window = self.config.inactivity_window;

        {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get_mut(sender) {
                if session.is_resumable_at(now) {
                    session.touch(window);
                    session.message_count += 1;
                    let snapshot = session.clone();
                    drop(sessions);
                    self.persist(&snapshot).await;
                    return snapshot;
                }
            }
        }

        let mut session = match self.load_live(sender).await {
            Some(restored) => {
                debug!(session_id = %restored.session_id, sender, "Session restored from storage");
                restored
            }
            None => {
                let fresh = Session::new(sender, window);
                metrics::counter!(session_metrics::CREATED_TOTAL).increment(1);
                info!(session_id = %fresh.session_id, sender, "Session created");
                fresh
            }
        };
        session.touch(window);
        session.message_count += 1;

        let active = {
            let mut sessions = self.sessions.write().await;
            sessions.insert(sender.to_string(), session.clone());
            sessions.len()
        };
        metrics::gauge!(session_metrics::ACTIVE).set(active as f64);

        self.persist(&session).await;
        session
    }

    /// Current session for a sender, if any is held in memory or storage.
    pub async fn get(&self, sender: &str) -> Option<Session> {
        if let Some(session) = self.sessions.read().await.get(sender) {
            return Some(session.clone());
        }
        self.load_live(sender).await
    }

    /// Look a session up by id, in memory first and then in storage.
    pub async fn find(&self, session_id: &str) -> Result<Option<Session>, SessionError> {
        if let Some(session) = self
            .sessions
            .read()
            .await
            .values()
            .find(|s| s.session_id == session_id)
        {
            return Ok(Some(session.clone()));
        }
        match &self.db {
            Some(db) => Ok(db.get_session(session_id).await?),
            None => Ok(None),
        }
    }

    /// Retire a session by id. Its sender's next message starts a fresh one.
    /// Returns `false` when no such session exists.
    pub async fn deactivate(&self, session_id: &str) -> Result<bool, SessionError> {
        let (removed, active) = {
            let mut sessions = self.sessions.write().await;
            let sender = sessions
                .values()
                .find(|s| s.session_id == session_id)
                .map(|s| s.sender.clone());
            let removed = sender.and_then(|sender| sessions.remove(&sender));
            (removed, sessions.len())
        };

        let retired = match removed {
            Some(session) => Some(session),
            None => match &self.db {
                Some(db) => db.get_session(session_id).await?,
                None => None,
            },
        };
        let Some(mut session) = retired else {
            return Ok(false);
        };

        session.expires_at = Utc::now();
        self.persist(&session).await;
        self.roadmaps.write().await.remove(session_id);
        metrics::gauge!(session_metrics::ACTIVE).set(active as f64);
        info!(session_id, sender = %session.sender, "Session deactivated");
        Ok(true)
    }

    /// Move the sender's session to `target`.
    ///
    /// An invalid move out of a non-terminal state resets the session to
    /// `New` and is retried once. Terminal sessions never move.
    pub async fn transition(
        &self,
        sender: &str,
        target: SessionState,
    ) -> Result<Session, SessionError> {
        let window = self.config.inactivity_window;
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(sender)
                .ok_or_else(|| SessionError::NotFound {
                    sender: sender.to_string(),
                })?;

            let from = session.state;
            if session.transition_to(target, window).is_err() {
                if from.is_terminal() {
                    return Err(SessionError::InvalidTransition {
                        session_id: session.session_id.clone(),
                        from,
                        to: target,
                    });
                }

                warn!(
                    session_id = %session.session_id,
                    %from,
                    to = %target,
                    "Invalid session transition, resetting to new"
                );
                session.state = SessionState::New;
                session.touch(window);
                if session.transition_to(target, window).is_err() {
                    let snapshot = session.clone();
                    drop(sessions);
                    self.persist(&snapshot).await;
                    return Err(SessionError::InvalidTransition {
                        session_id: snapshot.session_id,
                        from,
                        to: target,
                    });
                }
            }

            debug!(session_id = %session.session_id, %from, to = %target, "Session transitioned");
            session.clone()
        };

        self.persist(&snapshot).await;
        Ok(snapshot)
    }

    /// Store the business profile extracted by the classification stage.
    pub async fn record_classification(
        &self,
        sender: &str,
        classification: &Classification,
    ) -> Result<(), SessionError> {
        let snapshot = {
            let mut sessions = self.sessions.write().await;
            let session = sessions
                .get_mut(sender)
                .ok_or_else(|| SessionError::NotFound {
                    sender: sender.to_string(),
                })?;
            session.apply_classification(classification);
            session.touch(self.config.inactivity_window);
            session.clone()
        };
        self.persist(&snapshot).await;
        Ok(())
    }

    /// Store the run's roadmap, then move the session to `Complete`.
    ///
    /// Only a session in `Planning` can complete. The roadmap is in place
    /// before the state changes, so a `Complete` session always has one.
    pub async fn complete(
        &self,
        sender: &str,
        roadmap: ComplianceRoadmap,
    ) -> Result<Session, SessionError> {
        let session_id = roadmap.session_id().to_string();
        {
            let sessions = self.sessions.read().await;
            let current = sessions.get(sender).ok_or_else(|| SessionError::NotFound {
                sender: sender.to_string(),
            })?;
            if current.state != SessionState::Planning {
                return Err(SessionError::InvalidTransition {
                    session_id: current.session_id.clone(),
                    from: current.state,
                    to: SessionState::Complete,
                });
            }
        }

        if let Some(db) = &self.db {
            if let Err(e) = db.save_roadmap(sender, &roadmap).await {
                warn!(session_id = %session_id, error = %e, "Failed to persist roadmap");
            }
        }
        self.roadmaps
            .write()
            .await
            .insert(session_id.clone(), roadmap);

        match self.transition(sender, SessionState::Complete).await {
            Ok(session) => {
                info!(session_id = %session.session_id, sender, "Session complete");
                Ok(session)
            }
            Err(e) => {
                self.roadmaps.write().await.remove(&session_id);
                Err(e)
            }
        }
    }

    /// Roadmap of a completed session.
    pub async fn roadmap(
        &self,
        session_id: &str,
    ) -> Result<Option<ComplianceRoadmap>, SessionError> {
        if let Some(roadmap) = self.roadmaps.read().await.get(session_id) {
            return Ok(Some(roadmap.clone()));
        }
        match &self.db {
            Some(db) => Ok(db.get_roadmap(session_id).await?),
            None => Ok(None),
        }
    }

    /// Drop whatever the sender had going and start over in `New`.
    pub async fn reset(&self, sender: &str) -> Session {
        let window = self.config.inactivity_window;
        let mut fresh = Session::new(sender, window);
        fresh.message_count = 1;

        let previous = self
            .sessions
            .write()
            .await
            .insert(sender.to_string(), fresh.clone());

        let previous = match previous {
            Some(old) => Some(old),
            None => self.load_live(sender).await,
        };
        if let Some(mut old) = previous {
            old.expires_at = Utc::now();
            self.persist(&old).await;
            debug!(session_id = %old.session_id, sender, "Previous session retired");
        }

        metrics::counter!(session_metrics::CREATED_TOTAL).increment(1);
        info!(session_id = %fresh.session_id, sender, "Session reset");
        self.persist(&fresh).await;
        fresh
    }

    /// Acquire the sender's lock. Waiters are served in arrival order.
    pub async fn lock_sender(&self, sender: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(sender.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Remove sessions idle past the inactivity window. Returns how many went.
    pub async fn sweep(&self) -> usize {
        let now = Utc::now();

        let (expired, active) = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<Session> = sessions
                .values()
                .filter(|s| s.is_expired_at(now))
                .cloned()
                .collect();
            for session in &expired {
                sessions.remove(&session.sender);
            }
            (expired, sessions.len())
        };

        if !expired.is_empty() {
            let mut roadmaps = self.roadmaps.write().await;
            for session in &expired {
                roadmaps.remove(&session.session_id);
            }
        }

        // A lock held only by the map has no waiters.
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        if let Some(db) = &self.db {
            if let Err(e) = db.delete_expired_sessions(now).await {
                warn!(error = %e, "Failed to delete expired sessions");
            }
        }

        let count = expired.len();
        metrics::gauge!(session_metrics::ACTIVE).set(active as f64);
        if count > 0 {
            metrics::counter!(session_metrics::EXPIRED_TOTAL).increment(count as u64);
            info!(count, "Expired idle sessions");
        }
        count
    }

    /// Write every in-memory session to storage. Returns how many were written.
    pub async fn flush(&self) -> usize {
        let Some(db) = &self.db else {
            return 0;
        };
        let snapshot: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        let mut written = 0;
        for session in &snapshot {
            match db.upsert_session(session).await {
                Ok(()) => written += 1,
                Err(e) => {
                    warn!(session_id = %session.session_id, error = %e, "Failed to flush session")
                }
            }
        }
        info!(written, "Sessions flushed");
        written
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    async fn persist(&self, session: &Session) {
        if let Some(db) = &self.db {
            if let Err(e) = db.upsert_session(session).await {
                warn!(session_id = %session.session_id, error = %e, "Failed to persist session");
            }
        }
    }

    async fn load_live(&self, sender: &str) -> Option<Session> {
        let db = self.db.as_ref()?;
        match db.get_live_session(sender, Utc::now()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(sender, error = %e, "Failed to load session from storage");
                None
            }
        }
    }
}

/// Spawn a background task that sweeps idle sessions on the configured interval.
pub fn spawn_sweep_task(manager: Arc<SessionManager>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(manager.config.sweep_interval);
        loop {
            interval.tick().await;
            manager.sweep().await;
        }
    })
}
