//! Session registry.
//!
//! The registry maps session ids to live sessions and guarantees that,
//! however many callers race on [`SessionManager::acquire_or_create`] for
//! the same id, exactly one shell is spawned per generation of that id.
//!
//! Concurrency contract:
//! - The map is a [`DashMap`]; a shard lock is only held for pure map
//!   mutation (reserving or removing a slot), never across a spawn.
//! - A reserved slot holds a [`OnceCell`]. The first caller to reach the
//!   cell spawns; everyone else awaits the same cell and gets the same `Arc`.
//! - A slot whose session is STOPPED or ERROR is replaced by a fresh slot
//!   with a new generation. Sessions remove their own slot on reaching
//!   STOPPED, matched by generation so a stale session cannot evict its
//!   successor.
//! - Lock order is shard lock, then session lock. Sessions never call into
//!   the registry while holding their own lock.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use protocol::CloseReason;
use tokio::sync::OnceCell;

use super::handle::{Session, SessionInfo, SessionOptions};
use super::pty::{SessionError, SessionId};

/// Operations the gateway needs from a session registry.
///
/// Implementations must be thread-safe and suitable for concurrent access.
pub trait SessionManager: Send + Sync {
    /// Returns the live session for `id`, spawning one if there is none.
    ///
    /// Never spawns twice for concurrent callers with the same id. A spawn
    /// failure is not an error here: the returned session is already
    /// STOPPED with `spawn_failed` queued for its subscribers.
    fn acquire_or_create(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Arc<Session>, SessionError>> + Send;

    /// Returns the session for `id`, if one is registered.
    fn get(&self, id: &str) -> Option<Arc<Session>>;

    /// Closes the session for `id`.
    ///
    /// Returns whether this call performed the teardown.
    fn close(
        &self,
        id: &str,
        reason: CloseReason,
    ) -> impl Future<Output = Result<bool, SessionError>> + Send;

    /// Closes every registered session. Returns how many teardowns ran.
    fn close_all(&self, reason: CloseReason) -> impl Future<Output = usize> + Send;

    /// Snapshots all registered sessions, ordered by id.
    fn list(&self) -> Vec<SessionInfo>;

    /// Returns the number of registered sessions.
    fn count(&self) -> usize;
}

type Slots = DashMap<SessionId, Slot>;

/// One generation of one session id.
struct Slot {
    generation: u64,
    cell: Arc<OnceCell<Arc<Session>>>,
}

impl Slot {
    /// A slot can be reused while its spawn is pending or its session is live.
    fn is_live(&self) -> bool {
        self.cell
            .get()
            .is_none_or(|session| !session.state().is_terminal())
    }
}

/// Lets a session remove itself from the registry that created it.
#[derive(Clone, Default)]
pub struct RegistryHandle {
    slots: Weak<Slots>,
}

impl RegistryHandle {
    /// A handle attached to no registry, for sessions created directly.
    pub fn detached() -> Self {
        Self::default()
    }

    /// Removes `id` if it still belongs to `generation`.
    pub fn remove(&self, id: &str, generation: u64) -> bool {
        let Some(slots) = self.slots.upgrade() else {
            return false;
        };
        let removed = slots
            .remove_if(id, |_, slot| slot.generation == generation)
            .is_some();
        if removed {
            tracing::debug!(session_id = %id, generation = generation, "Removed session from registry");
        }
        removed
    }
}

/// [`SessionManager`] backed by a [`DashMap`] of once-initialized slots.
pub struct SessionRegistry {
    slots: Arc<Slots>,
    options: SessionOptions,
    max_sessions: usize,
    next_generation: AtomicU64,
    spawns: Arc<AtomicU64>,
}

impl SessionRegistry {
    /// Creates an empty registry. New sessions are spawned with `options`.
    pub fn new(options: SessionOptions, max_sessions: usize) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            options,
            max_sessions,
            next_generation: AtomicU64::new(0),
            spawns: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Total number of spawns performed since creation.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Removes `id` if it still belongs to `generation`.
    pub fn remove(&self, id: &str, generation: u64) -> bool {
        self.handle().remove(id, generation)
    }

    fn handle(&self) -> RegistryHandle {
        RegistryHandle {
            slots: Arc::downgrade(&self.slots),
        }
    }

    /// Finds or creates the slot for `id` under its shard lock.
    fn reserve(&self, id: &str) -> Result<(u64, Arc<OnceCell<Arc<Session>>>), SessionError> {
        // Checked outside the entry lock: `len` takes every shard lock.
        // Concurrent creations of distinct ids can overshoot by a few.
        if !self.slots.contains_key(id) && self.slots.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let slot = match self.slots.entry(id.to_string()) {
            Entry::Occupied(entry) if entry.get().is_live() => {
                let slot = entry.get();
                return Ok((slot.generation, Arc::clone(&slot.cell)));
            }
            Entry::Occupied(mut entry) => {
                let slot = self.new_slot();
                tracing::debug!(session_id = %id, generation = slot.generation, "Replacing stopped session");
                entry.insert(slot);
                entry.into_ref()
            }
            Entry::Vacant(entry) => entry.insert(self.new_slot()),
        };
        Ok((slot.generation, Arc::clone(&slot.cell)))
    }

    fn new_slot(&self) -> Slot {
        Slot {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            cell: Arc::new(OnceCell::new()),
        }
    }

    fn sessions(&self) -> Vec<Arc<Session>> {
        self.slots
            .iter()
            .filter_map(|entry| entry.value().cell.get().cloned())
            .collect()
    }
}

impl SessionManager for SessionRegistry {
    async fn acquire_or_create(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let (generation, cell) = self.reserve(id)?;
        if let Some(session) = cell.get() {
            return Ok(Arc::clone(session));
        }

        let id = id.to_string();
        let options = self.options.clone();
        let registry = self.handle();
        let spawns = Arc::clone(&self.spawns);

        // The cell is filled inside a detached task, so a caller that gives
        // up mid-spawn still leaves the session in its slot.
        let init = tokio::spawn(async move {
            let session = cell
                .get_or_init(|| async move {
                    spawns.fetch_add(1, Ordering::SeqCst);
                    tracing::info!(session_id = %id, generation = generation, "Spawning session");
                    Session::spawn(id, generation, options, registry).await
                })
                .await;
            Arc::clone(session)
        });

        init.await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))
    }

    fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.slots
            .get(id)
            .and_then(|slot| slot.cell.get().cloned())
    }

    async fn close(&self, id: &str, reason: CloseReason) -> Result<bool, SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        Ok(session.close(reason).await)
    }

    async fn close_all(&self, reason: CloseReason) -> usize {
        let sessions = self.sessions();
        tracing::info!(count = sessions.len(), reason = %reason, "Closing all sessions");

        let closes = sessions.iter().map(|session| session.close(reason));
        join_all(closes).await.into_iter().filter(|closed| *closed).count()
    }

    fn list(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions().iter().map(|s| s.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    fn count(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use protocol::{FrameKind, SessionState};
    use tokio::time::timeout;

    use super::*;
    use crate::session::SpawnOptions;

    fn registry(max_sessions: usize) -> Arc<SessionRegistry> {
        registry_with_shell("/bin/sh", max_sessions)
    }

    fn registry_with_shell(shell: &str, max_sessions: usize) -> Arc<SessionRegistry> {
        let options = SessionOptions {
            spawn: SpawnOptions {
                shell: Some(shell.to_string()),
                ..SpawnOptions::default()
            },
            kill_grace: Duration::from_millis(500),
            drain_timeout: Duration::from_millis(200),
            ..SessionOptions::default()
        };
        Arc::new(SessionRegistry::new(options, max_sessions))
    }

    #[tokio::test]
    async fn test_registry_acquire_creates_session() {
        let registry = registry(8);

        let session = registry.acquire_or_create("conv-1").await.unwrap();

        assert_eq!(session.id(), "conv-1");
        assert_eq!(session.state(), SessionState::Running);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.spawn_count(), 1);

        registry.close_all(CloseReason::Shutdown).await;
    }

    #[tokio::test]
    async fn test_registry_acquire_returns_existing() {
        let registry = registry(8);

        let first = registry.acquire_or_create("conv-1").await.unwrap();
        let second = registry.acquire_or_create("conv-1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.spawn_count(), 1);

        registry.close_all(CloseReason::Shutdown).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registry_concurrent_acquire_single_spawn() {
        let registry = registry(8);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.acquire_or_create("shared").await.unwrap() })
            })
            .collect();
        let sessions: Vec<Arc<Session>> = join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(registry.spawn_count(), 1);
        assert_eq!(registry.count(), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));

        registry.close_all(CloseReason::Shutdown).await;
    }

    #[tokio::test]
    async fn test_registry_abandoned_acquire_spawns_once() {
        let registry = registry(8);

        // The caller gives up while the shell is still starting.
        let _ = timeout(
            Duration::from_micros(1),
            registry.acquire_or_create("abandoned"),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let session = registry.acquire_or_create("abandoned").await.unwrap();

        assert_eq!(registry.spawn_count(), 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(session.state(), SessionState::Running);
        assert!(Arc::ptr_eq(&session, &registry.get("abandoned").unwrap()));

        assert_eq!(registry.close_all(CloseReason::Shutdown).await, 1);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_distinct_ids_spawn_separately() {
        let registry = registry(8);

        let a = registry.acquire_or_create("a").await.unwrap();
        let b = registry.acquire_or_create("b").await.unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_ne!(a.pid(), b.pid());
        assert_eq!(registry.spawn_count(), 2);

        let ids: Vec<_> = registry.list().into_iter().map(|info| info.id).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert_eq!(registry.close_all(CloseReason::Shutdown).await, 2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_registry_close_removes_session() {
        let registry = registry(8);
        registry.acquire_or_create("gone").await.unwrap();

        assert!(registry.close("gone", CloseReason::AdminKill).await.unwrap());

        assert!(registry.get("gone").is_none());
        assert_eq!(registry.count(), 0);
        assert!(matches!(
            registry.close("gone", CloseReason::AdminKill).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_registry_concurrent_close() {
        let registry = registry(8);
        let session = registry.acquire_or_create("racy").await.unwrap();

        let closers: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.close(CloseReason::AdminKill).await })
            })
            .collect();
        let winners = join_all(closers)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(winners, 1);
        assert_eq!(session.teardown_count(), 1);
        timeout(Duration::from_secs(5), session.stopped()).await.unwrap();
        assert!(registry.get("racy").is_none());
    }

    #[tokio::test]
    async fn test_registry_reuses_id_after_stop() {
        let registry = registry(8);

        let first = registry.acquire_or_create("reuse").await.unwrap();
        registry.close("reuse", CloseReason::AdminKill).await.unwrap();

        let second = registry.acquire_or_create("reuse").await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.generation() > first.generation());
        assert_eq!(second.state(), SessionState::Running);
        assert_eq!(registry.spawn_count(), 2);

        // The old generation cannot evict the new one.
        assert!(!registry.remove("reuse", first.generation()));
        assert!(registry.get("reuse").is_some());

        registry.close_all(CloseReason::Shutdown).await;
    }

    #[tokio::test]
    async fn test_registry_limit() {
        let registry = registry(2);

        registry.acquire_or_create("one").await.unwrap();
        registry.acquire_or_create("two").await.unwrap();

        assert!(matches!(
            registry.acquire_or_create("three").await,
            Err(SessionError::LimitReached(2))
        ));
        // Existing ids are still reachable at the limit.
        assert!(registry.acquire_or_create("one").await.is_ok());

        registry.close("two", CloseReason::AdminKill).await.unwrap();
        assert!(registry.acquire_or_create("three").await.is_ok());

        registry.close_all(CloseReason::Shutdown).await;
    }

    #[tokio::test]
    async fn test_registry_spawn_failure() {
        let registry = registry_with_shell("/nonexistent/shell/binary", 8);

        let session = registry.acquire_or_create("broken").await.unwrap();

        assert_eq!(session.state(), SessionState::Stopped);
        assert_eq!(session.close_reason(), Some(CloseReason::SpawnFailed));
        assert!(registry.get("broken").is_none());

        let mut stream = session.subscribe();
        let mut last = None;
        while let Some(frame) = stream.recv().await {
            last = Some(frame);
        }
        let last = last.unwrap();
        assert_eq!(last.kind(), FrameKind::Closed);
        assert_eq!(last.close_reason(), Some(CloseReason::SpawnFailed));
    }

    #[tokio::test]
    async fn test_registry_process_exit_removes_session() {
        let registry = registry(8);
        let session = registry.acquire_or_create("exits").await.unwrap();

        session.write(b"exit\n").unwrap();
        timeout(Duration::from_secs(5), session.stopped()).await.unwrap();

        assert_eq!(session.close_reason(), Some(CloseReason::ProcessExited));
        assert!(registry.get("exits").is_none());
    }

    #[tokio::test]
    async fn test_registry_detached_handle() {
        let handle = RegistryHandle::detached();
        assert!(!handle.remove("anything", 0));
    }
}
