//! Process-wide table of live sessions.
//!
//! The registry owns lifecycle, not behaviour: each session gets a
//! cancellation token (a child of the registry's root token) and a list of the
//! tasks that serve it. Removing a session cancels its token; shutting down the
//! registry cancels every token, waits a bounded time for all tasks and aborts
//! whatever is still running.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a caller gets back from [`SessionRegistry::create_session`].
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub id: Uuid,
    /// Cancelled when the session is removed or the registry shuts down.
    pub token: CancellationToken,
}

#[derive(Debug)]
struct SessionEntry {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    last_activity: Instant,
}

/// Summary of a [`SessionRegistry::shutdown_all`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sessions: usize,
    pub tasks: usize,
    /// Tasks still running at the deadline and aborted.
    pub aborted: usize,
}

#[derive(Debug)]
pub struct SessionRegistry {
    root: CancellationToken,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_session(&self) -> SessionTicket {
        let id = Uuid::new_v4();
        let token = self.root.child_token();
        self.sessions.lock().insert(
            id,
            SessionEntry {
                token: token.clone(),
                tasks: Vec::new(),
                last_activity: Instant::now(),
            },
        );
        info!(session_id = %id, "Session created");
        SessionTicket { id, token }
    }

    /// Hands a task to the registry. If the session is already gone the task
    /// is aborted.
    pub fn attach_task(&self, id: Uuid, handle: JoinHandle<()>) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(&id) {
            Some(entry) => {
                entry.tasks.retain(|task| !task.is_finished());
                entry.tasks.push(handle);
                true
            }
            None => {
                drop(sessions);
                debug!(session_id = %id, "Task attached to unknown session, aborting");
                handle.abort();
                false
            }
        }
    }

    /// Records activity on a session.
    pub fn touch(&self, id: Uuid) {
        if let Some(entry) = self.sessions.lock().get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    /// Removes a session and cancels its token. Its tasks are expected to
    /// observe the token and finish on their own.
    pub fn remove_session(&self, id: Uuid) -> bool {
        let entry = self.sessions.lock().remove(&id);
        match entry {
            Some(entry) => {
                entry.token.cancel();
                info!(session_id = %id, "Session removed");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.sessions.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`Self::shutdown_all`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancels every session and waits up to `timeout` for their tasks.
    ///
    /// Tasks still running at the deadline are aborted. The table is empty
    /// when this returns, and sessions created afterwards start cancelled.
    pub async fn shutdown_all(&self, timeout: Duration) -> ShutdownReport {
        self.root.cancel();
        let entries: Vec<(Uuid, SessionEntry)> = self.sessions.lock().drain().collect();

        let sessions = entries.len();
        let handles: Vec<JoinHandle<()>> = entries
            .into_iter()
            .flat_map(|(_, entry)| {
                entry.token.cancel();
                entry.tasks
            })
            .collect();
        let tasks = handles.len();
        let abort_handles: Vec<AbortHandle> = handles.iter().map(JoinHandle::abort_handle).collect();

        info!(sessions, tasks, timeout = ?timeout, "Shutting down sessions");
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!(?timeout, "Session shutdown timed out, aborting remaining tasks");
        }

        let mut aborted = 0;
        for handle in abort_handles {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }

        ShutdownReport {
            sessions,
            tasks,
            aborted,
        }
    }

    /// Removes sessions idle for longer than `max_idle` and returns their ids.
    pub fn reap_stale(&self, max_idle: Duration) -> Vec<Uuid> {
        let now = Instant::now();
        let stale: Vec<(Uuid, SessionEntry)> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<Uuid> = sessions
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.last_activity) > max_idle)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        stale
            .into_iter()
            .map(|(id, entry)| {
                info!(session_id = %id, "Reaping stale session");
                entry.token.cancel();
                id
            })
            .collect()
    }

    /// Periodically reaps stale sessions until the registry shuts down.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration, max_idle: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let token = self.root.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let reaped = registry.reap_stale(max_idle);
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "Cleaned up stale sessions");
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_create_and_remove() {
        let registry = SessionRegistry::new();
        let ticket = registry.create_session();
        assert!(registry.contains(ticket.id));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove_session(ticket.id));
        assert!(ticket.token.is_cancelled());
        assert!(!registry.remove_session(ticket.id));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_attach_to_unknown_session_aborts_task() {
        let registry = SessionRegistry::new();
        let handle = tokio::spawn(std::future::pending::<()>());
        let abort = handle.abort_handle();
        assert!(!registry.attach_task(Uuid::new_v4(), handle));
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_is_bounded() {
        let registry = SessionRegistry::new();
        let finished = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let ticket = registry.create_session();
            let finished = finished.clone();
            let hung = i < 2;
            let handle = tokio::spawn(async move {
                if hung {
                    // Ignores cancellation entirely.
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                } else {
                    ticket.token.cancelled().await;
                }
                finished.fetch_add(1, Ordering::SeqCst);
            });
            registry.attach_task(ticket.id, handle);
        }

        let start = Instant::now();
        let report = registry.shutdown_all(Duration::from_secs(3)).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4));
        assert!(registry.is_empty());
        assert!(registry.is_shutting_down());
        assert_eq!(
            report,
            ShutdownReport {
                sessions: 5,
                tasks: 5,
                aborted: 2
            }
        );
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_all_returns_early_when_tasks_cooperate() {
        let registry = SessionRegistry::new();
        for _ in 0..3 {
            let ticket = registry.create_session();
            let token = ticket.token.clone();
            registry.attach_task(ticket.id, tokio::spawn(async move { token.cancelled().await }));
        }
        let start = Instant::now();
        let report = registry.shutdown_all(Duration::from_secs(3)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(report.aborted, 0);

        // Late arrivals are born cancelled.
        assert!(registry.create_session().token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_stale() {
        let registry = SessionRegistry::new();
        let idle = registry.create_session();
        let busy = registry.create_session();

        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        registry.touch(busy.id);
        tokio::time::advance(Duration::from_secs(15 * 60)).await;

        let reaped = registry.reap_stale(Duration::from_secs(30 * 60));
        assert_eq!(reaped, vec![idle.id]);
        assert!(idle.token.is_cancelled());
        assert!(!busy.token.is_cancelled());
        assert!(registry.contains(busy.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_runs_until_shutdown() {
        let registry = Arc::new(SessionRegistry::new());
        let ticket = registry.create_session();
        let reaper = registry.spawn_reaper(Duration::from_secs(300), Duration::from_secs(1800));

        tokio::time::sleep(Duration::from_secs(2101)).await;
        assert!(!registry.contains(ticket.id));

        registry.shutdown_all(Duration::from_secs(1)).await;
        reaper.await.unwrap();
    }
}
