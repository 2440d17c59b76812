//! Transport sessions: creation, refresh, expiry sweep, destruction with
//! listener notification, and per-stream replay state for resumable SSE.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::Duration;

use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::errors::GatewayError;

/// Replay buffers are bounded; the oldest event falls off first.
const REPLAY_CAPACITY: usize = 100;

/// One server-to-client event with its per-stream id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub id: u64,
    pub data: String,
}

/// State of one SSE stream. The stream belongs to exactly one session; its
/// replay queue survives client disconnects so the stream can be resumed
/// with `Last-Event-ID`.
struct StreamState {
    next_event_id: u64,
    replay: VecDeque<SseEvent>,
    active: bool,
    sender: Option<mpsc::UnboundedSender<SseEvent>>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            next_event_id: 1,
            replay: VecDeque::new(),
            active: false,
            sender: None,
        }
    }

    fn push(&mut self, data: String) {
        let event = SseEvent {
            id: self.next_event_id,
            data,
        };
        self.next_event_id += 1;
        if self.replay.len() == REPLAY_CAPACITY {
            self.replay.pop_front();
        }
        self.replay.push_back(event.clone());
        if self.active {
            if let Some(sender) = &self.sender {
                if sender.send(event).is_err() {
                    // Receiver side went away without a DELETE; the buffer
                    // keeps accumulating for a later resume.
                    self.active = false;
                    self.sender = None;
                }
            }
        }
    }

    fn replay_after(&self, last_event_id: u64) -> Vec<SseEvent> {
        self.replay
            .iter()
            .filter(|event| event.id > last_event_id)
            .cloned()
            .collect()
    }
}

struct Session {
    created_at: Instant,
    last_activity_at: Instant,
    auth_token: Option<SecretString>,
    streams: HashMap<String, StreamState>,
}

type DestroyListener = Box<dyn Fn(&str) + Send + Sync>;

/// All live sessions behind one lock. No await point ever holds the lock.
pub struct SessionStore {
    sessions: RwLock<HashMap<String, Session>>,
    listeners: RwLock<Vec<DestroyListener>>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            timeout,
        }
    }

    /// Register a destruction listener. Each successful destruction notifies
    /// every listener exactly once.
    pub fn on_destroy(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.push(Box::new(listener));
        }
    }

    /// Create a session, capturing the validated client token. The id is a
    /// v4 UUID: cryptographically random and URL-safe.
    pub fn create(&self, auth_token: Option<SecretString>) -> String {
        let id = Uuid::new_v4().to_string();
        let now = Instant::now();
        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(
                id.clone(),
                Session {
                    created_at: now,
                    last_activity_at: now,
                    auth_token,
                    streams: HashMap::new(),
                },
            );
        }
        debug!(session_id = %id, "session created");
        id
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sessions
            .read()
            .map(|s| s.contains_key(id))
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Touch the activity clock. Returns false for unknown sessions.
    pub fn refresh(&self, id: &str) -> bool {
        match self.sessions.write() {
            Ok(mut sessions) => match sessions.get_mut(id) {
                Some(session) => {
                    session.last_activity_at = Instant::now();
                    true
                }
                None => false,
            },
            Err(_) => false,
        }
    }

    /// The token captured at initialize, for building the session's upstream
    /// client. Never logged.
    pub fn auth_token(&self, id: &str) -> Result<Option<SecretString>, GatewayError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| GatewayError::session("session store lock poisoned"))?;
        sessions
            .get(id)
            .map(|session| session.auth_token.clone())
            .ok_or_else(|| GatewayError::session(format!("unknown session {id}")))
    }

    pub fn age(&self, id: &str) -> Option<Duration> {
        self.sessions
            .read()
            .ok()?
            .get(id)
            .map(|s| s.created_at.elapsed())
    }

    /// Destroy a session. Idempotent: only the call that actually removes
    /// the session fires the listeners.
    pub fn destroy(&self, id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .ok()
            .and_then(|mut sessions| sessions.remove(id))
            .is_some();
        if removed {
            debug!(session_id = %id, "session destroyed");
            self.notify(id);
        }
        removed
    }

    /// Destroy every session whose idle time exceeds the timeout.
    pub fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<String> = match self.sessions.read() {
            Ok(sessions) => sessions
                .iter()
                .filter(|(_, session)| {
                    now.duration_since(session.last_activity_at) > self.timeout
                })
                .map(|(id, _)| id.clone())
                .collect(),
            Err(_) => return 0,
        };
        let mut destroyed = 0;
        for id in expired {
            if self.destroy(&id) {
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            debug!(destroyed, "swept expired sessions");
        }
        destroyed
    }

    /// Destroy everything (process shutdown), notifying listeners per
    /// session.
    pub fn destroy_all(&self) -> usize {
        let ids: Vec<String> = self
            .sessions
            .read()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter(|id| self.destroy(id)).count()
    }

    fn notify(&self, id: &str) {
        if let Ok(listeners) = self.listeners.read() {
            for listener in listeners.iter() {
                listener(id);
            }
        }
    }

    // ---- streams ------------------------------------------------------

    /// Open a fresh stream on the session and hand back its receiver.
    pub fn open_stream(
        &self,
        session_id: &str,
    ) -> Result<(String, mpsc::UnboundedReceiver<SseEvent>), GatewayError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| GatewayError::session("session store lock poisoned"))?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::session(format!("unknown session {session_id}")))?;

        let stream_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut stream = StreamState::new();
        stream.active = true;
        stream.sender = Some(sender);
        session.streams.insert(stream_id.clone(), stream);
        Ok((stream_id, receiver))
    }

    /// Reattach to the session's most recent stream, replaying every
    /// buffered event with id greater than `last_event_id`, in order.
    pub fn resume_stream(
        &self,
        session_id: &str,
        last_event_id: u64,
    ) -> Result<(String, Vec<SseEvent>, mpsc::UnboundedReceiver<SseEvent>), GatewayError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| GatewayError::session("session store lock poisoned"))?;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::session(format!("unknown session {session_id}")))?;

        let Some((stream_id, stream)) = session
            .streams
            .iter_mut()
            .max_by_key(|(_, stream)| stream.next_event_id)
        else {
            return Err(GatewayError::session(format!(
                "session {session_id} has no stream to resume"
            )));
        };

        let replayed = stream.replay_after(last_event_id);
        let (sender, receiver) = mpsc::unbounded_channel();
        stream.active = true;
        stream.sender = Some(sender);
        Ok((stream_id.clone(), replayed, receiver))
    }

    /// Client went away: deactivate the writer but keep the replay buffer so
    /// the stream can be resumed. The session itself survives.
    pub fn close_stream(&self, session_id: &str, stream_id: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(session) = sessions.get_mut(session_id) {
                if let Some(stream) = session.streams.get_mut(stream_id) {
                    stream.active = false;
                    stream.sender = None;
                }
            }
        }
    }

    /// Enqueue a server-initiated notification on every stream of the
    /// session. Ids are strictly monotonic per stream.
    pub fn push_notification(&self, session_id: &str, data: &str) -> usize {
        match self.sessions.write() {
            Ok(mut sessions) => match sessions.get_mut(session_id) {
                Some(session) => {
                    for stream in session.streams.values_mut() {
                        stream.push(data.to_string());
                    }
                    session.streams.len()
                }
                None => 0,
            },
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(1800))
    }

    #[tokio::test]
    async fn create_and_refresh() {
        let store = store();
        let id = store.create(None);
        assert!(store.exists(&id));
        assert!(store.refresh(&id));
        assert!(!store.refresh("nope"));
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_notifies_once() {
        let store = store();
        let notifications = Arc::new(AtomicUsize::new(0));
        let seen = notifications.clone();
        store.on_destroy(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let id = store.create(None);
        assert!(store.destroy(&id));
        assert!(!store.destroy(&id));
        assert_eq!(notifications.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_idle_sessions() {
        let store = SessionStore::new(Duration::from_secs(60));
        let idle = store.create(None);
        let busy = store.create(None);

        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(store.refresh(&busy));
        tokio::time::advance(Duration::from_secs(30)).await;

        // idle: 75s without activity; busy: 30s.
        assert_eq!(store.sweep(Instant::now()), 1);
        assert!(!store.exists(&idle));
        assert!(store.exists(&busy));
    }

    #[tokio::test]
    async fn tokens_are_returned_for_known_sessions_only() {
        let store = store();
        let id = store.create(Some(SecretString::from("tok".to_string())));
        assert!(store.auth_token(&id).unwrap().is_some());
        assert!(store.auth_token("nope").is_err());
    }

    #[tokio::test]
    async fn stream_event_ids_are_strictly_increasing() {
        let store = store();
        let id = store.create(None);
        let (_, mut rx) = store.open_stream(&id).unwrap();

        store.push_notification(&id, "one");
        store.push_notification(&id, "two");
        store.push_notification(&id, "three");

        let mut last = 0;
        for _ in 0..3 {
            let event = rx.try_recv().unwrap();
            assert!(event.id > last);
            last = event.id;
        }
    }

    #[tokio::test]
    async fn resume_replays_only_events_after_the_cursor() {
        let store = store();
        let id = store.create(None);
        let (stream_id, rx) = store.open_stream(&id).unwrap();
        drop(rx);
        store.close_stream(&id, &stream_id);

        for n in 1..=7 {
            store.push_notification(&id, &format!("event-{n}"));
        }

        let (resumed_id, replayed, _rx) = store.resume_stream(&id, 5).unwrap();
        assert_eq!(resumed_id, stream_id);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0], SseEvent { id: 6, data: "event-6".into() });
        assert_eq!(replayed[1], SseEvent { id: 7, data: "event-7".into() });
    }

    #[tokio::test]
    async fn replay_buffer_is_bounded_fifo() {
        let store = store();
        let id = store.create(None);
        let (_, rx) = store.open_stream(&id).unwrap();
        drop(rx);

        for n in 0..150 {
            store.push_notification(&id, &format!("event-{n}"));
        }

        let (_, replayed, _rx) = store.resume_stream(&id, 0).unwrap();
        assert_eq!(replayed.len(), 100);
        // Oldest events were evicted; ids 51..=150 remain.
        assert_eq!(replayed.first().map(|e| e.id), Some(51));
        assert_eq!(replayed.last().map(|e| e.id), Some(150));
    }

    #[tokio::test]
    async fn destroy_all_reports_each_session() {
        let store = store();
        store.create(None);
        store.create(None);
        assert_eq!(store.destroy_all(), 2);
        assert_eq!(store.count(), 0);
    }
}
