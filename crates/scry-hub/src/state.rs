use crate::config::HubConfig;
use crate::path_guard;
use scry_core::events::{EventError, HookEvent, MAIN_AGENT_ID};
use scry_core::session_log::{SessionLog, SessionLogError};
use scry_core::spawn::{record_dispatch, resolve_completion, FsMailbox, SpawnMailbox};
use scry_core::{now_ms, EventType};
use scry_storage::{ScryStore, StorageError};
use scry_transcript::TranscriptCache;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

/// Events a live listener may fall behind by before it is dropped.
pub const SUBSCRIBER_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Error)]
pub enum AcceptError {
    #[error(transparent)]
    Invalid(#[from] EventError),
    #[error(transparent)]
    Log(#[from] SessionLogError),
    #[error("accept task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Everything the gateway mutates, created once at startup and shared with
/// every handler.
pub struct HubState {
    config: HubConfig,
    log: SessionLog,
    mailbox: Arc<dyn SpawnMailbox>,
    store: Option<Arc<Mutex<ScryStore>>>,
    cache: Arc<TranscriptCache>,
    current_session: Mutex<Option<String>>,
    last_activity: Mutex<Instant>,
    agent_transcripts: RwLock<BTreeMap<String, String>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    subscriber_counter: AtomicU64,
    accept_lock: AsyncMutex<()>,
    started: Instant,
}

impl HubState {
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        config.paths.ensure_dirs()?;
        let store = if config.use_store {
            let store = ScryStore::open(&config.paths.db_path)?;
            info!(event = "store_open", path = %config.paths.db_path.display());
            Some(Arc::new(Mutex::new(store)))
        } else {
            None
        };
        let mailbox = Arc::new(FsMailbox::new(
            config.paths.pending_dir.clone(),
            config.paths.resolved_dir.clone(),
        ));
        Ok(Self {
            log: SessionLog::new(config.paths.sessions_dir.clone()),
            mailbox,
            store,
            cache: Arc::new(TranscriptCache::new()),
            current_session: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
            agent_transcripts: RwLock::new(BTreeMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            subscriber_counter: AtomicU64::new(0),
            accept_lock: AsyncMutex::new(()),
            started: Instant::now(),
            config,
        })
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn cache(&self) -> Arc<TranscriptCache> {
        Arc::clone(&self.cache)
    }

    pub fn store(&self) -> Option<Arc<Mutex<ScryStore>>> {
        self.store.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn current_session(&self) -> Option<String> {
        self.current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn agent_transcripts(&self) -> BTreeMap<String, String> {
        self.agent_transcripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Validate, correlate, log and broadcast one posted event.
    ///
    /// Append and broadcast run under one lock, so the durable log and every
    /// live stream see events in acceptance order. Mailbox and log file work
    /// runs on the blocking pool.
    pub async fn accept(&self, value: Value) -> Result<HookEvent, AcceptError> {
        let mut event = HookEvent::from_wire(value)?;

        let _accepting = self.accept_lock.lock().await;
        self.assign_session(&mut event);
        let mailbox = Arc::clone(&self.mailbox);
        let log = self.log.clone();
        let event = tokio::task::spawn_blocking(move || {
            correlate(mailbox.as_ref(), &mut event);
            log.append(&event).map(|_| event)
        })
        .await??;
        self.touch();
        self.remember_transcript(&event);
        self.broadcast(&event);
        debug!(
            event = "event_accepted",
            id = %event.id,
            session_id = %event.session_id,
            event_type = event.event_type()
        );
        Ok(event)
    }

    fn assign_session(&self, event: &mut HookEvent) {
        let mut current = self
            .current_session
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if event.session_id.trim().is_empty() {
            event.session_id = current
                .clone()
                .unwrap_or_else(|| format!("ses_{}", now_ms()));
        }
        if current.is_none() || event.event_type() == EventType::SessionStart.as_str() {
            *current = Some(event.session_id.clone());
        }
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn remember_transcript(&self, event: &HookEvent) {
        let Some(path) = event.transcript_path() else {
            return;
        };
        let key = match event.agent_id() {
            Some(agent_id) => agent_id.to_string(),
            None if event.event_type() == EventType::SessionStart.as_str() => {
                MAIN_AGENT_ID.to_string()
            }
            None => return,
        };
        self.agent_transcripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, path.to_string());
    }

    /// The resolved path a dashboard may read for `raw`, when it lies under the
    /// transcript root or beside a transcript some event reported.
    pub fn transcript_path(&self, raw: &Path) -> Option<PathBuf> {
        let known = self
            .agent_transcripts()
            .into_values()
            .map(PathBuf::from)
            .collect::<Vec<_>>();
        path_guard::allowed_path(
            raw,
            &self.config.transcript_root,
            known.iter().map(PathBuf::as_path),
        )
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let id = self.subscriber_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sender);
        info!(event = "listener_connected", subscriber = id);
        Subscription {
            id,
            receiver,
            state: Arc::clone(self),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn unsubscribe(&self, id: u64) {
        let removed = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            info!(event = "listener_disconnected", subscriber = id);
        }
    }

    fn broadcast(&self, event: &HookEvent) {
        let data: Arc<str> = match serde_json::to_string(&event.to_wire()) {
            Ok(data) => data.into(),
            Err(err) => {
                warn!(event = "broadcast_encode_failed", error = %err);
                return;
            }
        };
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|id, sender| match sender.try_send(Arc::clone(&data)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(event = "listener_lagging", subscriber = *id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Fold an accepted event into the store, if one is configured. Failures
    /// are logged; the event is already durable in the session log.
    pub async fn persist(&self, event: HookEvent) {
        let Some(store) = self.store() else {
            return;
        };
        let event_id = event.id.clone();
        let work = tokio::task::spawn_blocking(move || {
            let store = store.lock().unwrap_or_else(PoisonError::into_inner);
            store.apply_event(&event)
        });
        match tokio::time::timeout(self.config.blocking_timeout, work).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                warn!(event = "store_apply_failed", id = %event_id, error = %err)
            }
            Ok(Err(err)) => warn!(event = "store_apply_panicked", id = %event_id, error = %err),
            Err(_) => warn!(event = "store_apply_timeout", id = %event_id),
        }
    }
}

fn correlate(mailbox: &dyn SpawnMailbox, event: &mut HookEvent) {
    let tool_input = event
        .extra
        .get("tool_input")
        .and_then(Value::as_object)
        .cloned();
    match record_dispatch(mailbox, event, tool_input.as_ref()) {
        Ok(Some(spawn)) => info!(
            event = "spawn_recorded",
            agent_id = %spawn.agent_id,
            label = %spawn.agent_label
        ),
        Ok(None) => {}
        Err(err) => warn!(event = "spawn_record_failed", error = %err),
    }
    match resolve_completion(mailbox, event) {
        Ok(Some(spawn)) => info!(
            event = "spawn_resolved",
            agent_id = %spawn.agent_id,
            label = %spawn.agent_label
        ),
        Ok(None) => {}
        Err(err) => warn!(event = "spawn_resolve_failed", error = %err),
    }
}

/// A live listener's queue; dropping it deregisters the listener.
pub struct Subscription {
    id: u64,
    receiver: mpsc::Receiver<Arc<str>>,
    state: Arc<HubState>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.unsubscribe(self.id);
    }
}
