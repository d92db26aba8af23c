//! Client-side replay cache for pushed stream events.
//!
//! A [`ReplayCache`] keeps the latest snapshot per job, entity and lock, plus a bounded,
//! delta-merged history per stream. Observers registered late are replayed from the cache
//! before they see live events, so a freshly mounted view never starts blank.

mod history;

use std::{
    collections::{BTreeMap, HashMap},
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::warn;
use uuid::Uuid;

use crate::protocol::events::{EventPayload, EventType, StreamEvent};
use history::StreamHistory;

pub const DEFAULT_MAX_STREAMS: usize = 50;
pub const DEFAULT_MAX_EVENTS_PER_STREAM: usize = 200;

pub type Observer = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayLimits {
    /// Streams kept in memory; the least recently updated stream is evicted first.
    pub max_streams: usize,
    pub max_events_per_stream: usize,
}

impl Default for ReplayLimits {
    fn default() -> Self {
        Self {
            max_streams: DEFAULT_MAX_STREAMS,
            max_events_per_stream: DEFAULT_MAX_EVENTS_PER_STREAM,
        }
    }
}

/// Identity of a snapshot slot. One slot per job, entity, or locked object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SnapshotKey {
    Job(String),
    Entity { kind: EventType, id: String },
    Lock { workspace_id: Uuid, object_type: String, object_id: String },
}

impl SnapshotKey {
    pub fn for_event(event: &StreamEvent) -> Option<Self> {
        match &event.event {
            EventPayload::JobUpdate(update) => Some(Self::Job(update.job_id.clone())),
            EventPayload::OrganizationUpdate(update)
            | EventPayload::FolderUpdate(update)
            | EventPayload::UsecaseUpdate(update) => {
                Some(Self::Entity { kind: event.event_type(), id: update.id.clone() })
            }
            EventPayload::LockUpdate(update) => Some(Self::Lock {
                workspace_id: event.workspace_id,
                object_type: update.object_type.clone(),
                object_id: update.object_id.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone)]
enum Scope {
    All,
    Stream(String),
}

impl Scope {
    fn matches(&self, stream_id: &str) -> bool {
        match self {
            Self::All => true,
            Self::Stream(scoped) => scoped == stream_id,
        }
    }
}

#[derive(Clone)]
struct Registration {
    scope: Scope,
    callback: Observer,
}

#[derive(Default)]
struct CacheState {
    snapshots: BTreeMap<SnapshotKey, StreamEvent>,
    streams: HashMap<String, StreamHistory>,
    observers: BTreeMap<String, Registration>,
    tick: u64,
}

/// Replay cache constructed once per client session.
///
/// Observer callbacks run outside the state lock and are isolated from each other: a
/// panicking observer is logged and skipped. Deliveries are serialized, so an observer sees
/// its whole replay before any live event. Callbacks must not block or call back into the
/// cache.
#[derive(Clone)]
pub struct ReplayCache {
    state: Arc<Mutex<CacheState>>,
    delivery: Arc<Mutex<()>>,
    limits: ReplayLimits,
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(ReplayLimits::default())
    }
}

impl ReplayCache {
    pub fn new(limits: ReplayLimits) -> Self {
        Self { state: Arc::default(), delivery: Arc::default(), limits }
    }

    pub fn limits(&self) -> ReplayLimits {
        self.limits
    }

    /// Registers `observer_key` for every event and replays all cached snapshots and stream
    /// histories to it. Re-using a key replaces the earlier observer. Returns the number of
    /// replayed events.
    pub fn subscribe<F>(&self, observer_key: impl Into<String>, on_event: F) -> usize
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.register(observer_key.into(), Scope::All, Arc::new(on_event))
    }

    /// Registers `observer_key` for a single stream and replays that stream's snapshots, then
    /// its history.
    pub fn subscribe_to_stream<F>(
        &self,
        observer_key: impl Into<String>,
        stream_id: impl Into<String>,
        on_event: F,
    ) -> usize
    where
        F: Fn(&StreamEvent) + Send + Sync + 'static,
    {
        self.register(observer_key.into(), Scope::Stream(stream_id.into()), Arc::new(on_event))
    }

    pub fn unsubscribe(&self, observer_key: &str) -> bool {
        self.lock_state().observers.remove(observer_key).is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.lock_state().observers.len()
    }

    /// Parses a pushed SSE frame and ingests it. Malformed frames are logged and dropped.
    pub fn ingest_frame(&self, event_name: &str, data: &str) -> bool {
        // Keep-alive frames carry no stream position.
        if event_name == EventType::Ping.as_str() {
            return false;
        }

        match StreamEvent::from_frame(event_name, data) {
            Ok(event) => self.ingest(event),
            Err(error) => {
                warn!(event_name, error = %error, "dropping malformed stream event frame");
                false
            }
        }
    }

    /// Caches `event` and delivers it to matching observers. Returns false when the event was
    /// ignored: keep-alive pings, and events at or behind what the cache already holds.
    pub fn ingest(&self, event: StreamEvent) -> bool {
        if event.event_type() == EventType::Ping {
            return false;
        }

        let _delivery = self.lock_delivery();
        let observers = {
            let mut state = self.lock_state();
            if !state.store(event.clone(), self.limits) {
                return false;
            }
            state
                .observers
                .iter()
                .filter(|(_, registration)| registration.scope.matches(&event.stream_id))
                .map(|(key, registration)| (key.clone(), Arc::clone(&registration.callback)))
                .collect::<Vec<_>>()
        };

        for (observer_key, callback) in observers {
            deliver(&observer_key, &callback, &event);
        }
        true
    }

    pub fn snapshot(&self, key: &SnapshotKey) -> Option<StreamEvent> {
        self.lock_state().snapshots.get(key).cloned()
    }

    pub fn snapshots(&self) -> Vec<StreamEvent> {
        self.lock_state().snapshots.values().cloned().collect()
    }

    pub fn stream_history(&self, stream_id: &str) -> Vec<StreamEvent> {
        self.lock_state()
            .streams
            .get(stream_id)
            .map(|history| history.events().cloned().collect())
            .unwrap_or_default()
    }

    /// Cached stream ids, least recently updated first.
    pub fn stream_ids(&self) -> Vec<String> {
        self.lock_state().streams_by_recency().into_iter().map(|(id, _)| id.clone()).collect()
    }

    /// Every stream with cached state, snapshot-only streams included. These are the streams a
    /// client reads from [`Self::last_sequence`] after reconnecting.
    pub fn known_stream_ids(&self) -> Vec<String> {
        let state = self.lock_state();
        let mut stream_ids: Vec<String> =
            state.streams_by_recency().into_iter().map(|(id, _)| id.clone()).collect();
        for event in state.snapshots.values() {
            if !stream_ids.contains(&event.stream_id) {
                stream_ids.push(event.stream_id.clone());
            }
        }
        stream_ids
    }

    /// Highest sequence seen for a stream; the starting point of a catch-up read.
    pub fn last_sequence(&self, stream_id: &str) -> Option<i64> {
        let state = self.lock_state();
        let from_history = state.streams.get(stream_id).map(StreamHistory::last_sequence);
        let from_snapshots = state
            .snapshots
            .values()
            .filter(|event| event.stream_id == stream_id)
            .map(|event| event.sequence)
            .max();
        from_history.max(from_snapshots)
    }

    fn register(&self, observer_key: String, scope: Scope, callback: Observer) -> usize {
        // Held until the replay is delivered so no live event overtakes it.
        let _delivery = self.lock_delivery();
        let replay = {
            let mut state = self.lock_state();
            let replay = match &scope {
                Scope::All => {
                    let mut events: Vec<StreamEvent> = state.snapshots.values().cloned().collect();
                    for (_, history) in state.streams_by_recency() {
                        events.extend(history.events().cloned());
                    }
                    events
                }
                Scope::Stream(stream_id) => {
                    let mut events: Vec<StreamEvent> = state
                        .snapshots
                        .values()
                        .filter(|event| &event.stream_id == stream_id)
                        .cloned()
                        .collect();
                    if let Some(history) = state.streams.get(stream_id) {
                        events.extend(history.events().cloned());
                    }
                    events
                }
            };
            state
                .observers
                .insert(observer_key.clone(), Registration { scope, callback: Arc::clone(&callback) });
            replay
        };

        for event in &replay {
            deliver(&observer_key, &callback, event);
        }
        replay.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        // Observers never run under this lock, so a poisoned guard still holds consistent data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_delivery(&self) -> MutexGuard<'_, ()> {
        self.delivery.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl CacheState {
    fn store(&mut self, event: StreamEvent, limits: ReplayLimits) -> bool {
        if let Some(key) = SnapshotKey::for_event(&event) {
            if let Some(current) = self.snapshots.get(&key) {
                if current.stream_id == event.stream_id && current.sequence >= event.sequence {
                    return false;
                }
            }
            self.snapshots.insert(key, event);
            return true;
        }

        self.tick += 1;
        let tick = self.tick;
        let stream_id = event.stream_id.clone();
        let history = self.streams.entry(stream_id.clone()).or_default();
        if !history.push(event, limits.max_events_per_stream) {
            return false;
        }
        history.last_touch = tick;

        self.evict_streams(&stream_id, limits.max_streams.max(1));
        true
    }

    fn evict_streams(&mut self, keep: &str, max_streams: usize) {
        while self.streams.len() > max_streams {
            let oldest = self
                .streams
                .iter()
                .filter(|(stream_id, _)| stream_id.as_str() != keep)
                .min_by_key(|(_, history)| history.last_touch)
                .map(|(stream_id, _)| stream_id.clone());
            match oldest {
                Some(stream_id) => {
                    self.streams.remove(&stream_id);
                }
                None => break,
            }
        }
    }

    fn streams_by_recency(&self) -> Vec<(&String, &StreamHistory)> {
        let mut streams: Vec<_> = self.streams.iter().collect();
        streams.sort_by_key(|(_, history)| history.last_touch);
        streams
    }
}

fn deliver(observer_key: &str, callback: &Observer, event: &StreamEvent) {
    if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
        warn!(
            observer = observer_key,
            stream_id = %event.stream_id,
            sequence = event.sequence,
            "stream event observer panicked; continuing delivery"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Arc, Mutex},
        thread,
        time::Duration,
    };

    use chrono::Utc;
    use uuid::Uuid;

    use super::{ReplayCache, ReplayLimits, SnapshotKey};
    use crate::protocol::events::{
        EventPayload, Heartbeat, JobUpdate, StreamEvent, TextDelta,
    };

    fn content(stream_id: &str, sequence: i64, delta: &str) -> StreamEvent {
        StreamEvent {
            stream_id: stream_id.into(),
            sequence,
            workspace_id: Uuid::nil(),
            event: EventPayload::ContentDelta(TextDelta { delta: delta.into() }),
            message_id: None,
            created_at: Utc::now(),
        }
    }

    fn job(sequence: i64, status: &str) -> StreamEvent {
        StreamEvent {
            stream_id: "job_7".into(),
            sequence,
            workspace_id: Uuid::nil(),
            event: EventPayload::JobUpdate(JobUpdate {
                job_id: "7".into(),
                status: status.into(),
                progress: None,
                detail: serde_json::Value::Null,
            }),
            message_id: None,
            created_at: Utc::now(),
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<StreamEvent>>>, impl Fn(&StreamEvent) + Send + Sync) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |event: &StreamEvent| sink.lock().expect("recorder lock").push(event.clone()))
    }

    #[test]
    fn job_snapshots_keep_only_the_latest_update() {
        let cache = ReplayCache::default();
        cache.ingest(job(1, "queued"));
        cache.ingest(job(2, "running"));

        let snapshot =
            cache.snapshot(&SnapshotKey::Job("7".into())).expect("job snapshot should exist");
        assert_eq!(snapshot.sequence, 2);
        assert!(cache.stream_history("job_7").is_empty());
    }

    #[test]
    fn stream_observers_replay_snapshots_of_their_stream() {
        let cache = ReplayCache::default();
        cache.ingest(job(1, "queued"));
        cache.ingest(job(2, "running"));
        cache.ingest(content("other", 1, "x"));

        let (seen, observer) = recorder();
        let replayed = cache.subscribe_to_stream("job-widget", "job_7", observer);

        assert_eq!(replayed, 1);
        let seen = seen.lock().expect("recorder lock");
        assert_eq!(seen[0].sequence, 2);
        assert!(matches!(&seen[0].event, EventPayload::JobUpdate(update) if update.status == "running"));
    }

    #[test]
    fn known_stream_ids_include_snapshot_streams() {
        let cache = ReplayCache::default();
        cache.ingest(content("msg-1", 1, "x"));
        cache.ingest(job(4, "running"));

        assert_eq!(cache.stream_ids(), vec!["msg-1".to_owned()]);
        assert_eq!(cache.known_stream_ids(), vec!["msg-1".to_owned(), "job_7".to_owned()]);
        assert_eq!(cache.last_sequence("job_7"), Some(4));
    }

    #[test]
    fn replay_completes_before_live_events_are_delivered() {
        let cache = ReplayCache::default();
        for sequence in 1..=5 {
            cache.ingest(job(sequence, "running"));
            cache.ingest(content(&format!("s{sequence}"), 1, "cached"));
        }

        let (started_tx, started_rx) = mpsc::channel::<()>();
        let started_tx = Mutex::new(Some(started_tx));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let observer = move |event: &StreamEvent| {
            if let Some(started) = started_tx.lock().expect("signal lock").take() {
                started.send(()).expect("live writer should be waiting");
                thread::sleep(Duration::from_millis(50));
            }
            sink.lock().expect("recorder lock").push(event.stream_id.clone());
        };

        let live_cache = cache.clone();
        let live = thread::spawn(move || {
            started_rx.recv().expect("replay should start");
            live_cache.ingest(content("live", 1, "fresh"));
        });
        let replayed = cache.subscribe("board", observer);
        live.join().expect("live writer should finish");

        let seen = seen.lock().expect("recorder lock");
        assert_eq!(seen.len(), replayed + 1);
        assert_eq!(seen.last().map(String::as_str), Some("live"));
    }

    #[test]
    fn stale_snapshot_updates_are_ignored() {
        let cache = ReplayCache::default();
        cache.ingest(job(3, "done"));

        assert!(!cache.ingest(job(2, "running")));
        assert_eq!(cache.last_sequence("job_7"), Some(3));
    }

    #[test]
    fn pings_are_not_cached() {
        let cache = ReplayCache::default();
        let ping = StreamEvent {
            event: EventPayload::Ping(Heartbeat::default()),
            ..content("s1", 1, "")
        };

        assert!(!cache.ingest(ping));
        assert!(cache.stream_ids().is_empty());
    }

    #[test]
    fn least_recently_updated_stream_is_evicted() {
        let cache = ReplayCache::new(ReplayLimits { max_streams: 2, max_events_per_stream: 8 });
        cache.ingest(content("a", 1, "x"));
        cache.ingest(content("b", 1, "x"));
        cache.ingest(content("a", 2, "y"));
        cache.ingest(content("c", 1, "x"));

        assert_eq!(cache.stream_ids(), vec!["a".to_owned(), "c".to_owned()]);
    }

    #[test]
    fn live_events_reach_observers_unmerged() {
        let cache = ReplayCache::default();
        let (seen, observer) = recorder();
        cache.subscribe("widget", observer);

        cache.ingest(content("s1", 1, "Hel"));
        cache.ingest(content("s1", 2, "lo"));

        let seen = seen.lock().expect("recorder lock");
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1].sequence, 2);
    }

    #[test]
    fn resubscribing_replaces_the_observer() {
        let cache = ReplayCache::default();
        let (first, first_observer) = recorder();
        let (second, second_observer) = recorder();
        cache.subscribe("widget", first_observer);
        cache.subscribe("widget", second_observer);

        cache.ingest(content("s1", 1, "x"));

        assert!(first.lock().expect("recorder lock").is_empty());
        assert_eq!(second.lock().expect("recorder lock").len(), 1);
        assert_eq!(cache.observer_count(), 1);
        assert!(cache.unsubscribe("widget"));
        assert!(!cache.unsubscribe("widget"));
    }
}
