use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use super::{DEFAULT_MAX_RESOLUTION, Resolution, SessionError, SessionState, StreamSession};
use crate::decoder::DecoderFactory;
use crate::dispatch::{DispatchTask, Dispatcher};
use crate::metrics;
use crate::protocol::StreamId;

pub type SharedSession = Arc<Mutex<StreamSession>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Absent,
    CreationQueued,
    Ready,
    Active,
    Released,
}

/// Result of asking the registry for a stream's session.
#[derive(Debug)]
pub enum Lookup {
    Ready(SharedSession),
    /// First sighting: a pending marker was recorded and the caller must queue
    /// the creation task.
    Queued,
    /// Creation already queued and not yet completed.
    Pending,
    Released,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session {0} already exists")]
    DuplicateSessionCreation(StreamId),
    #[error("registry already released")]
    Released,
    #[error("failed to open session {id}: {source}")]
    Open {
        id: StreamId,
        #[source]
        source: SessionError,
    },
}

enum Slot {
    Pending,
    Live(SharedSession),
}

/// Stream id to session map.
///
/// `lookup_or_request` is the only way a new id enters the map, and it checks
/// and inserts under a single write lock, so concurrent frames for a new id
/// queue exactly one creation. Sessions are only ever built by
/// `complete_creation`, which runs on the owning thread and tolerates being
/// asked twice for the same id.
pub struct StreamRegistry {
    slots: RwLock<HashMap<StreamId, Slot>>,
    retired: Mutex<Vec<StreamId>>,
    factory: Arc<dyn DecoderFactory>,
    dispatcher: Arc<Dispatcher<DispatchTask>>,
    max_resolution: Resolution,
    released: AtomicBool,
}

impl StreamRegistry {
    pub fn new(factory: Arc<dyn DecoderFactory>, dispatcher: Arc<Dispatcher<DispatchTask>>) -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
            factory,
            dispatcher,
            max_resolution: DEFAULT_MAX_RESOLUTION,
            released: AtomicBool::new(false),
        }
    }

    /// Caps the resolution every session built by this registry accepts.
    pub fn with_max_resolution(mut self, max_resolution: Resolution) -> Self {
        self.max_resolution = max_resolution;
        self
    }

    pub fn max_resolution(&self) -> Resolution {
        self.max_resolution
    }

    pub fn lookup_or_request(&self, id: StreamId) -> Lookup {
        if self.released.load(Ordering::Acquire) {
            return Lookup::Released;
        }
        if let Some(Slot::Live(session)) = self.slots.read().get(&id) {
            return Lookup::Ready(session.clone());
        }

        let mut slots = self.slots.write();
        match slots.entry(id) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Live(session) => Lookup::Ready(session.clone()),
                Slot::Pending => Lookup::Pending,
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Pending);
                Lookup::Queued
            }
        }
    }

    /// Builds the session for `id`. Must run on the owning thread.
    ///
    /// A second call for an id that already has a session is a no-op that
    /// reports `DuplicateSessionCreation`. A failed open clears the pending
    /// marker so a later frame can queue a fresh attempt.
    pub fn complete_creation(&self, id: StreamId, resolution: Resolution) -> Result<(), RegistryError> {
        if self.released.load(Ordering::Acquire) {
            return Err(RegistryError::Released);
        }
        if matches!(self.slots.read().get(&id), Some(Slot::Live(_))) {
            metrics::SESSION_EVENTS
                .with_label_values(&["duplicate"])
                .inc();
            return Err(RegistryError::DuplicateSessionCreation(id));
        }

        let opened = StreamSession::open(
            id,
            self.factory.as_ref(),
            resolution,
            self.max_resolution,
            self.dispatcher.clone(),
        );

        let mut slots = self.slots.write();
        match opened {
            Ok(session) => {
                if matches!(slots.get(&id), Some(Slot::Live(_))) {
                    metrics::SESSION_EVENTS
                        .with_label_values(&["duplicate"])
                        .inc();
                    return Err(RegistryError::DuplicateSessionCreation(id));
                }
                slots.insert(id, Slot::Live(Arc::new(Mutex::new(session))));
                metrics::SESSION_EVENTS
                    .with_label_values(&["created"])
                    .inc();
                metrics::SESSIONS_LIVE.set(live_count(&slots) as i64);
                tracing::info!(
                    target: "beach_reel::registry",
                    stream = id,
                    %resolution,
                    "stream session ready"
                );
                Ok(())
            }
            Err(source) => {
                if matches!(slots.get(&id), Some(Slot::Pending)) {
                    slots.remove(&id);
                }
                metrics::SESSION_EVENTS
                    .with_label_values(&["failed"])
                    .inc();
                Err(RegistryError::Open { id, source })
            }
        }
    }

    pub fn get(&self, id: StreamId) -> Option<SharedSession> {
        match self.slots.read().get(&id) {
            Some(Slot::Live(session)) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn state(&self, id: StreamId) -> StreamState {
        if self.released.load(Ordering::Acquire) {
            return if self.retired.lock().contains(&id) {
                StreamState::Released
            } else {
                StreamState::Absent
            };
        }
        match self.slots.read().get(&id) {
            None => StreamState::Absent,
            Some(Slot::Pending) => StreamState::CreationQueued,
            Some(Slot::Live(session)) => match session.lock().state() {
                SessionState::Ready => StreamState::Ready,
                SessionState::Active => StreamState::Active,
                SessionState::Released => StreamState::Released,
            },
        }
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        live_count(&self.slots.read())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Live(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases every session and clears the map. Only the first call does
    /// anything; the caller must make sure no `process_frame` is in flight.
    pub fn release_all(&self) -> usize {
        if self.released.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let drained: Vec<(StreamId, Slot)> = self.slots.write().drain().collect();
        let mut released = 0;
        let mut retired = self.retired.lock();
        for (id, slot) in drained {
            if let Slot::Live(session) = slot {
                if session.lock().release() {
                    released += 1;
                }
                retired.push(id);
            }
        }
        metrics::SESSION_EVENTS
            .with_label_values(&["released"])
            .inc_by(released as u64);
        metrics::SESSIONS_LIVE.set(0);
        tracing::info!(target: "beach_reel::registry", released, "stream registry released");
        released
    }
}

fn live_count(slots: &HashMap<StreamId, Slot>) -> usize {
    slots
        .values()
        .filter(|slot| matches!(slot, Slot::Live(_)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::echo::EchoFactory;
    use std::thread;

    fn registry(factory: &Arc<EchoFactory>) -> StreamRegistry {
        StreamRegistry::new(factory.clone(), Arc::new(Dispatcher::new()))
    }

    const VGA: Resolution = Resolution::new(640, 480);

    #[test]
    fn first_sighting_queues_once() {
        let factory = Arc::new(EchoFactory::new(0));
        let registry = registry(&factory);
        assert_eq!(registry.state(1), StreamState::Absent);
        assert!(matches!(registry.lookup_or_request(1), Lookup::Queued));
        assert_eq!(registry.state(1), StreamState::CreationQueued);
        assert!(matches!(registry.lookup_or_request(1), Lookup::Pending));
        assert!(matches!(registry.lookup_or_request(1), Lookup::Pending));
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn duplicate_creation_is_a_no_op() {
        let factory = Arc::new(EchoFactory::new(0));
        let registry = registry(&factory);
        let _ = registry.lookup_or_request(3);
        registry.complete_creation(3, VGA).expect("first creation");
        let err = registry.complete_creation(3, VGA).expect_err("second creation");
        assert!(matches!(err, RegistryError::DuplicateSessionCreation(3)));
        assert_eq!(factory.created(), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state(3), StreamState::Ready);
        assert!(matches!(registry.lookup_or_request(3), Lookup::Ready(_)));
    }

    #[test]
    fn concurrent_first_sightings_create_one_session() {
        let factory = Arc::new(EchoFactory::new(0));
        let registry = Arc::new(registry(&factory));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..50)
                        .filter(|_| matches!(registry.lookup_or_request(9), Lookup::Queued))
                        .count()
                })
            })
            .collect();
        let queued: usize = handles
            .into_iter()
            .map(|h| h.join().expect("worker"))
            .sum();
        assert_eq!(queued, 1);

        for _ in 0..queued + 3 {
            let _ = registry.complete_creation(9, VGA);
        }
        assert_eq!(factory.created(), 1);
        assert_eq!(registry.ids(), vec![9]);
    }

    #[test]
    fn failed_open_allows_retry() {
        let factory = Arc::new(EchoFactory::new(0).failing_init());
        let registry = registry(&factory);
        assert!(matches!(registry.lookup_or_request(2), Lookup::Queued));
        let err = registry.complete_creation(2, VGA).expect_err("init fails");
        assert!(matches!(err, RegistryError::Open { id: 2, .. }));
        assert_eq!(registry.state(2), StreamState::Absent);
        assert!(matches!(registry.lookup_or_request(2), Lookup::Queued));
    }

    #[test]
    fn sessions_inherit_the_resolution_cap() {
        let factory = Arc::new(EchoFactory::new(0));
        let registry = registry(&factory).with_max_resolution(VGA);
        assert_eq!(registry.max_resolution(), VGA);

        let _ = registry.lookup_or_request(4);
        let err = registry
            .complete_creation(4, Resolution::new(1280, 720))
            .expect_err("above the cap");
        assert!(matches!(
            err,
            RegistryError::Open {
                id: 4,
                source: SessionError::InvalidResolution(_)
            }
        ));
        assert_eq!(factory.created(), 0);

        let _ = registry.lookup_or_request(4);
        registry.complete_creation(4, VGA).expect("at the cap");
        let session = registry.get(4).expect("session 4");
        assert!(matches!(
            session.lock().process_frame(&[1], 642, 480),
            Err(SessionError::InvalidResolution(_))
        ));
    }

    #[test]
    fn creation_logs_under_registry_target() {
        use tracing::field::{Field, Visit};
        use tracing::{Event, Subscriber};
        use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

        #[derive(Clone, Default)]
        struct Targets(Arc<Mutex<Vec<(String, Vec<String>)>>>);

        struct FieldNames(Vec<String>);

        impl Visit for FieldNames {
            fn record_debug(&mut self, field: &Field, _value: &dyn std::fmt::Debug) {
                self.0.push(field.name().to_string());
            }
        }

        impl<S: Subscriber> Layer<S> for Targets {
            fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
                let mut names = FieldNames(Vec::new());
                event.record(&mut names);
                self.0
                    .lock()
                    .push((event.metadata().target().to_string(), names.0));
            }
        }

        let targets = Targets::default();
        let subscriber = tracing_subscriber::registry().with(targets.clone());
        let factory = Arc::new(EchoFactory::new(0));
        tracing::subscriber::with_default(subscriber, || {
            let registry = registry(&factory);
            let _ = registry.lookup_or_request(6);
            registry.complete_creation(6, VGA).expect("create");
        });

        let events = targets.0.lock();
        let (_, fields) = events
            .iter()
            .find(|(target, _)| target == "beach_reel::registry")
            .expect("event under beach_reel::registry");
        assert!(fields.iter().any(|name| name == "stream"));
        assert!(fields.iter().all(|name| name != "target"));
    }

    #[test]
    fn release_all_runs_once() {
        let factory = Arc::new(EchoFactory::new(0));
        let registry = registry(&factory);
        for id in [1, 2, 3] {
            let _ = registry.lookup_or_request(id);
            registry.complete_creation(id, VGA).expect("create");
        }
        let held = registry.get(2).expect("session 2");

        assert_eq!(registry.release_all(), 3);
        assert_eq!(registry.release_all(), 0);
        assert_eq!(factory.released(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.state(2), StreamState::Released);
        assert_eq!(registry.state(200), StreamState::Absent);
        assert!(matches!(registry.lookup_or_request(4), Lookup::Released));
        assert!(matches!(
            registry.complete_creation(4, VGA),
            Err(RegistryError::Released)
        ));

        // A handle that outlived the registry does not release twice on drop.
        drop(held);
        assert_eq!(factory.released(), 3);
    }
}
