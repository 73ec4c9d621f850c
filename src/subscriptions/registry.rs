//! Subscription registry driving version-cursor delivery.

use crate::cell::VersionedCell;
use crate::error::{BusError, DeliveryError, DeliveryReport, Result, SubscriberFailure};
use crate::types::{AttachMode, SubscriberId, SubscriberState, Version};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::{Mutex, ReentrantMutex};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::types::{Callback, RegistryConfig, SubscriptionGuard, SubscriptionHandle};

/// Last version delivered to one subscriber.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    last_seen: Version,
}

/// Where deliveries for a subscriber go.
enum Sink<T> {
    Callback(Callback<T>),
    Channel(Sender<Arc<T>>),
}

impl<T> Clone for Sink<T> {
    fn clone(&self) -> Self {
        match self {
            Sink::Callback(callback) => Sink::Callback(Arc::clone(callback)),
            Sink::Channel(sender) => Sink::Channel(sender.clone()),
        }
    }
}

impl<T> Sink<T> {
    fn same_as(&self, other: &Sink<T>) -> bool {
        match (self, other) {
            (Sink::Callback(a), Sink::Callback(b)) => Arc::ptr_eq(a, b),
            (Sink::Channel(a), Sink::Channel(b)) => a.same_channel(b),
            _ => false,
        }
    }
}

/// Internal subscriber state.
struct Subscriber<T> {
    sink: Sink<T>,
    cursor: Cursor,
    mode: AttachMode,
}

struct RegistryState<T> {
    cell: VersionedCell<Arc<T>>,
    subscribers: HashMap<SubscriberId, Subscriber<T>>,
}

/// Holds the latest value and delivers it to attached subscribers.
///
/// Every subscriber carries a private cursor: the last version it was
/// handed. A delivery happens exactly when the cursor lags the cell.
///
/// All operations are serialized by a re-entrant dispatch lock, so a
/// callback may attach, detach, force or publish on the same registry
/// from the delivering thread. The state lock is never held while a
/// callback runs.
pub struct SubscriptionRegistry<T> {
    dispatch: ReentrantMutex<()>,
    state: Mutex<RegistryState<T>>,
    /// Latest value handed over by `post`, waiting for `dispatch_posted`.
    posted: Mutex<Option<T>>,
    config: RegistryConfig,
}

impl<T> SubscriptionRegistry<T> {
    /// Create an empty registry with the default config.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create an empty registry with a custom config.
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            dispatch: ReentrantMutex::new(()),
            state: Mutex::new(RegistryState {
                cell: VersionedCell::new(),
                subscribers: HashMap::new(),
            }),
            posted: Mutex::new(None),
            config,
        }
    }

    /// Registry whose cell already holds `value` at `version`.
    #[cfg(test)]
    fn starting_at(value: T, version: Version) -> Self {
        let registry = Self::new();
        registry.state.lock().cell = VersionedCell::at_version(Arc::new(value), version);
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // --- Attach / Detach ---

    /// Attach a callback subscriber.
    ///
    /// Attaching an id that is already present does nothing and keeps its
    /// cursor. With `ReplayCurrent` and a value in the cell, the callback
    /// runs before this returns; a failure there is reported as
    /// `DeliveryFailed` but the subscriber stays attached.
    ///
    /// Ids in the reserved range are refused with `ReservedSubscriberId`.
    pub fn attach<F>(&self, id: SubscriberId, mode: AttachMode, callback: F) -> Result<()>
    where
        F: Fn(&T) -> std::result::Result<(), DeliveryError> + Send + Sync + 'static,
    {
        Self::check_caller_id(id)?;
        self.attach_sink(id, mode, Sink::Callback(Arc::new(callback)))?;
        Ok(())
    }

    /// Attach using the configured default mode.
    pub fn observe<F>(&self, id: SubscriberId, callback: F) -> Result<()>
    where
        F: Fn(&T) -> std::result::Result<(), DeliveryError> + Send + Sync + 'static,
    {
        self.attach(id, self.config.default_mode, callback)
    }

    /// Attach a channel-backed subscriber with a fresh id.
    ///
    /// The id comes from the reserved range, so it never collides with a
    /// caller-chosen one. Values arrive on a bounded channel. A full buffer
    /// is reported as `BufferFull`; once the handle is dropped the
    /// subscriber is detached on the next delivery.
    pub fn subscribe_channel(&self, mode: AttachMode) -> Result<SubscriptionHandle<T>> {
        let id = SubscriberId::next_reserved();
        let (sender, receiver) = bounded(self.config.channel_buffer_size.max(1));
        let handle = SubscriptionHandle { id, receiver };
        self.attach_sink(id, mode, Sink::Channel(sender))?;
        Ok(handle)
    }

    fn check_caller_id(id: SubscriberId) -> Result<()> {
        if id.is_reserved() {
            return Err(BusError::ReservedSubscriberId(id));
        }
        Ok(())
    }

    /// Insert a subscriber and run its replay. Returns false when the id was
    /// already attached and nothing changed.
    fn attach_sink(&self, id: SubscriberId, mode: AttachMode, sink: Sink<T>) -> Result<bool> {
        let _dispatch = self.dispatch.lock();

        let replay = {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.subscribers.contains_key(&id) {
                trace!(%id, "attach ignored, already attached");
                return Ok(false);
            }

            let current = state.cell.version();
            let mut cursor = Cursor {
                last_seen: mode.initial_cursor(current),
            };
            let replay = match state.cell.value() {
                Some(value) if state.cell.is_delivery_due(cursor.last_seen) => {
                    cursor.last_seen = current;
                    Some(Arc::clone(value))
                }
                _ => None,
            };

            state.subscribers.insert(
                id,
                Subscriber {
                    sink: sink.clone(),
                    cursor,
                    mode,
                },
            );
            debug!(%id, ?mode, version = %current, replay = replay.is_some(), "subscriber attached");
            replay.map(|value| (value, current))
        };

        if let Some((value, version)) = replay {
            let mut failures = Vec::new();
            self.deliver(id, &sink, &value, &mut failures);
            Self::into_result(version, failures)?;
        }
        Ok(true)
    }

    /// Remove a subscriber and its cursor. Unknown ids are ignored.
    pub fn detach(&self, id: SubscriberId) {
        let _dispatch = self.dispatch.lock();
        if self.state.lock().subscribers.remove(&id).is_some() {
            debug!(%id, "subscriber detached");
        } else {
            trace!(%id, "detach ignored, not attached");
        }
    }

    /// Move a subscriber's cursor to the current version without calling it.
    ///
    /// Any pending delivery, including one queued in an in-flight publish,
    /// is skipped. Unknown ids are ignored.
    pub fn force_cursor_to_latest(&self, id: SubscriberId) {
        let _dispatch = self.dispatch.lock();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let version = state.cell.version();

        match state.subscribers.get_mut(&id) {
            Some(subscriber) => {
                if subscriber.cursor.last_seen < version {
                    debug!(%id, from = %subscriber.cursor.last_seen, to = %version, "pending delivery skipped");
                }
                subscriber.cursor.last_seen = version;
            }
            None => trace!(%id, "force ignored, not attached"),
        }
    }

    // --- Publishing ---

    /// Publish a value and deliver it to every subscriber that is due.
    ///
    /// The set of due subscribers is fixed before the first callback runs;
    /// subscribers attached during the pass get nothing from it. A failing
    /// callback does not stop delivery to the others; all failures come
    /// back together as `DeliveryFailed` once the pass is complete.
    pub fn publish(&self, value: T) -> Result<Version> {
        let _dispatch = self.dispatch.lock();

        let value = Arc::new(value);
        let (version, due) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let version = state.cell.publish(Arc::clone(&value))?;
            let due: Vec<SubscriberId> = state
                .subscribers
                .iter()
                .filter(|(_, sub)| state.cell.is_delivery_due(sub.cursor.last_seen))
                .map(|(id, _)| *id)
                .collect();
            (version, due)
        };
        debug!(version = %version, due = due.len(), "value published");

        let mut failures = Vec::new();
        for id in due {
            if let Some(sink) = self.claim(id, version) {
                self.deliver(id, &sink, &value, &mut failures);
            }
        }

        Self::into_result(version, failures)?;
        Ok(version)
    }

    /// Hand over a value from any thread for a later `dispatch_posted`.
    ///
    /// Only the latest posted value is kept. Returns true when the slot was
    /// empty, i.e. the caller should schedule a dispatch.
    pub fn post(&self, value: T) -> bool {
        let was_empty = self.posted.lock().replace(value).is_none();
        trace!(schedule = was_empty, "value posted");
        was_empty
    }

    /// Publish the pending posted value, if any. Runs on the delivery thread.
    pub fn dispatch_posted(&self) -> Result<Option<Version>> {
        let pending = self.posted.lock().take();
        match pending {
            Some(value) => self.publish(value).map(Some),
            None => Ok(None),
        }
    }

    pub fn has_posted(&self) -> bool {
        self.posted.lock().is_some()
    }

    /// Re-check a snapshotted subscriber and advance its cursor.
    ///
    /// Returns nothing if it was detached, forced, re-attached, or already
    /// served by a nested publish since the snapshot.
    fn claim(&self, id: SubscriberId, version: Version) -> Option<Sink<T>> {
        let mut state = self.state.lock();
        let subscriber = state.subscribers.get_mut(&id)?;
        if subscriber.cursor.last_seen >= version {
            trace!(%id, version = %version, "delivery no longer due");
            return None;
        }
        subscriber.cursor.last_seen = version;
        Some(subscriber.sink.clone())
    }

    fn deliver(
        &self,
        id: SubscriberId,
        sink: &Sink<T>,
        value: &Arc<T>,
        failures: &mut Vec<SubscriberFailure>,
    ) {
        match self.invoke(sink, value) {
            Ok(()) => {}
            Err(DeliveryError::Disconnected) => {
                let mut state = self.state.lock();
                if state
                    .subscribers
                    .get(&id)
                    .is_some_and(|sub| sub.sink.same_as(sink))
                {
                    state.subscribers.remove(&id);
                    warn!(%id, "subscriber disconnected, detached");
                }
            }
            Err(error) => {
                warn!(%id, %error, "subscriber delivery failed");
                failures.push(SubscriberFailure { id, error });
            }
        }
    }

    fn invoke(&self, sink: &Sink<T>, value: &Arc<T>) -> std::result::Result<(), DeliveryError> {
        match sink {
            Sink::Channel(sender) => match sender.try_send(Arc::clone(value)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(DeliveryError::BufferFull),
                Err(TrySendError::Disconnected(_)) => Err(DeliveryError::Disconnected),
            },
            Sink::Callback(callback) if self.config.catch_panics => {
                match panic::catch_unwind(AssertUnwindSafe(|| callback(value.as_ref()))) {
                    Ok(result) => result,
                    Err(payload) => Err(DeliveryError::Panicked(panic_message(payload.as_ref()))),
                }
            }
            Sink::Callback(callback) => callback(value.as_ref()),
        }
    }

    fn into_result(version: Version, failures: Vec<SubscriberFailure>) -> Result<()> {
        if failures.is_empty() {
            Ok(())
        } else {
            Err(BusError::DeliveryFailed(DeliveryReport { version, failures }))
        }
    }

    // --- Queries ---

    /// Current value (if any) and version.
    pub fn snapshot(&self) -> (Option<Arc<T>>, Version) {
        let state = self.state.lock();
        let (value, version) = state.cell.snapshot();
        (value.cloned(), version)
    }

    pub fn version(&self) -> Version {
        self.state.lock().cell.version()
    }

    pub fn has_value(&self) -> bool {
        self.state.lock().cell.value().is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    pub fn is_attached(&self, id: SubscriberId) -> bool {
        self.state.lock().subscribers.contains_key(&id)
    }

    /// Mode a subscriber attached with.
    pub fn mode_of(&self, id: SubscriberId) -> Option<AttachMode> {
        self.state.lock().subscribers.get(&id).map(|sub| sub.mode)
    }

    pub fn state_of(&self, id: SubscriberId) -> SubscriberState {
        let state = self.state.lock();
        match state.subscribers.get(&id) {
            None => SubscriberState::Detached,
            Some(sub) if state.cell.is_delivery_due(sub.cursor.last_seen) => {
                SubscriberState::Pending
            }
            Some(_) => SubscriberState::Current,
        }
    }
}

impl<T> SubscriptionRegistry<T> {
    /// Attach a callback that is detached again when the guard drops.
    ///
    /// If the id is already attached nothing changes and the returned guard
    /// does not own the subscriber, so dropping it leaves the existing one
    /// in place. If the replay fails the new subscriber is detached before
    /// the error is returned.
    pub fn attach_scoped<F>(
        self: &Arc<Self>,
        id: SubscriberId,
        mode: AttachMode,
        callback: F,
    ) -> Result<SubscriptionGuard<T>>
    where
        F: Fn(&T) -> std::result::Result<(), DeliveryError> + Send + Sync + 'static,
    {
        Self::check_caller_id(id)?;
        match self.attach_sink(id, mode, Sink::Callback(Arc::new(callback))) {
            Ok(true) => Ok(SubscriptionGuard::new(Arc::clone(self), id)),
            Ok(false) => Ok(SubscriptionGuard::unowned(id)),
            Err(e) => {
                self.detach(id);
                Err(e)
            }
        }
    }
}

impl<T> Default for SubscriptionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn recorder(log: &Log) -> impl Fn(&String) -> std::result::Result<(), DeliveryError> {
        let log = Arc::clone(log);
        move |value: &String| {
            log.lock().push(value.clone());
            Ok(())
        }
    }

    fn seen(log: &Log) -> Vec<String> {
        log.lock().clone()
    }

    #[test]
    fn test_replay_on_attach() {
        let registry = SubscriptionRegistry::new();
        registry.publish("x".to_string()).unwrap();

        let log = Log::default();
        registry
            .attach(SubscriberId(1), AttachMode::ReplayCurrent, recorder(&log))
            .unwrap();

        assert_eq!(seen(&log), vec!["x"]);
        assert_eq!(registry.state_of(SubscriberId(1)), SubscriberState::Current);
    }

    #[test]
    fn test_skip_on_attach() {
        let registry = SubscriptionRegistry::new();
        registry.publish("x".to_string()).unwrap();

        let log = Log::default();
        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, recorder(&log))
            .unwrap();
        assert!(seen(&log).is_empty());

        registry.publish("y".to_string()).unwrap();
        assert_eq!(seen(&log), vec!["y"]);
    }

    #[test]
    fn test_replay_on_empty_cell_waits_for_publish() {
        let registry = SubscriptionRegistry::new();
        let log = Log::default();
        registry
            .attach(SubscriberId(1), AttachMode::ReplayCurrent, recorder(&log))
            .unwrap();
        assert!(seen(&log).is_empty());
        assert_eq!(registry.state_of(SubscriberId(1)), SubscriberState::Current);

        registry.publish("x".to_string()).unwrap();
        assert_eq!(seen(&log), vec!["x"]);
    }

    #[test]
    fn test_duplicate_attach_keeps_cursor() {
        let registry = SubscriptionRegistry::new();
        registry.publish("x".to_string()).unwrap();

        let log = Log::default();
        registry
            .attach(SubscriberId(1), AttachMode::ReplayCurrent, recorder(&log))
            .unwrap();
        registry
            .attach(SubscriberId(1), AttachMode::ReplayCurrent, recorder(&log))
            .unwrap();

        assert_eq!(seen(&log), vec!["x"]);
        assert_eq!(registry.subscriber_count(), 1);
    }

    #[test]
    fn test_force_cursor_on_unknown_id_is_noop() {
        let registry: SubscriptionRegistry<String> = SubscriptionRegistry::new();
        registry.force_cursor_to_latest(SubscriberId(42));
        registry.detach(SubscriberId(42));
        assert_eq!(registry.state_of(SubscriberId(42)), SubscriberState::Detached);
    }

    #[test]
    fn test_detach_during_pass_skips_subscriber() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let log = Log::default();

        // Whichever of 1 and 2 runs first detaches the other.
        for (me, other) in [(1, 2), (2, 1)] {
            let inner = Arc::downgrade(&registry);
            let log = Arc::clone(&log);
            registry
                .attach(SubscriberId(me), AttachMode::SkipToLatest, move |value: &String| {
                    log.lock().push(format!("{me}:{value}"));
                    if let Some(registry) = inner.upgrade() {
                        registry.detach(SubscriberId(other));
                    }
                    Ok(())
                })
                .unwrap();
        }

        registry.publish("x".to_string()).unwrap();
        assert_eq!(seen(&log).len(), 1);
        assert_eq!(registry.subscriber_count(), 1);
    }

    #[test]
    fn test_attach_during_pass_gets_nothing_from_it() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let late = Log::default();

        let inner = Arc::downgrade(&registry);
        let late_log = Arc::clone(&late);
        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, move |_: &String| {
                if let Some(registry) = inner.upgrade() {
                    registry
                        .attach(SubscriberId(2), AttachMode::SkipToLatest, recorder(&late_log))
                        .map_err(DeliveryError::callback)?;
                }
                Ok(())
            })
            .unwrap();

        registry.publish("x".to_string()).unwrap();
        assert!(seen(&late).is_empty());
        assert!(registry.is_attached(SubscriberId(2)));

        registry.publish("y".to_string()).unwrap();
        assert_eq!(seen(&late), vec!["y"]);
    }

    #[test]
    fn test_replay_attach_during_pass_is_not_double_delivered() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let late = Log::default();

        let inner = Arc::downgrade(&registry);
        let late_log = Arc::clone(&late);
        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, move |_: &String| {
                if let Some(registry) = inner.upgrade() {
                    registry
                        .attach(SubscriberId(2), AttachMode::ReplayCurrent, recorder(&late_log))
                        .map_err(DeliveryError::callback)?;
                }
                Ok(())
            })
            .unwrap();

        registry.publish("x".to_string()).unwrap();
        // Replayed once by its own attach, not again by the in-flight pass.
        assert_eq!(seen(&late), vec!["x"]);
    }

    #[test]
    fn test_nested_publish_does_not_deliver_stale_value() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let log = Log::default();

        let inner = Arc::downgrade(&registry);
        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, move |value: &String| {
                if value == "first" {
                    if let Some(registry) = inner.upgrade() {
                        registry.publish("second".to_string()).map_err(DeliveryError::callback)?;
                    }
                }
                Ok(())
            })
            .unwrap();
        registry
            .attach(SubscriberId(2), AttachMode::SkipToLatest, recorder(&log))
            .unwrap();

        registry.publish("first".to_string()).unwrap();

        let got = seen(&log);
        assert_eq!(got.last().map(String::as_str), Some("second"));
        assert!(got.len() <= 2);
        assert_eq!(registry.state_of(SubscriberId(2)), SubscriberState::Current);
    }

    #[test]
    fn test_failures_are_aggregated() {
        let registry = SubscriptionRegistry::new();
        let log = Log::default();

        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, |_: &String| {
                Err(DeliveryError::callback("rejected"))
            })
            .unwrap();
        registry
            .attach(SubscriberId(2), AttachMode::SkipToLatest, recorder(&log))
            .unwrap();
        registry
            .attach(SubscriberId(3), AttachMode::SkipToLatest, |_: &String| {
                if true {
                    panic!("exploded");
                }
                Ok(())
            })
            .unwrap();

        let err = registry.publish("x".to_string()).unwrap_err();
        let BusError::DeliveryFailed(report) = err else {
            panic!("expected DeliveryFailed");
        };

        assert_eq!(report.version, Version(1));
        let mut ids = report.failed_ids();
        ids.sort_by_key(|id| id.0);
        assert_eq!(ids, vec![SubscriberId(1), SubscriberId(3)]);
        assert!(matches!(
            report.failure_for(SubscriberId(3)),
            Some(DeliveryError::Panicked(msg)) if msg == "exploded"
        ));
        assert_eq!(seen(&log), vec!["x"]);

        // A failed delivery still counts as delivered.
        assert_eq!(registry.state_of(SubscriberId(1)), SubscriberState::Current);
    }

    #[test]
    fn test_channel_subscriber_receives_values() {
        let registry = SubscriptionRegistry::new();
        registry.publish(1u32).unwrap();

        let handle = registry.subscribe_channel(AttachMode::ReplayCurrent).unwrap();
        registry.publish(2).unwrap();

        assert_eq!(*handle.recv_timeout(Duration::from_millis(100)).unwrap(), 1);
        assert_eq!(*handle.recv_timeout(Duration::from_millis(100)).unwrap(), 2);
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_channel_overflow_is_reported() {
        let registry = SubscriptionRegistry::with_config(RegistryConfig {
            channel_buffer_size: 2,
            ..Default::default()
        });
        let handle = registry.subscribe_channel(AttachMode::SkipToLatest).unwrap();

        registry.publish(1u32).unwrap();
        registry.publish(2).unwrap();
        let err = registry.publish(3).unwrap_err();

        assert!(matches!(
            err,
            BusError::DeliveryFailed(ref report)
                if matches!(report.failure_for(handle.id), Some(DeliveryError::BufferFull))
        ));
        assert_eq!(handle.drain().iter().map(|v| **v).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_dropped_channel_is_detached() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe_channel(AttachMode::SkipToLatest).unwrap();
        let id = handle.id;
        drop(handle);

        registry.publish(1u32).unwrap();
        assert!(!registry.is_attached(id));
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_post_keeps_latest() {
        let registry = SubscriptionRegistry::new();
        let log = Log::default();
        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, recorder(&log))
            .unwrap();

        assert!(registry.post("a".to_string()));
        assert!(!registry.post("b".to_string()));
        assert!(registry.has_posted());

        assert_eq!(registry.dispatch_posted().unwrap(), Some(Version(1)));
        assert_eq!(registry.dispatch_posted().unwrap(), None);
        assert_eq!(seen(&log), vec!["b"]);
    }

    #[test]
    fn test_scoped_attach_detaches_on_drop() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let log = Log::default();

        {
            let _guard = registry
                .attach_scoped(SubscriberId(1), AttachMode::SkipToLatest, recorder(&log))
                .unwrap();
            registry.publish("x".to_string()).unwrap();
        }
        registry.publish("y".to_string()).unwrap();

        assert_eq!(seen(&log), vec!["x"]);
        assert!(!registry.is_attached(SubscriberId(1)));
    }

    #[test]
    fn test_released_guard_keeps_subscriber() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let guard = registry
            .attach_scoped(SubscriberId(1), AttachMode::SkipToLatest, |_: &String| Ok(()))
            .unwrap();

        assert_eq!(guard.release(), SubscriberId(1));
        assert!(registry.is_attached(SubscriberId(1)));
    }

    #[test]
    fn test_scoped_attach_on_existing_id_does_not_own_it() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let log = Log::default();
        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, recorder(&log))
            .unwrap();

        let guard = registry
            .attach_scoped(SubscriberId(1), AttachMode::SkipToLatest, |_: &String| Ok(()))
            .unwrap();
        assert!(!guard.owns_subscriber());
        drop(guard);

        registry.publish("x".to_string()).unwrap();
        assert!(registry.is_attached(SubscriberId(1)));
        assert_eq!(seen(&log), vec!["x"]);
    }

    #[test]
    fn test_failed_scoped_replay_detaches() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        registry.publish("x".to_string()).unwrap();

        let result = registry.attach_scoped(SubscriberId(1), AttachMode::ReplayCurrent, |_: &String| {
            Err(DeliveryError::callback("rejected"))
        });

        assert!(matches!(result, Err(BusError::DeliveryFailed(_))));
        assert!(!registry.is_attached(SubscriberId(1)));
    }

    #[test]
    fn test_channel_ids_never_collide_with_caller_ids() {
        let registry = SubscriptionRegistry::<u32>::new();
        let handle = registry.subscribe_channel(AttachMode::SkipToLatest).unwrap();
        assert!(handle.id.is_reserved());

        let count = Arc::new(Mutex::new(0));
        for id in 0..4 {
            let count = Arc::clone(&count);
            registry
                .attach(SubscriberId(id), AttachMode::SkipToLatest, move |_: &u32| {
                    *count.lock() += 1;
                    Ok(())
                })
                .unwrap();
        }
        assert_eq!(registry.subscriber_count(), 5);

        registry.publish(7).unwrap();
        assert_eq!(*count.lock(), 4);
        assert_eq!(handle.drain().iter().map(|v| **v).collect::<Vec<_>>(), vec![7]);
    }

    #[test]
    fn test_reserved_ids_are_refused() {
        let registry = Arc::new(SubscriptionRegistry::<String>::new());
        let handle = registry.subscribe_channel(AttachMode::SkipToLatest).unwrap();

        let result = registry.attach(handle.id, AttachMode::SkipToLatest, |_: &String| Ok(()));
        assert!(matches!(result, Err(BusError::ReservedSubscriberId(id)) if id == handle.id));

        let reserved = SubscriberId(SubscriberId::RESERVED_BIT | 5);
        let scoped = registry.attach_scoped(reserved, AttachMode::SkipToLatest, |_: &String| Ok(()));
        assert!(matches!(scoped, Err(BusError::ReservedSubscriberId(_))));
        assert_eq!(registry.subscriber_count(), 1);
    }

    #[test]
    fn test_overflowing_publish_leaves_subscribers_untouched() {
        let registry = SubscriptionRegistry::starting_at("last".to_string(), Version(u64::MAX));
        let log = Log::default();
        registry
            .attach(SubscriberId(1), AttachMode::SkipToLatest, recorder(&log))
            .unwrap();
        let handle = registry.subscribe_channel(AttachMode::SkipToLatest).unwrap();

        let err = registry.publish("lost".to_string()).unwrap_err();
        assert!(matches!(err, BusError::VersionOverflow { version } if version == Version(u64::MAX)));

        assert!(seen(&log).is_empty());
        assert!(handle.try_recv().is_err());
        let (value, version) = registry.snapshot();
        assert_eq!(value.as_deref().map(String::as_str), Some("last"));
        assert_eq!(version, Version(u64::MAX));
        assert_eq!(registry.subscriber_count(), 2);
        assert_eq!(registry.state_of(SubscriberId(1)), SubscriberState::Current);
        assert_eq!(registry.state_of(handle.id), SubscriberState::Current);
    }

    #[test]
    fn test_observe_uses_default_mode() {
        let registry = SubscriptionRegistry::with_config(RegistryConfig {
            default_mode: AttachMode::ReplayCurrent,
            ..Default::default()
        });
        registry.publish("x".to_string()).unwrap();

        let log = Log::default();
        registry.observe(SubscriberId(1), recorder(&log)).unwrap();

        assert_eq!(seen(&log), vec!["x"]);
        assert_eq!(registry.mode_of(SubscriberId(1)), Some(AttachMode::ReplayCurrent));
    }
}
