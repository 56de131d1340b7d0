//! Integration tests for watches and sink wake-ups.

use std::sync::{Arc, Mutex, OnceLock, Weak};

use xixibase::{
    CacheError, CacheManager, ManualClock, WatchEvent, WatchPoll, WatchSink, WatchUpdate,
};

const START: u32 = 5_000;

/// Records every wake-up and calls back into the manager while doing so,
/// which would deadlock if sinks were woken under the manager lock.
#[derive(Default)]
struct RecordingSink {
    manager: OnceLock<Weak<CacheManager>>,
    woken: Mutex<Vec<u32>>,
}

impl WatchSink for RecordingSink {
    fn on_watch_notify(&self, watch_id: u32) {
        if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
            let _ = manager.watch_count();
        }
        self.woken.lock().unwrap().push(watch_id);
    }
}

impl RecordingSink {
    fn woken(&self) -> Vec<u32> {
        self.woken.lock().unwrap().clone()
    }
}

fn create_cache() -> (Arc<CacheManager>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(START));
    let cache = CacheManager::builder().clock(clock.clone()).build();
    (Arc::new(cache), clock)
}

fn sink_for(cache: &Arc<CacheManager>) -> Arc<RecordingSink> {
    let sink = Arc::new(RecordingSink::default());
    let _ = sink.manager.set(Arc::downgrade(cache));
    sink
}

fn set(cache: &CacheManager, key: &[u8], data: &[u8], watch_id: u32) -> u64 {
    let item = cache.new_item(0, key, data, b"", 0, 0).unwrap();
    cache.set(item, watch_id).unwrap()
}

#[test]
fn test_create_watch_ids_nonzero_and_distinct() {
    let (cache, _) = create_cache();
    let a = cache.create_watch(0, 60).unwrap();
    let b = cache.create_watch(0, 60).unwrap();
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
    assert_eq!(cache.watch_count(), 2);
}

#[test]
fn test_unknown_watch_rejected() {
    let (cache, _) = create_cache();
    set(&cache, b"k", b"v", 0);

    assert_eq!(cache.get(0, b"k", 999).unwrap_err(), CacheError::WatchNotFound);
    let item = cache.new_item(0, b"other", b"v", b"", 0, 0).unwrap();
    assert_eq!(cache.add(item, 999).unwrap_err(), CacheError::WatchNotFound);
    assert_eq!(cache.get(0, b"other", 0).unwrap_err(), CacheError::NotFound);

    let sink = cache.register_sink(sink_for(&cache));
    assert_eq!(
        cache
            .check_watch_and_set_callback(sink, 0, 999, 0, 60)
            .unwrap_err(),
        CacheError::WatchNotFound
    );
    cache.check_invariants().unwrap();
}

#[test]
fn test_redelivery_until_acknowledged() {
    let (cache, _) = create_cache();
    let sink = sink_for(&cache);
    let handle = cache.register_sink(sink.clone());
    let watch_id = cache.create_watch(0, 60).unwrap();

    let cache_id = set(&cache, b"k", b"v1", 0);
    cache.get(0, b"k", watch_id).unwrap();

    let poll = cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    assert_eq!(poll, WatchPoll::Waiting);

    cache.remove(0, b"k", 0).unwrap();
    assert_eq!(sink.woken(), vec![watch_id]);

    let first = cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    let WatchPoll::Ready(batch) = first.clone() else {
        panic!("expected a batch, got {first:?}");
    };
    assert_ne!(batch.sequence, 0);
    assert_eq!(
        batch.updates,
        vec![WatchUpdate {
            cache_id,
            event: WatchEvent::Deleted,
        }]
    );

    let again = cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    assert_eq!(again, first);

    let acked = cache
        .check_watch_and_set_callback(handle, 0, watch_id, batch.sequence, 60)
        .unwrap();
    assert_eq!(acked, WatchPoll::Waiting);
}

#[test]
fn test_events_for_each_change() {
    let (cache, clock) = create_cache();
    let watch_id = cache.create_watch(0, 600).unwrap();
    let handle = cache.register_sink(sink_for(&cache));

    set(&cache, b"data", b"1", watch_id);
    set(&cache, b"data", b"2", 0);

    set(&cache, b"base", b"1", watch_id);
    cache.update_flags(0, b"base", 7, 0).unwrap();

    set(&cache, b"count", b"10", watch_id);
    cache.delta(0, b"count", true, 1, 0).unwrap();

    let item = cache.new_item(0, b"short", b"v", b"", 0, 2).unwrap();
    cache.add(item, watch_id).unwrap();
    clock.advance(3);
    cache.check_expired();

    let item = cache.new_item(1, b"flushed", b"v", b"", 0, 0).unwrap();
    cache.add(item, watch_id).unwrap();
    cache.flush(1);

    let poll = cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 600)
        .unwrap();
    let WatchPoll::Ready(batch) = poll else {
        panic!("expected a batch");
    };
    let events: Vec<WatchEvent> = batch.updates.iter().map(|u| u.event).collect();
    assert_eq!(
        events,
        vec![
            WatchEvent::DataUpdated,
            WatchEvent::BaseInfoUpdated,
            WatchEvent::DataUpdated,
            WatchEvent::Expired,
            WatchEvent::Flushed,
        ]
    );
}

#[test]
fn test_new_watch_misses_replaced_item() {
    let (cache, _) = create_cache();
    let watch_id = cache.create_watch(0, 60).unwrap();
    let handle = cache.register_sink(sink_for(&cache));

    set(&cache, b"k", b"v1", 0);
    let new_id = set(&cache, b"k", b"v2", watch_id);

    let poll = cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    assert_eq!(poll, WatchPoll::Waiting);

    cache.remove(0, b"k", 0).unwrap();
    let poll = cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    let WatchPoll::Ready(batch) = poll else {
        panic!("expected a batch");
    };
    assert_eq!(
        batch.updates,
        vec![WatchUpdate {
            cache_id: new_id,
            event: WatchEvent::Deleted,
        }]
    );
}

#[test]
fn test_notification_disarms_sink() {
    let (cache, _) = create_cache();
    let watch_id = cache.create_watch(0, 60).unwrap();
    let handle = cache.register_sink(sink_for(&cache));

    set(&cache, b"k", b"v", watch_id);
    cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    cache.update_flags(0, b"k", 1, 0).unwrap();

    // the notification disarmed the sink, so clearing it collects nothing
    assert_eq!(
        cache.check_watch_and_clear_callback(handle, watch_id).unwrap(),
        None
    );

    cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .map(|poll| assert!(matches!(poll, WatchPoll::Ready(_))))
        .unwrap();
}

#[test]
fn test_replaced_sink_is_woken() {
    let (cache, _) = create_cache();
    let watch_id = cache.create_watch(0, 60).unwrap();
    let first = sink_for(&cache);
    let second = sink_for(&cache);
    let first_handle = cache.register_sink(first.clone());
    let second_handle = cache.register_sink(second.clone());

    cache
        .check_watch_and_set_callback(first_handle, 0, watch_id, 0, 60)
        .unwrap();
    cache
        .check_watch_and_set_callback(first_handle, 0, watch_id, 0, 60)
        .unwrap();
    assert!(first.woken().is_empty());

    cache
        .check_watch_and_set_callback(second_handle, 0, watch_id, 0, 60)
        .unwrap();
    assert_eq!(first.woken(), vec![watch_id]);
    assert!(second.woken().is_empty());
}

#[test]
fn test_unregistered_sink_not_woken() {
    let (cache, _) = create_cache();
    let watch_id = cache.create_watch(0, 60).unwrap();
    let sink = sink_for(&cache);
    let handle = cache.register_sink(sink.clone());

    set(&cache, b"k", b"v", watch_id);
    cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    assert!(cache.unregister_sink(handle));

    cache.remove(0, b"k", 0).unwrap();
    assert!(sink.woken().is_empty());
}

#[test]
fn test_clear_callback_disarms() {
    let (cache, _) = create_cache();
    let watch_id = cache.create_watch(0, 60).unwrap();
    let sink = sink_for(&cache);
    let handle = cache.register_sink(sink.clone());

    set(&cache, b"k", b"v", watch_id);
    cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 60)
        .unwrap();
    assert_eq!(
        cache.check_watch_and_clear_callback(handle, watch_id).unwrap(),
        None
    );

    cache.remove(0, b"k", 0).unwrap();
    assert!(sink.woken().is_empty());
    assert_eq!(
        cache.check_watch_and_clear_callback(handle, 12345).unwrap_err(),
        CacheError::WatchNotFound
    );
}

#[test]
fn test_idle_watch_expires() {
    let (cache, clock) = create_cache();
    let watch_id = cache.create_watch(0, 10).unwrap();
    let handle = cache.register_sink(sink_for(&cache));

    clock.advance(5);
    cache
        .check_watch_and_set_callback(handle, 0, watch_id, 0, 10)
        .unwrap();

    clock.advance(9);
    cache.check_expired();
    assert_eq!(cache.watch_count(), 1);

    clock.advance(1);
    cache.check_expired();
    assert_eq!(cache.watch_count(), 0);
    assert_eq!(
        cache.get(0, b"k", watch_id).unwrap_err(),
        CacheError::NotFound
    );
    set(&cache, b"k", b"v", 0);
    assert_eq!(
        cache.get(0, b"k", watch_id).unwrap_err(),
        CacheError::WatchNotFound
    );
}
