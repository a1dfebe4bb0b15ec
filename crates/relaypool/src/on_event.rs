//! Event callbacks and the wrappers the pool puts around them.

use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::event::{Event, is_replaceable_kind};
use crate::filter::{Filter, match_filters};

/// Called with an event, whether the relay already sent EOSE for the
/// subscription, and the relay URL (`None` for events served from the cache).
pub type OnEvent = Arc<dyn Fn(&Event, bool, Option<&str>) + Send + Sync>;

/// Called once per relay when it reports end of stored events, with the oldest
/// `created_at` it delivered for the subscription.
pub type OnEose = Arc<dyn Fn(&str, Option<u64>) + Send + Sync>;

/// Build an [`OnEvent`] from a closure.
pub fn on_event<F>(f: F) -> OnEvent
where
    F: Fn(&Event, bool, Option<&str>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Build an [`OnEose`] from a closure.
pub fn on_eose<F>(f: F) -> OnEose
where
    F: Fn(&str, Option<u64>) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Invoke an application callback, containing any panic it raises.
pub(crate) fn guarded(what: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("{} callback panicked; continuing delivery", what);
    }
}

/// Drop events whose id was already delivered through this callback.
pub fn dedup_events(inner: OnEvent) -> OnEvent {
    let seen: Mutex<HashSet<String>> = Mutex::new(HashSet::new());
    Arc::new(move |event: &Event, after_eose: bool, url: Option<&str>| {
        if !seen.lock().insert(event.id.clone()) {
            return;
        }
        inner(event, after_eose, url);
    })
}

/// Drop replaceable-kind events that are not newer than the last one delivered
/// for the same author and kind.
pub fn drop_older_events(inner: OnEvent) -> OnEvent {
    let newest: Mutex<HashMap<(String, u16), u64>> = Mutex::new(HashMap::new());
    Arc::new(move |event: &Event, after_eose: bool, url: Option<&str>| {
        if is_replaceable_kind(event.kind) {
            let mut newest = newest.lock();
            let key = (event.pubkey.clone(), event.kind);
            if let Some(&created_at) = newest.get(&key)
                && created_at >= event.created_at
            {
                return;
            }
            newest.insert(key, event.created_at);
        }
        inner(event, after_eose, url);
    })
}

/// Forward only events that match at least one filter.
pub fn match_filters_only(inner: OnEvent, filters: Vec<Filter>) -> OnEvent {
    Arc::new(move |event: &Event, after_eose: bool, url: Option<&str>| {
        if match_filters(&filters, event) {
            inner(event, after_eose, url);
        }
    })
}

/// Log every delivered event at debug level.
pub fn log_events(inner: OnEvent) -> OnEvent {
    Arc::new(move |event: &Event, after_eose: bool, url: Option<&str>| {
        debug!(
            "Event {} kind {} from {} (after EOSE: {})",
            event.id,
            event.kind,
            url.unwrap_or("cache"),
            after_eose
        );
        inner(event, after_eose, url);
    })
}

/// Accumulate delivered events and report the whole list after each one.
///
/// Unless `skip_sort` is set the list is kept ordered by `created_at`,
/// with later arrivals placed after earlier ones on ties.
pub fn collect<F>(on_events: F, skip_sort: bool) -> OnEvent
where
    F: Fn(&[Event]) + Send + Sync + 'static,
{
    let events: Mutex<Vec<Event>> = Mutex::new(Vec::new());
    Arc::new(move |event: &Event, _after_eose: bool, _url: Option<&str>| {
        let snapshot = {
            let mut events = events.lock();
            let index = if skip_sort {
                events.len()
            } else {
                events.partition_point(|e| e.created_at <= event.created_at)
            };
            events.insert(index, event.clone());
            events.clone()
        };
        on_events(&snapshot);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(id: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: "alice".to_string(),
            created_at,
            kind,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        }
    }

    fn counter() -> (Arc<AtomicUsize>, OnEvent) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        let cb = on_event(move |_, _, _| {
            inner.fetch_add(1, Ordering::SeqCst);
        });
        (count, cb)
    }

    #[test]
    fn test_dedup_delivers_once() {
        let (count, cb) = counter();
        let cb = dedup_events(cb);

        let e = event("a", 1, 10);
        cb(&e, false, Some("wss://one"));
        cb(&e, true, Some("wss://two"));
        cb(&event("b", 1, 10), false, None);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_older_replaceable() {
        let (count, cb) = counter();
        let cb = drop_older_events(cb);

        cb(&event("m2", 0, 20), false, None);
        cb(&event("m1", 0, 10), false, None);
        cb(&event("m1b", 0, 20), false, None);
        cb(&event("m3", 0, 30), false, None);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_older_ignores_regular_kinds() {
        let (count, cb) = counter();
        let cb = drop_older_events(cb);

        cb(&event("n2", 1, 20), false, None);
        cb(&event("n1", 1, 10), false, None);

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_match_filters_only() {
        let (count, cb) = counter();
        let cb = match_filters_only(cb, vec![Filter::new().kinds(vec![1])]);

        cb(&event("a", 1, 10), false, None);
        cb(&event("b", 7, 10), false, None);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collect_sorts_by_created_at() {
        let latest: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&latest);
        let cb = collect(
            move |events| {
                *sink.lock() = events.iter().map(|e| e.id.clone()).collect();
            },
            false,
        );

        cb(&event("b", 1, 20), false, None);
        cb(&event("c", 1, 30), false, None);
        cb(&event("a", 1, 10), false, None);
        cb(&event("b2", 1, 20), false, None);

        assert_eq!(*latest.lock(), vec!["a", "b", "b2", "c"]);
    }

    #[test]
    fn test_collect_skip_sort_keeps_arrival_order() {
        let latest: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&latest);
        let cb = collect(
            move |events| {
                *sink.lock() = events.iter().map(|e| e.id.clone()).collect();
            },
            true,
        );

        cb(&event("b", 1, 20), false, None);
        cb(&event("a", 1, 10), false, None);

        assert_eq!(*latest.lock(), vec!["b", "a"]);
    }

    #[test]
    fn test_guarded_contains_panics() {
        let mut reached = false;
        guarded("test", || panic!("boom"));
        guarded("test", || reached = true);
        assert!(reached);
    }
}
