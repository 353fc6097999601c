//! Bounded, id-stamped event log with blocking fan-out.
//!
//! Every normalized event is appended here and stamped with a strictly
//! increasing sequence id. Consumers replay from any id with `read_since`
//! and tail the log with `block_until_newer`; both are cheap enough that
//! many concurrent SSE subscribers can share one log.
//!
//! A consumer whose cursor has fallen out of the retained window observes a
//! gap: `read_since` silently resumes from the oldest retained event. Gaps
//! mean order-state must be re-fetched from the store snapshot, not
//! reconstructed from the stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::models::GatewayEvent;

struct LogInner {
    /// Next id to assign; ids start at 1 and never repeat.
    next_id: u64,
    events: VecDeque<(u64, GatewayEvent)>,
    /// Secondary view of order/fill/error traffic, capped independently.
    activity: VecDeque<(u64, GatewayEvent)>,
}

pub struct EventLog {
    inner: Mutex<LogInner>,
    cond: Condvar,
    capacity: usize,
    activity_capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize, activity_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogInner {
                next_id: 1,
                events: VecDeque::with_capacity(capacity.min(1024)),
                activity: VecDeque::with_capacity(activity_capacity.min(256)),
            }),
            cond: Condvar::new(),
            capacity: capacity.max(1),
            activity_capacity: activity_capacity.max(1),
        }
    }

    /// Append an event, assign its sequence id, and wake all blocked readers.
    pub fn append(&self, event: GatewayEvent) -> u64 {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        if event.is_activity() {
            inner.activity.push_back((id, event.clone()));
            if inner.activity.len() > self.activity_capacity {
                inner.activity.pop_front();
            }
        }

        inner.events.push_back((id, event));
        if inner.events.len() > self.capacity {
            inner.events.pop_front();
        }

        drop(inner);
        self.cond.notify_all();
        id
    }

    /// Events with id strictly greater than `last_id`, oldest first.
    ///
    /// With `last_id` unset, the whole retained window is returned. The
    /// second element is the new cursor: the id of the last returned event,
    /// or the caller's cursor unchanged when nothing new exists.
    pub fn read_since(&self, last_id: Option<u64>) -> (Vec<(u64, GatewayEvent)>, Option<u64>) {
        let inner = self.inner.lock();
        let events: Vec<(u64, GatewayEvent)> = match last_id {
            None => inner.events.iter().cloned().collect(),
            Some(id) => inner
                .events
                .iter()
                .filter(|(eid, _)| *eid > id)
                .cloned()
                .collect(),
        };
        let cursor = events.last().map(|(id, _)| *id).or(last_id);
        (events, cursor)
    }

    /// Block until an event with id greater than `last_id` exists, or the
    /// timeout elapses. Returns immediately when one already does.
    pub fn block_until_newer(&self, last_id: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            // next_id - 1 is the highest id ever assigned; comparing against
            // it (not the buffer tail) keeps the answer correct even if the
            // newer event has already been evicted.
            if inner.next_id - 1 > last_id {
                return true;
            }
            if self.cond.wait_until(&mut inner, deadline).timed_out() {
                return inner.next_id - 1 > last_id;
            }
        }
    }

    /// Snapshot of the recent-activity view (order/fill/error events only).
    pub fn recent_activity(&self) -> Vec<(u64, GatewayEvent)> {
        self.inner.lock().activity.iter().cloned().collect()
    }

    /// Highest id assigned so far (0 if nothing was appended yet).
    pub fn last_id(&self) -> u64 {
        self.inner.lock().next_id - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn market(symbol: &str, price: f64) -> GatewayEvent {
        GatewayEvent::Market {
            symbol: symbol.to_string(),
            price,
            ts: 0,
        }
    }

    fn error(msg: &str) -> GatewayEvent {
        GatewayEvent::Error {
            message: msg.to_string(),
        }
    }

    #[test]
    fn ids_are_strictly_increasing() {
        let log = EventLog::new(16, 16);
        let mut prev = 0;
        for i in 0..10 {
            let id = log.append(market("BTCUSDT", 100.0 + i as f64));
            assert!(id > prev);
            prev = id;
        }
        assert_eq!(log.last_id(), 10);
    }

    #[test]
    fn read_since_none_then_cursor_is_empty_without_appends() {
        let log = EventLog::new(16, 16);
        log.append(market("BTCUSDT", 1.0));
        log.append(market("BTCUSDT", 2.0));

        let (all, cursor) = log.read_since(None);
        assert_eq!(all.len(), 2);

        let (newer, cursor2) = log.read_since(cursor);
        assert!(newer.is_empty());
        assert_eq!(cursor2, cursor);
    }

    #[test]
    fn eviction_produces_gap_not_error() {
        let log = EventLog::new(3, 16);
        for i in 0..5 {
            log.append(market("BTCUSDT", i as f64));
        }
        // ids 1..=5 were assigned, only 3..=5 retained.
        let (events, cursor) = log.read_since(Some(1));
        let ids: Vec<u64> = events.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(cursor, Some(5));
    }

    #[test]
    fn activity_view_filters_and_caps() {
        let log = EventLog::new(64, 2);
        log.append(market("BTCUSDT", 1.0));
        log.append(error("a"));
        log.append(error("b"));
        log.append(error("c"));
        log.append(market("BTCUSDT", 2.0));

        let activity = log.recent_activity();
        assert_eq!(activity.len(), 2);
        assert!(activity
            .iter()
            .all(|(_, e)| matches!(e, GatewayEvent::Error { .. })));
    }

    #[test]
    fn block_until_newer_returns_immediately_when_event_exists() {
        let log = EventLog::new(16, 16);
        log.append(market("BTCUSDT", 1.0));
        assert!(log.block_until_newer(0, Duration::from_millis(1)));
    }

    #[test]
    fn block_until_newer_times_out_without_appends() {
        let log = EventLog::new(16, 16);
        assert!(!log.block_until_newer(0, Duration::from_millis(20)));
    }

    #[test]
    fn two_blocked_subscribers_both_wake_on_one_append() {
        let log = Arc::new(EventLog::new(16, 16));
        log.append(market("BTCUSDT", 1.0)); // id 1

        let a = {
            let log = log.clone();
            std::thread::spawn(move || log.block_until_newer(1, Duration::from_secs(5)))
        };
        let b = {
            let log = log.clone();
            std::thread::spawn(move || log.block_until_newer(0, Duration::from_secs(5)))
        };

        // Subscriber b already has a newer event; subscriber a needs the append.
        std::thread::sleep(Duration::from_millis(50));
        log.append(market("BTCUSDT", 2.0)); // id 2

        assert!(a.join().unwrap());
        assert!(b.join().unwrap());

        let (for_a, _) = log.read_since(Some(1));
        assert_eq!(for_a.len(), 1);
        let (for_b, _) = log.read_since(Some(0));
        assert_eq!(for_b.len(), 2);
    }
}
