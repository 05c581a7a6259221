use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        RwLock,
    },
    time::{Duration, Instant},
};

/// A cancellable timer wheel.
///
/// Entries are ordered by deadline; `poll` drains everything due at or
/// before the given instant. Scheduling returns an id that `cancel`
/// accepts until the entry fires. All operations take the locks briefly
/// and never block on anything else, so the wheel can be shared freely.
pub struct TimerWheel<T> {
    entries: RwLock<BTreeMap<(Instant, u64), T>>,
    deadlines: RwLock<HashMap<u64, Instant>>,
    next_id: AtomicU64,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        TimerWheel {
            entries: RwLock::new(BTreeMap::new()),
            deadlines: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn timeout(&self, after: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + after, value)
    }

    pub fn timeout_at(&self, deadline: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().unwrap().insert((deadline, id), value);
        self.deadlines.write().unwrap().insert(id, deadline);
        id
    }

    pub fn cancel(&self, id: u64) -> Option<T> {
        let deadline = self.deadlines.write().unwrap().remove(&id)?;
        self.entries.write().unwrap().remove(&(deadline, id))
    }

    /// Removes and returns every entry due at or before `now`, in
    /// deadline order.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let mut entries = self.entries.write().unwrap();
        let keys: Vec<(Instant, u64)> = entries
            .range(..=(now, u64::MAX))
            .map(|(key, _)| *key)
            .collect();
        if keys.is_empty() {
            return due;
        }
        due.reserve(keys.len());
        let mut deadlines = self.deadlines.write().unwrap();
        for key in keys {
            if let Some(value) = entries.remove(&key) {
                due.push(value);
            }
            deadlines.remove(&key.1);
        }
        due
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        TimerWheel::new()
    }
}

#[test]
fn test_timer_wheel() {
    let wheel = TimerWheel::new();
    let now = Instant::now();

    let id = wheel.timeout_at(now, "first");
    assert_eq!(id, 1);
    assert_eq!(wheel.cancel(id), Some("first"));
    assert_eq!(wheel.cancel(id), None);

    wheel.timeout_at(now, "due");
    wheel.timeout_at(now + Duration::from_millis(1500), "later");
    let due = wheel.poll(now + Duration::from_secs(1));
    assert_eq!(due, vec!["due"]);
    assert_eq!(wheel.len(), 1);

    let rest = wheel.poll(now + Duration::from_secs(2));
    assert_eq!(rest, vec!["later"]);
    assert!(wheel.is_empty());
}

#[test]
fn test_timer_wheel_orders_same_deadline() {
    let wheel = TimerWheel::new();
    let now = Instant::now();
    wheel.timeout_at(now, 1);
    wheel.timeout_at(now, 2);
    wheel.timeout_at(now, 3);
    assert_eq!(wheel.poll(now), vec![1, 2, 3]);
}
