use std::collections::BTreeMap;

use crate::NtpTimestamp;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeoutId(u64);

/// Work the reference steering asked to be done at a later time.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Midnight at which a pending leap second is applied
    LeapStart,
    /// End of the settle period after a leap second
    LeapEnd,
    /// Switch to the next fallback drift
    FallbackDrift,
}

pub trait Scheduler {
    fn add_timeout(&mut self, at: NtpTimestamp, event: TimerEvent) -> TimeoutId;

    fn add_timeout_by_delay(
        &mut self,
        now: NtpTimestamp,
        delay: f64,
        event: TimerEvent,
    ) -> TimeoutId {
        self.add_timeout(now.add_seconds(delay.max(0.0)), event)
    }

    fn remove_timeout(&mut self, id: TimeoutId);
}

/// Ordered queue of pending timeouts. Timeouts with the same deadline fire
/// in the order they were added.
#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    pending: BTreeMap<(NtpTimestamp, TimeoutId), TimerEvent>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn next_deadline(&self) -> Option<NtpTimestamp> {
        self.pending.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the first timeout that is due at `now`.
    pub fn pop_due(&mut self, now: NtpTimestamp) -> Option<(TimeoutId, TimerEvent)> {
        let (&(at, id), _) = self.pending.iter().next()?;
        if now.seconds_since(at) < 0.0 {
            return None;
        }
        self.pending.remove(&(at, id)).map(|event| (id, event))
    }

    pub fn is_pending(&self, id: TimeoutId) -> bool {
        self.pending.keys().any(|(_, pending)| *pending == id)
    }
}

impl Scheduler for TimerQueue {
    fn add_timeout(&mut self, at: NtpTimestamp, event: TimerEvent) -> TimeoutId {
        let id = TimeoutId(self.next_id);
        self.next_id += 1;
        self.pending.insert((at, id), event);
        id
    }

    fn remove_timeout(&mut self, id: TimeoutId) {
        self.pending.retain(|(_, pending), _| *pending != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        let mut timers = TimerQueue::new();
        let base = NtpTimestamp::from_unix(1000, 0);

        let late = timers.add_timeout(base.add_seconds(10.0), TimerEvent::LeapEnd);
        let early = timers.add_timeout_by_delay(base, 5.0, TimerEvent::LeapStart);
        let same = timers.add_timeout(base.add_seconds(5.0), TimerEvent::FallbackDrift);

        assert_eq!(timers.next_deadline(), Some(base.add_seconds(5.0)));
        assert_eq!(timers.pop_due(base.add_seconds(4.0)), None);
        assert_eq!(
            timers.pop_due(base.add_seconds(6.0)),
            Some((early, TimerEvent::LeapStart))
        );
        assert_eq!(
            timers.pop_due(base.add_seconds(6.0)),
            Some((same, TimerEvent::FallbackDrift))
        );
        assert_eq!(timers.pop_due(base.add_seconds(6.0)), None);
        assert!(timers.is_pending(late));
    }

    #[test]
    fn test_remove() {
        let mut timers = TimerQueue::new();
        let base = NtpTimestamp::from_unix(1000, 0);
        let id = timers.add_timeout(base, TimerEvent::LeapStart);
        timers.remove_timeout(id);
        assert!(timers.is_empty());
        assert_eq!(timers.pop_due(base.add_seconds(1.0)), None);

        // negative delays fire immediately
        timers.add_timeout_by_delay(base, -3.0, TimerEvent::FallbackDrift);
        assert_eq!(timers.next_deadline(), Some(base));
    }
}
