//! Event timer wheel.
//!
//! Second-granularity one-shot and periodic entries carrying an opaque
//! item. The reactor tick drains due entries and acts on the items; the
//! wheel itself never looks at the clock, which keeps it deterministic
//! under test.

use std::collections::BTreeMap;

/// Cancellation token for a scheduled entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

struct WheelEntry<T> {
    token: u64,
    deadline: i64,
    period: Option<u64>,
    item: T,
}

pub struct TimerWheel<T> {
    next_token: u64,
    entries: Vec<WheelEntry<T>>,
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn schedule(&mut self, deadline: i64, period: Option<u64>, item: T) -> TimerToken {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.push(WheelEntry {
            token,
            deadline,
            period,
            item,
        });
        TimerToken(token)
    }

    /// Fire once at `now + delay_secs`.
    pub fn schedule_once(&mut self, now: i64, delay_secs: u64, item: T) -> TimerToken {
        self.schedule(now + delay_secs as i64, None, item)
    }

    /// Fire every `period_secs`, first at `now + period_secs`.
    pub fn schedule_periodic(&mut self, now: i64, period_secs: u64, item: T) -> TimerToken {
        let period_secs = period_secs.max(1);
        self.schedule(now + period_secs as i64, Some(period_secs), item)
    }

    /// Cancel an entry, returning its item when it was still pending.
    pub fn cancel(&mut self, token: TimerToken) -> Option<T> {
        let idx = self.entries.iter().position(|e| e.token == token.0)?;
        Some(self.entries.swap_remove(idx).item)
    }

    /// Seconds until the earliest deadline, for poll-timeout calculation.
    pub fn next_due_in(&self, now: i64) -> Option<u64> {
        self.entries
            .iter()
            .map(|e| (e.deadline - now).max(0) as u64)
            .min()
    }
}

impl<T: Clone> TimerWheel<T> {
    /// Drain entries due at `now`, in deadline order. One-shot items move
    /// out; periodic items are cloned and rescheduled.
    pub fn pop_due(&mut self, now: i64) -> Vec<(TimerToken, T)> {
        let mut due: BTreeMap<(i64, u64), T> = BTreeMap::new();

        let mut idx = 0;
        while idx < self.entries.len() {
            if self.entries[idx].deadline > now {
                idx += 1;
                continue;
            }
            let entry = &mut self.entries[idx];
            match entry.period {
                Some(period) => {
                    due.insert((entry.deadline, entry.token), entry.item.clone());
                    entry.deadline = now + period as i64;
                    idx += 1;
                }
                None => {
                    let entry = self.entries.swap_remove(idx);
                    due.insert((entry.deadline, entry.token), entry.item);
                }
            }
        }

        due.into_iter()
            .map(|((_, token), item)| (TimerToken(token), item))
            .collect()
    }
}
