use std::ops::{Index, IndexMut};
use std::time::Instant;

/// Kinds of per-connection timeouts
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Timer {
    /// Bounds connect and the application handshake
    Connect = 0,
    /// Bounds one message write, from first byte to completion
    Send = 1,
}

impl Timer {
    pub(crate) const VALUES: [Self; 2] = [Timer::Connect, Timer::Send];
}

/// Deadline per timer kind
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; 2],
}

impl TimerTable {
    /// Earliest armed deadline
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.data.iter().flatten().min().copied()
    }

    /// Disarm and return the kinds that expired at `now`
    pub(crate) fn expired(&mut self, now: Instant) -> impl Iterator<Item = Timer> + '_ {
        Timer::VALUES.into_iter().filter(move |&timer| {
            if self.data[timer as usize].map_or(false, |t| t <= now) {
                self.data[timer as usize] = None;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn stop_all(&mut self) {
        self.data = [None; 2];
    }
}

impl Index<Timer> for TimerTable {
    type Output = Option<Instant>;
    fn index(&self, index: Timer) -> &Option<Instant> {
        &self.data[index as usize]
    }
}

impl IndexMut<Timer> for TimerTable {
    fn index_mut(&mut self, index: Timer) -> &mut Option<Instant> {
        &mut self.data[index as usize]
    }
}
