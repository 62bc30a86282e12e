// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Monotonic clock and timer wheel.
//!
//! The engine is single-threaded; there is no timer thread. The wheel only
//! answers "when is the next deadline" so the poll timeout can be computed,
//! and "which timers are due now" after the poll returns.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic microseconds since the process-local epoch.
pub fn now_usec() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_micros() as u64
}

/// Identity of a scheduled wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKey {
    /// Periodic send tick of a publisher slot.
    PublishTick(usize),

    /// Periodic invocation tick of a service-caller slot.
    CallerTick(usize),

    /// Master liveness ping.
    MasterPing,

    /// Connect/idle deadline of a session (by session id).
    SessionDeadline(u64),

    /// Connect deadline of an outbound RPC flow (by call id).
    RpcDeadline(u64),
}

#[derive(Debug)]
struct Timer {
    key: TimerKey,
    deadline: u64,
    period: Option<u64>,
}

/// Small set of absolute-deadline timers with linear scans.
///
/// The population is one entry per periodic publisher, per periodic caller,
/// one master ping and one per pending deadline - a handful. Linear scans
/// beat a heap at this size and keep re-arm logic trivial.
#[derive(Debug, Default)]
pub struct TimerWheel {
    timers: Vec<Timer>,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self { timers: Vec::new() }
    }

    /// Arm (or re-arm) a timer. `period` of `Some(p)` makes it periodic.
    pub fn arm(&mut self, key: TimerKey, deadline: u64, period: Option<u64>) {
        if let Some(t) = self.timers.iter_mut().find(|t| t.key == key) {
            t.deadline = deadline;
            t.period = period;
        } else {
            self.timers.push(Timer {
                key,
                deadline,
                period,
            });
        }
    }

    /// Remove a timer. Unknown keys are ignored.
    pub fn disarm(&mut self, key: TimerKey) {
        self.timers.retain(|t| t.key != key);
    }

    /// Earliest absolute deadline over all armed timers.
    pub fn earliest_deadline(&self) -> Option<u64> {
        self.timers.iter().map(|t| t.deadline).min()
    }

    /// Collect every timer due at `now`. Periodic timers are re-armed past
    /// `now`; one-shot timers are removed.
    pub fn pop_due(&mut self, now: u64) -> Vec<TimerKey> {
        let mut due = Vec::new();
        let mut idx = 0;
        while idx < self.timers.len() {
            if self.timers[idx].deadline <= now {
                due.push(self.timers[idx].key);
                match self.timers[idx].period {
                    Some(period) if period > 0 => {
                        let t = &mut self.timers[idx];
                        while t.deadline <= now {
                            t.deadline += period;
                        }
                        idx += 1;
                    }
                    _ => {
                        self.timers.swap_remove(idx);
                    }
                }
            } else {
                idx += 1;
            }
        }
        due
    }

    /// Number of armed timers.
    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}
