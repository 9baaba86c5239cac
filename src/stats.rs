// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Communication statistics.
//!
//! The counters are shared between the datalink layer, the application
//! layer and the keep-alive task and may be read at any time.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::Outcome;

/// Counters of a single session.
#[derive(Debug, Default)]
pub struct Statistics {
    outcomes: [AtomicU64; Outcome::ALL.len()],
    timeouts: AtomicU64,
    acks_sent: AtomicU64,
    naks_sent: AtomicU64,
    acks_received: AtomicU64,
    naks_received: AtomicU64,
}

/// A copy of the [`Statistics`] counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    /// Number of responses per outcome, indexed by the outcome value.
    pub outcomes: [u64; Outcome::ALL.len()],
    pub timeouts: u64,
    pub acks_sent: u64,
    pub naks_sent: u64,
    pub acks_received: u64,
    pub naks_received: u64,
}

impl StatisticsSnapshot {
    #[must_use]
    pub fn outcome(&self, outcome: Outcome) -> u64 {
        self.outcomes[usize::from(outcome.value())]
    }

    /// Total number of decoded responses.
    #[must_use]
    pub fn responses(&self) -> u64 {
        self.outcomes.iter().sum()
    }
}

fn increment(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Statistics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a decoded response.
    pub fn record_outcome(&self, outcome: Outcome) {
        increment(&self.outcomes[usize::from(outcome.value())]);
    }

    pub fn record_timeout(&self) {
        increment(&self.timeouts);
    }

    pub fn record_ack_sent(&self) {
        increment(&self.acks_sent);
    }

    pub fn record_nak_sent(&self) {
        increment(&self.naks_sent);
    }

    pub fn record_ack_received(&self) {
        increment(&self.acks_received);
    }

    pub fn record_nak_received(&self) {
        increment(&self.naks_received);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatisticsSnapshot {
            outcomes: std::array::from_fn(|i| load(&self.outcomes[i])),
            timeouts: load(&self.timeouts),
            acks_sent: load(&self.acks_sent),
            naks_sent: load(&self.naks_sent),
            acks_received: load(&self.acks_received),
            naks_received: load(&self.naks_received),
        }
    }

    /// Reset all counters to zero.
    pub fn clear(&self) {
        for counter in self.outcomes.iter().chain([
            &self.timeouts,
            &self.acks_sent,
            &self.naks_sent,
            &self.acks_received,
            &self.naks_received,
        ]) {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
