//! Change detection and trailing coalescing for pushed snapshots.
//!
//! The baseline moves on every accepted value, immediately. Only the visible
//! apply is deferred: accepted values wait in a single pending slot whose
//! deadline slides forward with each acceptance, and whatever sits in the slot
//! when the deadline passes is what gets applied.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    Accepted,
    Suppressed,
}

#[derive(Debug)]
struct Pending<T> {
    value: T,
    due: Instant,
}

#[derive(Debug)]
pub struct Reconciler<T> {
    baseline: T,
    pending: Option<Pending<T>>,
    window: Duration,
}

impl<T: PartialEq + Clone> Reconciler<T> {
    pub fn new(baseline: T, window: Duration) -> Self {
        Self {
            baseline,
            pending: None,
            window,
        }
    }

    /// Resets the comparison baseline without scheduling an apply (initial
    /// fetch or cache fallback).
    pub fn reset_baseline(&mut self, baseline: T) {
        self.baseline = baseline;
    }

    pub fn baseline(&self) -> &T {
        &self.baseline
    }

    /// Deep-compares `incoming` with the baseline. Equal values are dropped;
    /// anything else becomes the baseline and the pending apply.
    pub fn reconcile(&mut self, incoming: T, now: Instant) -> Reconciliation {
        if incoming == self.baseline {
            return Reconciliation::Suppressed;
        }
        self.baseline = incoming.clone();
        self.pending = Some(Pending {
            value: incoming,
            due: now + self.window,
        });
        Reconciliation::Accepted
    }

    /// The pending value, once its window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some(p) if p.due <= now => self.pending.take().map(|p| p.value),
            _ => None,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|p| p.due)
    }

    /// Drops the pending apply. Returns whether there was one.
    pub fn cancel(&mut self) -> bool {
        self.pending.take().is_some()
    }
}
