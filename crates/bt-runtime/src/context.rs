//! Per-manager execution bookkeeping.

use std::collections::VecDeque;
use std::time::Duration;

use bt_core::Status;
use serde::Serialize;

/// One completed tick as seen from the manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TickRecord {
    pub tick_no: u64,
    pub status: Status,
    pub duration: Duration,
}

/// Aggregate tick statistics plus a bounded history of recent ticks.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub tick_count: u64,
    pub total_duration: Duration,
    pub success_count: u64,
    pub failure_count: u64,
    pub error_count: u64,
    pub last_tick_duration: Duration,
    history: VecDeque<TickRecord>,
    history_limit: usize,
}

impl ExecutionContext {
    pub fn new(history_limit: usize) -> Self {
        Self {
            tick_count: 0,
            total_duration: Duration::ZERO,
            success_count: 0,
            failure_count: 0,
            error_count: 0,
            last_tick_duration: Duration::ZERO,
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
        }
    }

    pub fn record(&mut self, status: Status, duration: Duration) {
        self.tick_count += 1;
        self.total_duration += duration;
        self.last_tick_duration = duration;
        match status {
            Status::Success => self.success_count += 1,
            Status::Failure => self.failure_count += 1,
            Status::Error => self.error_count += 1,
            Status::Running | Status::Invalid => {}
        }
        if self.history.len() == self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(TickRecord {
            tick_no: self.tick_count,
            status,
            duration,
        });
    }

    pub fn history(&self) -> impl Iterator<Item = &TickRecord> {
        self.history.iter()
    }

    pub fn average_tick_duration(&self) -> Duration {
        if self.tick_count == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.tick_count as u32
        }
    }
}
