//! Hand-rolled doubles shared by the node behavior tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bt_core::{Behavior, Blackboard, EventBus, Node, SetupCtx, Status, TickCtx};

pub fn setup_ctx() -> SetupCtx {
    SetupCtx {
        blackboard: Arc::new(Blackboard::new()),
        events: Arc::new(EventBus::new()),
    }
}

/// Counters observable from the outside of a [`ScriptedLeaf`].
#[derive(Default)]
pub struct Probe {
    pub ticks: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl Probe {
    pub fn ticks(&self) -> usize {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
}

/// Plays back a fixed sequence of statuses, repeating the last one forever.
pub struct ScriptedLeaf {
    script: VecDeque<Status>,
    last: Status,
    probe: Arc<Probe>,
}

#[async_trait]
impl Behavior for ScriptedLeaf {
    async fn tick(&mut self, _ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        self.probe.ticks.fetch_add(1, Ordering::SeqCst);
        if let Some(next) = self.script.pop_front() {
            self.last = next;
        }
        Ok(self.last)
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }

    fn cancel(&mut self) {
        self.probe.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn scripted(name: &str, script: &[Status]) -> (Node, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let leaf = ScriptedLeaf {
        script: script.iter().copied().collect(),
        last: *script.last().unwrap_or(&Status::Failure),
        probe: Arc::clone(&probe),
    };
    (Node::new(name, Box::new(leaf)), probe)
}

pub fn always(name: &str, status: Status) -> (Node, Arc<Probe>) {
    scripted(name, &[status])
}
