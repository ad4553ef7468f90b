use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use bt_core::{
    Behavior, Blackboard, EventBus, EventKind, Node, SetupCtx, Status, TickCtx, TreeError,
};

struct StaticBehavior {
    result: Status,
    ticks: Arc<AtomicUsize>,
}

impl StaticBehavior {
    fn new(result: Status) -> (Self, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        (
            Self {
                result,
                ticks: Arc::clone(&ticks),
            },
            ticks,
        )
    }
}

#[async_trait]
impl Behavior for StaticBehavior {
    async fn tick(&mut self, _ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        Ok(self.result)
    }

    fn max_children(&self) -> Option<usize> {
        Some(0)
    }
}

struct ErroringBehavior;

#[async_trait]
impl Behavior for ErroringBehavior {
    async fn tick(&mut self, _ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        Err(anyhow!("sensor offline"))
    }
}

struct FailingSetup;

#[async_trait]
impl Behavior for FailingSetup {
    async fn tick(&mut self, _ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
        Ok(Status::Success)
    }

    async fn setup(&mut self, _ctx: &SetupCtx) -> anyhow::Result<()> {
        Err(anyhow!("resource unavailable"))
    }
}

fn ctx() -> SetupCtx {
    SetupCtx {
        blackboard: Arc::new(Blackboard::new()),
        events: Arc::new(EventBus::new()),
    }
}

fn record_events(ctx: &SetupCtx) -> Arc<Mutex<Vec<EventKind>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let log2 = Arc::clone(&log);
    ctx.events.subscribe(move |event| {
        log2.lock().unwrap().push(event.kind);
    });
    log
}

#[tokio::test]
async fn tick_before_setup_is_an_error() {
    let (behavior, ticks) = StaticBehavior::new(Status::Success);
    let mut node = Node::new("orphan", Box::new(behavior));

    assert_eq!(node.tick().await, Status::Error);
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn first_tick_emits_lifecycle_events_in_order() {
    let setup = ctx();
    let log = record_events(&setup);

    let (behavior, _) = StaticBehavior::new(Status::Success);
    let mut node = Node::new("worker", Box::new(behavior));
    node.setup(&setup).await.unwrap();

    assert_eq!(node.tick().await, Status::Success);
    node.shutdown().await;

    assert_eq!(
        *log.lock().unwrap(),
        vec![
            EventKind::Initialized,
            EventKind::Setup,
            EventKind::Entering,
            EventKind::Exiting,
            EventKind::StatusChanged,
            EventKind::Shutdown,
        ]
    );
}

#[tokio::test]
async fn failed_precondition_skips_behavior() {
    let setup = ctx();
    let (behavior, ticks) = StaticBehavior::new(Status::Success);
    let mut node = Node::new("guarded", Box::new(behavior)).with_precondition(|| false);
    node.setup(&setup).await.unwrap();

    assert_eq!(node.tick().await, Status::Failure);
    assert_eq!(ticks.load(Ordering::SeqCst), 0);
    assert_eq!(node.stats().total_ticks, 0);
}

#[tokio::test]
async fn failed_precondition_clears_a_pending_cancel() {
    struct SeesCancel {
        seen: Arc<Mutex<Vec<bool>>>,
    }

    #[async_trait]
    impl Behavior for SeesCancel {
        async fn tick(&mut self, ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
            self.seen.lock().unwrap().push(ctx.cancelled);
            Ok(Status::Success)
        }
    }

    let setup = ctx();
    let gate = Arc::new(AtomicBool::new(true));
    let seen = Arc::new(Mutex::new(Vec::new()));

    let gate2 = Arc::clone(&gate);
    let mut node = Node::new(
        "guarded",
        Box::new(SeesCancel {
            seen: Arc::clone(&seen),
        }),
    )
    .with_precondition(move || gate2.load(Ordering::SeqCst));
    node.setup(&setup).await.unwrap();

    // A cancel followed by a precondition failure must not leak into the
    // next real attempt.
    node.cancel();
    gate.store(false, Ordering::SeqCst);
    assert_eq!(node.tick().await, Status::Failure);

    gate.store(true, Ordering::SeqCst);
    assert_eq!(node.tick().await, Status::Success);
    assert_eq!(*seen.lock().unwrap(), vec![false]);
}

#[tokio::test]
async fn failed_postcondition_demotes_success() {
    let setup = ctx();
    let (behavior, _) = StaticBehavior::new(Status::Success);
    let mut node = Node::new("checked", Box::new(behavior)).with_postcondition(|| false);
    node.setup(&setup).await.unwrap();

    assert_eq!(node.tick().await, Status::Failure);
    assert_eq!(node.stats().failure_count, 1);
    assert_eq!(node.stats().success_count, 0);
}

#[tokio::test]
async fn behavior_errors_become_error_status() {
    let setup = ctx();
    let log = record_events(&setup);

    let mut node = Node::new("flaky", Box::new(ErroringBehavior));
    node.setup(&setup).await.unwrap();

    assert_eq!(node.tick().await, Status::Error);
    assert_eq!(node.stats().error_count, 1);
    assert!(node
        .stats()
        .last_error
        .as_deref()
        .unwrap()
        .contains("sensor offline"));
    assert!(log.lock().unwrap().contains(&EventKind::Error));
}

#[tokio::test]
async fn setup_failure_surfaces_the_node_name() {
    let setup = ctx();
    let mut node = Node::new("camera", Box::new(FailingSetup));

    match node.setup(&setup).await {
        Err(TreeError::SetupFailed { node, .. }) => assert_eq!(node, "camera"),
        other => panic!("expected SetupFailed, got {other:?}"),
    }
    assert!(!node.is_setup());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let setup = ctx();
    let log = record_events(&setup);

    let (behavior, _) = StaticBehavior::new(Status::Success);
    let mut node = Node::new("once", Box::new(behavior));
    node.setup(&setup).await.unwrap();

    node.shutdown().await;
    node.shutdown().await;

    let shutdowns = log
        .lock()
        .unwrap()
        .iter()
        .filter(|k| **k == EventKind::Shutdown)
        .count();
    assert_eq!(shutdowns, 1);
}

#[tokio::test]
async fn running_ticks_do_not_enter_the_duration_mean() {
    let setup = ctx();
    let (behavior, _) = StaticBehavior::new(Status::Running);
    let mut node = Node::new("long", Box::new(behavior));
    node.setup(&setup).await.unwrap();

    node.tick().await;
    node.tick().await;

    assert_eq!(node.stats().total_ticks, 2);
    assert_eq!(node.stats().completed_ticks, 0);
    assert_eq!(node.stats().average_duration_secs, 0.0);
}

#[tokio::test]
async fn reset_preserves_stats() {
    let setup = ctx();
    let (behavior, _) = StaticBehavior::new(Status::Success);
    let mut node = Node::new("counter", Box::new(behavior));
    node.setup(&setup).await.unwrap();

    node.tick().await;
    node.reset();

    assert_eq!(node.status(), Status::Invalid);
    assert_eq!(node.stats().success_count, 1);
}

#[tokio::test]
async fn leaves_reject_children() {
    let (leaf, _) = StaticBehavior::new(Status::Success);
    let (child, _) = StaticBehavior::new(Status::Success);
    let mut node = Node::new("leaf", Box::new(leaf));

    assert!(matches!(
        node.add_child(Node::new("child", Box::new(child))),
        Err(TreeError::TooManyChildren { .. })
    ));
}

#[tokio::test]
async fn duplicate_sibling_names_are_rejected() {
    struct AnyChildren;

    #[async_trait]
    impl Behavior for AnyChildren {
        async fn tick(&mut self, _ctx: &mut TickCtx<'_>) -> anyhow::Result<Status> {
            Ok(Status::Success)
        }
    }

    let mut parent = Node::new("parent", Box::new(AnyChildren));
    let (a, _) = StaticBehavior::new(Status::Success);
    let (b, _) = StaticBehavior::new(Status::Success);

    parent.add_child(Node::new("twin", Box::new(a))).unwrap();
    assert!(matches!(
        parent.add_child(Node::new("twin", Box::new(b))),
        Err(TreeError::DuplicateChild { .. })
    ));
}
