mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bt_core::{ClientScope, EventKind, Node, Status};
use bt_nodes::{
    Action, ActionResult, BlackboardDelete, BlackboardSet, CompareOp, Condition, DebugLog,
    EventEmit, LogLevel, Throttle, TimedCondition, Wait,
};
use common::setup_ctx;
use serde_json::json;

#[tokio::test]
async fn action_maps_bool_results_to_statuses() {
    let ctx = setup_ctx();
    let mut ok = Action::new(|_ctx| async { Ok(ActionResult::from(true)) }).into_node("ok");
    let mut bad = Action::new(|_ctx| async { Ok(ActionResult::from(false)) }).into_node("bad");
    ok.setup(&ctx).await.unwrap();
    bad.setup(&ctx).await.unwrap();

    assert_eq!(ok.tick().await, Status::Success);
    assert_eq!(bad.tick().await, Status::Failure);
}

#[tokio::test]
async fn action_reads_and_writes_the_blackboard() {
    let ctx = setup_ctx();
    ctx.blackboard
        .set("default", "battery_level", json!(85), None)
        .unwrap();

    let mut mover = Action::new(|call| async move {
        let battery = call.blackboard.get_default("battery_level")?;
        call.blackboard.set_default("moved", json!(true))?;
        Ok(ActionResult::from(battery.as_i64().unwrap_or(0) >= 20))
    })
    .into_node("move");
    mover.setup(&ctx).await.unwrap();

    assert_eq!(mover.tick().await, Status::Success);
    assert_eq!(ctx.blackboard.get("default", "moved").unwrap(), json!(true));
}

#[tokio::test]
async fn action_errors_surface_as_error_status() {
    let ctx = setup_ctx();
    let mut node = Action::new(|_ctx| async { anyhow::bail!("motor fault") }).into_node("broken");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Error);
    assert_eq!(node.stats().error_count, 1);
}

#[tokio::test]
async fn action_ignore_errors_turns_faults_into_success() {
    let ctx = setup_ctx();
    let mut node = Action::new(|_ctx| async { anyhow::bail!("motor fault") })
        .with_ignore_errors()
        .into_node("tolerant");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Success);
}

#[tokio::test]
async fn action_retries_within_one_tick() {
    let ctx = setup_ctx();
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts2 = Arc::clone(&attempts);

    let mut node = Action::new(move |_ctx| {
        let attempts = Arc::clone(&attempts2);
        async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Ok(ActionResult::from(n >= 2))
        }
    })
    .with_retry_count(2)
    .into_node("flaky");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Success);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn action_timeout_cancels_the_function() {
    let ctx = setup_ctx();
    let mut node = Action::new(|_ctx| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(ActionResult::Success)
    })
    .with_timeout(Duration::from_secs(1))
    .into_node("stuck");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Failure);
}

#[tokio::test]
async fn cancelled_action_fails_promptly_without_error() {
    let ctx = setup_ctx();
    let mut node = Action::new(|_ctx| async { Ok(ActionResult::Success) }).into_node("work");
    node.setup(&ctx).await.unwrap();

    node.cancel();
    assert_eq!(node.tick().await, Status::Failure);
    assert_eq!(node.stats().error_count, 0);

    // The flag clears with the terminal result.
    assert_eq!(node.tick().await, Status::Success);
}

#[tokio::test]
async fn condition_compares_blackboard_values() {
    let ctx = setup_ctx();
    ctx.blackboard
        .set("default", "battery_level", json!(85), None)
        .unwrap();

    let mut high = Condition::on_key("default", "battery_level", CompareOp::Ge, json!(20))
        .into_node("battery_ok");
    let mut low = Condition::on_key("default", "battery_level", CompareOp::Lt, json!(20))
        .into_node("battery_low");
    high.setup(&ctx).await.unwrap();
    low.setup(&ctx).await.unwrap();

    assert_eq!(high.tick().await, Status::Success);
    assert_eq!(low.tick().await, Status::Failure);
}

#[tokio::test]
async fn condition_on_missing_key_fails_instead_of_erroring() {
    let ctx = setup_ctx();
    let mut node =
        Condition::on_key("default", "absent", CompareOp::Eq, json!(1)).into_node("ghost");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Failure);
    assert_eq!(node.stats().error_count, 0);
}

#[test]
fn compare_ops_parse_and_order() {
    assert_eq!("<=".parse::<CompareOp>().unwrap(), CompareOp::Le);
    assert!("~=".parse::<CompareOp>().is_err());

    assert!(CompareOp::Lt.eval(&json!(1), &json!(2)));
    assert!(CompareOp::Ge.eval(&json!("b"), &json!("a")));
    assert!(CompareOp::Ne.eval(&json!("a"), &json!(1)));
    // Ordering between incomparable shapes is false, not an error.
    assert!(!CompareOp::Lt.eval(&json!("a"), &json!(1)));
}

#[tokio::test(start_paused = true)]
async fn wait_runs_until_its_duration_elapses() {
    let ctx = setup_ctx();
    let mut node = Wait::new(Duration::from_secs(5)).into_node("pause");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Running);
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(node.tick().await, Status::Running);
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(node.tick().await, Status::Success);

    // The clock restarts for the next round.
    assert_eq!(node.tick().await, Status::Running);
}

#[tokio::test(start_paused = true)]
async fn timed_condition_succeeds_on_first_satisfaction() {
    let ctx = setup_ctx();
    ctx.blackboard.set("default", "ready", json!(false), None).unwrap();

    let condition = Condition::on_key("default", "ready", CompareOp::Eq, json!(true));
    let mut node = TimedCondition::new(condition, Duration::from_secs(10)).into_node("watch");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Running);
    ctx.blackboard.set("default", "ready", json!(true), None).unwrap();
    assert_eq!(node.tick().await, Status::Success);
}

#[tokio::test(start_paused = true)]
async fn timed_condition_fails_at_window_expiry() {
    let ctx = setup_ctx();
    let condition = Condition::on_key("default", "ready", CompareOp::Eq, json!(true));
    let mut node = TimedCondition::new(condition, Duration::from_secs(2)).into_node("watch");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Running);
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(node.tick().await, Status::Failure);
}

#[tokio::test(start_paused = true)]
async fn timed_condition_ratio_decides_at_expiry() {
    let ctx = setup_ctx();
    ctx.blackboard.set("default", "ready", json!(true), None).unwrap();

    let condition = Condition::on_key("default", "ready", CompareOp::Eq, json!(true));
    let mut node = TimedCondition::new(condition, Duration::from_secs(2))
        .with_required_ratio(0.5)
        .into_node("watch");
    node.setup(&ctx).await.unwrap();

    // Satisfied samples do not short-circuit in ratio mode.
    assert_eq!(node.tick().await, Status::Running);
    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(node.tick().await, Status::Success);
}

#[tokio::test(start_paused = true)]
async fn throttle_gates_until_the_interval_passes() {
    let ctx = setup_ctx();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);

    let mut node = Throttle::new(Duration::from_secs(10))
        .with_action(move |_call| {
            let fired = Arc::clone(&fired2);
            async move {
                fired.fetch_add(1, Ordering::SeqCst);
                Ok(ActionResult::Success)
            }
        })
        .into_node("limited");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Success);
    assert_eq!(node.tick().await, Status::Failure);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(node.tick().await, Status::Success);
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn throttle_can_report_sticky_success() {
    let ctx = setup_ctx();
    let mut node = Throttle::new(Duration::from_secs(10))
        .with_sticky_success()
        .into_node("limited");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Success);
    assert_eq!(node.tick().await, Status::Success);
}

#[tokio::test]
async fn debug_log_always_succeeds() {
    let ctx = setup_ctx();
    let mut node = DebugLog::new("entering patrol", LogLevel::Info).into_node("log");
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Success);
}

#[tokio::test]
async fn event_emit_publishes_on_the_bus() {
    let ctx = setup_ctx();
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = Arc::clone(&seen);
    ctx.events.subscribe(move |event| {
        if event.kind == EventKind::StatusChanged && event.payload.is_some() {
            seen2.lock().unwrap().push(event.payload.clone().unwrap());
        }
    });

    let mut node = EventEmit::new(EventKind::StatusChanged)
        .with_payload(json!({"custom": "marker"}))
        .into_node("announce");
    node.setup(&ctx).await.unwrap();

    node.tick().await;
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .any(|payload| payload == &json!({"custom": "marker"})));
}

#[tokio::test]
async fn blackboard_set_and_delete_roundtrip() {
    let ctx = setup_ctx();
    let mut set = BlackboardSet::new("flag", json!(7)).into_node("set");
    let mut del = BlackboardDelete::new("flag").into_node("del");
    set.setup(&ctx).await.unwrap();
    del.setup(&ctx).await.unwrap();

    assert_eq!(set.tick().await, Status::Success);
    assert_eq!(ctx.blackboard.get("default", "flag").unwrap(), json!(7));
    assert_eq!(del.tick().await, Status::Success);
    // Deleting again reports failure: the key is gone.
    assert_eq!(del.tick().await, Status::Failure);
}

#[tokio::test]
async fn scoped_blackboard_set_fails_on_access_denial() {
    let ctx = setup_ctx();
    let mut node = Node::new(
        "restricted",
        Box::new(BlackboardSet::new("forbidden", json!(1))),
    )
    .with_scope(ClientScope::default().write_keys(["allowed"]));
    node.setup(&ctx).await.unwrap();

    assert_eq!(node.tick().await, Status::Failure);
    assert!(!ctx.blackboard.contains("default", "forbidden"));
}
