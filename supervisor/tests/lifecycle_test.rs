//! Lifecycle scenarios against real worker processes with a scripted probe.
//!
//! Timeouts are scaled down from production values; the assertions are the
//! same ones an operator would make against `/status`.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use shared_types::{ActivityEvent, WorkerState, ACTIVITY_KIND_WEBHOOK};

use common::*;
use supervisor::lifecycle::StopReason;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_activity_brings_worker_to_running() {
    let launcher = RecordingLauncher::new();
    let probe = ScriptedProbe::healthy();
    let handle = start_supervisor(fast_settings(), launcher.clone(), probe.clone()).await;

    assert_eq!(handle.view().state, WorkerState::Stopped);
    handle.record_activity(activity("test")).unwrap();

    let view = handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");
    assert_eq!(view.generation, 1);
    assert!(view.pid.is_some());
    assert!(view.running_since.is_some());

    let snapshot = handle.status();
    assert!(snapshot.healthy);
    assert!(snapshot.auto_shutdown_in_ms.is_some());
    assert_eq!(launcher.launches(), 1);

    shutdown(&handle).await;
    assert_eq!(launcher.live_workers(), 0);
}

#[tokio::test]
async fn test_burst_of_activity_spawns_one_worker() {
    let launcher = RecordingLauncher::new();
    let handle = start_supervisor(fast_settings(), launcher.clone(), ScriptedProbe::healthy()).await;

    for i in 0..10 {
        handle.record_activity(activity(&format!("burst-{i}"))).unwrap();
    }
    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(launcher.launches(), 1);
    assert_eq!(launcher.overlaps(), 0);
    assert_eq!(handle.view().generation, 1);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_last_activity_is_maximum_seen() {
    let launcher = RecordingLauncher::new();
    let handle = start_supervisor(fast_settings(), launcher.clone(), ScriptedProbe::healthy()).await;

    let now = Utc::now();
    let newest = now - chrono::Duration::seconds(1);
    let at = |ts| ActivityEvent::new("reorder", "out of order", ACTIVITY_KIND_WEBHOOK, ts);

    handle.record_activity(at(now - chrono::Duration::seconds(3))).unwrap();
    handle.record_activity(at(newest)).unwrap();
    handle.record_activity(at(now - chrono::Duration::seconds(2))).unwrap();
    handle.record_activity(at(newest)).unwrap();

    // Stop is processed after every cast above, so it doubles as a barrier.
    handle.stop_and_wait(StopReason::Operator).await.unwrap();
    assert_eq!(handle.view().last_activity_at, Some(newest));

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_single_failed_probe_does_not_restart() {
    let launcher = RecordingLauncher::new();
    let probe = ScriptedProbe::healthy();
    let handle = start_supervisor(fast_settings(), launcher.clone(), probe.clone()).await;

    handle.record_activity(activity("test")).unwrap();
    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");

    probe.fail_next(1);
    let view = handle
        .wait_for(WAIT, |v| {
            v.state == WorkerState::Running && v.health_history.iter().any(|h| !h.healthy)
        })
        .await
        .expect("worker should recover after one failed probe");
    assert_eq!(view.consecutive_failures, 0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(handle.view().generation, 1);
    assert_eq!(launcher.launches(), 1);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_consecutive_failures_restart_exactly_once() {
    let launcher = RecordingLauncher::new();
    let probe = ScriptedProbe::healthy();
    let handle = start_supervisor(fast_settings(), launcher.clone(), probe.clone()).await;

    handle.record_activity(activity("test")).unwrap();
    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");

    probe.fail_next(3);
    let view = handle
        .wait_for(WAIT, |v| v.generation == 2 && v.state == WorkerState::Running)
        .await
        .expect("replacement worker should reach RUNNING");
    assert_eq!(view.restart_attempts, 0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(handle.view().generation, 2);
    assert_eq!(launcher.launches(), 2);
    assert_eq!(launcher.overlaps(), 0);
    assert_eq!(launcher.live_workers(), 1);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_spawn_failures_escalate_to_failed() {
    let launcher = Arc::new(FailingLauncher::default());
    let handle = start_supervisor(fast_settings(), launcher.clone(), ScriptedProbe::healthy()).await;

    handle.record_activity(activity("test")).unwrap();
    let view = handle
        .wait_for(WAIT, |v| v.state == WorkerState::Failed)
        .await
        .expect("supervisor should give up");

    assert_eq!(view.restart_attempts, 3);
    assert!(view.pid.is_none());
    let detail = view.error_detail.expect("FAILED carries error detail");
    assert!(detail.contains("spawn failed"), "{detail}");

    // Backoff doubles between attempts.
    let attempts = launcher.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts[1] - attempts[0] >= Duration::from_millis(20));
    assert!(attempts[2] - attempts[1] >= Duration::from_millis(40));

    // No further attempts without new activity.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(launcher.attempts().len(), 3);
    assert_eq!(handle.view().state, WorkerState::Failed);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_startup_grace_exhaustion_then_recovery_on_new_activity() {
    let launcher = RecordingLauncher::new();
    let probe = ScriptedProbe::down();
    let mut settings = fast_settings();
    settings.startup_grace = Duration::from_millis(200);
    settings.max_restart_attempts = 2;
    let handle = start_supervisor(settings, launcher.clone(), probe.clone()).await;

    handle.record_activity(activity("test")).unwrap();
    let view = handle
        .wait_for(WAIT, |v| v.state == WorkerState::Failed)
        .await
        .expect("startup grace should exhaust");
    assert!(view
        .error_detail
        .as_deref()
        .is_some_and(|d| d.contains("no healthy probe")));
    assert_eq!(launcher.launches(), 2);
    assert_eq!(launcher.live_workers(), 0);

    probe.set_healthy(true);
    handle.record_activity(activity("operator-retry")).unwrap();
    let view = handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("new activity should clear FAILED");
    assert_eq!(view.restart_attempts, 0);
    assert!(view.error_detail.is_none());
    assert_eq!(launcher.launches(), 3);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_inactivity_stops_worker() {
    let launcher = RecordingLauncher::new();
    let mut settings = fast_settings();
    settings.inactivity_timeout = Duration::from_millis(300);
    settings.stop_grace = Duration::from_millis(200);
    let deadline = settings.inactivity_timeout
        + settings.health_check_interval
        + settings.stop_grace
        + Duration::from_millis(150);
    let handle = start_supervisor(settings, launcher.clone(), ScriptedProbe::healthy()).await;

    let last_activity = Instant::now();
    handle.record_activity(activity("test")).unwrap();
    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");

    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Stopped)
        .await
        .expect("worker should stop after inactivity");
    let idle_for = last_activity.elapsed();
    assert!(idle_for >= Duration::from_millis(300), "stopped early: {idle_for:?}");
    assert!(idle_for <= deadline, "stopped late: {idle_for:?} > {deadline:?}");
    assert_eq!(launcher.live_workers(), 0);
    assert!(handle.view().pid.is_none());

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_stale_activity_on_cold_supervisor_launches_nothing() {
    let launcher = RecordingLauncher::new();
    let mut settings = fast_settings();
    settings.inactivity_timeout = Duration::from_secs(60);
    let handle = start_supervisor(settings, launcher.clone(), ScriptedProbe::healthy()).await;

    let an_hour_ago = Utc::now() - chrono::Duration::hours(1);
    let replayed = ActivityEvent::new("relay", "redelivered", ACTIVITY_KIND_WEBHOOK, an_hour_ago);
    handle.record_activity(replayed.clone()).unwrap();
    handle.record_activity(replayed).unwrap();

    // Stop is processed after both casts, so it doubles as a barrier.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop_and_wait(StopReason::Operator).await.unwrap();

    let view = handle.view();
    assert_eq!(launcher.launches(), 0);
    assert_eq!(view.generation, 0);
    assert_eq!(view.state, WorkerState::Stopped);
    assert_eq!(view.last_activity_at, Some(an_hour_ago));

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_steady_activity_keeps_single_worker() {
    let launcher = RecordingLauncher::new();
    let mut settings = fast_settings();
    settings.inactivity_timeout = Duration::from_millis(300);
    let handle = start_supervisor(settings, launcher.clone(), ScriptedProbe::healthy()).await;

    handle.record_activity(activity("steady")).unwrap();
    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.record_activity(activity("steady")).unwrap();
        assert_eq!(handle.view().state, WorkerState::Running);
    }
    assert_eq!(handle.view().generation, 1);
    assert_eq!(launcher.launches(), 1);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_crash_with_recent_activity_restarts() {
    let launcher = RecordingLauncher::with_overrides(vec![short_lived("0.3")]);
    let handle = start_supervisor(fast_settings(), launcher.clone(), ScriptedProbe::healthy()).await;

    handle.record_activity(activity("test")).unwrap();
    let view = handle
        .wait_for(WAIT, |v| v.generation == 2 && v.state == WorkerState::Running)
        .await
        .expect("crashed worker should be replaced");
    assert_eq!(view.restart_attempts, 0);
    assert_eq!(launcher.launches(), 2);
    assert_eq!(launcher.overlaps(), 0);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_crash_without_recent_activity_settles_stopped() {
    let launcher = RecordingLauncher::with_overrides(vec![short_lived("0.3")]);
    let mut settings = fast_settings();
    settings.inactivity_timeout = Duration::from_secs(1);
    // Keep the inactivity tick out of the way; the crash must decide.
    settings.health_check_interval = Duration::from_secs(2);
    let handle = start_supervisor(settings, launcher.clone(), ScriptedProbe::healthy()).await;

    let nearly_stale = Utc::now() - chrono::Duration::milliseconds(900);
    handle
        .record_activity(ActivityEvent::new(
            "test",
            "old news",
            ACTIVITY_KIND_WEBHOOK,
            nearly_stale,
        ))
        .unwrap();

    let view = handle
        .wait_for(WAIT, |v| v.generation == 1 && v.state == WorkerState::Stopped)
        .await
        .expect("crash without recent activity should settle at STOPPED");
    assert!(view
        .error_detail
        .as_deref()
        .is_some_and(|d| d.contains("exited unexpectedly")));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(launcher.launches(), 1);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_inactivity_supersedes_in_flight_start() {
    let launcher = RecordingLauncher::new();
    let mut settings = fast_settings();
    settings.inactivity_timeout = Duration::from_millis(200);
    settings.startup_grace = Duration::from_secs(10);
    let handle = start_supervisor(settings, launcher.clone(), ScriptedProbe::down()).await;

    handle.record_activity(activity("test")).unwrap();
    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Starting)
        .await
        .expect("worker should be starting");

    let view = handle
        .wait_for(WAIT, |v| v.state == WorkerState::Stopped)
        .await
        .expect("inactivity should cancel the start");
    assert_eq!(view.generation, 1);
    assert_eq!(launcher.live_workers(), 0);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_operator_stop_terminates_worker() {
    let launcher = RecordingLauncher::new();
    let handle = start_supervisor(fast_settings(), launcher.clone(), ScriptedProbe::healthy()).await;

    handle.record_activity(activity("test")).unwrap();
    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");

    handle.stop_and_wait(StopReason::Operator).await.unwrap();
    let view = handle.view();
    assert_eq!(view.state, WorkerState::Stopped);
    assert!(view.pid.is_none());
    assert_eq!(launcher.live_workers(), 0);

    shutdown(&handle).await;
}

#[tokio::test]
async fn test_status_readable_while_spawn_in_flight() {
    let launcher = RecordingLauncher::slow(Duration::from_millis(500));
    let handle = start_supervisor(fast_settings(), launcher.clone(), ScriptedProbe::healthy()).await;

    handle.record_activity(activity("test")).unwrap();
    handle
        .wait_for(Duration::from_millis(200), |v| v.state == WorkerState::Starting)
        .await
        .expect("STARTING should be published before the spawn completes");
    assert_eq!(launcher.launches(), 0);
    assert_eq!(handle.status().state, WorkerState::Starting);

    handle
        .wait_for(WAIT, |v| v.state == WorkerState::Running)
        .await
        .expect("worker should reach RUNNING");

    shutdown(&handle).await;
}
