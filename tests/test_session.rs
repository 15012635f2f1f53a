//! Tests for session lifecycle policies: validation, capacity, idle
//! eviction, and close semantics.

mod common;

use cdbsh::error::EngineError;
use cdbsh::session::SessionState;
use common::{ChildBehavior, ScriptedProcessManager, engine_with, test_config};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Create / close basics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_and_close_session() {
    let (engine, _, _) = engine_with(test_config(), ScriptedProcessManager::normal());

    let sid = engine.create_session(common::DUMP, None).await.unwrap();
    assert!(sid.starts_with("sess-"));
    assert!(engine.is_session_active(&sid).await.unwrap());
    assert_eq!(
        engine.get_session_state(&sid).await.unwrap(),
        SessionState::Ready
    );

    engine.close_session(&sid).await.unwrap();
    assert!(!engine.is_session_active(&sid).await.unwrap());
    assert!(engine.list_sessions().await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_close_unknown_session_is_a_noop() {
    let (engine, _, _) = engine_with(test_config(), ScriptedProcessManager::normal());
    engine.close_session("sess-ghost").await.unwrap();
    engine.shutdown().await;
}

#[tokio::test]
async fn test_session_ids_are_unique() {
    let (engine, _, _) = engine_with(test_config(), ScriptedProcessManager::normal());
    let a = engine.create_session(common::DUMP, None).await.unwrap();
    let b = engine.create_session(common::DUMP, None).await.unwrap();
    assert_ne!(a, b);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_list_sessions_reports_metadata() {
    let (engine, _, _) = engine_with(test_config(), ScriptedProcessManager::normal());
    let sid = engine
        .create_session(common::DUMP, Some("srv*c:\\sym"))
        .await
        .unwrap();

    let sessions = engine.list_sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    let info = &sessions[0];
    assert_eq!(info.session_id, sid);
    assert_eq!(info.dump_path, common::DUMP);
    assert_eq!(info.symbols_path.as_deref(), Some("srv*c:\\sym"));
    assert_eq!(info.state, SessionState::Ready);
    assert_eq!(info.active_commands, 0);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_resources_list_changed_on_create_and_close() {
    let (engine, bridge, _) = engine_with(test_config(), ScriptedProcessManager::normal());

    let sid = engine.create_session(common::DUMP, None).await.unwrap();
    assert_eq!(
        bridge
            .frames_for("notifications/resources/listChanged")
            .len(),
        1
    );

    engine.close_session(&sid).await.unwrap();
    assert_eq!(
        bridge
            .frames_for("notifications/resources/listChanged")
            .len(),
        2
    );
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Dump validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_missing_dump_is_rejected() {
    let (engine, _, _) = engine_with(test_config(), ScriptedProcessManager::normal());
    let err = engine
        .create_session("/dumps/missing.dmp", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DumpNotFound(_)));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unreadable_dump_is_rejected() {
    let (engine, _, fs) = engine_with(test_config(), ScriptedProcessManager::normal());
    fs.mark_unreadable("/dumps/locked.dmp");
    let err = engine
        .create_session("/dumps/locked.dmp", None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DumpUnreadable { .. }));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_debugger_startup_failure_surfaces() {
    let (engine, _, _) = engine_with(
        test_config(),
        ScriptedProcessManager::with_behaviors(&[ChildBehavior::Silent]),
    );
    let err = engine.create_session(common::DUMP, None).await.unwrap_err();
    assert!(matches!(err, EngineError::StartupFailed(_)));
    // No half-created session lingers.
    assert!(engine.list_sessions().await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_debugger_args_carry_dump_and_symbols() {
    let proc = ScriptedProcessManager::normal();
    let (engine, _, _) = engine_with(test_config(), proc.clone());
    engine
        .create_session(common::DUMP, Some("srv*https://msdl.microsoft.com"))
        .await
        .unwrap();

    let spec = proc.last_spec.lock().unwrap().clone().unwrap();
    assert!(spec.program.ends_with("cdb.exe"));
    let args = spec.args.join(" ");
    assert!(args.contains(&format!("-z {}", common::DUMP)));
    assert!(args.contains("-y srv*https://msdl.microsoft.com"));
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Capacity
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_capacity_limit_and_release() {
    let mut config = test_config();
    config.max_sessions = 1;
    let (engine, _, _) = engine_with(config, ScriptedProcessManager::normal());

    let first = engine.create_session(common::DUMP, None).await.unwrap();

    let err = engine.create_session(common::DUMP, None).await.unwrap_err();
    assert!(matches!(err, EngineError::AtCapacity { active: 1, max: 1 }));

    // Closing the first frees the slot.
    engine.close_session(&first).await.unwrap();
    engine.create_session(common::DUMP, None).await.unwrap();
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Idle eviction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_idle_session_is_evicted() {
    let mut config = test_config();
    config.session_idle_timeout = Duration::from_millis(200);
    config.idle_sweep_interval = Duration::from_millis(50);
    let (engine, _, _) = engine_with(config, ScriptedProcessManager::normal());

    let sid = engine.create_session(common::DUMP, None).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if !engine.is_session_active(&sid).await.unwrap() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "idle session was never evicted"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_activity_defers_idle_eviction() {
    let mut config = test_config();
    config.session_idle_timeout = Duration::from_millis(400);
    config.idle_sweep_interval = Duration::from_millis(50);
    let (engine, _, _) = engine_with(config, ScriptedProcessManager::normal());

    let sid = engine.create_session(common::DUMP, None).await.unwrap();

    // Keep touching the session; it must survive well past the idle timeout.
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(engine.is_session_active(&sid).await.unwrap());
        let _ = engine.get_session_state(&sid).await.unwrap();
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_session_with_pending_commands_is_not_evicted() {
    let mut config = test_config();
    config.session_idle_timeout = Duration::from_millis(200);
    config.idle_sweep_interval = Duration::from_millis(50);
    // Long command timeout so the executing command stays in flight.
    config.command_timeout = Duration::from_secs(30);
    let (engine, _, _) = engine_with(config, ScriptedProcessManager::normal());

    let sid = engine.create_session(common::DUMP, None).await.unwrap();
    let cid = engine.enqueue_command(&sid, "spin").await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        engine.is_session_active(&sid).await.unwrap(),
        "session with an in-flight command must not be idle-evicted"
    );

    engine.cancel_command(&sid, &cid).await.unwrap();
    engine.shutdown().await;
}

// ---------------------------------------------------------------------------
// Close semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_close_cancels_outstanding_commands() {
    let mut config = test_config();
    config.command_timeout = Duration::from_secs(30);
    let (engine, _, _) = engine_with(config, ScriptedProcessManager::normal());

    let sid = engine.create_session(common::DUMP, None).await.unwrap();
    let running = engine.enqueue_command(&sid, "spin").await.unwrap();
    let queued = engine.enqueue_command(&sid, "lm").await.unwrap();

    // Wait until `spin` is actually on the wire.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let info = engine.get_command_info(&sid, &running).await.unwrap();
        if info.state == cdbsh::command::CommandState::Executing {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "spin never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    engine.close_session(&sid).await.unwrap();

    assert!(!engine.is_session_active(&sid).await.unwrap());
    // Both ids are gone with the session.
    assert!(matches!(
        engine.get_command_info(&sid, &running).await.unwrap_err(),
        EngineError::UnknownSession(_)
    ));
    assert!(matches!(
        engine.get_command_info(&sid, &queued).await.unwrap_err(),
        EngineError::UnknownSession(_)
    ));
    engine.shutdown().await;
}
