//! Start/stop cycles against real shell processes
#![cfg(unix)]

mod common;

use directory_helpers::subprocess::process_tree::ProcessTable;
use directory_helpers::subprocess::{ChunkSource, ExitStatus, LifecycleState, ProcessError};
use regex::Regex;
use std::time::Duration;

use common::{project_with_start, test_config};

#[tokio::test]
async fn test_start_waits_for_ready_line() {
    let (_temp, project) =
        project_with_start("echo booting; sleep 0.2; echo 'listening on :8080'; sleep 30").await;
    let mut controller = project.lifecycle();

    let chunk = controller
        .start(&Regex::new(r"listening on :\d+").unwrap())
        .await
        .unwrap();

    assert!(chunk.text().contains("listening on :8080"));
    assert_eq!(controller.state(), LifecycleState::Running);
    assert!(controller.pid().unwrap() > 0);

    controller.stop().await.unwrap();
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert!(controller.pid().is_none());
}

#[tokio::test]
async fn test_start_stop_start_matches_second_process_only() {
    let (_temp, project) = project_with_start(
        "echo \"ready from $$\"; sleep 30",
    )
    .await;
    let mut controller = project.lifecycle();
    let ready = Regex::new(r"ready from \d+").unwrap();

    controller.start(&ready).await.unwrap();
    let first_pid = controller.pid().unwrap();
    controller.stop().await.unwrap();

    let chunk = controller.start(&ready).await.unwrap();
    let second_pid = controller.pid().unwrap();
    assert_ne!(first_pid, second_pid);
    assert_eq!(chunk.text().trim(), format!("ready from {second_pid}"));

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_leaves_no_descendants() {
    let (_temp, project) = project_with_start(
        "sleep 30 & echo \"child=$! ready\"; sleep 30 & wait",
    )
    .await;
    let mut controller = project.lifecycle();

    let chunk = controller
        .start(&Regex::new(r"child=\d+ ready").unwrap())
        .await
        .unwrap();
    let child: u32 = Regex::new(r"child=(\d+)")
        .unwrap()
        .captures(chunk.text())
        .and_then(|c| c[1].parse().ok())
        .unwrap();
    let leader = controller.pid().unwrap();

    let table = ProcessTable::capture().await.unwrap();
    assert!(table.descendants(leader).contains(&child));

    controller.stop().await.unwrap();

    let table = ProcessTable::capture().await.unwrap();
    assert!(!table.is_alive(leader));
    assert!(!table.is_alive(child));
    assert!(table.descendants(leader).is_empty());
}

#[tokio::test]
async fn test_stop_reaches_descendant_in_new_session() {
    if !command_exists("setsid").await {
        return;
    }
    let (_temp, project) = project_with_start(
        "setsid sleep 30 & echo \"child=$! ready\"; wait",
    )
    .await;
    let mut controller = project.lifecycle();

    let chunk = controller
        .start(&Regex::new(r"child=\d+ ready").unwrap())
        .await
        .unwrap();
    let child: u32 = Regex::new(r"child=(\d+)")
        .unwrap()
        .captures(chunk.text())
        .and_then(|c| c[1].parse().ok())
        .unwrap();

    controller.stop().await.unwrap();
    assert!(!ProcessTable::capture().await.unwrap().is_alive(child));
}

#[tokio::test]
async fn test_process_exiting_before_ready() {
    let (_temp, project) = project_with_start("echo 'port in use' >&2; exit 4").await;
    let mut controller = project.lifecycle();

    let err = controller
        .start(&Regex::new("listening").unwrap())
        .await
        .unwrap_err();

    match err {
        ProcessError::ExitedBeforeReady { status, output } => {
            assert_eq!(status, ExitStatus::Error(4));
            assert!(output.contains("port in use"));
        }
        other => panic!("expected ExitedBeforeReady, got {other:?}"),
    }
    assert_eq!(controller.state(), LifecycleState::Idle);
    assert!(matches!(
        controller.stop().await.unwrap_err(),
        ProcessError::NotRunning
    ));
}

#[tokio::test]
async fn test_output_after_ready_is_readable() {
    let (_temp, project) =
        project_with_start("echo ready; sleep 0.1; echo 'request served'; sleep 30").await;
    let mut controller = project.lifecycle();
    controller.start(&Regex::new("ready").unwrap()).await.unwrap();

    let next = controller
        .output()
        .unwrap()
        .next_timeout(Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(next.text(), "request served\n");

    controller.stop().await.unwrap();
}

#[tokio::test]
async fn test_ready_timeout_stops_silent_process() {
    let (_temp, project) = project_with_start("sleep 30").await;
    let mut controller = directory_helpers::subprocess::SubprocessManager::production(
        test_config().with_ready_timeout(Duration::from_millis(200)),
    )
    .lifecycle(project.root());

    let err = controller
        .start(&Regex::new("ready").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, ProcessError::ReadyTimeout(_)));
    assert_eq!(controller.state(), LifecycleState::Idle);
}

#[tokio::test]
async fn test_dropping_controller_kills_process_group() {
    let (_temp, project) =
        project_with_start("sleep 30 & echo \"child=$! ready\"; wait").await;
    let mut controller = project.lifecycle();

    let chunk = controller
        .start(&Regex::new(r"child=\d+ ready").unwrap())
        .await
        .unwrap();
    let child: u32 = Regex::new(r"child=(\d+)")
        .unwrap()
        .captures(chunk.text())
        .and_then(|c| c[1].parse().ok())
        .unwrap();
    let leader = controller.pid().unwrap();

    drop(controller);

    let mut alive = true;
    for _ in 0..100 {
        let table = ProcessTable::capture().await.unwrap();
        alive = table.is_alive(leader) || table.is_alive(child);
        if !alive {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!alive, "process group survived controller drop");
}

async fn command_exists(program: &str) -> bool {
    tokio::process::Command::new("sh")
        .arg("-c")
        .arg(format!("command -v {program}"))
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}
