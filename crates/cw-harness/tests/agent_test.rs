use std::time::Duration;

use cw_harness::agent::{AgentError, AgentRunner, CommandAgent};

fn sh(script: &str) -> CommandAgent {
    // The instructions reference is appended last and lands in `$1`.
    CommandAgent::new("sh", vec!["-c".into(), script.into(), "sh".into()])
}

#[tokio::test]
async fn captures_exit_status_and_both_streams() {
    let agent = sh("echo \"running $1\"; echo oops >&2; exit 3");
    let out = agent.run("/tasks/nightly.md").await.unwrap();

    assert_eq!(out.exit_status, Some(3));
    assert!(!out.success());
    assert!(out.output.contains("running /tasks/nightly.md"));
    assert!(out.output.contains("oops"));
}

#[tokio::test]
async fn zero_exit_is_success() {
    let out = sh("exit 0").run("x").await.unwrap();
    assert!(out.success());
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let agent = CommandAgent::new("/nonexistent/cronwarden-agent", vec![]);
    let err = agent.run("x").await.unwrap_err();
    assert!(matches!(err, AgentError::Spawn { .. }));
}

#[tokio::test]
async fn slow_attempt_times_out() {
    let agent = sh("sleep 5").with_timeout(Duration::from_millis(100));
    let err = agent.run("x").await.unwrap_err();
    assert!(matches!(err, AgentError::Timeout(limit) if limit == Duration::from_millis(100)));
}
