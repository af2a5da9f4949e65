//! Executor tests against real subprocesses: `/bin/sh` scripts speaking the
//! jsonlines agent framing.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use switchboard::agent::executor::AgentInstance;
use switchboard::agent::{AgentEvent, AgentSpec, AgentState, Transport};
use tokio::sync::mpsc;

/// A well-behaved jsonlines agent: banner, ping replies, and a two-delta
/// chat completion.
const ECHO_AGENT: &str = r#"
echo "READY shelltest 0.1"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  case "$line" in
    *'"op":"ping"'*)
      printf '{"id":"%s","final":true}\n' "$id"
      ;;
    *'"op":"chat"'*)
      printf '{"id":"%s","delta":"hello "}\n' "$id"
      printf '{"id":"%s","delta":"world","final":true,"finish_reason":"stop","usage":{"prompt_tokens":2,"completion_tokens":2}}\n' "$id"
      ;;
  esac
done
"#;

/// An agent that accepts one request and then exits without replying.
const FLAKY_AGENT: &str = r#"
echo "READY flaky 0.1"
IFS= read -r line
exit 0
"#;

fn spec(script: &str, max_concurrent: usize) -> Arc<AgentSpec> {
    Arc::new(AgentSpec {
        name: "shelltest".to_owned(),
        binary_path: "/bin/sh".into(),
        argv: vec!["-c".to_owned(), script.to_owned()],
        env: HashMap::new(),
        working_dir: None,
        transport: Transport::StdioJsonlines,
        startup_timeout: Duration::from_secs(5),
        max_concurrent_invocations: max_concurrent,
        models_advertised: ["shell-model".to_owned()].into_iter().collect::<BTreeSet<_>>(),
        primary: true,
    })
}

async fn spawn_ready(script: &str) -> (AgentInstance, mpsc::UnboundedReceiver<String>) {
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();
    let instance = AgentInstance::spawn(spec(script, 2), exit_tx)
        .await
        .expect("agent should spawn");
    tokio::time::timeout(Duration::from_secs(5), instance.wait_ready())
        .await
        .expect("readiness should not hang")
        .expect("agent should become ready");
    (instance, exit_rx)
}

#[tokio::test]
async fn banner_satisfies_startup_and_health_probe_works() {
    let (instance, _exit_rx) = spawn_ready(ECHO_AGENT).await;
    assert_eq!(instance.state(), AgentState::Ready);
    assert!(instance.pid().is_some());

    instance
        .health(Duration::from_secs(2))
        .await
        .expect("ping probe should succeed");
    assert!(instance.last_health_ok().is_some());

    instance.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn invoke_round_trip_streams_deltas_then_done() {
    let (instance, _exit_rx) = spawn_ready(ECHO_AGENT).await;

    let permit = instance.try_admit().expect("slot available");
    let mut invocation = instance
        .invoke(
            "req-1".to_owned(),
            "shell-model",
            serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
            false,
            permit,
        )
        .await
        .expect("invoke should start");
    assert_eq!(instance.in_flight(), 1);

    let mut content = String::new();
    let mut finished = false;
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), invocation.next_event())
        .await
        .expect("agent should reply")
    {
        match event {
            AgentEvent::Delta { content: delta } => content.push_str(&delta),
            AgentEvent::Done {
                finish_reason,
                usage,
            } => {
                assert_eq!(finish_reason.as_deref(), Some("stop"));
                assert_eq!(usage.unwrap().total_tokens, 4);
                finished = true;
                break;
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(finished);
    assert_eq!(content, "hello world");
    invocation.mark_finished();
    drop(invocation);

    // The slot is released once the invocation guard drops.
    tokio::time::timeout(Duration::from_secs(1), async {
        while instance.in_flight() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("in-flight slot should be released");

    instance.stop(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn subprocess_exit_fails_outstanding_invocations() {
    let (instance, mut exit_rx) = spawn_ready(FLAKY_AGENT).await;

    let permit = instance.try_admit().expect("slot available");
    let mut invocation = instance
        .invoke(
            "req-2".to_owned(),
            "shell-model",
            serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
            false,
            permit,
        )
        .await
        .expect("invoke should start");

    match tokio::time::timeout(Duration::from_secs(5), invocation.next_event())
        .await
        .expect("exit should surface")
    {
        Some(AgentEvent::Failed { message }) => {
            assert!(message.contains("exited"), "message: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }

    assert!(instance.wait_exited(Duration::from_secs(5)).await);
    assert_eq!(instance.state(), AgentState::Dead);

    // The waiter reports the exit to the supervisor channel.
    let exited_name = tokio::time::timeout(Duration::from_secs(2), exit_rx.recv())
        .await
        .expect("exit notification")
        .expect("channel open");
    assert_eq!(exited_name, "shelltest");
}

#[tokio::test]
async fn stop_closes_stdin_and_reaps_the_process() {
    let (instance, _exit_rx) = spawn_ready(ECHO_AGENT).await;
    instance.stop(Duration::from_secs(5)).await;
    assert!(instance.wait_exited(Duration::from_secs(1)).await);
    assert_eq!(instance.state(), AgentState::Dead);
    assert!(!instance.is_alive());
}

#[tokio::test]
async fn concurrency_is_bounded_by_the_spec() {
    let (instance, _exit_rx) = spawn_ready(ECHO_AGENT).await;

    let first = instance.try_admit().expect("first slot");
    let second = instance.try_admit().expect("second slot");
    assert!(instance.try_admit().is_none(), "third admit must fail");
    assert_eq!(instance.state(), AgentState::Busy);

    drop(first);
    drop(second);
    tokio::time::timeout(Duration::from_secs(1), async {
        while instance.try_admit().is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("slots should free up");

    instance.stop(Duration::from_secs(2)).await;
}
