use std::time::Duration;

use tokio::process::Command;
use tracing::warn;

use crate::types::ScriptOutcome;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs a `scripts/run` request: a sandboxed evaluator with captured
/// stdout, bounded by `timeout_ms` (default 10s), per spec 4.6.
///
/// The evaluator itself is `sh -c <text>`; a platform with a real sandboxed
/// interpreter (Elixir's `Code.eval_string`, a Lua VM, etc) would override
/// this, but the engine only depends on "run bounded, capture stdout".
pub async fn run(text: &str, timeout_ms: Option<u64>) -> ScriptOutcome {
    let timeout = timeout_ms.map(Duration::from_millis).unwrap_or(DEFAULT_TIMEOUT);

    let mut child = match Command::new("sh")
        .arg("-c")
        .arg(text)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            return ScriptOutcome::Error {
                r#return: String::new(),
                reason: err.to_string(),
                output: String::new(),
            }
        }
    };

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => ScriptOutcome::Completed {
            r#return: output.status.code().unwrap_or(0).to_string(),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        },
        Ok(Ok(output)) => ScriptOutcome::Error {
            r#return: String::new(),
            reason: format!("exit status {:?}", output.status.code()),
            output: String::from_utf8_lossy(&output.stdout).into_owned(),
        },
        Ok(Err(err)) => ScriptOutcome::Error {
            r#return: String::new(),
            reason: err.to_string(),
            output: String::new(),
        },
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "script execution timed out, killing child");
            ScriptOutcome::Error {
                r#return: String::new(),
                reason: "timeout".to_string(),
                output: String::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_script_captures_stdout() {
        let outcome = run("echo hello", None).await;
        match outcome {
            ScriptOutcome::Completed { output, .. } => assert_eq!(output.trim(), "hello"),
            ScriptOutcome::Error { reason, .. } => panic!("unexpected error: {reason}"),
        }
    }

    #[tokio::test]
    async fn timeout_is_reported_as_error() {
        let outcome = run("sleep 5", Some(20)).await;
        match outcome {
            ScriptOutcome::Error { reason, .. } => assert_eq!(reason, "timeout"),
            ScriptOutcome::Completed { .. } => panic!("expected timeout"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let outcome = run("exit 1", None).await;
        assert!(matches!(outcome, ScriptOutcome::Error { .. }));
    }
}
