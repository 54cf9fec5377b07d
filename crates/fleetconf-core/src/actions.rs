// ── Service-action subprocess ──
//
// Service actions transform intent into device configuration. The
// controller hands the candidate `<devices>` tree to the configured
// command on stdin and reads the transformed tree from stdout, bounded
// by the device timeout. The child is the only unit of concurrency
// outside the reactor.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub struct ActionRunner {
    command: Vec<String>,
    timeout: Duration,
}

impl ActionRunner {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self, CoreError> {
        if command.is_empty() {
            return Err(CoreError::ActionUnconfigured);
        }
        Ok(Self { command, timeout })
    }

    /// Run the action process once: write `input` to its stdin, return
    /// its stdout. Non-zero exit or a timeout fails the run.
    pub async fn run(&self, input: String) -> Result<String, CoreError> {
        let mut child = Command::new(&self.command[0])
            .args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::ActionFailed {
                message: format!("spawn {}: {e}", self.command[0]),
            })?;

        let mut stdin = child.stdin.take().ok_or_else(|| CoreError::ActionFailed {
            message: "stdin not captured".into(),
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| CoreError::ActionFailed {
            message: "stdout not captured".into(),
        })?;

        let work = async {
            stdin.write_all(input.as_bytes()).await?;
            drop(stdin);
            let mut output = String::new();
            stdout.read_to_string(&mut output).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, output))
        };

        let (status, output) = tokio::time::timeout(self.timeout, work)
            .await
            .map_err(|_| CoreError::ActionFailed {
                message: format!("timed out after {:?}", self.timeout),
            })?
            .map_err(|e| CoreError::ActionFailed {
                message: e.to_string(),
            })?;

        if !status.success() {
            return Err(CoreError::ActionFailed {
                message: format!("exited with {status}"),
            });
        }
        debug!(bytes = output.len(), "service action produced output");
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identity_action_roundtrips_input() {
        let runner =
            ActionRunner::new(vec!["cat".into()], Duration::from_secs(5)).unwrap();
        let out = runner.run("<devices/>".into()).await.unwrap();
        assert_eq!(out, "<devices/>");
    }

    #[tokio::test]
    async fn failing_action_is_reported() {
        let runner =
            ActionRunner::new(vec!["false".into()], Duration::from_secs(5)).unwrap();
        let err = runner.run(String::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::ActionFailed { .. }));
    }

    #[tokio::test]
    async fn hung_action_times_out() {
        let runner = ActionRunner::new(
            vec!["sleep".into(), "10".into()],
            Duration::from_millis(100),
        )
        .unwrap();
        let err = runner.run(String::new()).await.unwrap_err();
        assert!(matches!(err, CoreError::ActionFailed { message } if message.contains("timed out")));
    }

    #[test]
    fn empty_command_is_unconfigured() {
        assert!(matches!(
            ActionRunner::new(Vec::new(), Duration::from_secs(1)),
            Err(CoreError::ActionUnconfigured)
        ));
    }
}
