//! Running a single external command with streamed output.

use crate::{ExecutorError, ExecutorResult};
use futures::StreamExt;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
}

/// A command that ran to completion with a zero exit status.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub duration: Duration,
}

/// Run `argv` in `cwd`, handing every output line to `on_line` as it arrives.
///
/// The child is killed if it outlives `timeout`. A non-zero exit status is
/// an error.
pub async fn run_step(
    argv: &[String],
    cwd: &Path,
    timeout: Duration,
    mut on_line: impl FnMut(OutputLine),
) -> ExecutorResult<StepOutput> {
    let (program, args) = argv.split_first().ok_or(ExecutorError::EmptyCommand)?;
    debug!(program = %program, args = ?args, cwd = %cwd.display(), "Running step");

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecutorError::Spawn {
            program: program.clone(),
            source,
        })?;

    let start = Instant::now();

    let stdout = child.stdout.take().map(|out| {
        LinesStream::new(BufReader::new(out).lines())
            .map(|line| (OutputStream::Stdout, line))
            .boxed()
    });
    let stderr = child.stderr.take().map(|err| {
        LinesStream::new(BufReader::new(err).lines())
            .map(|line| (OutputStream::Stderr, line))
            .boxed()
    });
    let mut lines = futures::stream::select(
        stdout.unwrap_or_else(|| futures::stream::empty().boxed()),
        stderr.unwrap_or_else(|| futures::stream::empty().boxed()),
    );

    let run = async {
        while let Some((stream, line)) = lines.next().await {
            match line {
                Ok(content) => on_line(OutputLine { stream, content }),
                Err(e) => warn!(program = %program, error = %e, "Unreadable output line"),
            }
        }
        child.wait().await
    };

    let outcome = tokio::time::timeout(timeout, run).await;
    let status = match outcome {
        Ok(status) => status?,
        Err(_) => {
            if let Err(e) = child.start_kill() {
                warn!(program = %program, error = %e, "Failed to kill timed out step");
            }
            return Err(ExecutorError::Timeout {
                program: program.clone(),
                after: timeout,
            });
        }
    };

    if !status.success() {
        return Err(ExecutorError::ExitStatus {
            program: program.clone(),
            code: status.code(),
        });
    }

    Ok(StepOutput {
        duration: start.elapsed(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_streams_both_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = Vec::new();

        run_step(
            &argv(&["sh", "-c", "echo out; echo err >&2"]),
            dir.path(),
            Duration::from_secs(10),
            |line| seen.push(line),
        )
        .await
        .unwrap();

        assert!(seen.contains(&OutputLine {
            stream: OutputStream::Stdout,
            content: "out".to_string()
        }));
        assert!(seen.contains(&OutputLine {
            stream: OutputStream::Stderr,
            content: "err".to_string()
        }));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        run_step(
            &argv(&["sh", "-c", "echo hi > marker"]),
            dir.path(),
            Duration::from_secs(10),
            |_| {},
        )
        .await
        .unwrap();
        assert!(dir.path().join("marker").exists());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_step(&argv(&["false"]), dir.path(), Duration::from_secs(10), |_| {})
            .await
            .unwrap_err();
        assert_matches!(err, ExecutorError::ExitStatus { code: Some(1), .. });
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_step(
            &argv(&["definitely-not-a-real-tool-xyz"]),
            dir.path(),
            Duration::from_secs(10),
            |_| {},
        )
        .await
        .unwrap_err();
        assert_matches!(err, ExecutorError::Spawn { .. });
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_step(
            &argv(&["sh", "-c", "sleep 5"]),
            dir.path(),
            Duration::from_millis(200),
            |_| {},
        )
        .await
        .unwrap_err();
        assert_matches!(err, ExecutorError::Timeout { .. });
    }

    #[tokio::test]
    async fn test_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_step(&[], dir.path(), Duration::from_secs(1), |_| {})
            .await
            .unwrap_err();
        assert_matches!(err, ExecutorError::EmptyCommand);
    }
}
