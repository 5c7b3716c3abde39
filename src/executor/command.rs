//! Executor that shells out to an external program.
//!
//! The program receives the job through `VMFLOW_*` environment variables and
//! reports back on stdout, one JSON object per line. A line holding a
//! `result` key is the final [`JobResult`]; any other object is read as a
//! [`JobProgress`] update. Non-JSON lines are logged and ignored.

use super::{ExecutionError, JobContext, JobExecutor, Result};
use crate::jobs::{JobDefinition, JobProgress, JobResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, def: &JobDefinition, job_id: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env("VMFLOW_JOB_ID", job_id)
            .env("VMFLOW_JOB_KIND", kind_name(def))
            .env("VMFLOW_TARGET", &def.target)
            .env("VMFLOW_OUTPUT", &def.output)
            .env("VMFLOW_FORMAT", def.format.as_deref().unwrap_or(""))
            .env("VMFLOW_METHOD", def.method.as_deref().unwrap_or(""))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

fn kind_name(def: &JobDefinition) -> String {
    serde_json::to_value(def.kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default()
}

enum Line {
    Progress(JobProgress),
    Result(JobResult),
    Ignored,
}

fn parse_line(line: &str) -> Result<Line> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return Ok(Line::Ignored);
    }

    let mut value: serde_json::Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Ok(Line::Ignored),
    };

    if let Some(result) = value.get_mut("result") {
        let result = serde_json::from_value(result.take())
            .map_err(|e| ExecutionError::InvalidOutput(format!("result: {e}")))?;
        return Ok(Line::Result(result));
    }

    let progress = serde_json::from_value(value)
        .map_err(|e| ExecutionError::InvalidOutput(format!("progress: {e}")))?;
    Ok(Line::Progress(progress))
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[async_trait]
impl JobExecutor for CommandExecutor {
    async fn execute(&self, def: &JobDefinition, ctx: JobContext) -> Result<JobResult> {
        ctx.checkpoint()?;

        let started = Instant::now();
        let mut child = self.command(def, ctx.job_id()).spawn()?;
        info!(job_id = %ctx.job_id(), program = %self.program, pid = ?child.id(), "Executor started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::InvalidOutput("stdout not captured".to_string()))?;
        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut buf).await;
            }
            buf
        });

        let mut lines = BufReader::new(stdout).lines();
        let mut result = None;

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancelled() => {
                    let _ = child.kill().await;
                    info!(job_id = %ctx.job_id(), "Executor killed after cancellation");
                    return Err(ExecutionError::Cancelled);
                }
                line = lines.next_line() => match line? {
                    Some(line) => match parse_line(&line)? {
                        Line::Progress(progress) => ctx.report(progress).await,
                        Line::Result(r) => result = Some(r),
                        Line::Ignored => debug!(job_id = %ctx.job_id(), %line, "Executor output"),
                    },
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                let _ = child.kill().await;
                return Err(ExecutionError::Cancelled);
            }
            status = child.wait() => status?,
        };
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            warn!(job_id = %ctx.job_id(), %status, "Executor exited with failure");
            return Err(ExecutionError::Exit {
                status: status.to_string(),
                stderr: tail(&stderr),
            });
        }

        let mut result = result.unwrap_or_else(|| JobResult {
            output_dir: def.output.clone(),
            method: def.method.clone(),
            ..Default::default()
        });
        if result.duration_secs == 0.0 {
            result.duration_secs = started.elapsed().as_secs_f64();
        }
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::executor::ProgressSink;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct Collect(Mutex<Vec<JobProgress>>);

    #[async_trait]
    impl ProgressSink for Collect {
        async fn report(&self, _job_id: &str, progress: JobProgress) {
            self.0.lock().unwrap().push(progress);
        }
    }

    fn shell(script: &str) -> CommandExecutor {
        CommandExecutor::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_parse_line_kinds() {
        assert!(matches!(parse_line("plain text").unwrap(), Line::Ignored));
        assert!(matches!(
            parse_line(r#"{"phase":"exporting","percent_complete":12.5}"#).unwrap(),
            Line::Progress(p) if p.percent_complete == 12.5
        ));
        assert!(matches!(
            parse_line(r#"{"result":{"output_dir":"/x","total_bytes":3}}"#).unwrap(),
            Line::Result(r) if r.total_bytes == 3
        ));
        assert!(parse_line(r#"{"result":{"files":"nope"}}"#).is_err());
    }

    #[test]
    fn test_tail_keeps_end() {
        let long = "a".repeat(STDERR_TAIL_BYTES) + "end";
        let t = tail(&long);
        assert_eq!(t.len(), STDERR_TAIL_BYTES);
        assert!(t.ends_with("end"));
    }

    #[tokio::test]
    async fn test_reports_progress_and_result() {
        let executor = shell(
            r#"echo "starting $VMFLOW_TARGET"
echo '{"phase":"exporting","percent_complete":50}'
echo '{"result":{"output_dir":"/exports/vm-1","files":["vm-1.ovf"],"total_bytes":42}}'"#,
        );
        let sink = Arc::new(Collect::default());
        let ctx = JobContext::new("job-1", CancellationToken::new(), sink.clone());

        let def = JobDefinition::new("vm-1", "/exports");
        let result = executor.execute(&def, ctx).await.unwrap();

        assert_eq!(result.output_dir, "/exports/vm-1");
        assert_eq!(result.total_bytes, 42);
        assert!(result.duration_secs > 0.0);

        let progress = sink.0.lock().unwrap().clone();
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].phase, "exporting");
    }

    #[tokio::test]
    async fn test_default_result_uses_output() {
        let executor = shell("true");
        let def = JobDefinition::new("vm-1", "/exports").with_method("govc");

        let result = executor
            .execute(&def, JobContext::detached("job-1"))
            .await
            .unwrap();
        assert_eq!(result.output_dir, "/exports");
        assert_eq!(result.method.as_deref(), Some("govc"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let executor = shell("echo 'disk locked' >&2; exit 3");
        let def = JobDefinition::new("vm-1", "/exports");

        let err = executor
            .execute(&def, JobContext::detached("job-1"))
            .await
            .unwrap_err();
        match err {
            ExecutionError::Exit { stderr, .. } => assert_eq!(stderr, "disk locked"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let executor = shell("sleep 30");
        let def = JobDefinition::new("vm-1", "/exports");
        let ctx = JobContext::detached("job-1");
        let token = ctx.cancellation_token();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            token.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), executor.execute(&def, ctx))
            .await
            .expect("executor did not stop after cancel");
        assert!(matches!(outcome, Err(ExecutionError::Cancelled)));
    }
}
