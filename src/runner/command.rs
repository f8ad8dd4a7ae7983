//! External process engine.
//!
//! Runs a configured program once per experiment. The program learns its
//! partition through `LABRELAY_EXPERIMENT` and reports progress on stdout:
//! JSON object lines are decoded as log records, any other line is logged at
//! info level. Stderr lines are logged as warnings and the last few of them
//! become the failure message when the program exits unsuccessfully.

use std::collections::VecDeque;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{Engine, EngineContext};
use crate::config::EngineConfig;
use crate::logs::{LogRecord, LogStore};

const STDERR_TAIL_LINES: usize = 20;

/// Engine adapter spawning one child process per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    /// Create an engine running `program` with `args` (`{name}` is substituted).
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from configuration, `None` when no command is configured.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Option<Self> {
        config
            .command
            .as_ref()
            .map(|program| Self::new(program.clone(), config.args.clone()))
    }

    /// Program path or name.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Engine for CommandEngine {
    async fn run<S: LogStore>(&self, ctx: EngineContext<S>) -> anyhow::Result<()> {
        let name = ctx.partition.as_str();
        let mut child = Command::new(&self.program)
            .args(self.args.iter().map(|arg| arg.replace("{name}", name)))
            .env("LABRELAY_EXPERIMENT", name)
            .env("LABRELAY_OVERRIDE", ctx.override_existing.to_string())
            .env("LABRELAY_CONFIG", serde_json::to_string(&ctx.config)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start engine '{}'", self.program))?;

        let stdout = child.stdout.take().context("engine stdout not captured")?;
        let stderr = child.stderr.take().context("engine stderr not captured")?;

        let stdout_pump = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                ctx.writer.write(parse_stdout_line(&line)).await?;
            }
            anyhow::Ok(())
        };

        let stderr_pump = async {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                ctx.writer.write(LogRecord::warning(line.clone())).await?;
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            anyhow::Ok(tail)
        };

        let wait = async { child.wait().await.context("failed to wait for engine") };

        let ((), tail, status) = tokio::try_join!(stdout_pump, stderr_pump, wait)?;
        if status.success() {
            return Ok(());
        }

        let detail = tail.into_iter().collect::<Vec<_>>().join("\n");
        if detail.is_empty() {
            anyhow::bail!("engine exited with {status}");
        }
        anyhow::bail!("engine exited with {status}: {detail}")
    }
}

fn parse_stdout_line(line: &str) -> LogRecord {
    if line.trim_start().starts_with('{') {
        if let Ok(record) = serde_json::from_str::<LogRecord>(line) {
            return record;
        }
    }
    LogRecord::info(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{LogLevel, MemoryLogStore};
    use crate::runner::PartitionWriter;
    use crate::validate::PartitionName;
    use std::sync::Arc;

    fn context(store: &Arc<MemoryLogStore>, name: &str) -> EngineContext<MemoryLogStore> {
        let partition = PartitionName::new(name).unwrap();
        EngineContext {
            partition: partition.clone(),
            config: serde_json::json!({"customers": 10}),
            override_existing: false,
            writer: PartitionWriter::new(Arc::clone(store), partition),
        }
    }

    #[test]
    fn test_parse_stdout_line() {
        let record = parse_stdout_line(r#"{"level":"success","message":"sold","agent_id":"b1"}"#);
        assert_eq!(record.level(), LogLevel::Success);
        assert_eq!(parse_stdout_line("plain text"), LogRecord::info("plain text"));
        assert_eq!(parse_stdout_line("{not json"), LogRecord::info("{not json"));
    }

    #[test]
    fn test_from_config() {
        assert!(CommandEngine::from_config(&EngineConfig::default()).is_none());
        let engine = CommandEngine::from_config(&EngineConfig {
            command: Some("sim".into()),
            args: vec!["{name}".into()],
        })
        .unwrap();
        assert_eq!(engine.program(), "sim");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_process_logs_stdout() {
        let store = Arc::new(MemoryLogStore::new());
        let engine = CommandEngine::new(
            "sh",
            vec![
                "-c".into(),
                r#"echo "start $1 $LABRELAY_EXPERIMENT"; echo '{"level":"success","message":"done"}'"#.into(),
                "sh".into(),
                "{name}".into(),
            ],
        );

        engine.run(context(&store, "exp_cmd")).await.unwrap();

        let entries = store
            .read_after(&PartitionName::new("exp_cmd").unwrap(), None, 10)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message(), Some("start exp_cmd exp_cmd"));
        assert_eq!(entries[1].level(), LogLevel::Success);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_process_reports_stderr_tail() {
        let store = Arc::new(MemoryLogStore::new());
        let engine = CommandEngine::new(
            "sh",
            vec!["-c".into(), "echo working; echo 'bad input' >&2; exit 3".into()],
        );

        let err = engine.run(context(&store, "exp_fail")).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("bad input"), "{message}");

        let partition = PartitionName::new("exp_fail").unwrap();
        assert_eq!(store.count(&partition).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_program_fails() {
        let store = Arc::new(MemoryLogStore::new());
        let engine = CommandEngine::new("/nonexistent/labrelay-engine", vec![]);
        let err = engine.run(context(&store, "exp_missing")).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to start engine"));
    }
}
