//! Shell command executor

use async_trait::async_trait;
use dagflow_common::error::{Error, Result};
use dagflow_core::context::RunContext;
use dagflow_core::executor::StepExecutor;
use dagflow_core::status::Node;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

const DEFAULT_SHELL: &str = "/bin/sh";

/// Runs a step's command line under a shell, captures stdout/stderr to the
/// node's log files, and records the trimmed stdout as the step's output
/// variable when one is configured.
pub struct CommandExecutor {
    log_dir: PathBuf,
    child_pid: Arc<Mutex<Option<u32>>>,
}

impl CommandExecutor {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            child_pid: Arc::new(Mutex::new(None)),
        }
    }

    fn log_path(&self, ctx: &RunContext, step: &str, ext: &str) -> PathBuf {
        self.log_dir
            .join(dagflow_common::keys::sanitize_for_filename(&ctx.dag_name))
            .join(dagflow_common::keys::sanitize_for_filename(&ctx.dag_run_id))
            .join(format!(
                "{}.{ext}",
                dagflow_common::keys::sanitize_for_filename(step)
            ))
    }

    async fn write_log(path: &PathBuf, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    fn deliver_signal(pid: u32, signal: i32) {
        // SAFETY: plain libc::kill on a pid this executor spawned; no memory
        // is touched
        #[allow(unsafe_code)]
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    async fn execute(&mut self, ctx: &RunContext, node: &mut Node) -> Result<()> {
        let step = node.step.clone();
        let Some(run) = &step.run else {
            return Err(Error::Validation(format!(
                "step {:?} has no command to run",
                step.name
            )));
        };
        let command_line = ctx.env.expand(run);
        let shell = step.shell.as_deref().unwrap_or(DEFAULT_SHELL);

        let stdout_path = self.log_path(ctx, &step.name, "out");
        let stderr_path = self.log_path(ctx, &step.name, "err");
        node.stdout = stdout_path.display().to_string();
        node.stderr = stderr_path.display().to_string();

        debug!(step = %step.name, shell, command = %command_line, "spawning command");
        let mut child = Command::new(shell)
            .arg("-c")
            .arg(&command_line)
            .envs(ctx.env.vars())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        *self.child_pid.lock() = child.id();

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let outcome = tokio::select! {
            result = async {
                // Drain both pipes concurrently so neither can fill and
                // block the child
                let (stdout_buf, stderr_buf) = tokio::join!(
                    async {
                        let mut buf = Vec::new();
                        if let Some(mut pipe) = stdout_pipe {
                            let _ = tokio::io::copy(&mut pipe, &mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(mut pipe) = stderr_pipe {
                            let _ = tokio::io::copy(&mut pipe, &mut buf).await;
                        }
                        buf
                    },
                );
                let status = child.wait().await?;
                Ok::<_, Error>((status, stdout_buf, stderr_buf))
            } => Some(result),
            () = ctx.cancel.cancelled() => None,
        };

        let Some(output) = outcome else {
            // Cancelled: signal the child, then reap it
            self.kill(libc::SIGTERM);
            let _ = child.wait().await;
            *self.child_pid.lock() = None;
            return Err(Error::Timeout(format!("step {:?} aborted", step.name)));
        };
        *self.child_pid.lock() = None;

        let (status, stdout_buf, stderr_buf) = output?;
        Self::write_log(&stdout_path, &stdout_buf).await?;
        Self::write_log(&stderr_path, &stderr_buf).await?;

        if let Some(output_var) = &step.output {
            let value = String::from_utf8_lossy(&stdout_buf).trim().to_string();
            node.output_variables.insert(output_var.clone(), value);
        }

        if status.success() {
            Ok(())
        } else {
            let code = status.code().unwrap_or(-1);
            let tail = String::from_utf8_lossy(&stderr_buf);
            let tail = tail.lines().last().unwrap_or_default();
            Err(Error::Internal(format!(
                "step {:?} exited with code {code}: {tail}",
                step.name
            )))
        }
    }

    fn kill(&mut self, signal: i32) {
        if let Some(pid) = *self.child_pid.lock() {
            warn!(pid, signal, "signalling running command");
            Self::deliver_signal(pid, signal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagflow_common::types::DagRunRef;
    use dagflow_core::context::EnvScope;
    use dagflow_core::dag::Step;
    use dagflow_store::{FileDagRunStore, InMemoryDagDatabase, InMemoryQueueStore};
    use std::collections::HashMap;
    use tokio_util::sync::CancellationToken;

    fn ctx(dir: &tempfile::TempDir, env: EnvScope) -> RunContext {
        RunContext {
            env,
            run_store: Arc::new(FileDagRunStore::new(dir.path())),
            queue_store: Arc::new(InMemoryQueueStore::new()),
            dag_db: Arc::new(InMemoryDagDatabase::new()),
            dispatcher: None,
            cancel: CancellationToken::new(),
            root: DagRunRef::new("etl", "r1"),
            dag_name: "etl".to_string(),
            dag_run_id: "r1".to_string(),
        }
    }

    fn node(run: &str, output: Option<&str>) -> Node {
        Node::new(Step {
            name: "step1".to_string(),
            run: Some(run.to_string()),
            output: output.map(ToString::to_string),
            ..Step::default()
        })
    }

    #[tokio::test]
    async fn captures_output_variable_and_logs() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir, EnvScope::empty());
        let mut node = node("echo hello-from-step", Some("GREETING"));
        let mut exec = CommandExecutor::new(dir.path().join("logs"));

        exec.execute(&ctx, &mut node).await.unwrap();

        assert_eq!(node.output_variables.get("GREETING"), Some("hello-from-step"));
        let logged = std::fs::read_to_string(&node.stdout).unwrap();
        assert_eq!(logged.trim(), "hello-from-step");
    }

    #[tokio::test]
    async fn env_vars_flow_into_the_command() {
        let dir = tempfile::tempdir().unwrap();
        let env = EnvScope::empty().with_dag_env(HashMap::from([(
            "TARGET".to_string(),
            "production".to_string(),
        )]));
        let ctx = ctx(&dir, env);
        let mut node = node("echo deploying to ${TARGET}", Some("OUT"));
        let mut exec = CommandExecutor::new(dir.path().join("logs"));

        exec.execute(&ctx, &mut node).await.unwrap();
        assert_eq!(
            node.output_variables.get("OUT"),
            Some("deploying to production")
        );
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error_with_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(&dir, EnvScope::empty());
        let mut node = node("echo boom >&2; exit 3", None);
        let mut exec = CommandExecutor::new(dir.path().join("logs"));

        let err = exec.execute(&ctx, &mut node).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("code 3"));
        assert!(message.contains("boom"));
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let context = ctx(&dir, EnvScope::empty());
        let cancel = context.cancel.clone();
        let mut node = node("sleep 30", None);
        let mut exec = CommandExecutor::new(dir.path().join("logs"));

        let started = std::time::Instant::now();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = exec.execute(&context, &mut node).await.unwrap_err();
        assert!(matches!(err.root(), Error::Timeout(_)));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
