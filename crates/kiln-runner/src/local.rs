//! Host executor: steps run as local processes in a fresh sandbox directory.

use async_trait::async_trait;
use kiln_core::pipeline::{Arch, EnvironmentDescriptor, Platform};
use kiln_core::ports::{CommandResult, CommandSpec, ExecutionContext, Executor, OutputLine, OutputStream};
use kiln_core::{Error, ExecutorId, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalExecutorConfig {
    /// Directory under which one sandbox per acquisition is created.
    pub sandbox_root: PathBuf,
    /// Serve descriptors whose platform or arch differs from the host.
    pub allow_foreign_platforms: bool,
    /// Pass the host environment through to steps.
    pub inherit_env: bool,
}

impl Default for LocalExecutorConfig {
    fn default() -> Self {
        Self {
            sandbox_root: std::env::temp_dir().join("kiln-sandboxes"),
            allow_foreign_platforms: false,
            inherit_env: true,
        }
    }
}

pub struct LocalExecutor {
    config: LocalExecutorConfig,
}

impl LocalExecutor {
    pub fn new(config: LocalExecutorConfig) -> Self {
        Self { config }
    }

    fn check_platform(&self, environment: &str, descriptor: &EnvironmentDescriptor) -> Result<()> {
        if self.config.allow_foreign_platforms {
            return Ok(());
        }
        let host = (Platform::host(), Arch::host());
        if host != (Some(descriptor.platform), Some(descriptor.arch)) {
            return Err(Error::ExecutorUnavailable {
                environment: environment.to_string(),
                message: format!(
                    "host cannot serve {}/{}",
                    descriptor.platform.as_str(),
                    descriptor.arch.as_str()
                ),
            });
        }
        Ok(())
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(LocalExecutorConfig::default())
    }
}

const POSIX_SHELLS: &[&str] = &["sh", "bash", "dash", "zsh", "ksh", "ash"];

/// Program and leading arguments for a step's `shell` setting.
///
/// A bare POSIX shell runs the script with `-e -c`, any other bare program
/// with `-c`. A setting with arguments (`pwsh -NoProfile -Command`) is used
/// as given, with the script appended.
fn shell_invocation(shell: &str) -> Result<(String, Vec<String>)> {
    let mut words = shell.split_whitespace();
    let Some(program) = words.next() else {
        return Err(Error::InvalidPipeline("step shell must not be empty".to_string()));
    };
    let mut args: Vec<String> = words.map(str::to_string).collect();
    if args.is_empty() {
        let name = std::path::Path::new(program)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(program);
        if POSIX_SHELLS.contains(&name) {
            args.push("-e".to_string());
        }
        args.push("-c".to_string());
    }
    Ok((program.to_string(), args))
}

fn stream_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0u32;
        while let Ok(Some(line)) = lines.next_line().await {
            line_number += 1;
            let output = OutputLine {
                stream,
                content: line,
                line_number,
                timestamp: chrono::Utc::now(),
            };
            if tx.send(output).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn acquire(&self, environment: &str, descriptor: &EnvironmentDescriptor) -> Result<ExecutionContext> {
        self.check_platform(environment, descriptor)?;

        let id = ExecutorId::new();
        let workdir = self.config.sandbox_root.join(id.to_string());
        tokio::fs::create_dir_all(&workdir)
            .await
            .map_err(|e| Error::ExecutorUnavailable {
                environment: environment.to_string(),
                message: format!("failed to create sandbox: {e}"),
            })?;

        info!(executor_id = %id, environment, workdir = %workdir.display(), "Sandbox acquired");
        Ok(ExecutionContext {
            id,
            environment: environment.to_string(),
            descriptor: descriptor.clone(),
            workdir,
        })
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        command: &CommandSpec,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<CommandResult> {
        let start = std::time::Instant::now();
        let cwd = match &command.working_directory {
            Some(dir) => ctx.workdir.join(dir),
            None => ctx.workdir.clone(),
        };

        let mut env_vars: HashMap<String, String> = if self.config.inherit_env {
            std::env::vars().collect()
        } else {
            HashMap::new()
        };
        env_vars.extend(command.env.clone());

        let (program, args) = shell_invocation(&command.shell)?;
        debug!(shell = %command.shell, cwd = %cwd.display(), "Spawning step process");
        let mut cmd = Command::new(&program);
        if !self.config.inherit_env {
            cmd.env_clear();
        }
        let mut child = cmd
            .args(&args)
            .arg(&command.script)
            .current_dir(&cwd)
            .envs(&env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn process: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

        let stdout_handle = stream_lines(stdout, OutputStream::Stdout, output_tx.clone());
        let stderr_handle = stream_lines(stderr, OutputStream::Stderr, output_tx);

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Internal(format!("Failed to wait for process: {e}")))?;

        let _ = stdout_handle.await;
        let _ = stderr_handle.await;

        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(exit_code, duration_ms, "Command completed");

        Ok(CommandResult {
            exit_code,
            duration_ms,
        })
    }

    async fn release(&self, ctx: ExecutionContext) -> Result<()> {
        match tokio::fs::remove_dir_all(&ctx.workdir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(executor_id = %ctx.id, error = %e, "Failed to remove sandbox");
                return Err(Error::ExecutorLost(format!("{}: {e}", ctx.id)));
            }
        }
        info!(executor_id = %ctx.id, environment = %ctx.environment, "Sandbox released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(root: &std::path::Path) -> LocalExecutor {
        LocalExecutor::new(LocalExecutorConfig {
            sandbox_root: root.to_path_buf(),
            allow_foreign_platforms: true,
            inherit_env: true,
        })
    }

    fn script(cmd: &str) -> CommandSpec {
        CommandSpec {
            script: cmd.to_string(),
            shell: "sh".to_string(),
            working_directory: None,
            env: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_run_streams_output() {
        let root = tempfile::tempdir().unwrap();
        let executor = executor(root.path());
        let ctx = executor.acquire("default", &EnvironmentDescriptor::default()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(100);

        let mut spec = script("echo hello; echo \"$GREETING\" >&2");
        spec.env.insert("GREETING".to_string(), "hi".to_string());
        let result = executor.run(&ctx, &spec, tx).await.unwrap();
        assert!(result.success());

        let mut lines = vec![];
        while let Some(line) = rx.recv().await {
            lines.push((line.stream, line.content));
        }
        assert!(lines.contains(&(OutputStream::Stdout, "hello".to_string())));
        assert!(lines.contains(&(OutputStream::Stderr, "hi".to_string())));
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let root = tempfile::tempdir().unwrap();
        let executor = executor(root.path());
        let ctx = executor.acquire("default", &EnvironmentDescriptor::default()).await.unwrap();
        let (tx, _rx) = mpsc::channel(100);

        let result = executor.run(&ctx, &script("exit 3"), tx).await.unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
    }

    #[test]
    fn test_shell_invocation() {
        let args = |shell: &str| shell_invocation(shell).unwrap().1;
        assert_eq!(args("bash"), vec!["-e", "-c"]);
        assert_eq!(args("/bin/zsh"), vec!["-e", "-c"]);
        assert_eq!(args("python3"), vec!["-c"]);
        assert_eq!(
            shell_invocation("pwsh -NoProfile -Command").unwrap(),
            ("pwsh".to_string(), vec!["-NoProfile".to_string(), "-Command".to_string()])
        );
        assert!(shell_invocation("  ").is_err());
    }

    #[tokio::test]
    async fn test_shell_with_arguments_is_used_verbatim() {
        let root = tempfile::tempdir().unwrap();
        let executor = executor(root.path());
        let ctx = executor.acquire("default", &EnvironmentDescriptor::default()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(100);

        let mut spec = script("false; echo kept going");
        spec.shell = "sh -c".to_string();
        let result = executor.run(&ctx, &spec, tx).await.unwrap();
        assert!(result.success());

        let mut lines = vec![];
        while let Some(line) = rx.recv().await {
            lines.push(line.content);
        }
        assert_eq!(lines, vec!["kept going".to_string()]);
    }

    #[tokio::test]
    async fn test_release_removes_sandbox() {
        let root = tempfile::tempdir().unwrap();
        let executor = executor(root.path());
        let ctx = executor.acquire("default", &EnvironmentDescriptor::default()).await.unwrap();
        let workdir = ctx.workdir.clone();
        assert!(workdir.is_dir());

        executor.release(ctx).await.unwrap();
        assert!(!workdir.exists());
    }

    #[tokio::test]
    async fn test_refuses_foreign_platform() {
        let root = tempfile::tempdir().unwrap();
        let executor = LocalExecutor::new(LocalExecutorConfig {
            sandbox_root: root.path().to_path_buf(),
            ..LocalExecutorConfig::default()
        });
        let foreign = EnvironmentDescriptor {
            platform: if Platform::host() == Some(Platform::Macos) {
                Platform::Linux
            } else {
                Platform::Macos
            },
            ..EnvironmentDescriptor::default()
        };

        let err = executor.acquire("darwin", &foreign).await.unwrap_err();
        assert!(matches!(err, Error::ExecutorUnavailable { .. }));
    }
}
