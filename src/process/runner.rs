use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{CommandSpec, ProcessError, ProcessOutput, ProcessRunner, PASSWORD_ENV};

/// [`ProcessRunner`] backed by `tokio::process`
#[derive(Debug, Default, Clone)]
pub struct TokioProcessRunner;

impl TokioProcessRunner {
    /// Runner spawning real processes
    pub fn new() -> Self {
        Self
    }
}

async fn read_stream<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!(error = %e, "Output stream closed early");
        }
    }
    buf
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, spec: CommandSpec) -> Result<ProcessOutput, ProcessError> {
        debug!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "Running external command");

        let CommandSpec {
            program,
            args,
            timeout: limit,
            password,
        } = spec;

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches anything the child
        // left running in the background
        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(password) = &password {
            cmd.env(PASSWORD_ENV, password.expose());
        }

        let spawned = cmd.spawn();
        // The builder holds a copy of the environment; neither it nor the
        // password survives past spawn.
        drop(cmd);
        drop(password);

        let mut child = spawned.map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child.id();

        let mut stdout_task = tokio::spawn(read_stream(child.stdout.take()));
        let mut stderr_task = tokio::spawn(read_stream(child.stderr.take()));

        // The deadline covers draining the pipes as well: a grandchild that
        // inherited stdout keeps them open after the child itself exits.
        let completion = async {
            let status = child.wait().await?;
            let (stdout, stderr) = tokio::join!(&mut stdout_task, &mut stderr_task);
            Ok::<_, std::io::Error>((status, stdout.unwrap_or_default(), stderr.unwrap_or_default()))
        };
        let outcome = timeout(limit, completion).await;

        match outcome {
            Ok(Ok((status, stdout, stderr))) => Ok(ProcessOutput {
                exit_code: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            }),
            Ok(Err(source)) => Err(ProcessError::Io { program, source }),
            Err(_) => {
                kill_process_group(pid);
                // Reaps the child if it is still running; fails harmlessly
                // when only its descendants were left
                if let Err(e) = child.kill().await {
                    debug!(program = %program, error = %e, "Child already exited before kill");
                }
                stdout_task.abort();
                stderr_task.abort();
                warn!(program = %program, timeout_secs = limit.as_secs(), "External command timed out");
                Err(ProcessError::Timeout {
                    program,
                    timeout: limit,
                })
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions; the group id is
    // the one the child was spawned into.
    let rc = unsafe { libc::killpg(pid, libc::SIGKILL) };
    if rc != 0 {
        debug!(pgid = pid, error = %std::io::Error::last_os_error(), "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::Password;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .arg("-c")
            .arg("echo out; echo err >&2; exit 3");

        let output = runner.run(spec).await.expect("sh should run");
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_password_reaches_child_environment_only() {
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("sh", Duration::from_secs(5))
            .arg("-c")
            .arg(format!("printf %s \"${}\"", PASSWORD_ENV))
            .with_password(Password::new("s3cret"));

        let output = runner.run(spec).await.expect("sh should run");
        assert_eq!(output.stdout, "s3cret");
    }

    #[tokio::test]
    async fn test_timeout_kills_child() {
        let runner = TokioProcessRunner::new();
        let started = Instant::now();
        let spec = CommandSpec::new("sleep", Duration::from_millis(200)).arg("30");

        let result = runner.run(spec).await;
        assert!(matches!(result, Err(ProcessError::Timeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_timeout_covers_background_grandchild_holding_output() {
        let runner = TokioProcessRunner::new();
        let started = Instant::now();
        let spec = CommandSpec::new("sh", Duration::from_secs(1))
            .arg("-c")
            .arg("sleep 6 & echo started");

        let result = runner.run(spec).await;
        assert!(matches!(result, Err(ProcessError::Timeout { .. })), "got {:?}", result);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("sh", Duration::from_millis(500))
            .arg("-c")
            .arg(format!("sleep 30 & echo $! > {}; wait", pid_file.display()));

        let result = runner.run(spec).await;
        assert!(matches!(result, Err(ProcessError::Timeout { .. })));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        // Give the kernel a moment to deliver SIGKILL; signal 0 only probes
        let mut alive = true;
        for _ in 0..20 {
            alive = unsafe { libc::kill(pid, 0) } == 0 && !is_zombie(pid);
            if !alive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!alive, "background grandchild survived the timeout");
    }

    #[cfg(target_os = "linux")]
    fn is_zombie(pid: i32) -> bool {
        std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .map(|stat| stat.rsplit(')').next().map(|rest| rest.trim_start().starts_with('Z')).unwrap_or(false))
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let runner = TokioProcessRunner::new();
        let spec = CommandSpec::new("/nonexistent/definitely-not-here", Duration::from_secs(1));

        let result = runner.run(spec).await;
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }
}
