// Shared test helpers: a scripted ProcessRunner standing in for the system
// ssh tooling.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backup_sync::config::{ConfigStore, MemoryConfigStore};
use backup_sync::identity::{IdentityPaths, KeyManager};
use backup_sync::process::{CommandSpec, ProcessError, ProcessOutput, ProcessRunner};
use backup_sync::remote::{BootstrapSettings, TrustBootstrap, TrustTracker};
use backup_sync::service::{BackupSyncService, ServiceSettings};
use parking_lot::Mutex;
use tokio::sync::Notify;

pub const HOST_KEY_LINE: &str = "|1|c2FsdA==|aGFzaA== ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIHostKey";

type Handler = Arc<dyn Fn(&CommandSpec) -> Result<ProcessOutput, ProcessError> + Send + Sync>;

/// One observed invocation
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub had_password: bool,
    pub started_at: Instant,
}

impl RecordedCall {
    /// Last argument; for ssh this is the remote command
    pub fn remote_command(&self) -> &str {
        self.args.last().map(String::as_str).unwrap_or("")
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

struct Pause {
    program: String,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

/// Scripted runner keyed by program name. Unscripted programs succeed with
/// empty output.
#[derive(Default)]
pub struct FakeRunner {
    handlers: Mutex<HashMap<String, Handler>>,
    calls: Mutex<Vec<RecordedCall>>,
    pause: Mutex<Option<Pause>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// A remote that accepts the password, echoes back commands and has
    /// working ssh tooling locally
    pub fn healthy() -> Self {
        let runner = Self::new();
        let generation = Arc::new(AtomicUsize::new(0));
        runner.on("ssh-keygen", move |spec| {
            let n = generation.fetch_add(1, Ordering::SeqCst);
            write_keypair(spec, n);
            Ok(ProcessOutput::ok(""))
        });
        runner.on("ssh-keyscan", |_| Ok(ProcessOutput::ok(format!("{HOST_KEY_LINE}\n"))));
        runner.on("sshpass", |_| Ok(ProcessOutput::ok("Key added successfully\n")));
        runner.on("ssh", echo_remote);
        runner
    }

    pub fn on<F>(&self, program: &str, handler: F)
    where
        F: Fn(&CommandSpec) -> Result<ProcessOutput, ProcessError> + Send + Sync + 'static,
    {
        self.handlers.lock().insert(program.to_string(), Arc::new(handler));
    }

    /// Block the next call to `program` until released.
    /// Returns (entered, release).
    pub fn pause_on(&self, program: &str) -> (Arc<Notify>, Arc<Notify>) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        *self.pause.lock() = Some(Pause {
            program: program.to_string(),
            entered: entered.clone(),
            release: release.clone(),
        });
        (entered, release)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.program == program).collect()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.program).collect()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, spec: CommandSpec) -> Result<ProcessOutput, ProcessError> {
        self.calls.lock().push(RecordedCall {
            program: spec.program.clone(),
            args: spec.args.clone(),
            timeout: spec.timeout,
            had_password: spec.password.is_some(),
            started_at: Instant::now(),
        });

        let pause = {
            let mut slot = self.pause.lock();
            match slot.as_ref() {
                Some(p) if p.program == spec.program => slot.take(),
                _ => None,
            }
        };
        if let Some(pause) = pause {
            pause.entered.notify_one();
            pause.release.notified().await;
        }

        let handler = self.handlers.lock().get(&spec.program).cloned();
        match handler {
            Some(handler) => handler(&spec),
            None => Ok(ProcessOutput::ok("")),
        }
    }
}

/// Emulates `ssh-keygen -f <path>`: writes both halves
pub fn write_keypair(spec: &CommandSpec, generation: usize) {
    let path = spec
        .args
        .iter()
        .position(|a| a == "-f")
        .and_then(|i| spec.args.get(i + 1))
        .map(PathBuf::from)
        .expect("ssh-keygen called without -f");
    std::fs::write(&path, format!("PRIVATE KEY {generation}\n")).unwrap();
    std::fs::write(
        path.with_extension("pub"),
        format!("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI{generation} backup-sync\n"),
    )
    .unwrap();
}

/// Emulates a remote shell that understands `echo` and `true`
pub fn echo_remote(spec: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
    let command = spec.args.last().cloned().unwrap_or_default();
    if let Some(text) = command.strip_prefix("echo ") {
        return Ok(ProcessOutput::ok(format!("{text}\n")));
    }
    Ok(ProcessOutput::ok(""))
}

pub fn connection_refused(_: &CommandSpec) -> Result<ProcessOutput, ProcessError> {
    Ok(ProcessOutput::failed(
        255,
        "ssh: connect to host 203.0.113.9 port 22: Connection refused\n",
    ))
}

pub fn fast_bootstrap() -> BootstrapSettings {
    BootstrapSettings {
        settle_delay: Duration::ZERO,
        ..BootstrapSettings::default()
    }
}

/// Bootstrap wired to a fake runner and an in-memory config store
pub struct BootstrapHarness {
    pub runner: Arc<FakeRunner>,
    pub store: Arc<MemoryConfigStore>,
    pub tracker: Arc<TrustTracker>,
    pub keys: KeyManager,
    pub bootstrap: TrustBootstrap,
}

impl BootstrapHarness {
    pub fn new(data_dir: &Path, runner: FakeRunner) -> Self {
        Self::with_settings(data_dir, runner, fast_bootstrap())
    }

    pub fn with_settings(data_dir: &Path, runner: FakeRunner, settings: BootstrapSettings) -> Self {
        let runner = Arc::new(runner);
        let store = Arc::new(MemoryConfigStore::new());
        let tracker = Arc::new(TrustTracker::new());
        let keys = KeyManager::new(IdentityPaths::in_dir(data_dir), runner.clone());
        let bootstrap = TrustBootstrap::new(
            keys.clone(),
            runner.clone(),
            tracker.clone(),
            store.clone() as Arc<dyn ConfigStore>,
            settings,
        );
        Self {
            runner,
            store,
            tracker,
            keys,
            bootstrap,
        }
    }
}

/// Service over a fake runner with zero settle delay
pub fn service(data_dir: &Path, runner: Arc<FakeRunner>, store: Arc<MemoryConfigStore>) -> BackupSyncService {
    let mut settings = ServiceSettings::new(data_dir);
    settings.bootstrap = fast_bootstrap();
    BackupSyncService::new(settings, runner, store)
}

/// Write an archive and pin its mtime
pub fn archive(root: &Path, category: &str, name: &str, bytes: usize, mtime_secs: u64) -> PathBuf {
    let dir = root.join(category);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, vec![0u8; bytes]).unwrap();
    let mtime = std::time::UNIX_EPOCH + Duration::from_secs(mtime_secs);
    std::fs::File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(mtime)
        .unwrap();
    path
}
