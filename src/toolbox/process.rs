//! Guest process table for `StartProgram`, `ListProcessesEx` and
//! `TerminateProcess`.
//!
//! Pids are allocated from a counter, not by the OS, so in-process
//! functions and shell commands share one namespace. An entry outlives its
//! process by the configured expiry so clients can read the exit code.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use std::{env, fmt, io};

use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use quick_xml::escape::escape;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::op::Operation;
use crate::toolbox::vix::StartProgramRequest;

pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(300);

/// Exit code recorded for a process that was killed or died on a signal.
pub const KILLED_EXIT_CODE: i32 = -1;

const SHELL: &str = "/bin/sh";

#[derive(Debug, Clone, Error)]
#[error("{message} (exit code {exit_code})")]
pub struct ProcessError {
    pub exit_code: i32,
    pub message: String,
}

impl ProcessError {
    pub fn new(exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }
}

impl From<ProcessError> for Error {
    fn from(err: ProcessError) -> Self {
        Error::Io {
            context: "guest process".into(),
            source: io::Error::other(err),
        }
    }
}

pub type ProcessFn = Arc<dyn Fn(String, Operation) -> BoxFuture<'static, Result<(), ProcessError>> + Send + Sync>;

/// What `start` runs.
#[derive(Clone)]
pub enum Process {
    /// The program path and arguments through `/bin/sh -c`.
    Command,
    /// A task given the argument string. The operation is cancelled on kill.
    Func(ProcessFn),
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Process::Command => f.write_str("Command"),
            Process::Func(_) => f.write_str("Func"),
        }
    }
}

impl Process {
    pub fn func<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Operation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
    {
        Process::Func(Arc::new(move |args, op| f(args, op).boxed()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessState {
    pub pid: i64,
    pub name: String,
    pub args: String,
    pub owner: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub exit_code: Option<i32>,
}

impl ProcessState {
    fn to_xml(&self) -> String {
        let cmd = format!("{} {}", self.name, self.args);
        let mut xml = format!(
            "<proc><cmd>{}</cmd><exe>{}</exe><pid>{}</pid><owner>{}</owner><start>{}</start>",
            escape(cmd.trim_end()),
            escape(&self.name),
            self.pid,
            escape(&self.owner),
            self.start_time,
        );
        if let (Some(code), Some(end)) = (self.exit_code, self.end_time) {
            xml.push_str(&format!("<eCode>{code}</eCode><eTime>{end}</eTime>"));
        }
        xml.push_str("</proc>");
        xml
    }
}

struct Entry {
    state: ProcessState,
    op: Operation,
    exited: watch::Receiver<Option<ProcessState>>,
}

pub struct ProcessManager {
    expire: Duration,
    next_pid: AtomicI64,
    entries: Arc<Mutex<BTreeMap<i64, Entry>>>,
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(DEFAULT_EXPIRY)
    }
}

impl ProcessManager {
    pub fn new(expire: Duration) -> Self {
        Self {
            expire,
            next_pid: AtomicI64::new(0),
            entries: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i64, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch `process` in the background and return its pid.
    pub fn start(&self, request: &StartProgramRequest, process: Process) -> Result<i64> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::Unsupported("process start outside the async runtime".into()))?;

        let op = Operation::new("process");
        let run = match &process {
            Process::Command => {
                let _guard = runtime.enter();
                shell(request)?
            }
            Process::Func(f) => f(request.arguments.clone(), op.clone()),
        };

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed) + 1;
        let state = ProcessState {
            pid,
            name: request.program_path.clone(),
            args: request.arguments.clone(),
            owner: env::var("USER").unwrap_or_else(|_| "root".to_owned()),
            start_time: Utc::now().timestamp(),
            end_time: None,
            exit_code: None,
        };
        let (exited_tx, exited) = watch::channel(None);
        self.lock().insert(
            pid,
            Entry {
                state,
                op: op.clone(),
                exited,
            },
        );
        info!(pid, program = %request.program_path, kind = ?process, "process started");

        let entries = self.entries.clone();
        let expire = self.expire;
        runtime.spawn(async move {
            let result = tokio::select! {
                biased;
                res = run => res,
                err = op.done() => Err(ProcessError::new(KILLED_EXIT_CODE, err.to_string())),
            };
            let exit_code = match &result {
                Ok(()) => 0,
                Err(err) => err.exit_code,
            };

            let final_state = {
                let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
                entries.get_mut(&pid).map(|entry| {
                    entry.state.exit_code = Some(exit_code);
                    entry.state.end_time = Some(Utc::now().timestamp());
                    entry.state.clone()
                })
            };
            info!(pid, exit_code, "process exited");
            exited_tx.send_replace(final_state);

            tokio::time::sleep(expire).await;
            entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&pid);
            debug!(pid, "process entry expired");
        });

        Ok(pid)
    }

    /// Cancel `pid`. False if the pid is unknown.
    pub fn kill(&self, pid: i64) -> bool {
        match self.lock().get(&pid) {
            Some(entry) => {
                entry.op.cancel();
                info!(pid, "process killed");
                true
            }
            None => false,
        }
    }

    pub fn state(&self, pid: i64) -> Option<ProcessState> {
        self.lock().get(&pid).map(|entry| entry.state.clone())
    }

    /// Resolves with the final state once `pid` exits.
    pub async fn wait(&self, pid: i64) -> Option<ProcessState> {
        let mut exited = self.lock().get(&pid)?.exited.clone();
        let state = exited.wait_for(Option::is_some).await.ok()?;
        state.clone()
    }

    /// XML listing of `pids`, or of every process when `pids` is empty.
    pub fn list(&self, pids: &[i64]) -> String {
        let entries = self.lock();
        entries
            .values()
            .filter(|entry| pids.is_empty() || pids.contains(&entry.state.pid))
            .map(|entry| entry.state.to_xml())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Shell processes
// ---------------------------------------------------------------------------

/// Resolve `program` the way a shell would: as a path if it has a slash,
/// otherwise through `PATH`.
fn look_path(program: &str) -> Result<PathBuf> {
    if program.is_empty() {
        return Err(Error::InvalidArgument("empty program path".into()));
    }
    if program.contains('/') {
        let path = Path::new(program);
        return match path.metadata() {
            Ok(meta) if meta.is_file() => Ok(path.to_path_buf()),
            Ok(_) => Err(Error::InvalidArgument(format!("{program} is not a file"))),
            Err(e) => Err(Error::io(format!("program {program}"), e)),
        };
    }
    let search = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| Error::NotFound(format!("program {program}")))
}

/// Backslash-escape quotes, redirection and separator characters.
fn shell_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '"' | '\'' | '\\' | '<' | '>' | '|' | '&' | ';' | '$' | '`' | ' ') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Arguments are shell text and pass through unchanged.
fn shell_command(program: &Path, arguments: &str) -> String {
    let program = shell_escape(&program.to_string_lossy());
    if arguments.is_empty() {
        program
    } else {
        format!("{program} {arguments}")
    }
}

fn shell(request: &StartProgramRequest) -> Result<BoxFuture<'static, Result<(), ProcessError>>> {
    let program = look_path(&request.program_path)?;

    let mut cmd = tokio::process::Command::new(SHELL);
    cmd.arg("-c")
        .arg(shell_command(&program, &request.arguments))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    if !request.working_dir.is_empty() {
        cmd.current_dir(&request.working_dir);
    }
    for var in &request.env_vars {
        if let Some((key, value)) = var.split_once('=') {
            cmd.env(key, value);
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::io(format!("start {}", program.display()), e))?;

    Ok(async move {
        let status = child
            .wait()
            .await
            .map_err(|e| ProcessError::new(KILLED_EXIT_CODE, e.to_string()))?;
        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(ProcessError::new(code, format!("exit status {code}"))),
            None => Err(ProcessError::new(KILLED_EXIT_CODE, "terminated by signal")),
        }
    }
    .boxed())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
