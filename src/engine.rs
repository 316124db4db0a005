use crate::config::{
    Admission, DEFAULT_KILL_GRACE, DEFAULT_MAX_CONCURRENT_RUNS, DEFAULT_MAX_OUTPUT_BYTES,
    JsonStyle, Settings, WorkingDir,
};
use crate::error::HubError;
use crate::ledger::Ledger;
use crate::model::{ParamMode, ParameterSet, Run, RunStatus, ScriptDescriptor};
use crate::params::quote_token;
use rand::Rng;
use std::collections::HashMap;
use std::io::{self, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use wait_timeout::ChildExt;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_concurrent_runs: usize,
    pub admission: Admission,
    pub max_output_bytes: usize,
    pub working_dir: WorkingDir,
    pub env: HashMap<String, String>,
    pub json_style: JsonStyle,
    pub kill_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            admission: Admission::Queue { max_wait: None },
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            working_dir: WorkingDir::Inherit,
            env: HashMap::new(),
            json_style: JsonStyle::Flags,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            max_concurrent_runs: settings.max_concurrent_runs,
            admission: settings.admission,
            max_output_bytes: settings.max_output_bytes,
            working_dir: settings.working_dir.clone(),
            env: settings.env.clone(),
            json_style: settings.json_style,
            kill_grace: settings.kill_grace,
        }
    }
}

/// Shared flag used to ask an in-flight run to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation. Has no effect once the run is terminal.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlight {
    pub id: String,
    pub script_name: String,
    pub started_at: OffsetDateTime,
}

/// Launches scripts, enforces limits, and hands finished runs to the ledger.
pub struct Engine {
    options: EngineOptions,
    ledger: Arc<Ledger>,
    slots: Slots,
    in_flight: Mutex<HashMap<String, (InFlight, CancelToken)>>,
}

impl Engine {
    pub fn new(options: EngineOptions, ledger: Arc<Ledger>) -> Self {
        let slots = Slots::new(options.max_concurrent_runs.max(1));
        Self {
            options,
            ledger,
            slots,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Runs `script` to a terminal state and records it.
    ///
    /// A zero `timeout` disables the deadline. The only errors are `Busy`
    /// (nothing was started) and `Unpersisted` (the run finished and is held
    /// by the ledger's pending buffer).
    pub fn execute(
        &self,
        script: &ScriptDescriptor,
        params: &ParameterSet,
        timeout: Duration,
    ) -> Result<Run, HubError> {
        self.execute_with_cancel(script, params, timeout, CancelToken::new())
    }

    pub fn execute_with_cancel(
        &self,
        script: &ScriptDescriptor,
        params: &ParameterSet,
        timeout: Duration,
        cancel: CancelToken,
    ) -> Result<Run, HubError> {
        let _slot = self.slots.acquire(self.options.admission)?;

        let id = new_run_id();
        let started_at = OffsetDateTime::now_utc();
        let wall = Instant::now();
        let _tracked = self.track(&id, &script.name, started_at, cancel.clone());

        let args = params.to_args(self.options.json_style);
        let mut command = self.build_command(script, &args);
        let command_preview = preview(&command);

        tracing::info!(
            run_id = %id,
            script = %script.name,
            command = %command_preview,
            "run started"
        );
        let outcome = self.run_process(&mut command, timeout, &cancel);

        let run = Run {
            id,
            script_name: script.name.clone(),
            script_path: script.path.clone(),
            mode: params.mode(),
            parameters: describe_parameters(params),
            command_preview,
            started_at,
            finished_at: Some(OffsetDateTime::now_utc()),
            duration_ms: duration_millis(wall.elapsed()),
            status: outcome.status,
            exit_code: outcome.exit_code,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            stdout_truncated: outcome.stdout_truncated,
            stderr_truncated: outcome.stderr_truncated,
        };

        tracing::info!(
            run_id = %run.id,
            script = %run.script_name,
            status = %run.status,
            exit_code = ?run.exit_code,
            duration_ms = run.duration_ms,
            "run finished"
        );

        match self.ledger.append(&run) {
            Ok(()) => Ok(run),
            Err(err) => {
                tracing::warn!(run_id = %run.id, error = %err, "run held in pending buffer");
                Err(HubError::Unpersisted {
                    run: Box::new(run),
                    message: err.to_string(),
                })
            }
        }
    }

    /// Cancels an in-flight run. Returns `false` when no such run is running.
    pub fn cancel(&self, id: &str) -> bool {
        let in_flight = lock(&self.in_flight);
        match in_flight.get(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> Vec<InFlight> {
        let mut runs: Vec<InFlight> = lock(&self.in_flight)
            .values()
            .map(|(info, _)| info.clone())
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        runs
    }

    fn track(
        &self,
        id: &str,
        script_name: &str,
        started_at: OffsetDateTime,
        cancel: CancelToken,
    ) -> Tracked<'_> {
        let info = InFlight {
            id: id.to_string(),
            script_name: script_name.to_string(),
            started_at,
        };
        lock(&self.in_flight).insert(id.to_string(), (info, cancel));
        Tracked {
            engine: self,
            id: id.to_string(),
        }
    }

    fn build_command(&self, script: &ScriptDescriptor, args: &[String]) -> Command {
        let mut command = match &script.interpreter {
            Some(interpreter) => {
                let mut cmd = Command::new(interpreter);
                cmd.arg(&script.path);
                cmd
            }
            None => Command::new(&script.path),
        };
        command.args(args);

        match &self.options.working_dir {
            WorkingDir::Inherit => {}
            WorkingDir::ScriptDir => {
                if let Some(parent) = script.path.parent() {
                    command.current_dir(parent);
                }
            }
            WorkingDir::Fixed(dir) => {
                command.current_dir(dir);
            }
        }

        if !self.options.env.is_empty() {
            command.envs(&self.options.env);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        command
    }

    fn run_process(
        &self,
        command: &mut Command,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Outcome {
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                tracing::warn!(error = %err, "script failed to launch");
                return Outcome::launch_failure(command, &err);
            }
        };

        let stdout = Arc::new(Mutex::new(Capture::new(self.options.max_output_bytes)));
        let stderr = Arc::new(Mutex::new(Capture::new(self.options.max_output_bytes)));
        let (done_tx, done_rx) = mpsc::channel();
        let mut readers = 0;

        if let Some(out) = child.stdout.take() {
            spawn_reader(out, Arc::clone(&stdout), done_tx.clone());
            readers += 1;
        }
        if let Some(err) = child.stderr.take() {
            spawn_reader(err, Arc::clone(&stderr), done_tx.clone());
            readers += 1;
        }
        drop(done_tx);

        let ending = self.wait_child(&mut child, timeout, cancel);
        if !drain_readers(&done_rx, readers, self.options.kill_grace) {
            // something in the process group still holds the pipes open
            kill_group(&child);
            drain_readers(&done_rx, readers, POLL_INTERVAL * 4);
        }

        let (stdout, stdout_truncated) = lock(&stdout).snapshot();
        let (mut stderr, stderr_truncated) = lock(&stderr).snapshot();
        if stdout_truncated || stderr_truncated {
            tracing::warn!(stdout_truncated, stderr_truncated, "run output truncated");
        }

        let (status, exit_code) = match ending {
            Ending::Exited(status) => classify_exit(status),
            Ending::TimedOut => {
                tracing::warn!(timeout = ?timeout, "run timed out");
                append_note(
                    &mut stderr,
                    &format!(
                        "run timed out after {}; process terminated",
                        humantime::format_duration(timeout)
                    ),
                );
                (RunStatus::TimedOut, None)
            }
            Ending::Cancelled => {
                tracing::warn!("run cancelled");
                append_note(&mut stderr, "run cancelled; process terminated");
                (RunStatus::Cancelled, None)
            }
            Ending::WaitFailed(message) => {
                append_note(&mut stderr, &format!("wait for script: {message}"));
                (RunStatus::Failed, None)
            }
        };

        Outcome {
            status,
            exit_code,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
        }
    }

    fn wait_child(&self, child: &mut Child, timeout: Duration, cancel: &CancelToken) -> Ending {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);

        loop {
            if cancel.is_cancelled() {
                terminate(child, self.options.kill_grace);
                return Ending::Cancelled;
            }

            let wait_for = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        terminate(child, Duration::ZERO);
                        return Ending::TimedOut;
                    }
                    POLL_INTERVAL.min(deadline - now)
                }
                None => POLL_INTERVAL,
            };

            match child.wait_timeout(wait_for) {
                Ok(Some(status)) => return Ending::Exited(status),
                Ok(None) => continue,
                Err(err) => {
                    terminate(child, Duration::ZERO);
                    return Ending::WaitFailed(err.to_string());
                }
            }
        }
    }
}

struct Tracked<'a> {
    engine: &'a Engine,
    id: String,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        lock(&self.engine.in_flight).remove(&self.id);
    }
}

/// Counting gate bounding the number of live child processes.
struct Slots {
    limit: usize,
    used: Mutex<usize>,
    freed: Condvar,
}

struct SlotGuard<'a> {
    slots: &'a Slots,
}

impl Slots {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            used: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    fn acquire(&self, admission: Admission) -> Result<SlotGuard<'_>, HubError> {
        let mut used = lock(&self.used);

        match admission {
            Admission::Reject => {
                if *used >= self.limit {
                    return Err(HubError::Busy { limit: self.limit });
                }
            }
            Admission::Queue { max_wait: None } => {
                while *used >= self.limit {
                    used = self.freed.wait(used).unwrap_or_else(PoisonError::into_inner);
                }
            }
            Admission::Queue {
                max_wait: Some(max_wait),
            } => {
                let deadline = Instant::now() + max_wait;
                while *used >= self.limit {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HubError::Busy { limit: self.limit });
                    }
                    let (guard, _) = self
                        .freed
                        .wait_timeout(used, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    used = guard;
                }
            }
        }

        *used += 1;
        Ok(SlotGuard { slots: self })
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut used = lock(&self.slots.used);
        *used = used.saturating_sub(1);
        self.slots.freed.notify_one();
    }
}

enum Ending {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(String),
}

struct Outcome {
    status: RunStatus,
    exit_code: Option<i32>,
    stdout: String,
    stderr: String,
    stdout_truncated: bool,
    stderr_truncated: bool,
}

impl Outcome {
    fn launch_failure(command: &Command, err: &io::Error) -> Self {
        let exit_code = match err.kind() {
            io::ErrorKind::NotFound => 127,
            _ => 126,
        };

        Self {
            status: RunStatus::Failed,
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: format!(
                "failed to launch {}: {err}",
                command.get_program().to_string_lossy()
            ),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }
}

/// Bounded byte buffer for one output stream.
#[derive(Debug)]
pub struct Capture {
    buf: Vec<u8>,
    limit: usize,
    dropped: u64,
}

impl Capture {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            dropped: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let keep = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..keep]);
        self.dropped += (chunk.len() - keep) as u64;
    }

    /// Captured text plus whether anything was cut off.
    pub fn snapshot(&self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.buf).to_string();
        if self.dropped == 0 {
            return (text, false);
        }

        text.push_str(&truncation_marker(self.dropped));
        (text, true)
    }
}

pub fn truncation_marker(dropped: u64) -> String {
    format!("\n[output truncated: {dropped} bytes omitted]")
}

fn spawn_reader<R>(mut source: R, sink: Arc<Mutex<Capture>>, done: mpsc::Sender<()>)
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = [0_u8; READ_CHUNK];
        loop {
            let read = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            };
            lock(&sink).push(&buf[..read]);
        }
        let _ = done.send(());
    });
}

fn drain_readers(done: &mpsc::Receiver<()>, readers: usize, wait: Duration) -> bool {
    let deadline = Instant::now() + wait;
    let mut finished = 0;

    while finished < readers {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match done.recv_timeout(remaining) {
            Ok(()) => finished += 1,
            Err(mpsc::RecvTimeoutError::Disconnected) => return true,
            Err(mpsc::RecvTimeoutError::Timeout) => return false,
        }
    }

    true
}

/// Stops the child and, on unix, the rest of its process group.
///
/// With a non-zero `grace` the group first gets SIGTERM and a chance to exit.
fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        if !grace.is_zero() {
            signal_group(child, libc::SIGTERM);
            if let Ok(Some(_)) = child.wait_timeout(grace) {
                kill_group(child);
                return;
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

fn kill_group(child: &Child) {
    #[cfg(unix)]
    signal_group(child, libc::SIGKILL);
    #[cfg(not(unix))]
    let _ = child;
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(child.id()) else {
        return;
    };
    // SAFETY: killpg only sends a signal; the group was created for this child
    // at spawn and an already-empty group just yields ESRCH.
    unsafe {
        libc::killpg(pgid, signal);
    }
}

fn classify_exit(status: ExitStatus) -> (RunStatus, Option<i32>) {
    if status.success() {
        return (RunStatus::Succeeded, Some(0));
    }

    let code = status.code().unwrap_or_else(|| signal_exit_code(status));
    (RunStatus::Failed, Some(code))
}

#[cfg(unix)]
fn signal_exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| 128 + sig).unwrap_or(1)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: ExitStatus) -> i32 {
    1
}

fn append_note(stderr: &mut String, note: &str) {
    if !stderr.is_empty() && !stderr.ends_with('\n') {
        stderr.push('\n');
    }
    stderr.push_str("[scripthub] ");
    stderr.push_str(note);
}

fn preview(command: &Command) -> String {
    let mut parts = vec![quote_token(&command.get_program().to_string_lossy())];
    parts.extend(command.get_args().map(|arg| quote_token(&arg.to_string_lossy())));
    parts.join(" ")
}

/// Human-readable form of the submitted parameters, as stored on the run.
pub fn describe_parameters(params: &ParameterSet) -> String {
    match params.mode() {
        ParamMode::Positional => params.to_positional_input(),
        ParamMode::KeyValue => params.to_key_value_input(),
        ParamMode::Json if params.is_empty() => String::new(),
        ParamMode::Json => params.to_json().to_string(),
    }
}

fn duration_millis(elapsed: Duration) -> i64 {
    i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn new_run_id() -> String {
    let mut random = [0_u8; 8];
    rand::rng().fill(&mut random);
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!("{millis}-{}", hex_encode(&random))
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
