use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use uuid::Uuid;

use crate::protocol::{self, ReplCommand, ReplResponse};
use crate::terminate;
use crate::types::{ReplConfig, ReplError, ReplOutput, Snippet};

/// Lifecycle of a [`Repl`]. `Killed` and `Closed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplState {
    Created,
    Starting,
    Running,
    Killed,
    Closed,
}

impl ReplState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ReplState::Killed | ReplState::Closed)
    }
}

/// Pipes and child handle, present between a successful spawn and teardown.
struct ReplIo {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    /// Environment produced by the header, chained onto every command.
    header_env: Option<u64>,
    primed: bool,
}

/// Kills the REPL if an exchange is dropped before it completes, so an
/// unread response never reaches the next caller.
struct InFlight<'a> {
    repl: &'a Repl,
    done: bool,
}

impl<'a> InFlight<'a> {
    fn new(repl: &'a Repl) -> Self {
        Self { repl, done: false }
    }

    fn finish(mut self) {
        self.done = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.done {
            tracing::warn!(repl = %self.repl.id, "REPL exchange cancelled, killing process");
            self.repl.abandon();
        }
    }
}

/// A single Lean REPL process.
///
/// Each `Repl` owns one child process (launched in its own process group so
/// `lake` and the REPL it starts die together) and talks to it with
/// blank-line-delimited JSON over stdin/stdout. It is shared as `Arc<Repl>`
/// between the pool and the caller that checked it out; all methods take
/// `&self`.
pub struct Repl {
    id: Uuid,
    header: String,
    config: Arc<ReplConfig>,
    created_at: Instant,
    state: Mutex<ReplState>,
    killed: AtomicBool,
    /// Set once the child is known to have exited, so its pid is never
    /// signalled again.
    exited: AtomicBool,
    /// 0 until spawned.
    pid: AtomicU32,
    uses: AtomicU64,
    io: tokio::sync::Mutex<Option<ReplIo>>,
}

impl std::fmt::Debug for Repl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repl")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("state", &self.state())
            .field("uses", &self.uses())
            .finish()
    }
}

impl Repl {
    /// Create a REPL that will be primed with `header`. No process is started.
    pub fn new(header: impl Into<String>, config: Arc<ReplConfig>) -> Self {
        Self {
            id: Uuid::new_v4(),
            header: header.into(),
            config,
            created_at: Instant::now(),
            state: Mutex::new(ReplState::Created),
            killed: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            pid: AtomicU32::new(0),
            uses: AtomicU64::new(0),
            io: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The header this process is (or will be) primed with.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Completed interactions so far.
    pub fn uses(&self) -> u64 {
        self.uses.load(Ordering::Acquire)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> ReplState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// True while the child exists, has not exited, and was not killed.
    ///
    /// Never blocks: if an exchange currently holds the child, the process is
    /// considered running.
    pub fn is_running(&self) -> bool {
        if self.is_killed() || self.state() != ReplState::Running {
            return false;
        }
        match self.io.try_lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(io) => match io.child.try_wait() {
                    Ok(None) => true,
                    _ => {
                        self.exited.store(true, Ordering::Release);
                        false
                    }
                },
                None => false,
            },
            Err(_) => true,
        }
    }

    /// Move to `next` unless the current state is terminal.
    fn transition(&self, next: ReplState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Launch the REPL process.
    ///
    /// The child gets its own process group and, when configured, an
    /// address-space limit of `max_repl_mem_mb`.
    pub async fn spawn(&self) -> Result<(), ReplError> {
        let mut guard = self.io.lock().await;
        match self.state() {
            ReplState::Created => {}
            state if state.is_terminal() => return Err(ReplError::DeadProcess),
            _ => return Err(ReplError::Protocol("REPL already spawned".into())),
        }
        self.transition(ReplState::Starting);

        let (child, stdin, stdout) = match self.spawn_process() {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!(
                    repl = %self.id,
                    command = %self.config.command.display(),
                    error = %e,
                    "Failed to spawn REPL"
                );
                self.killed.store(true, Ordering::Release);
                self.transition(ReplState::Killed);
                return Err(ReplError::Spawn(e));
            }
        };

        if let Some(pid) = child.id() {
            self.pid.store(pid, Ordering::Release);
        }
        *guard = Some(ReplIo {
            child,
            stdin,
            stdout,
            header_env: None,
            primed: false,
        });
        self.transition(ReplState::Running);

        tracing::debug!(
            repl = %self.id,
            pid = self.pid(),
            working_dir = %self.config.working_dir.display(),
            "Spawned REPL"
        );
        Ok(())
    }

    /// Spawn the underlying OS process.
    fn spawn_process(
        &self,
    ) -> std::io::Result<(Child, BufWriter<ChildStdin>, BufReader<ChildStdout>)> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .current_dir(&self.config.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if let Some(bytes) = self.config.memory_limit_bytes() {
                // SAFETY: the closure runs between fork and exec and only
                // performs the setrlimit syscall.
                unsafe {
                    cmd.pre_exec(move || {
                        nix::sys::resource::setrlimit(
                            nix::sys::resource::Resource::RLIMIT_AS,
                            bytes,
                            bytes,
                        )
                        .map_err(std::io::Error::from)
                    });
                }
            }
        }

        let mut child = cmd.spawn()?;

        let stdin = child
            .stdin
            .take()
            .map(BufWriter::new)
            .ok_or_else(|| std::io::Error::other("Failed to capture stdin"))?;
        let stdout = child
            .stdout
            .take()
            .map(BufReader::new)
            .ok_or_else(|| std::io::Error::other("Failed to capture stdout"))?;

        Ok((child, stdin, stdout))
    }

    /// Send the header and remember the environment it produces.
    ///
    /// Must complete before [`interact`](Self::interact). An empty header
    /// primes trivially. Any failure kills the process.
    pub async fn prime(&self, timeout: Duration) -> Result<(), ReplError> {
        if self.is_killed() {
            return Err(ReplError::DeadProcess);
        }
        let mut guard = self.io.lock().await;
        if self.is_killed() || self.state().is_terminal() {
            return Err(ReplError::DeadProcess);
        }
        let Some(io) = guard.as_mut() else {
            return Err(ReplError::Prime("REPL has not been spawned".into()));
        };

        if self.header.trim().is_empty() {
            io.primed = true;
            return Ok(());
        }

        let command = ReplCommand::new(self.header.clone(), None);
        let start = Instant::now();
        let in_flight = InFlight::new(self);
        let result = tokio::time::timeout(timeout, Self::exchange(io, &command)).await;
        in_flight.finish();

        let failure = match result {
            Ok(Ok(response)) => match (response.first_error(), response.env) {
                (None, Some(env)) => {
                    io.header_env = Some(env);
                    io.primed = true;
                    tracing::debug!(
                        repl = %self.id,
                        env,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Primed REPL"
                    );
                    return Ok(());
                }
                (Some(err), _) => ReplError::Prime(err.to_string()),
                (None, None) => ReplError::Prime("header response carried no environment".into()),
            },
            Ok(Err(_)) if self.is_killed() => return Err(ReplError::DeadProcess),
            Ok(Err(e)) => ReplError::Prime(e.to_string()),
            Err(_) => {
                tracing::warn!(
                    repl = %self.id,
                    timeout_secs = timeout.as_secs_f64(),
                    "REPL priming timed out, killing process"
                );
                ReplError::Timeout(timeout)
            }
        };

        self.kill_locked(&mut guard).await;
        Err(failure)
    }

    /// Evaluate one snippet on top of the header environment.
    ///
    /// Fails with [`ReplError::DeadProcess`] without any I/O if the process
    /// was killed. On timeout or a broken exchange the process is killed,
    /// since partial output cannot be trusted.
    pub async fn interact(
        &self,
        snippet: &Snippet,
        timeout: Duration,
    ) -> Result<ReplOutput, ReplError> {
        if self.is_killed() {
            return Err(ReplError::DeadProcess);
        }
        let mut guard = self.io.lock().await;
        if self.is_killed() || self.state().is_terminal() {
            return Err(ReplError::DeadProcess);
        }
        let Some(io) = guard.as_mut() else {
            return Err(ReplError::DeadProcess);
        };
        if !io.primed {
            return Err(ReplError::Protocol(
                "REPL must be primed before interaction".into(),
            ));
        }

        let command = ReplCommand::new(snippet.code.clone(), io.header_env);
        let start = Instant::now();
        let in_flight = InFlight::new(self);
        let result = tokio::time::timeout(timeout, Self::exchange(io, &command)).await;
        in_flight.finish();

        let failure = match result {
            Ok(Ok(response)) => {
                let uses = self.uses.fetch_add(1, Ordering::AcqRel) + 1;
                tracing::debug!(
                    repl = %self.id,
                    snippet = %snippet.id,
                    uses,
                    "REPL interaction complete"
                );
                return Ok(ReplOutput {
                    id: snippet.id.clone(),
                    response,
                    time: start.elapsed(),
                });
            }
            Ok(Err(_)) if self.is_killed() => return Err(ReplError::DeadProcess),
            Ok(Err(e)) => {
                tracing::warn!(
                    repl = %self.id,
                    snippet = %snippet.id,
                    error = %e,
                    "REPL exchange failed, killing process"
                );
                e
            }
            Err(_) => {
                tracing::warn!(
                    repl = %self.id,
                    snippet = %snippet.id,
                    timeout_secs = timeout.as_secs_f64(),
                    "REPL interaction timed out, killing process"
                );
                ReplError::Timeout(timeout)
            }
        };

        self.kill_locked(&mut guard).await;
        Err(failure)
    }

    /// Write one command and read its response frame.
    async fn exchange(io: &mut ReplIo, command: &ReplCommand) -> Result<ReplResponse, ReplError> {
        let json = command
            .to_json()
            .map_err(|e| ReplError::Protocol(format!("Serialization error: {e}")))?;

        protocol::write_frame(&mut io.stdin, &json)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::BrokenPipe => ReplError::ProcessDied,
                _ => ReplError::Io(e),
            })?;

        match protocol::read_frame(&mut io.stdout).await? {
            Some(frame) => ReplResponse::parse(frame.trim()),
            None => Err(ReplError::ProcessDied),
        }
    }

    /// Kill the process group and mark this REPL as killed.
    ///
    /// Idempotent. If another task is mid-exchange, the group is signalled
    /// first so that exchange ends promptly and releases the child.
    pub async fn kill(&self) {
        if self.state() == ReplState::Closed {
            return;
        }
        self.killed.store(true, Ordering::Release);
        self.transition(ReplState::Killed);

        let mut guard = match self.io.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                self.signal_group();
                self.io.lock().await
            }
        };
        self.kill_locked(&mut guard).await;
    }

    /// Mark this REPL killed and SIGKILL its group without waiting for the
    /// I/O lock. The child is reaped by a later [`kill`](Self::kill) or when
    /// the REPL is dropped.
    pub(crate) fn abandon(&self) {
        if self.state() == ReplState::Closed {
            return;
        }
        self.killed.store(true, Ordering::Release);
        self.transition(ReplState::Killed);
        self.signal_group();
    }

    /// Signal the group by pid, unless the child is already reaped and its
    /// pid may belong to someone else.
    fn signal_group(&self) {
        if let Some(pid) = self.pid().filter(|_| !self.exited.load(Ordering::Acquire)) {
            if let Err(e) = terminate::signal_process_group(pid) {
                tracing::warn!(repl = %self.id, pid, error = %e, "Failed to signal REPL group");
            }
        }
    }

    async fn kill_locked(&self, slot: &mut Option<ReplIo>) {
        self.killed.store(true, Ordering::Release);
        self.transition(ReplState::Killed);

        if let Some(mut io) = slot.take() {
            if let Err(e) =
                terminate::kill_process_safely(&mut io.child, true, self.config.kill_timeout()).await
            {
                tracing::error!(repl = %self.id, error = %e, "Failed to kill REPL process");
            }
            self.exited.store(true, Ordering::Release);
            tracing::debug!(repl = %self.id, uses = self.uses(), "REPL killed");
        }
    }

    /// Tear down a REPL that is no longer needed.
    ///
    /// Closes stdin and terminates the process group if it is still alive.
    /// Idempotent, and a no-op after [`kill`](Self::kill).
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        let mut guard = self.io.lock().await;
        if !self.transition(ReplState::Closed) {
            return;
        }

        if let Some(ReplIo {
            mut child, stdin, ..
        }) = guard.take()
        {
            drop(stdin);
            if let Err(e) =
                terminate::kill_process_safely(&mut child, true, self.config.kill_timeout()).await
            {
                tracing::error!(repl = %self.id, error = %e, "Failed to stop REPL process");
            }
            self.exited.store(true, Ordering::Release);
        }
        tracing::debug!(repl = %self.id, "REPL closed");
    }
}
