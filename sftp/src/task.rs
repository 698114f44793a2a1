//! Cooperative tasks.
//!
//! A task is a state machine driven by the connection's event loop. Each resumption (start, an
//! answer to one of its requests, a write-ready notification or a signal from another task) runs
//! synchronously and returns a list of [`Instruction`]s; an empty list means "stay suspended".
//! Exactly one task runs at a time, so nothing here needs locking.
//!
//! Tasks coordinate through [`Signal`]s, either sent to a known task directly or to a collector
//! looked up by [`CollectorKey`] (created on first use). See [`crate::collector`].

use crate::answer::Answer;
use crate::config::SessionConfig;
use crate::connection::{RequestTable, Stats};
use crate::error::Error;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub(crate) u64);

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Messages exchanged between tasks and collectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Signal {
    // subscriber -> directory lock
    /// Subscribe; the lock answers once it knows what the subscriber should do.
    WaitingFor,
    /// The tester saw the directory exist.
    Found,
    /// The tester (or a child lock) saw the directory missing.
    Missing,
    /// The tester could not decide; pass the test on.
    Abandon,
    // directory lock -> subscriber
    /// Nobody knows yet whether the directory exists: try your operation and report back.
    TryAndTell,
    /// The directory existed before.
    Ready,
    /// The directory was just created, so anything below it is missing too.
    CreateNew,
    /// The directory could not be created.
    Unavailable,
    // semaphore
    Lock,
    Release,
    Unlock,
}

/// Identity of a collector. At most one collector exists per key for the lifetime of a
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CollectorKey {
    /// Directory lock for a remote directory path.
    Dirlock(String),
    /// Counting semaphore for a named resource, see [`SessionConfig::semaphore_capacity`].
    Semaphore(String),
}

impl std::fmt::Display for CollectorKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CollectorKey::Dirlock(path) => write!(f, "dirlock({path:?})"),
            CollectorKey::Semaphore(name) => write!(f, "semaphore({name:?})"),
        }
    }
}

pub enum Instruction {
    /// Queue a request; the answer is delivered through [`Task::on_answer`].
    Send(Request),
    /// Ask for one [`Task::on_write_ready`] call once nothing else is waiting to be sent.
    WantWrite,
    /// Deliver a signal to another task right away.
    Signal { to: TaskId, signal: Signal },
    /// Deliver a signal to the collector for `key`, creating and starting it first if needed.
    Collect { key: CollectorKey, signal: Signal },
    /// Start another task.
    Start(Box<dyn Task>),
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Send(request) => write!(f, "Send({request})"),
            Instruction::WantWrite => write!(f, "WantWrite"),
            Instruction::Signal { to, signal } => write!(f, "Signal({signal} -> {to})"),
            Instruction::Collect { key, signal } => write!(f, "Collect({signal} -> {key})"),
            Instruction::Start(task) => write!(f, "Start({task})"),
        }
    }
}

/// An answer together with the request it answers.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: u32,
    pub request: Request,
    pub answer: Answer,
}

pub type Instructions = Result<Vec<Instruction>, Error>;

/// A resumable unit of work.
///
/// Handlers the task does not expect to be called report an internal error, which aborts the
/// connection.
pub trait Task: std::fmt::Display {
    fn start(&mut self, cx: &mut Context<'_>) -> Instructions;

    fn on_answer(&mut self, cx: &mut Context<'_>, reply: Reply) -> Instructions {
        let _ = cx;
        Err(Error::unexpected(reply.answer, reply.request))
    }

    fn on_write_ready(&mut self, cx: &mut Context<'_>) -> Instructions {
        let _ = cx;
        Err(Error::internal(format!("{self} did not ask for write readiness")))
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, from: TaskId, signal: Signal) -> Instructions {
        let _ = cx;
        Err(Error::internal(format!(
            "{self} got unexpected signal {signal} from {from}"
        )))
    }

    /// A finished task is dropped; requests still attributed to it are released.
    fn is_finished(&self) -> bool;
}

/// What a task may touch while it runs.
pub struct Context<'a> {
    pub(crate) me: TaskId,
    pub(crate) requests: &'a mut RequestTable,
    pub(crate) stats: &'a mut Stats,
    pub(crate) config: &'a SessionConfig,
}

impl Context<'_> {
    pub fn me(&self) -> TaskId {
        self.me
    }

    /// Frees request `id` for reuse. Releasing is always the owning task's job.
    pub fn release(&mut self, id: u32) {
        self.requests.release(id);
    }

    /// Records a protocol-level failure: logged and counted, the run goes on.
    pub fn record_failure(&mut self, message: impl std::fmt::Display) {
        tracing::error!("{message}");
        self.stats.failures += 1;
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        self.config
    }
}
