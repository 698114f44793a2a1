//! Publish state machines.
//!
//! Each item is one [`Task`] on the shared connection. Non-OK answers are recorded as failures
//! and end the item as [`Outcome::Failed`]; "not found" from a REMOVE is expected whenever a
//! previous run already got further, and is not a failure.

use std::io::Read;
use std::path::PathBuf;

use bytes::Bytes;
use sftp::collector::parent_dir;
use sftp::{
    Answer, CollectorKey, Context, Error, FileAttributes, Instruction, Instructions,
    OPEN_FILE_SEMAPHORE, OpenFlags, RenameFlags, Reply, Request, Signal, StatusCode, Task, TaskId,
};

use crate::STAGED_SUFFIX;
use crate::batch::SharedBatch;
use crate::summary::{Completion, Outcome, Tally};

fn permit(signal: Signal) -> Instruction {
    Instruction::Collect {
        key: CollectorKey::Semaphore(OPEN_FILE_SEMAPHORE.to_string()),
        signal,
    }
}

/// Where a finished upload reports to.
pub(crate) enum Landing {
    /// The upload went straight to its final name.
    Direct(Completion),
    /// A temporary upload of a directory batch.
    Staged { batch: SharedBatch, path: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Directory,
    Permit,
    Opening,
    /// Told the directory lock the directory is missing, waiting for it to be created.
    Creation,
    Writing,
    Closing,
    Done,
}

/// Streams one local file to a remote path.
pub(crate) struct Upload {
    source: PathBuf,
    remote: String,
    dir: Option<String>,
    chunk_size: usize,
    landing: Option<Landing>,
    tally: Tally,
    file: Option<std::fs::File>,
    stage: Stage,
    /// The directory lock made us find out whether the directory exists.
    tester: bool,
    retried: bool,
    permit: bool,
    handle: Option<Bytes>,
    offset: u64,
    writes_in_flight: usize,
    closed: bool,
    failed: bool,
}

impl Upload {
    pub(crate) fn new(
        source: PathBuf,
        remote: String,
        chunk_size: usize,
        landing: Landing,
        tally: Tally,
    ) -> Self {
        let dir = parent_dir(&remote).map(str::to_string);
        Self {
            source,
            remote,
            dir,
            chunk_size: chunk_size.max(1),
            landing: Some(landing),
            tally,
            file: None,
            stage: Stage::Directory,
            tester: false,
            retried: false,
            permit: false,
            handle: None,
            offset: 0,
            writes_in_flight: 0,
            closed: false,
            failed: false,
        }
    }

    fn dirlock(&self, signal: Signal) -> Result<Instruction, Error> {
        match &self.dir {
            Some(dir) => Ok(Instruction::Collect {
                key: CollectorKey::Dirlock(dir.clone()),
                signal,
            }),
            None => Err(Error::internal(format!("{self} has no parent directory"))),
        }
    }

    fn lock(&mut self) -> Instruction {
        self.stage = Stage::Permit;
        permit(Signal::Lock)
    }

    fn release_permit(&mut self, instructions: &mut Vec<Instruction>) {
        if self.permit {
            self.permit = false;
            instructions.push(permit(Signal::Release));
        }
    }

    fn open(&mut self) -> Instruction {
        self.stage = Stage::Opening;
        Instruction::Send(Request::Open {
            path: self.remote.clone(),
            flags: OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC,
            attrs: FileAttributes::default(),
        })
    }

    /// Gives up before any handle was obtained.
    fn abort(&mut self, cx: &mut Context<'_>) -> Instructions {
        self.failed = true;
        let mut instructions = Vec::new();
        if self.tester {
            self.tester = false;
            instructions.push(self.dirlock(Signal::Abandon)?);
        }
        self.release_permit(&mut instructions);
        instructions.extend(self.land(cx));
        Ok(instructions)
    }

    fn close(&mut self) -> Result<Vec<Instruction>, Error> {
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| Error::internal(format!("{self} closing without a handle")))?;
        self.stage = Stage::Closing;
        self.file = None;
        let mut instructions = vec![Instruction::Send(Request::Close { handle })];
        self.release_permit(&mut instructions);
        Ok(instructions)
    }

    fn next_chunk(&mut self) -> std::io::Result<Vec<u8>> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        if let Some(file) = self.file.as_mut() {
            file.take(self.chunk_size as u64).read_to_end(&mut chunk)?;
        }
        Ok(chunk)
    }

    fn maybe_land(&mut self, cx: &mut Context<'_>) -> Vec<Instruction> {
        if self.closed && self.writes_in_flight == 0 {
            self.land(cx)
        } else {
            vec![]
        }
    }

    fn land(&mut self, cx: &mut Context<'_>) -> Vec<Instruction> {
        self.stage = Stage::Done;
        if !self.failed {
            self.tally.borrow_mut().bytes_uploaded += self.offset;
        }
        let tasks = match self.landing.take() {
            Some(Landing::Direct(completion)) => {
                completion.finish(if self.failed {
                    Outcome::Failed
                } else {
                    Outcome::Done
                });
                vec![]
            }
            Some(Landing::Staged { batch, path }) => {
                if self.failed {
                    batch.borrow_mut().fail(&path)
                } else {
                    batch.borrow_mut().land(&path)
                }
            }
            None => {
                tracing::warn!("{} landed twice", cx.me());
                vec![]
            }
        };
        tasks.into_iter().map(Instruction::Start).collect()
    }

    fn on_open(&mut self, cx: &mut Context<'_>, answer: Answer) -> Instructions {
        match answer {
            Answer::Handle(handle) => {
                tracing::debug!("{self}: opened");
                self.handle = Some(handle);
                self.stage = Stage::Writing;
                let mut instructions = Vec::new();
                if self.tester {
                    self.tester = false;
                    instructions.push(self.dirlock(Signal::Found)?);
                }
                instructions.push(Instruction::WantWrite);
                Ok(instructions)
            }
            Answer::Status(status)
                if status.code == StatusCode::NoSuchFile && self.tester && !self.retried =>
            {
                tracing::debug!("{self}: directory missing, waiting for it");
                self.tester = false;
                self.retried = true;
                self.stage = Stage::Creation;
                let mut instructions = vec![self.dirlock(Signal::Missing)?];
                self.release_permit(&mut instructions);
                Ok(instructions)
            }
            Answer::Status(status) => {
                cx.record_failure(format!("failed to create {:?}: {status}", self.remote));
                self.abort(cx)
            }
            other => Err(Error::unexpected(other, "OPEN")),
        }
    }
}

impl std::fmt::Display for Upload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "upload({:?})", self.remote)
    }
}

impl Task for Upload {
    fn start(&mut self, cx: &mut Context<'_>) -> Instructions {
        match std::fs::File::open(&self.source) {
            Ok(file) => self.file = Some(file),
            Err(error) => {
                cx.record_failure(format!("cannot open {:?}: {error}", self.source));
                return self.abort(cx);
            }
        }
        if self.dir.is_some() {
            self.stage = Stage::Directory;
            Ok(vec![self.dirlock(Signal::WaitingFor)?])
        } else {
            Ok(vec![self.lock()])
        }
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, from: TaskId, signal: Signal) -> Instructions {
        match (self.stage, signal) {
            (Stage::Directory, Signal::TryAndTell) => {
                self.tester = true;
                Ok(vec![self.lock()])
            }
            (Stage::Directory | Stage::Creation, Signal::Ready | Signal::CreateNew) => {
                Ok(vec![self.lock()])
            }
            (Stage::Directory | Stage::Creation, Signal::Unavailable) => {
                tracing::error!(
                    "cannot upload {:?}: directory {:?} is unavailable",
                    self.remote,
                    self.dir
                );
                self.abort(cx)
            }
            (Stage::Permit, Signal::Unlock) => {
                self.permit = true;
                Ok(vec![self.open()])
            }
            (stage, signal) => Err(Error::internal(format!(
                "{self} got {signal} from {from} while in {stage:?}"
            ))),
        }
    }

    fn on_answer(&mut self, cx: &mut Context<'_>, reply: Reply) -> Instructions {
        cx.release(reply.id);
        match (&reply.request, reply.answer) {
            (Request::Open { .. }, answer) if self.stage == Stage::Opening => {
                self.on_open(cx, answer)
            }
            (Request::Write { offset, .. }, Answer::Status(status)) => {
                self.writes_in_flight -= 1;
                if !status.is_ok() {
                    cx.record_failure(format!(
                        "write to {:?} at {offset} failed: {status}",
                        self.remote
                    ));
                    self.failed = true;
                }
                Ok(self.maybe_land(cx))
            }
            (Request::Close { .. }, Answer::Status(status)) => {
                if !status.is_ok() {
                    cx.record_failure(format!("closing {:?} failed: {status}", self.remote));
                    self.failed = true;
                }
                self.closed = true;
                Ok(self.maybe_land(cx))
            }
            (_, answer) => Err(Error::unexpected(answer, &reply.request)),
        }
    }

    /// Sends the next chunk, keeping at most one of them waiting behind the pipe.
    fn on_write_ready(&mut self, cx: &mut Context<'_>) -> Instructions {
        if self.stage != Stage::Writing {
            return Err(Error::internal(format!(
                "{self} got write readiness while in {:?}",
                self.stage
            )));
        }
        if self.failed {
            return self.close();
        }
        let chunk = match self.next_chunk() {
            Ok(chunk) => chunk,
            Err(error) => {
                cx.record_failure(format!("cannot read {:?}: {error}", self.source));
                self.failed = true;
                return self.close();
            }
        };
        if chunk.is_empty() {
            tracing::debug!("{self}: {} bytes written", self.offset);
            return self.close();
        }
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| Error::internal(format!("{self} writing without a handle")))?;
        let offset = self.offset;
        self.offset += chunk.len() as u64;
        self.writes_in_flight += 1;
        Ok(vec![
            Instruction::Send(Request::Write {
                handle,
                offset,
                data: Bytes::from(chunk),
            }),
            Instruction::WantWrite,
        ])
    }

    fn is_finished(&self) -> bool {
        self.stage == Stage::Done
    }
}

enum Replacement {
    /// Rename `<dest>.new` over the destination.
    Staged,
    /// Create a symlink pointing at the target, taken verbatim.
    Symlink(String),
}

/// Remove-then-rename or remove-then-symlink of one destination.
///
/// The remove has to be observed before the second step is sent, otherwise a server that
/// reorders could remove the fresh file. Both steps are safe to repeat: a missing destination is
/// fine for the remove and the rename source only disappears once the rename succeeded.
pub(crate) struct Finalize {
    remote: String,
    replacement: Replacement,
    completion: Option<Completion>,
}

impl Finalize {
    pub(crate) fn replace(remote: String, completion: Completion) -> Self {
        Self {
            remote,
            replacement: Replacement::Staged,
            completion: Some(completion),
        }
    }

    pub(crate) fn relink(remote: String, target: String, completion: Completion) -> Self {
        Self {
            remote,
            replacement: Replacement::Symlink(target),
            completion: Some(completion),
        }
    }

    fn second_step(&self) -> Request {
        match &self.replacement {
            Replacement::Staged => Request::Rename {
                src: format!("{}{STAGED_SUFFIX}", self.remote),
                dst: self.remote.clone(),
                flags: RenameFlags::OVERWRITE,
            },
            Replacement::Symlink(target) => Request::Symlink {
                link: self.remote.clone(),
                target: target.clone(),
            },
        }
    }

    fn finish(&mut self, outcome: Outcome) {
        if let Some(completion) = self.completion.take() {
            completion.finish(outcome);
        }
    }
}

impl std::fmt::Display for Finalize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.replacement {
            Replacement::Staged => write!(f, "replace({:?})", self.remote),
            Replacement::Symlink(_) => write!(f, "relink({:?})", self.remote),
        }
    }
}

impl Task for Finalize {
    fn start(&mut self, _cx: &mut Context<'_>) -> Instructions {
        Ok(vec![Instruction::Send(Request::Remove {
            path: self.remote.clone(),
        })])
    }

    fn on_answer(&mut self, cx: &mut Context<'_>, reply: Reply) -> Instructions {
        cx.release(reply.id);
        let status = match reply.answer.status() {
            Some(status) => status,
            None => return Err(Error::unexpected(&reply.answer, &reply.request)),
        };
        match &reply.request {
            Request::Remove { .. } => {
                if !matches!(status.code, StatusCode::Ok | StatusCode::NoSuchFile) {
                    // the second step will tell whether this mattered
                    cx.record_failure(format!("{} failed: {status}", reply.request));
                }
                Ok(vec![Instruction::Send(self.second_step())])
            }
            Request::Rename { .. } | Request::Symlink { .. } => {
                if status.is_ok() {
                    self.finish(match self.replacement {
                        Replacement::Staged => Outcome::Done,
                        Replacement::Symlink(_) => Outcome::SymlinkDone,
                    });
                } else {
                    cx.record_failure(format!("{} failed: {status}", reply.request));
                    self.finish(Outcome::Failed);
                }
                Ok(vec![])
            }
            _ => Err(Error::unexpected(&reply.answer, &reply.request)),
        }
    }

    fn is_finished(&self) -> bool {
        self.completion.is_none()
    }
}

/// Removes one destination; already gone counts as done.
pub(crate) struct Delete {
    remote: String,
    completion: Option<Completion>,
}

impl Delete {
    pub(crate) fn new(remote: String, completion: Completion) -> Self {
        Self {
            remote,
            completion: Some(completion),
        }
    }
}

impl std::fmt::Display for Delete {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "delete({:?})", self.remote)
    }
}

impl Task for Delete {
    fn start(&mut self, _cx: &mut Context<'_>) -> Instructions {
        Ok(vec![Instruction::Send(Request::Remove {
            path: self.remote.clone(),
        })])
    }

    fn on_answer(&mut self, cx: &mut Context<'_>, reply: Reply) -> Instructions {
        cx.release(reply.id);
        let outcome = match (&reply.request, &reply.answer) {
            (Request::Remove { .. }, Answer::Status(status)) => match status.code {
                StatusCode::Ok => Outcome::Deleted,
                StatusCode::NoSuchFile => Outcome::AlreadyDeleted,
                _ => {
                    cx.record_failure(format!("{} failed: {status}", reply.request));
                    Outcome::Failed
                }
            },
            _ => return Err(Error::unexpected(&reply.answer, &reply.request)),
        };
        if let Some(completion) = self.completion.take() {
            completion.finish(outcome);
        }
        Ok(vec![])
    }

    fn is_finished(&self) -> bool {
        self.completion.is_none()
    }
}
