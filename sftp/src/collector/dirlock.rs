//! Directory lock.
//!
//! Serializes discovery and creation of one remote directory among any number of tasks that
//! want to put something into it. The first subscriber is asked to simply try its operation and
//! report whether the directory turned out to exist (`Found`) or not (`Missing`); everybody else
//! waits. On `Missing` the lock issues a single MKDIR, after making sure (through the lock of the
//! parent directory, recursively) that the parent exists. Once resolved, the lock answers every
//! past and future subscriber with `Ready` (directory existed) or `CreateNew` (it was created
//! here, so everything below it is known to be missing).
//!
//! A lock may in turn be the tester for its parent's lock (`tell_parent`). When its own
//! directory is missing in that situation it STATs the parent first and reports the result
//! upwards, which keeps creation strictly root to leaf and to one MKDIR per directory. The same
//! STAT answers the parent when the lock runs out of subscribers able to test its own directory.
//!
//! ```text
//! awaiting-parent --TryAndTell/Ready---------------> idle
//! awaiting-parent --CreateNew----------------------> creating
//! idle            --WaitingFor---------------------> testing
//! testing         --Found--------------------------> exists
//! testing         --Abandon, nobody left, tell parent--> checking-parent
//! checking-parent --STAT ok (tell parent Found)----> idle
//! checking-parent --STAT NO_SUCH_FILE (tell parent Missing)--> awaiting-parent
//! testing         --Missing, parent known----------> creating
//! testing         --Missing, parent unknown--------> probing-parent
//! probing-parent  --STAT ok (tell parent Found)----> creating
//! probing-parent  --STAT NO_SUCH_FILE (tell parent Missing)--> awaiting-parent
//! creating        --OK / FILE_ALREADY_EXISTS-------> exists
//! creating, probing-parent, checking-parent --any other status--> failed
//! ```

use std::collections::VecDeque;

use crate::answer::Answer;
use crate::attrs::FileAttributes;
use crate::error::Error;
use crate::request::Request;
use crate::status::StatusCode;
use crate::task::{CollectorKey, Context, Instruction, Instructions, Reply, Signal, Task, TaskId};

/// Parent of a remote path, `None` for top-level names and the root.
///
/// Follows the usual `dirname` rules: trailing slashes of the head are dropped unless the head
/// consists of slashes only.
pub fn parent_dir(path: &str) -> Option<&str> {
    let split = path.rfind('/')?;
    let head = &path[..=split];
    let trimmed = head.trim_end_matches('/');
    let parent = if trimmed.is_empty() { head } else { trimmed };
    (parent != path).then_some(parent)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Waiting for the parent's lock to tell whether the parent exists.
    AwaitingParent,
    /// Parent is fine, nobody is testing this directory yet.
    Idle,
    /// The first subscriber is finding out whether the directory exists.
    Testing,
    /// Directory is missing, STAT in flight to learn whether the parent exists.
    ProbingParent,
    /// Nobody can test this directory, STAT in flight to answer the parent's lock instead.
    CheckingParent,
    /// MKDIR in flight.
    Creating,
    Exists,
    Failed,
}

pub struct Dirlock {
    path: String,
    parent: Option<String>,
    mode: Mode,
    /// Our parent's lock asked us to report whether its directory exists.
    tell_parent: bool,
    /// The directory was created by this lock.
    fresh: bool,
    queue: VecDeque<TaskId>,
}

impl Dirlock {
    pub fn new(path: impl Into<String>) -> Self {
        let path = path.into();
        let parent = parent_dir(&path).map(str::to_string);
        Self {
            path,
            parent,
            mode: Mode::AwaitingParent,
            tell_parent: false,
            fresh: false,
            queue: VecDeque::new(),
        }
    }

    fn parent_key(&self) -> Result<CollectorKey, Error> {
        match &self.parent {
            Some(parent) => Ok(CollectorKey::Dirlock(parent.clone())),
            None => Err(Error::internal(format!(
                "{self} has no parent to report to"
            ))),
        }
    }

    fn resolution(&self) -> Signal {
        match (self.mode, self.fresh) {
            (Mode::Failed, _) => Signal::Unavailable,
            (_, true) => Signal::CreateNew,
            (_, false) => Signal::Ready,
        }
    }

    fn create(&mut self) -> Instructions {
        tracing::debug!("{self}: creating");
        self.mode = Mode::Creating;
        Ok(vec![Instruction::Send(Request::Mkdir {
            path: self.path.clone(),
            attrs: FileAttributes::default(),
        })])
    }

    /// Our directory is missing and nobody knows about the parent yet: find out before creating
    /// anything, so MKDIR is only ever issued below an existing directory.
    fn probe_parent(&mut self) -> Instructions {
        let parent = match &self.parent {
            Some(parent) => parent.clone(),
            None => return self.create(),
        };
        tracing::debug!("{self}: checking parent");
        self.mode = Mode::ProbingParent;
        Ok(vec![Instruction::Send(Request::Stat { path: parent })])
    }

    /// Reaches the terminal state and answers everybody who waited, in subscription order.
    fn resolve(&mut self, cx: &mut Context<'_>, fresh: bool) -> Instructions {
        self.mode = Mode::Exists;
        self.fresh = fresh;
        if fresh {
            cx.stats_mut().directories_created += 1;
        }
        tracing::debug!("{self}: exists (fresh: {fresh}), waking {}", self.queue.len());
        let mut instructions = Vec::new();
        if self.tell_parent {
            self.tell_parent = false;
            instructions.push(Instruction::Collect {
                key: self.parent_key()?,
                signal: Signal::Found,
            });
        }
        let signal = self.resolution();
        instructions.extend(
            self.queue
                .drain(..)
                .map(|to| Instruction::Signal { to, signal }),
        );
        Ok(instructions)
    }

    fn fail(&mut self) -> Instructions {
        self.mode = Mode::Failed;
        let mut instructions = Vec::new();
        if self.tell_parent {
            // we were testing the parent on its behalf, let somebody else try
            self.tell_parent = false;
            instructions.push(Instruction::Collect {
                key: self.parent_key()?,
                signal: Signal::Abandon,
            });
        }
        instructions.extend(self.queue.drain(..).map(|to| Instruction::Signal {
            to,
            signal: Signal::Unavailable,
        }));
        Ok(instructions)
    }

    /// The parent's lock waits for our answer but the last tester gave up: STAT the parent
    /// directly so its other subscribers are not held up.
    fn check_parent(&mut self) -> Instructions {
        let parent = match &self.parent {
            Some(parent) => parent.clone(),
            None => return Err(Error::internal(format!("{self} has no parent to check"))),
        };
        tracing::debug!("{self}: no tester left, checking parent on its behalf");
        self.mode = Mode::CheckingParent;
        Ok(vec![Instruction::Send(Request::Stat { path: parent })])
    }

    /// Hands the existence test to the oldest waiter, if any.
    fn next_tester(&mut self) -> Instructions {
        match self.queue.pop_front() {
            Some(to) => {
                self.mode = Mode::Testing;
                Ok(vec![Instruction::Signal {
                    to,
                    signal: Signal::TryAndTell,
                }])
            }
            None => {
                self.mode = Mode::Idle;
                Ok(vec![])
            }
        }
    }

    fn on_parent_signal(&mut self, signal: Signal) -> Instructions {
        if self.mode != Mode::AwaitingParent {
            return Err(Error::internal(format!(
                "{self} got {signal} from its parent while not waiting for it"
            )));
        }
        match signal {
            Signal::CreateNew => {
                self.tell_parent = false;
                self.fresh = true;
                self.create()
            }
            Signal::TryAndTell | Signal::Ready => {
                self.tell_parent = signal == Signal::TryAndTell;
                self.next_tester()
            }
            Signal::Unavailable => {
                tracing::warn!("{self}: parent directory unavailable");
                self.fail()
            }
            _ => Err(Error::internal(format!(
                "{self} got {signal} where a parent signal was expected"
            ))),
        }
    }
}

impl std::fmt::Display for Dirlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dirlock({:?})", self.path)
    }
}

impl Task for Dirlock {
    fn start(&mut self, _cx: &mut Context<'_>) -> Instructions {
        match &self.parent {
            Some(parent) => {
                self.mode = Mode::AwaitingParent;
                Ok(vec![Instruction::Collect {
                    key: CollectorKey::Dirlock(parent.clone()),
                    signal: Signal::WaitingFor,
                }])
            }
            None => {
                self.mode = Mode::Idle;
                self.tell_parent = false;
                self.fresh = false;
                Ok(vec![])
            }
        }
    }

    fn on_answer(&mut self, cx: &mut Context<'_>, reply: Reply) -> Instructions {
        cx.release(reply.id);
        match (self.mode, &reply.request, &reply.answer) {
            (Mode::Creating, Request::Mkdir { .. }, Answer::Status(status)) => match status.code {
                StatusCode::Ok => self.resolve(cx, true),
                // created behind our back, e.g. by a concurrent run
                StatusCode::FileAlreadyExists => self.resolve(cx, false),
                _ => {
                    cx.record_failure(format!(
                        "cannot create directory {:?}: {status}",
                        self.path
                    ));
                    self.fail()
                }
            },
            (
                mode @ (Mode::ProbingParent | Mode::CheckingParent),
                Request::Stat { .. },
                Answer::Attrs(_),
            ) => {
                tracing::debug!("{self}: parent exists");
                self.tell_parent = false;
                let mut instructions = vec![Instruction::Collect {
                    key: self.parent_key()?,
                    signal: Signal::Found,
                }];
                if mode == Mode::ProbingParent {
                    instructions.extend(self.create()?);
                } else {
                    instructions.extend(self.next_tester()?);
                }
                Ok(instructions)
            }
            (
                Mode::ProbingParent | Mode::CheckingParent,
                Request::Stat { .. },
                Answer::Status(status),
            ) if status.code == StatusCode::NoSuchFile =>
            {
                tracing::debug!("{self}: parent is missing too");
                self.tell_parent = false;
                self.mode = Mode::AwaitingParent;
                Ok(vec![Instruction::Collect {
                    key: self.parent_key()?,
                    signal: Signal::Missing,
                }])
            }
            (
                Mode::ProbingParent | Mode::CheckingParent,
                Request::Stat { path },
                Answer::Status(status),
            ) => {
                cx.record_failure(format!("cannot stat directory {path:?}: {status}"));
                self.fail()
            }
            _ => Err(Error::unexpected(&reply.answer, &reply.request)),
        }
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, from: TaskId, signal: Signal) -> Instructions {
        tracing::debug!("{self}: {signal} from {from} while {:?}", self.mode);
        match signal {
            Signal::WaitingFor => match self.mode {
                Mode::Exists | Mode::Failed => Ok(vec![Instruction::Signal {
                    to: from,
                    signal: self.resolution(),
                }]),
                Mode::Idle => {
                    self.mode = Mode::Testing;
                    Ok(vec![Instruction::Signal {
                        to: from,
                        signal: Signal::TryAndTell,
                    }])
                }
                Mode::AwaitingParent
                | Mode::Testing
                | Mode::ProbingParent
                | Mode::CheckingParent
                | Mode::Creating => {
                    self.queue.push_back(from);
                    Ok(vec![])
                }
            },
            Signal::Found => match self.mode {
                Mode::Testing => self.resolve(cx, false),
                _ => Err(Error::internal(format!(
                    "{self} got found from {from} while not testing"
                ))),
            },
            Signal::Missing => match self.mode {
                Mode::Testing | Mode::Idle => {
                    self.queue.push_back(from);
                    if self.tell_parent {
                        self.probe_parent()
                    } else {
                        self.create()
                    }
                }
                Mode::AwaitingParent
                | Mode::ProbingParent
                | Mode::CheckingParent
                | Mode::Creating => {
                    self.queue.push_back(from);
                    Ok(vec![])
                }
                Mode::Exists | Mode::Failed => Ok(vec![Instruction::Signal {
                    to: from,
                    signal: self.resolution(),
                }]),
            },
            Signal::Abandon => match self.mode {
                Mode::Testing if self.queue.is_empty() && self.tell_parent => self.check_parent(),
                Mode::Testing => self.next_tester(),
                _ => Ok(vec![]),
            },
            Signal::TryAndTell | Signal::Ready | Signal::CreateNew | Signal::Unavailable => {
                self.on_parent_signal(signal)
            }
            Signal::Lock | Signal::Release | Signal::Unlock => Err(Error::internal(format!(
                "{self} got semaphore signal {signal} from {from}"
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::connection::Core;
    use crate::flags::OpenFlags;
    use crate::status::Status;
    use crate::testing::{Probe, ProbeEvent, pump};
    use std::collections::HashSet;

    /// Minimal stand-in for an upload: open the file, using the directory lock the same way.
    fn opener(path: &'static str) -> Probe {
        let dir = parent_dir(path).map(str::to_string);
        let mut tester = false;
        let key = move || CollectorKey::Dirlock(dir.clone().unwrap());
        let open = move || {
            Instruction::Send(Request::Open {
                path: path.to_string(),
                flags: OpenFlags::WRITE | OpenFlags::CREAT,
                attrs: FileAttributes::default(),
            })
        };
        Probe::new(path, move |cx, event| match event {
            ProbeEvent::Start => (
                vec![Instruction::Collect {
                    key: key(),
                    signal: Signal::WaitingFor,
                }],
                false,
            ),
            ProbeEvent::Signal(_, Signal::TryAndTell) => {
                tester = true;
                (vec![open()], false)
            }
            ProbeEvent::Signal(_, Signal::Ready | Signal::CreateNew) => (vec![open()], false),
            ProbeEvent::Answer(reply) => {
                cx.release(reply.id);
                match reply.answer {
                    Answer::Handle(_) if tester => (
                        vec![Instruction::Collect {
                            key: key(),
                            signal: Signal::Found,
                        }],
                        true,
                    ),
                    Answer::Handle(_) => (vec![], true),
                    Answer::Status(status)
                        if tester && status.code == StatusCode::NoSuchFile =>
                    {
                        tester = false;
                        (
                            vec![Instruction::Collect {
                                key: key(),
                                signal: Signal::Missing,
                            }],
                            false,
                        )
                    }
                    // nothing learned about the directory, let the next subscriber test it
                    Answer::Status(_) if tester => (
                        vec![Instruction::Collect {
                            key: key(),
                            signal: Signal::Abandon,
                        }],
                        true,
                    ),
                    Answer::Status(_) => (vec![], true),
                    other => panic!("{path}: unexpected {other}"),
                }
            }
            other => panic!("{path}: unexpected {other:?}"),
        })
    }

    /// Server side: a set of existing directories; files can be created in any of them.
    fn server(dirs: &mut HashSet<String>, request: &Request) -> Answer {
        let parent_exists = |dirs: &HashSet<String>, path: &str| match parent_dir(path) {
            Some(parent) => dirs.contains(parent),
            None => true,
        };
        let status = |code| Answer::Status(Status::new(code, ""));
        match request {
            Request::Open { path, .. } if parent_exists(dirs, path) => {
                Answer::Handle(bytes::Bytes::from_static(b"h"))
            }
            Request::Open { .. } => status(StatusCode::NoSuchFile),
            Request::Mkdir { path, .. } if dirs.contains(path) => {
                status(StatusCode::FileAlreadyExists)
            }
            Request::Mkdir { path, .. } if parent_exists(dirs, path) => {
                dirs.insert(path.clone());
                status(StatusCode::Ok)
            }
            Request::Mkdir { .. } => status(StatusCode::NoSuchFile),
            Request::Stat { path } if dirs.contains(path) => {
                Answer::Attrs(FileAttributes::default())
            }
            Request::Stat { .. } => status(StatusCode::NoSuchFile),
            other => panic!("unexpected {other}"),
        }
    }

    fn mkdirs(requests: &[Request]) -> Vec<String> {
        requests
            .iter()
            .filter_map(|request| match request {
                Request::Mkdir { path, .. } => Some(path.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn each_missing_directory_is_created_once_root_first() {
        let mut core = Core::new(SessionConfig::default());
        for path in [
            "dist/stable/main/binary-amd64/Packages",
            "dist/stable/a",
            "dist/stable/main/c",
            "dist/stable/main/binary-amd64/Release",
            "dist/x",
            "dist/stable/b",
        ] {
            core.start(Box::new(opener(path))).unwrap();
        }
        let mut dirs = HashSet::from(["dist".to_string()]);
        let requests = pump(&mut core, |request| server(&mut dirs, request));
        assert_eq!(
            mkdirs(&requests),
            vec![
                "dist/stable",
                "dist/stable/main",
                "dist/stable/main/binary-amd64"
            ]
        );
        assert_eq!(core.stats().directories_created, 3);
        assert!(core.reap_stalled().is_empty());
    }

    #[test]
    fn existing_directory_needs_no_mkdir() {
        let mut core = Core::new(SessionConfig::default());
        for path in ["pool/main/a", "pool/main/b", "pool/c"] {
            core.start(Box::new(opener(path))).unwrap();
        }
        let mut dirs = HashSet::from(["pool".to_string(), "pool/main".to_string()]);
        let requests = pump(&mut core, |request| server(&mut dirs, request));
        assert!(mkdirs(&requests).is_empty());
        assert_eq!(requests.len(), 3);
        assert!(core.reap_stalled().is_empty());
    }

    #[test]
    fn concurrently_created_directory_counts_as_existing() {
        let mut core = Core::new(SessionConfig::default());
        core.start(Box::new(opener("a/b/f"))).unwrap();
        let mut dirs = HashSet::from(["a".to_string()]);
        let requests = pump(&mut core, |request| {
            if let Request::Mkdir { path, .. } = request {
                // somebody else wins the race
                dirs.insert(path.clone());
            }
            server(&mut dirs, request)
        });
        assert_eq!(mkdirs(&requests), vec!["a/b"]);
        assert_eq!(core.stats().directories_created, 0);
        assert!(core.reap_stalled().is_empty());
    }

    #[test]
    fn failed_creation_makes_waiters_unavailable() {
        let mut core = Core::new(SessionConfig::default());
        let outcome = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        for name in ["ro/x/1", "ro/x/2"] {
            let seen = outcome.clone();
            let mut tester = false;
            core.start(Box::new(Probe::new(name, move |cx, event| match event {
                ProbeEvent::Start => (
                    vec![Instruction::Collect {
                        key: CollectorKey::Dirlock("ro/x".to_string()),
                        signal: Signal::WaitingFor,
                    }],
                    false,
                ),
                ProbeEvent::Signal(_, Signal::TryAndTell) => {
                    tester = true;
                    (
                        vec![Instruction::Send(Request::Stat {
                            path: name.to_string(),
                        })],
                        false,
                    )
                }
                ProbeEvent::Answer(reply) => {
                    cx.release(reply.id);
                    (
                        vec![Instruction::Collect {
                            key: CollectorKey::Dirlock("ro/x".to_string()),
                            signal: Signal::Missing,
                        }],
                        false,
                    )
                }
                ProbeEvent::Signal(_, signal) => {
                    seen.borrow_mut().push(format!("{name} {signal} tester={tester}"));
                    (vec![], true)
                }
                other => panic!("unexpected {other:?}"),
            })))
            .unwrap();
        }
        let requests = pump(&mut core, |request| match request {
            Request::Stat { path } if path == "ro" => Answer::Attrs(FileAttributes::default()),
            Request::Stat { .. } => Answer::Status(Status::new(StatusCode::NoSuchFile, "")),
            Request::Mkdir { .. } => {
                Answer::Status(Status::new(StatusCode::PermissionDenied, "read-only"))
            }
            other => panic!("unexpected {other}"),
        });
        assert_eq!(mkdirs(&requests), vec!["ro/x"]);
        assert_eq!(core.stats().failures, 1);
        assert_eq!(
            *outcome.borrow(),
            vec!["ro/x/2 unavailable tester=false", "ro/x/1 unavailable tester=true"]
        );
    }

    fn opens(requests: &[Request]) -> Vec<&str> {
        requests
            .iter()
            .filter_map(|request| match request {
                Request::Open { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn abandoned_test_of_a_subdirectory_still_answers_the_parent() {
        let mut core = Core::new(SessionConfig::default());
        for path in ["a/b/f", "a/g"] {
            core.start(Box::new(opener(path))).unwrap();
        }
        let mut dirs = HashSet::from(["a".to_string(), "a/b".to_string()]);
        let requests = pump(&mut core, |request| match request {
            Request::Open { path, .. } if path == "a/b/f" => {
                Answer::Status(Status::new(StatusCode::PermissionDenied, ""))
            }
            _ => server(&mut dirs, request),
        });
        // "a/b" was testing "a" through "a/b/f", which learned nothing, so it STATs "a" itself
        assert_eq!(opens(&requests), vec!["a/b/f", "a/g"]);
        assert!(requests.iter().any(|request| matches!(
            request,
            Request::Stat { path } if path == "a"
        )));
        assert!(mkdirs(&requests).is_empty());
        assert!(core.reap_stalled().is_empty());
    }

    #[test]
    fn abandoned_test_passes_to_the_next_waiter() {
        let mut core = Core::new(SessionConfig::default());
        for path in ["a/b/f", "a/b/g", "a/h"] {
            core.start(Box::new(opener(path))).unwrap();
        }
        let mut dirs = HashSet::from(["a".to_string(), "a/b".to_string()]);
        let requests = pump(&mut core, |request| match request {
            Request::Open { path, .. } if path == "a/b/f" => {
                Answer::Status(Status::new(StatusCode::PermissionDenied, ""))
            }
            _ => server(&mut dirs, request),
        });
        assert_eq!(opens(&requests), vec!["a/b/f", "a/b/g", "a/h"]);
        // "a/b/g" did the test, no STAT needed
        assert!(!requests
            .iter()
            .any(|request| matches!(request, Request::Stat { .. })));
        assert!(core.reap_stalled().is_empty());
    }

    #[test]
    fn parent_follows_dirname_rules() {
        assert_eq!(parent_dir("dist/stable"), Some("dist"));
        assert_eq!(parent_dir("dist/stable/Packages"), Some("dist/stable"));
        assert_eq!(parent_dir("dist"), None);
        assert_eq!(parent_dir(""), None);
        assert_eq!(parent_dir("/srv"), Some("/"));
        assert_eq!(parent_dir("/"), None);
        assert_eq!(parent_dir("a//b"), Some("a"));
    }
}
