//! In-memory SFTP server for integration tests.
//!
//! The server keeps a tiny file tree (directories, files, symlinks), answers requests over a
//! `tokio::io::duplex` stream and logs every request received and every answer sent, in the
//! order they crossed the wire. Faults can be injected per path, and answers can be held back
//! and sent in reverse order to exercise out-of-order completion.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use publish::{Publisher, Settings};
use sftp::collector::parent_dir;
use sftp::{
    Answer, Connection, FileAttributes, OpenFlags, RenameFlags, Request, SessionConfig, Status,
    StatusCode, Version,
};

pub type TestPublisher = Publisher<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

#[derive(Debug, Clone)]
pub enum Logged {
    Received(Request),
    Answered(Request, Answer),
}

#[derive(Default)]
struct State {
    dirs: BTreeSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    symlinks: BTreeMap<String, String>,
    faults: HashMap<String, StatusCode>,
    handles: HashMap<Bytes, String>,
    next_handle: u64,
    peak_open: usize,
    reorder: bool,
    /// close the session after receiving this many requests, without answering the last one
    hang_up_after: Option<usize>,
    log: Vec<Logged>,
}

fn status(code: StatusCode) -> Answer {
    Answer::Status(Status::new(code, ""))
}

fn ok() -> Answer {
    status(StatusCode::Ok)
}

/// The path a fault registered for would apply to.
fn fault_path(request: &Request) -> Option<&str> {
    match request {
        Request::Open { path, .. }
        | Request::Mkdir { path, .. }
        | Request::Remove { path }
        | Request::Stat { path } => Some(path.as_str()),
        Request::Rename { dst, .. } => Some(dst.as_str()),
        Request::Symlink { link, .. } => Some(link.as_str()),
        _ => None,
    }
}

impl State {
    fn parent_exists(&self, path: &str) -> bool {
        parent_dir(path).is_none_or(|parent| self.dirs.contains(parent))
    }

    fn exists(&self, path: &str) -> bool {
        self.dirs.contains(path) || self.files.contains_key(path) || self.symlinks.contains_key(path)
    }

    fn handle(&mut self, request: &Request) -> Answer {
        if let Some(code) = fault_path(request).and_then(|path| self.faults.get(path)) {
            return status(*code);
        }
        match request {
            Request::Open { path, flags, .. } => {
                if !self.parent_exists(path) {
                    return status(StatusCode::NoSuchFile);
                }
                if self.dirs.contains(path) {
                    return status(StatusCode::Failure);
                }
                let exists = self.files.contains_key(path);
                if !exists && !flags.contains(OpenFlags::CREAT) {
                    return status(StatusCode::NoSuchFile);
                }
                if !exists || flags.contains(OpenFlags::TRUNC) {
                    self.files.insert(path.clone(), Vec::new());
                }
                self.next_handle += 1;
                let handle = Bytes::from(format!("h{}", self.next_handle));
                self.handles.insert(handle.clone(), path.clone());
                self.peak_open = self.peak_open.max(self.handles.len());
                Answer::Handle(handle)
            }
            Request::Write {
                handle,
                offset,
                data,
            } => {
                let Some(file) = self
                    .handles
                    .get(handle)
                    .and_then(|path| self.files.get_mut(path))
                else {
                    return status(StatusCode::InvalidHandle);
                };
                let start = *offset as usize;
                let end = start + data.len();
                if file.len() < end {
                    file.resize(end, 0);
                }
                file[start..end].copy_from_slice(data);
                ok()
            }
            Request::Close { handle } => match self.handles.remove(handle) {
                Some(_) => ok(),
                None => status(StatusCode::InvalidHandle),
            },
            Request::Mkdir { path, .. } => {
                if self.exists(path) {
                    status(StatusCode::FileAlreadyExists)
                } else if !self.parent_exists(path) {
                    status(StatusCode::NoSuchFile)
                } else {
                    self.dirs.insert(path.clone());
                    ok()
                }
            }
            Request::Stat { path } => {
                if self.dirs.contains(path) {
                    Answer::Attrs(FileAttributes::with_permissions(0o40755))
                } else if let Some(data) = self.files.get(path) {
                    Answer::Attrs(FileAttributes {
                        size: Some(data.len() as u64),
                        ..Default::default()
                    })
                } else {
                    status(StatusCode::NoSuchFile)
                }
            }
            Request::Remove { path } => {
                if self.files.remove(path).is_some() || self.symlinks.remove(path).is_some() {
                    ok()
                } else if self.dirs.contains(path) {
                    status(StatusCode::Failure)
                } else {
                    status(StatusCode::NoSuchFile)
                }
            }
            Request::Rename { src, dst, flags } => {
                if !self.files.contains_key(src) {
                    return status(StatusCode::NoSuchFile);
                }
                if self.exists(dst) && !flags.contains(RenameFlags::OVERWRITE) {
                    return status(StatusCode::FileAlreadyExists);
                }
                if let Some(data) = self.files.remove(src) {
                    self.symlinks.remove(dst);
                    self.files.insert(dst.clone(), data);
                }
                ok()
            }
            Request::Symlink { link, target } => {
                if self.exists(link) {
                    status(StatusCode::FileAlreadyExists)
                } else if !self.parent_exists(link) {
                    status(StatusCode::NoSuchFile)
                } else {
                    self.symlinks.insert(link.clone(), target.clone());
                    ok()
                }
            }
            _ => status(StatusCode::OpUnsupported),
        }
    }
}

/// Shared handle on the server state, cheap to clone.
#[derive(Clone, Default)]
pub struct Remote {
    state: Arc<Mutex<State>>,
}

impl Remote {
    pub fn with_dirs(dirs: &[&str]) -> Self {
        let remote = Self::default();
        remote
            .state
            .lock()
            .unwrap()
            .dirs
            .extend(dirs.iter().map(|dir| dir.to_string()));
        remote
    }

    /// Holds answers back while more requests are pending and sends them newest first.
    pub fn reordering(self) -> Self {
        self.state.lock().unwrap().reorder = true;
        self
    }

    /// Drops the connection as soon as the `n`th request arrives.
    pub fn hanging_up_after(self, n: usize) -> Self {
        self.state.lock().unwrap().hang_up_after = Some(n);
        self
    }

    /// Every request naming `path` fails with `code`.
    pub fn fail(&self, path: &str, code: StatusCode) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(path.to_string(), code);
    }

    pub fn put_file(&self, path: &str, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), data.to_vec());
    }

    pub fn put_symlink(&self, path: &str, target: &str) {
        self.state
            .lock()
            .unwrap()
            .symlinks
            .insert(path.to_string(), target.to_string());
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn symlink(&self, path: &str) -> Option<String> {
        self.state.lock().unwrap().symlinks.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(path)
    }

    /// Most handles that were open at the same time.
    pub fn peak_open(&self) -> usize {
        self.state.lock().unwrap().peak_open
    }

    pub fn log(&self) -> Vec<Logged> {
        self.state.lock().unwrap().log.clone()
    }

    /// Requests in the order they were received.
    pub fn requests(&self) -> Vec<Request> {
        self.log()
            .into_iter()
            .filter_map(|entry| match entry {
                Logged::Received(request) => Some(request),
                Logged::Answered(..) => None,
            })
            .collect()
    }

    pub fn mkdirs(&self) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                Request::Mkdir { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().unwrap().log.clear();
    }

    /// Serves a fresh session and returns a publisher connected to it.
    pub async fn connect(&self, session: SessionConfig, settings: Settings) -> TestPublisher {
        let (client, server) = tokio::io::duplex(1 << 16);
        tokio::spawn(serve(self.state.clone(), server));
        let (reader, writer) = tokio::io::split(client);
        let connection = Connection::handshake(reader, writer, session)
            .await
            .expect("handshake with the test server");
        Publisher::new(connection, settings)
    }

    pub async fn publisher(&self) -> TestPublisher {
        self.connect(SessionConfig::default(), Settings::default())
            .await
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .new_codec()
}

async fn serve(state: Arc<Mutex<State>>, stream: DuplexStream) {
    let (reader, writer) = tokio::io::split(stream);
    let mut reader = FramedRead::new(reader, codec());
    let mut writer = FramedWrite::new(writer, codec());
    let Some(Ok(init)) = reader.next().await else {
        return;
    };
    let version = sftp::request::decode_init(init.freeze()).expect("INIT from the client");
    assert_eq!(version, 3);
    let hello = Version {
        version: 3,
        extensions: vec![("posix-rename@openssh.com".to_string(), "1".to_string())],
    };
    if writer.send(hello.encode()).await.is_err() {
        return;
    }
    let reorder = state.lock().unwrap().reorder;
    let mut held: Vec<(u32, Request, Answer)> = Vec::new();
    loop {
        let frame = if held.is_empty() {
            reader.next().await
        } else {
            // give the client a chance to queue more before releasing what we hold
            tokio::task::yield_now().await;
            match reader.next().now_or_never() {
                Some(frame) => frame,
                None => {
                    while let Some((id, request, answer)) = held.pop() {
                        if send(&state, &mut writer, id, request, answer).await.is_err() {
                            return;
                        }
                    }
                    continue;
                }
            }
        };
        let Some(Ok(frame)) = frame else {
            return;
        };
        let (id, request) = Request::decode(frame.freeze()).expect("well-formed request");
        let answer = {
            let mut state = state.lock().unwrap();
            state.log.push(Logged::Received(request.clone()));
            let received = state
                .log
                .iter()
                .filter(|entry| matches!(entry, Logged::Received(_)))
                .count();
            if state.hang_up_after == Some(received) {
                return;
            }
            state.handle(&request)
        };
        if reorder {
            held.push((id, request, answer));
        } else if send(&state, &mut writer, id, request, answer).await.is_err() {
            return;
        }
    }
}

async fn send(
    state: &Arc<Mutex<State>>,
    writer: &mut FramedWrite<WriteHalf<DuplexStream>, LengthDelimitedCodec>,
    id: u32,
    request: Request,
    answer: Answer,
) -> std::io::Result<()> {
    let frame = answer.encode(id);
    state
        .lock()
        .unwrap()
        .log
        .push(Logged::Answered(request, answer));
    writer.send(frame).await
}

/// Writes `len` bytes of a recognizable pattern to `dir/name` and returns the path and content.
pub fn source_file(dir: &std::path::Path, name: &str, len: usize) -> (std::path::PathBuf, Vec<u8>) {
    let content: Vec<u8> = (0..len).map(|n| (n % 251) as u8).collect();
    let path = dir.join(name);
    std::fs::write(&path, &content).unwrap();
    (path, content)
}

/// Collects `path outcome` strings reported by completion callbacks.
#[derive(Clone, Default)]
pub struct Outcomes(std::rc::Rc<std::cell::RefCell<Vec<String>>>);

impl Outcomes {
    pub fn recorder(&self) -> impl FnOnce(&str, publish::Outcome) + 'static {
        let log = self.0.clone();
        move |path: &str, outcome| log.borrow_mut().push(format!("{path} {outcome}"))
    }

    pub fn staged_recorder(&self) -> impl FnMut(&str, publish::Outcome) + 'static {
        let log = self.0.clone();
        move |path: &str, outcome| log.borrow_mut().push(format!("{path} {outcome}"))
    }

    pub fn sorted(&self) -> Vec<String> {
        let mut outcomes = self.0.borrow().clone();
        outcomes.sort();
        outcomes
    }

    pub fn all(&self) -> Vec<String> {
        self.0.borrow().clone()
    }
}
