//! One SFTP session: request multiplexing and the event loop.
//!
//! The bookkeeping lives in [`Core`], which never touches I/O: it turns answer frames into task
//! resumptions and hands out the next frame to send when asked. [`Connection`] drives a core over
//! any pair of `AsyncRead`/`AsyncWrite` streams (the stdio of an ssh child process in
//! production, an in-memory duplex in tests).
//!
//! Request ids are allocated when a request is queued and stay in use until the owning task
//! releases them, whether or not an answer arrived in between.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{ChildStdin, ChildStdout};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::answer::{Answer, Version};
use crate::config::SessionConfig;
use crate::error::Error;
use crate::request::{self, PacketType, Request};
use crate::task::{CollectorKey, Context, Instruction, Reply, Signal, Task, TaskId};
use crate::transport::{SshConfig, SshProcess};

/// The only protocol version this client speaks.
pub const PROTOCOL_VERSION: u32 = 3;

/// Per-connection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub requests_sent: u64,
    /// Size of all request frames handed to the transport, length prefixes excluded.
    pub bytes_sent: u64,
    pub answers_received: u64,
    pub directories_created: u64,
    /// Protocol-level failures recorded by tasks.
    pub failures: u64,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "requests sent: {}\n\
            bytes sent: {}\n\
            answers received: {}\n\
            directories created: {}\n\
            failures: {}",
            self.requests_sent,
            self.bytes_sent,
            self.answers_received,
            self.directories_created,
            self.failures,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Queued,
    Sent,
    Answered,
}

#[derive(Debug)]
struct PendingRequest {
    owner: TaskId,
    request: Request,
    state: RequestState,
}

/// Request id space, pending requests and the outbound queue.
#[derive(Debug)]
pub(crate) struct RequestTable {
    space: u64,
    cursor: u64,
    pending: HashMap<u32, PendingRequest>,
    outbound: VecDeque<u32>,
    unanswered: usize,
}

impl RequestTable {
    fn new(space: u64) -> Self {
        Self {
            space: space.clamp(1, 1 << 32),
            cursor: 0,
            pending: HashMap::new(),
            outbound: VecDeque::new(),
            unanswered: 0,
        }
    }

    /// Linear probe from the rolling cursor.
    fn allocate(&mut self) -> Result<u32, Error> {
        let start = self.cursor;
        let mut candidate = start;
        loop {
            let id = candidate as u32;
            candidate = (candidate + 1) % self.space;
            if !self.pending.contains_key(&id) {
                self.cursor = candidate;
                return Ok(id);
            }
            if candidate == start {
                return Err(Error::TooManyRequests);
            }
        }
    }

    fn enqueue(&mut self, owner: TaskId, request: Request) -> Result<u32, Error> {
        let id = self.allocate()?;
        tracing::debug!("enqueue {id} for {owner}: {request}");
        self.pending.insert(
            id,
            PendingRequest {
                owner,
                request,
                state: RequestState::Queued,
            },
        );
        self.outbound.push_back(id);
        self.unanswered += 1;
        Ok(id)
    }

    pub(crate) fn release(&mut self, id: u32) {
        let Some(entry) = self.pending.remove(&id) else {
            tracing::debug!("request {id} released twice");
            return;
        };
        match entry.state {
            RequestState::Queued => {
                self.outbound.retain(|queued| *queued != id);
                self.unanswered -= 1;
            }
            RequestState::Sent => self.unanswered -= 1,
            RequestState::Answered => {}
        }
    }

    fn release_owner(&mut self, owner: TaskId) -> usize {
        let orphans: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &orphans {
            self.release(*id);
        }
        orphans.len()
    }

    fn next_outbound(&mut self) -> Option<(u32, &Request)> {
        let id = self.outbound.pop_front()?;
        let entry = self.pending.get_mut(&id)?;
        entry.state = RequestState::Sent;
        Some((id, &entry.request))
    }

    fn answer(&mut self, id: u32, answer: &Answer) -> Result<(TaskId, Request), Error> {
        let entry = self
            .pending
            .get_mut(&id)
            .ok_or(Error::UnknownRequestId(id))?;
        match entry.state {
            RequestState::Sent => {
                entry.state = RequestState::Answered;
                self.unanswered -= 1;
                Ok((entry.owner, entry.request.clone()))
            }
            // not even sent yet
            RequestState::Queued => Err(Error::UnknownRequestId(id)),
            RequestState::Answered => Err(Error::unexpected(
                format!("second answer {answer}"),
                &entry.request,
            )),
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.pending.len()
    }
}

#[derive(Debug)]
enum Event {
    Start,
    Answer(Reply),
    WriteReady,
    Signal { from: TaskId, signal: Signal },
}

/// Sans-IO state of a session: tasks, collectors, pending requests and the write-ready queue.
pub struct Core {
    requests: RequestTable,
    want_write: VecDeque<TaskId>,
    tasks: HashMap<TaskId, Box<dyn Task>>,
    collectors: HashMap<CollectorKey, TaskId>,
    next_task: u64,
    config: SessionConfig,
    stats: Stats,
}

impl Core {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            requests: RequestTable::new(config.id_space),
            want_write: VecDeque::new(),
            tasks: HashMap::new(),
            collectors: HashMap::new(),
            next_task: 0,
            config,
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Requests queued or in flight and not yet answered, or tasks waiting for write readiness.
    pub fn has_work(&self) -> bool {
        self.requests.unanswered > 0 || !self.want_write.is_empty()
    }

    /// Whether output readiness is of interest at all.
    pub fn wants_output(&self) -> bool {
        !self.requests.outbound.is_empty() || !self.want_write.is_empty()
    }

    /// Number of request ids currently in use.
    pub fn live_requests(&self) -> usize {
        self.requests.live()
    }

    /// Adds a task and runs its start handler.
    pub fn start(&mut self, task: Box<dyn Task>) -> Result<TaskId, Error> {
        let id = self.spawn(task);
        self.resume(id, Event::Start)?;
        Ok(id)
    }

    /// Handles one received frame body.
    pub fn on_input(&mut self, body: Bytes) -> Result<(), Error> {
        let (id, answer) = Answer::decode(body)?;
        self.stats.answers_received += 1;
        let (owner, request) = self.requests.answer(id, &answer)?;
        tracing::debug!("answer {id} to {request}: {answer}");
        self.resume(
            owner,
            Event::Answer(Reply {
                id,
                request,
                answer,
            }),
        )
    }

    /// Called whenever the transport has flushed everything handed to it.
    ///
    /// Tasks waiting for write readiness are only notified while no request is queued, each of
    /// them once; whatever they queue in response is sent one frame per call. Returns the next
    /// frame body to send, if any.
    pub fn on_output_ready(&mut self) -> Result<Option<Bytes>, Error> {
        if self.requests.outbound.is_empty() {
            for task in std::mem::take(&mut self.want_write) {
                self.resume(task, Event::WriteReady)?;
            }
        }
        let Some((id, request)) = self.requests.next_outbound() else {
            return Ok(None);
        };
        tracing::debug!("sending request {id}: {request}");
        let frame = request.encode(id);
        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(Some(frame))
    }

    /// Drops every task (collectors excepted) that is still alive although nothing can resume
    /// it any more, returning their descriptions.
    pub fn reap_stalled(&mut self) -> Vec<String> {
        if self.has_work() {
            return vec![];
        }
        let collectors: std::collections::HashSet<TaskId> =
            self.collectors.values().copied().collect();
        let mut stalled: Vec<TaskId> = self
            .tasks
            .keys()
            .filter(|id| !collectors.contains(id))
            .copied()
            .collect();
        stalled.sort();
        stalled
            .into_iter()
            .filter_map(|id| self.tasks.remove(&id))
            .map(|task| task.to_string())
            .collect()
    }

    fn spawn(&mut self, task: Box<dyn Task>) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        tracing::debug!("starting {id}: {task}");
        self.tasks.insert(id, task);
        id
    }

    fn resume(&mut self, id: TaskId, event: Event) -> Result<(), Error> {
        let Some(mut task) = self.tasks.remove(&id) else {
            tracing::warn!("{id} is gone, dropping {event:?}");
            return Ok(());
        };
        let mut cx = Context {
            me: id,
            requests: &mut self.requests,
            stats: &mut self.stats,
            config: &self.config,
        };
        let result = match event {
            Event::Start => task.start(&mut cx),
            Event::Answer(reply) => task.on_answer(&mut cx, reply),
            Event::WriteReady => task.on_write_ready(&mut cx),
            Event::Signal { from, signal } => task.on_signal(&mut cx, from, signal),
        };
        let finished = task.is_finished();
        if finished {
            tracing::debug!("{id} finished: {task}");
        } else {
            self.tasks.insert(id, task);
        }
        self.apply(id, result?)?;
        if finished {
            let orphans = self.requests.release_owner(id);
            if orphans > 0 {
                tracing::debug!("force-released {orphans} requests of {id}");
            }
            self.want_write.retain(|waiting| *waiting != id);
        }
        Ok(())
    }

    /// Applies instructions depth-first, in emission order.
    fn apply(&mut self, from: TaskId, instructions: Vec<Instruction>) -> Result<(), Error> {
        for instruction in instructions {
            match instruction {
                Instruction::Send(request) => {
                    self.requests.enqueue(from, request)?;
                }
                Instruction::WantWrite => self.want_write.push_back(from),
                Instruction::Signal { to, signal } => {
                    tracing::debug!(target: "sftp::collector", "{from} -> {to}: {signal}");
                    self.resume(to, Event::Signal { from, signal })?;
                }
                Instruction::Collect { key, signal } => {
                    let to = self.collector(&key)?;
                    tracing::debug!(target: "sftp::collector", "{from} -> {key}: {signal}");
                    self.resume(to, Event::Signal { from, signal })?;
                }
                Instruction::Start(task) => {
                    self.start(task)?;
                }
            }
        }
        Ok(())
    }

    /// Looks up the collector for `key`, creating and starting it on first use.
    fn collector(&mut self, key: &CollectorKey) -> Result<TaskId, Error> {
        if let Some(id) = self.collectors.get(key) {
            return Ok(*id);
        }
        tracing::debug!(target: "sftp::collector", "creating {key}");
        let id = self.spawn(crate::collector::create(key));
        // registered before starting, so the start handler's own lookups already see it
        self.collectors.insert(key.clone(), id);
        self.resume(id, Event::Start)?;
        Ok(id)
    }
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .new_codec()
}

enum Ready {
    Input(Option<std::io::Result<bytes::BytesMut>>),
    Output(std::io::Result<()>),
}

/// A live session over a pair of byte streams.
///
/// Generic over the transport so the same event loop runs against ssh's stdio or an in-memory
/// duplex.
pub struct Connection<R = ChildStdout, W = ChildStdin> {
    reader: FramedRead<R, LengthDelimitedCodec>,
    writer: FramedWrite<W, LengthDelimitedCodec>,
    /// a frame was handed to the writer and not flushed yet
    unflushed: bool,
    core: Core,
    server: Version,
    process: Option<SshProcess>,
}

impl Connection {
    /// Spawns ssh for `ssh` and performs the handshake over its stdio.
    pub async fn connect(ssh: &SshConfig, config: SessionConfig) -> Result<Self, Error> {
        let mut process = ssh.spawn()?;
        let (stdout, stdin) = process.take_stdio()?;
        let mut connection = Connection::handshake(stdout, stdin, config).await?;
        connection.process = Some(process);
        Ok(connection)
    }
}

impl<R, W> Connection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Sends INIT and requires VERSION as the first answer.
    pub async fn handshake(reader: R, writer: W, config: SessionConfig) -> Result<Self, Error> {
        let mut reader = FramedRead::new(reader, codec());
        let mut writer = FramedWrite::new(writer, codec());
        writer.send(request::encode_init(PROTOCOL_VERSION)).await?;
        let body = match reader.next().await {
            Some(frame) => frame?.freeze(),
            None => return Err(Error::Disconnected),
        };
        match body.first() {
            Some(&raw) if raw == PacketType::Version as u8 => {}
            Some(&raw) => {
                return Err(Error::Handshake(format!(
                    "expected VERSION, got packet type {raw}"
                )));
            }
            None => return Err(Error::Handshake("empty answer to INIT".to_string())),
        }
        let server = Version::decode(body)?;
        if server.version != PROTOCOL_VERSION {
            tracing::warn!(
                "server speaks protocol version {}, continuing with version {PROTOCOL_VERSION} semantics",
                server.version
            );
        }
        tracing::info!(
            "connected, server version {}, extensions: {:?}",
            server.version,
            server.extensions
        );
        Ok(Self {
            reader,
            writer,
            unflushed: false,
            core: Core::new(config),
            server,
            process: None,
        })
    }

    pub fn server(&self) -> &Version {
        &self.server
    }

    pub fn stats(&self) -> &Stats {
        self.core.stats()
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    /// Starts a task. Its requests go out once [`Connection::dispatch`] runs.
    pub fn start(&mut self, task: Box<dyn Task>) -> Result<TaskId, Error> {
        self.core.start(task)
    }

    /// See [`Core::reap_stalled`].
    pub fn reap_stalled(&mut self) -> Vec<String> {
        self.core.reap_stalled()
    }

    /// Runs the event loop until no request awaits an answer and nothing is queued.
    pub async fn dispatch(&mut self) -> Result<(), Error> {
        while self.core.has_work() || self.unflushed {
            let want_output = self.unflushed || self.core.wants_output();
            let ready = tokio::select! {
                biased;
                frame = self.reader.next() => Ready::Input(frame),
                flushed = SinkExt::<Bytes>::flush(&mut self.writer), if want_output => Ready::Output(flushed),
            };
            match ready {
                Ready::Input(None) => return Err(Error::Disconnected),
                Ready::Input(Some(frame)) => {
                    let frame = frame?;
                    tracing::trace!(target: "sftp::wire", "received packet of {} bytes", frame.len());
                    self.core.on_input(frame.freeze())?;
                }
                Ready::Output(flushed) => {
                    flushed?;
                    self.unflushed = false;
                    if let Some(frame) = self.core.on_output_ready()? {
                        tracing::trace!(target: "sftp::wire", "sending packet of {} bytes", frame.len());
                        self.writer.feed(frame).await?;
                        self.unflushed = true;
                    }
                }
            }
        }
        Ok(())
    }

    /// Closes our end of the stream and terminates the ssh process, if we own one.
    pub async fn close(mut self) -> Result<(), Error> {
        if let Err(error) = SinkExt::<Bytes>::close(&mut self.writer).await {
            tracing::debug!("closing the request stream failed: {error}");
        }
        if let Some(process) = self.process.take() {
            process.terminate().await?;
        }
        Ok(())
    }
}
