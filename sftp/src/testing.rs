//! Helpers for driving a [`Core`] without any I/O.

use crate::answer::Answer;
use crate::connection::Core;
use crate::request::Request;
use crate::task::{Context, Instruction, Instructions, Reply, Signal, Task, TaskId};

#[derive(Debug)]
pub enum ProbeEvent {
    Start,
    Answer(Reply),
    WriteReady,
    Signal(TaskId, Signal),
}

type Script = Box<dyn FnMut(&mut Context<'_>, ProbeEvent) -> (Vec<Instruction>, bool)>;

/// A task whose behavior is a closure returning `(instructions, finished)`.
pub struct Probe {
    name: String,
    script: Script,
    finished: bool,
}

impl Probe {
    pub fn new(
        name: &str,
        script: impl FnMut(&mut Context<'_>, ProbeEvent) -> (Vec<Instruction>, bool) + 'static,
    ) -> Self {
        Self {
            name: name.to_string(),
            script: Box::new(script),
            finished: false,
        }
    }

    fn run(&mut self, cx: &mut Context<'_>, event: ProbeEvent) -> Instructions {
        let (instructions, finished) = (self.script)(cx, event);
        self.finished = finished;
        Ok(instructions)
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Task for Probe {
    fn start(&mut self, cx: &mut Context<'_>) -> Instructions {
        self.run(cx, ProbeEvent::Start)
    }

    fn on_answer(&mut self, cx: &mut Context<'_>, reply: Reply) -> Instructions {
        self.run(cx, ProbeEvent::Answer(reply))
    }

    fn on_write_ready(&mut self, cx: &mut Context<'_>) -> Instructions {
        self.run(cx, ProbeEvent::WriteReady)
    }

    fn on_signal(&mut self, cx: &mut Context<'_>, from: TaskId, signal: Signal) -> Instructions {
        self.run(cx, ProbeEvent::Signal(from, signal))
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Plays server until the core runs out of work, answering requests in the order they were sent.
/// Returns every request seen.
pub fn pump(core: &mut Core, mut respond: impl FnMut(&Request) -> Answer) -> Vec<Request> {
    let mut in_flight = std::collections::VecDeque::new();
    let mut seen = Vec::new();
    while core.has_work() {
        while core.wants_output() {
            if let Some(frame) = core.on_output_ready().unwrap() {
                in_flight.push_back(Request::decode(frame).unwrap());
            }
        }
        let Some((id, request)) = in_flight.pop_front() else {
            panic!("core has work but nothing to answer");
        };
        let answer = respond(&request);
        seen.push(request);
        core.on_input(answer.encode(id)).unwrap();
    }
    seen
}
