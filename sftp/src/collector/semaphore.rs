//! Counting semaphore for a named resource.
//!
//! `Lock` is answered with `Unlock` once a permit is available; `Release` returns it. Waiters are
//! served strictly in arrival order and a release always wakes the oldest waiter before adding
//! to the idle count, so `available + held == capacity` at all times.

use std::collections::VecDeque;

use crate::error::Error;
use crate::task::{Context, Instruction, Instructions, Signal, Task, TaskId};

pub struct Semaphore {
    name: String,
    capacity: usize,
    available: usize,
    queue: VecDeque<TaskId>,
}

impl Semaphore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capacity: 0,
            available: 0,
            queue: VecDeque::new(),
        }
    }
}

impl std::fmt::Display for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "semaphore({:?})", self.name)
    }
}

impl Task for Semaphore {
    fn start(&mut self, cx: &mut Context<'_>) -> Instructions {
        self.capacity = cx.config().semaphore_capacity(&self.name)?;
        self.available = self.capacity;
        Ok(vec![])
    }

    fn on_signal(&mut self, _cx: &mut Context<'_>, from: TaskId, signal: Signal) -> Instructions {
        match signal {
            Signal::Lock if self.available > 0 => {
                self.available -= 1;
                tracing::debug!("{self}: granted to {from}, {} left", self.available);
                Ok(vec![Instruction::Signal {
                    to: from,
                    signal: Signal::Unlock,
                }])
            }
            Signal::Lock => {
                self.queue.push_back(from);
                tracing::debug!("{self}: {from} waits, {} waiting", self.queue.len());
                Ok(vec![])
            }
            Signal::Release => match self.queue.pop_front() {
                Some(next) => {
                    tracing::debug!("{self}: released by {from}, handed to {next}");
                    Ok(vec![Instruction::Signal {
                        to: next,
                        signal: Signal::Unlock,
                    }])
                }
                None if self.available < self.capacity => {
                    self.available += 1;
                    Ok(vec![])
                }
                None => Err(Error::internal(format!(
                    "{self} released by {from} more often than locked"
                ))),
            },
            _ => Err(Error::internal(format!(
                "{self} got unexpected signal {signal} from {from}"
            ))),
        }
    }

    fn is_finished(&self) -> bool {
        false
    }
}
