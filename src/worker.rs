//! Worker agent.
//!
//! A worker finds the leader, then keeps requesting tasks, merging them and returning the merged
//! runs until the leader reports the work finished. A lost connection sends the worker back to
//! discovery, which is how it follows a leader hand-off.

use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::discovery::Discovery;
use crate::leader::spawn_leader;
use crate::merger::merge;
use crate::protocol::{Channel, Message, Payload, ProtocolError, ResultPayload, TaskPayload};

const LEADER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Worker connection state.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// No leader connection.
    Disconnected,
    /// Connected, no task in progress.
    Idle,
    /// Task requested, waiting for its payload.
    AwaitingTask,
    /// Merging the received runs.
    Merging,
    /// Merged run announced, waiting for the leader to accept it.
    AwaitingSend,
}

/// Reason a worker run ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// The leader reported the work finished.
    Finished,
    /// Discovery found no leader.
    NoLeader,
}

/// Summary of a finished worker run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct WorkerReport {
    /// Merged runs handed back to a leader.
    pub completed: usize,
    /// Times the worker was promoted to leader.
    pub promotions: usize,
    pub exit: WorkerExit,
}

/// Event that ends the current leader connection.
#[derive(Debug)]
enum Interrupt {
    Promoted,
    Finished,
    Protocol(ProtocolError),
}

impl From<ProtocolError> for Interrupt {
    fn from(err: ProtocolError) -> Self {
        Interrupt::Protocol(err)
    }
}

/// Maps a leader message received in place of the expected one.
fn interrupt_on(message: Message) -> Interrupt {
    match message {
        Message::Promote => Interrupt::Promoted,
        Message::Finished => Interrupt::Finished,
        other => Interrupt::Protocol(ProtocolError::Unexpected(other)),
    }
}

/// Interprets bytes received in place of a task payload.
/// The leader cancels a task by sending a control message instead of it.
fn cancelled(bytes: &[u8]) -> Option<Interrupt> {
    let line = bytes.split(|byte| *byte == b'\n').next().unwrap_or_default();

    match Message::decode_bytes(line) {
        Ok(message @ (Message::Promote | Message::Finished)) => {
            log::debug!("task cancelled by leader: {}", message);
            Some(interrupt_on(message))
        }
        _ => None,
    }
}

/// Worker agent.
pub struct Worker {
    network: NetworkConfig,
    state: WorkerState,
    link: Option<Channel<TcpStream>>,
    leaders: Vec<thread::JoinHandle<()>>,
    completed: usize,
    finished: bool,
}

impl Worker {
    pub fn new(network: NetworkConfig) -> Self {
        Worker {
            network,
            state: WorkerState::Disconnected,
            link: None,
            leaders: Vec::new(),
            completed: 0,
            finished: false,
        }
    }

    /// Serves leaders until the work is finished or no leader can be found.
    pub fn run(mut self) -> WorkerReport {
        let exit = loop {
            if self.finished {
                break WorkerExit::Finished;
            }

            match self.link.take() {
                None => {
                    if !self.connect() {
                        break WorkerExit::NoLeader;
                    }
                }
                Some(mut channel) => match self.serve(&mut channel) {
                    Ok(()) => self.link = Some(channel),
                    Err(interrupt) => self.interrupt(channel.peer(), interrupt),
                },
            }
        };

        let promotions = self.leaders.len();
        self.wait_for_leaders();

        log::info!("worker finished ({:?}, tasks: {})", exit, self.completed);

        return WorkerReport {
            completed: self.completed,
            promotions,
            exit,
        };
    }

    /// Gives the leaders started on promotion the linger delay to release their workers.
    fn wait_for_leaders(&mut self) {
        let deadline = Instant::now() + self.network.linger() * 2;

        for handle in self.leaders.drain(..) {
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(LEADER_POLL_INTERVAL);
            }

            if !handle.is_finished() {
                log::warn!("leading role still active, leaving it running");
            } else if handle.join().is_err() {
                log::error!("leader thread panicked");
            }
        }
    }

    fn transition(&mut self, state: WorkerState) {
        log::debug!("worker state: {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Looks for the leader and connects to it.
    /// Returns `false` if the worker has to give up.
    fn connect(&mut self) -> bool {
        let ip = match Discovery::for_worker(&self.network).find_leader() {
            Ok(Some(ip)) => ip,
            Ok(None) => return false,
            Err(err) => {
                log::error!("leader discovery failed: {}", err);
                return false;
            }
        };

        let addr = SocketAddr::new(ip, self.network.ports().worker);
        match TcpStream::connect(addr) {
            Ok(stream) => {
                log::info!("connected to leader ({})", addr);
                self.link = Some(Channel::new(stream, format!("leader ({})", addr)));
                self.transition(WorkerState::Idle);
            }
            Err(err) => log::warn!("leader ({}) not reachable: {}", addr, err),
        }

        return true;
    }

    /// Runs one task cycle: request, merge, return.
    fn serve(&mut self, channel: &mut Channel<TcpStream>) -> Result<(), Interrupt> {
        self.transition(WorkerState::AwaitingTask);
        channel.send(&Message::Request)?;
        let size = match channel.receive()? {
            Message::Accepted(size) => size,
            other => return Err(interrupt_on(other)),
        };

        channel.send(&Message::Ready)?;
        let task = match channel.receive_payload(size) {
            Ok(bytes) => match TaskPayload::from_bytes(&bytes) {
                Ok(task) => task,
                Err(err) => return Err(cancelled(&bytes).unwrap_or(Interrupt::Protocol(err))),
            },
            Err(ProtocolError::Truncated { expected, partial }) => {
                let interrupt = cancelled(&partial);
                return Err(interrupt.unwrap_or(Interrupt::Protocol(ProtocolError::Truncated { expected, partial })));
            }
            Err(err) => return Err(err.into()),
        };
        log::debug!("task received (index: {}, epoch: {})", task.index, task.num_iter);

        self.transition(WorkerState::Merging);
        let result = ResultPayload {
            index: task.index,
            sorted: merge(task.a, task.b),
            num_iter: task.num_iter,
        }
        .to_bytes()?;

        self.transition(WorkerState::AwaitingSend);
        channel.send(&Message::Accepted(result.len()))?;
        match channel.receive()? {
            Message::Ready => channel.send_payload(&result)?,
            other => return Err(interrupt_on(other)),
        }

        self.completed += 1;
        self.transition(WorkerState::Idle);

        return Ok(());
    }

    /// Drops the leader connection and reacts to the reason.
    fn interrupt(&mut self, peer: &str, interrupt: Interrupt) {
        self.transition(WorkerState::Disconnected);

        match interrupt {
            Interrupt::Promoted => {
                log::info!("promoted to leader by {}", peer);
                match spawn_leader(self.network.clone(), self.network.settle_delay()) {
                    Ok(handle) => self.leaders.push(handle),
                    Err(err) => log::error!("leader thread not started: {}", err),
                }
            }
            Interrupt::Finished => {
                log::info!("work finished, reported by {}", peer);
                self.finished = true;
            }
            Interrupt::Protocol(err) => log::warn!("disconnected from {}: {}", peer, err),
        }
    }
}
