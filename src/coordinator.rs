//! Coordinator agent.
//!
//! The coordinator owns the sequence being sorted. It serves task and result exchanges requested by
//! the leader, asks for a new leader after every completed epoch and starts a leader itself when
//! none can be found.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::io;
use std::io::prelude::*;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::discovery::Discovery;
use crate::leader::spawn_leader;
use crate::partition::{Applied, PartitionTracker};
use crate::protocol::{Channel, Message, Payload, ProtocolError, ResultPayload, TaskPayload};

/// Default result file.
pub const DEFAULT_OUTPUT: &str = "result.txt";

/// Coordinator error.
#[derive(Debug)]
pub enum CoordinatorError {
    /// Input reading error.
    Input(io::Error),
    /// Input line is not an integer.
    Parse { line: usize, source: ParseIntError },
    /// Result writing error.
    Output(io::Error),
}

impl Error for CoordinatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            CoordinatorError::Input(err) => err,
            CoordinatorError::Parse { source, .. } => source,
            CoordinatorError::Output(err) => err,
        })
    }
}

impl Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            CoordinatorError::Input(err) => write!(f, "input reading failed: {}", err),
            CoordinatorError::Parse { line, source } => write!(f, "invalid number at line {}: {}", line, source),
            CoordinatorError::Output(err) => write!(f, "result writing failed: {}", err),
        }
    }
}

/// Reads a sequence of integers, one per line. Blank lines are skipped.
pub fn read_sequence<R: BufRead>(reader: R) -> Result<Vec<i64>, CoordinatorError> {
    let mut sequence = Vec::new();

    for (number, line) in reader.lines().enumerate() {
        let line = line.map_err(CoordinatorError::Input)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let item = line
            .parse::<i64>()
            .map_err(|source| CoordinatorError::Parse { line: number + 1, source })?;
        sequence.push(item);
    }

    return Ok(sequence);
}

/// Writes the sequence to a file, one item per line.
pub fn write_output(path: &Path, sequence: &[i64]) -> io::Result<()> {
    let mut writer = io::BufWriter::new(fs::File::create(path)?);
    for item in sequence {
        writeln!(writer, "{}", item)?;
    }

    return writer.flush();
}

/// Coordinator builder. Provides methods for [`Coordinator`] initialization.
#[derive(Clone)]
pub struct CoordinatorBuilder {
    network: NetworkConfig,
    output: Option<PathBuf>,
}

impl CoordinatorBuilder {
    /// Creates an instance of a builder with default parameters.
    pub fn new() -> Self {
        CoordinatorBuilder::default()
    }

    /// Builds a coordinator for the sequence.
    pub fn build(self, sequence: Vec<i64>) -> Coordinator {
        Coordinator {
            tracker: PartitionTracker::new(sequence),
            network: self.network,
            output: self.output,
            link: None,
            local_leader: None,
        }
    }

    /// Sets network configuration.
    pub fn with_network(mut self, network: NetworkConfig) -> CoordinatorBuilder {
        self.network = network;
        return self;
    }

    /// Sets the file the sorted sequence is written to.
    pub fn with_output<P: AsRef<Path>>(mut self, path: P) -> CoordinatorBuilder {
        self.output = Some(path.as_ref().to_path_buf());
        return self;
    }

    /// Keeps the sorted sequence in memory only.
    pub fn without_output(mut self) -> CoordinatorBuilder {
        self.output = None;
        return self;
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        CoordinatorBuilder {
            network: NetworkConfig::default(),
            output: Some(PathBuf::from(DEFAULT_OUTPUT)),
        }
    }
}

/// Outcome of a served leader request.
enum Served {
    Continue,
    /// An election has been requested, the leader connection must be dropped.
    Handoff,
}

/// Coordinator agent.
pub struct Coordinator {
    tracker: PartitionTracker<i64>,
    network: NetworkConfig,
    output: Option<PathBuf>,
    link: Option<Channel<TcpStream>>,
    local_leader: Option<thread::JoinHandle<()>>,
}

impl Coordinator {
    /// Sorts the sequence with the help of the cluster and returns it.
    /// The sorted sequence is also written to the output file, if one is set.
    pub fn run(mut self) -> Result<Vec<i64>, CoordinatorError> {
        log::info!("sorting {} items", self.tracker.len());

        while self.tracker.is_unsorted() {
            match self.link.take() {
                None => self.connect(),
                Some(mut channel) => match self.serve(&mut channel) {
                    Ok(Served::Continue) => self.link = Some(channel),
                    Ok(Served::Handoff) => log::info!("leaving {} for the next leader", channel.peer()),
                    Err(err) => log::warn!("disconnected from {}: {}", channel.peer(), err),
                },
            }
        }

        if let Some(channel) = self.link.take() {
            self.finish(channel);
        }

        log::info!("sequence sorted in {} epochs", self.tracker.epoch());

        let sequence = self.tracker.into_inner();
        if let Some(path) = &self.output {
            write_output(path, &sequence).map_err(CoordinatorError::Output)?;
            log::info!("result written to {}", path.display());
        }

        return Ok(sequence);
    }

    /// Looks for the leader and connects to it, starting a local leader if none answers.
    fn connect(&mut self) {
        let ip = match Discovery::for_coordinator(&self.network).find_leader() {
            Ok(Some(ip)) => ip,
            Ok(None) => {
                self.spawn_local_leader();
                return;
            }
            Err(err) => {
                log::warn!("leader discovery failed: {}", err);
                thread::sleep(self.network.discovery_timeout());
                return;
            }
        };

        let addr = SocketAddr::new(ip, self.network.ports().coordinator);
        match TcpStream::connect(addr) {
            Ok(stream) => {
                log::info!("connected to leader ({})", addr);
                self.link = Some(Channel::new(stream, format!("leader ({})", addr)));
            }
            Err(err) => log::warn!("leader ({}) not reachable: {}", addr, err),
        }
    }

    /// Starts a leader on this host unless the previously started one is still running.
    fn spawn_local_leader(&mut self) {
        if let Some(handle) = self.local_leader.take() {
            if !handle.is_finished() {
                log::debug!("local leader still running");
                self.local_leader = Some(handle);
                return;
            }
            let _ = handle.join();
        }

        log::info!("creating a new leader");
        match spawn_leader(self.network.clone(), Duration::ZERO) {
            Ok(handle) => self.local_leader = Some(handle),
            Err(err) => log::error!("leader thread not started: {}", err),
        }
    }

    /// Serves a single leader request.
    fn serve(&mut self, channel: &mut Channel<TcpStream>) -> Result<Served, ProtocolError> {
        match channel.receive()? {
            Message::Request => {
                self.send_lists(channel)?;
                Ok(Served::Continue)
            }
            Message::Accepted(size) => self.receive_sorted(channel, size),
            other => Err(ProtocolError::Unexpected(other)),
        }
    }

    fn send_lists(&mut self, channel: &mut Channel<TcpStream>) -> Result<(), ProtocolError> {
        let task = self
            .tracker
            .acquire_task()
            .ok_or(ProtocolError::Unexpected(Message::Request))?;
        log::debug!(
            "task (index: {}, epoch: {}, items: {}) for {}",
            task.index,
            task.epoch,
            task.a.len() + task.b.len(),
            channel.peer()
        );

        let payload = TaskPayload::from(task).to_bytes()?;
        channel.send(&Message::Accepted(payload.len()))?;
        match channel.receive()? {
            Message::Ready => channel.send_payload(&payload),
            other => Err(ProtocolError::Unexpected(other)),
        }
    }

    fn receive_sorted(&mut self, channel: &mut Channel<TcpStream>, size: usize) -> Result<Served, ProtocolError> {
        channel.send(&Message::Ready)?;
        let result = ResultPayload::from_bytes(&channel.receive_payload(size)?)?;
        let (index, epoch) = (result.index, result.num_iter);

        match self.tracker.apply_result(index, result.sorted, epoch) {
            Applied::EpochAdvanced if self.tracker.is_unsorted() => {
                log::info!("epoch {} started, requesting leader election", self.tracker.epoch());
                channel.send(&Message::Elect)?;
                return Ok(Served::Handoff);
            }
            Applied::Stale => log::debug!("discarding stale sorted list (index: {}, epoch: {})", index, epoch),
            applied => log::debug!("sorted list applied (index: {}, epoch: {}): {:?}", index, epoch, applied),
        }

        channel.send(&Message::Acknowledged)?;

        return Ok(Served::Continue);
    }

    /// Reports the work finished and waits for the leader to close the connection,
    /// so that requests still in flight are read rather than reset.
    fn finish(&mut self, mut channel: Channel<TcpStream>) {
        log::info!("work finished, notifying {}", channel.peer());

        if let Err(err) = channel.send(&Message::Finished) {
            log::warn!("finish not reported to {}: {}", channel.peer(), err);
            return;
        }

        let timeout = Some(self.network.linger() * 2);
        let prepared = channel
            .get_ref()
            .shutdown(Shutdown::Write)
            .and_then(|_| channel.get_ref().set_read_timeout(timeout));
        if let Err(err) = prepared.and_then(|_| channel.drain()) {
            log::debug!("connection to {} not drained: {}", channel.peer(), err);
        }
    }
}
