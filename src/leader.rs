//! Leader scheduler.
//!
//! The leader brokers work between the coordinator and the worker pool. It runs a single-threaded
//! event loop multiplexing the discovery endpoint, both accept endpoints, the coordinator connection
//! and any number of worker connections. Control messages are read without blocking. Bulk payload
//! transfers switch the socket to blocking mode for the duration of one transfer.
//!
//! A leader stops when the coordinator reports the work finished, requests an election or is lost.
//! In the last two cases the worker with the most completed tasks is promoted to be the next leader.

use std::collections::{BTreeMap, VecDeque};
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};

use crate::config::NetworkConfig;
use crate::protocol::{receive_buffer_len, Channel, Message, ProtocolError, MIN_RECEIVE_BUFFER};

const DISCOVERY: Token = Token(0);
const WORKER_LISTENER: Token = Token(1);
const COORDINATOR_LISTENER: Token = Token(2);
const COORDINATOR: Token = Token(3);
const FIRST_WORKER: usize = 4;

const EVENTS_CAPACITY: usize = 128;
/// Longest worker message accepted without a line end.
const MAX_MESSAGE_LEN: usize = 4 * MIN_RECEIVE_BUFFER;

/// Leader start-up error.
#[derive(Debug)]
pub enum LeaderError {
    /// Readiness poll creation or registration error.
    Poll(io::Error),
    /// Endpoint binding error.
    Bind { port: u16, source: io::Error },
}

impl Error for LeaderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(match &self {
            LeaderError::Poll(err) => err,
            LeaderError::Bind { source, .. } => source,
        })
    }
}

impl Display for LeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            LeaderError::Poll(err) => write!(f, "readiness poll initialization failed: {}", err),
            LeaderError::Bind { port, source } => write!(f, "port {} not bound: {}", port, source),
        }
    }
}

/// Reason the leader stops.
#[derive(Debug)]
enum Halt {
    /// The coordinator requested an election.
    Election,
    /// The coordinator reported all work finished.
    Finished,
    /// The coordinator connection failed.
    CoordinatorLost(ProtocolError),
}

impl From<ProtocolError> for Halt {
    fn from(err: ProtocolError) -> Self {
        Halt::CoordinatorLost(err)
    }
}

/// Maps a coordinator message received out of order to the leader reaction.
fn halt_on(message: Message) -> Halt {
    match message {
        Message::Elect => Halt::Election,
        Message::Finished => Halt::Finished,
        other => Halt::CoordinatorLost(ProtocolError::Unexpected(other)),
    }
}

/// Picks the next leader: the entry with the greatest completed task count.
/// Ties are resolved in favour of the entry met first.
pub fn elect<K, I>(completed: I) -> Option<K>
where
    I: IntoIterator<Item = (K, usize)>,
{
    let mut best: Option<(K, usize)> = None;

    for (key, count) in completed {
        match best {
            Some((_, top)) if count <= top => {}
            _ => best = Some((key, count)),
        }
    }

    return best.map(|(key, _)| key);
}

/// Starts a leader on a new thread after `delay`.
/// A leader that cannot bind its endpoints logs the failure and exits.
pub fn spawn_leader(config: NetworkConfig, delay: Duration) -> io::Result<thread::JoinHandle<()>> {
    thread::Builder::new().name("leader".into()).spawn(move || {
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        match Leader::bind(config) {
            Ok(leader) => leader.run(),
            Err(err) => log::error!("leader not started: {}", err),
        }
    })
}

fn set_nonblocking(stream: &TcpStream, nonblocking: bool) -> io::Result<()> {
    socket2::SockRef::from(stream).set_nonblocking(nonblocking)
}

/// Runs `op` with the socket switched to blocking mode.
fn blocking<T>(stream: &TcpStream, op: impl FnOnce(&TcpStream) -> io::Result<T>) -> io::Result<T> {
    set_nonblocking(stream, false)?;
    let result = op(stream);
    set_nonblocking(stream, true)?;

    return result;
}

/// Worker connection table entry.
struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    /// Bytes received but not yet split into messages.
    received: Vec<u8>,
    /// Received messages waiting to be handled.
    inbox: VecDeque<Message>,
    /// Task payloads waiting for the worker to get ready.
    outbox: VecDeque<Vec<u8>>,
    /// Tasks completed by the worker.
    completed: usize,
}

impl Peer {
    fn new(stream: TcpStream, addr: SocketAddr) -> Self {
        Peer {
            stream,
            addr,
            received: Vec::new(),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            completed: 0,
        }
    }

    /// Reads everything available without blocking and queues complete messages.
    fn fill(&mut self) -> Result<(), ProtocolError> {
        let mut buf = [0; MIN_RECEIVE_BUFFER];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return Err(ProtocolError::Closed),
                Ok(len) => {
                    self.received.extend_from_slice(&buf[..len]);
                    self.split_messages()?;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }

        return Ok(());
    }

    fn split_messages(&mut self) -> Result<(), ProtocolError> {
        while let Some(end) = self.received.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.received.drain(..=end).collect();
            let message = Message::decode_bytes(&line)?;
            log::debug!("message from worker ({}): {}", self.addr, message);
            self.inbox.push_back(message);
        }

        if self.received.len() > MAX_MESSAGE_LEN {
            return Err(ProtocolError::Malformed(format!(
                "{} bytes without a line end",
                self.received.len()
            )));
        }

        return Ok(());
    }

    fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        log::debug!("message to worker ({}): {}", self.addr, message);
        let line = message.encode();
        blocking(&self.stream, |mut stream| stream.write_all(line.as_bytes()))?;

        return Ok(());
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        log::debug!("sending task to worker ({})", self.addr);
        blocking(&self.stream, |mut stream| stream.write_all(payload))?;

        return Ok(());
    }

    /// Answers the announcement of a merged run and receives exactly `size` bytes of it.
    fn receive_payload(&mut self, size: usize) -> Result<Vec<u8>, ProtocolError> {
        self.send(&Message::Ready)?;

        let mut payload = Vec::with_capacity(receive_buffer_len(size));
        let buffered = self.received.len().min(size);
        payload.extend(self.received.drain(..buffered));

        let remaining = (size - payload.len()) as u64;
        blocking(&self.stream, |stream| stream.take(remaining).read_to_end(&mut payload))?;

        if payload.len() < size {
            return Err(ProtocolError::Truncated {
                expected: size,
                partial: payload,
            });
        }

        log::debug!("sorted list received from worker ({})", self.addr);

        return Ok(payload);
    }
}

/// Leader scheduler.
pub struct Leader {
    config: NetworkConfig,
    poll: Poll,
    discovery: UdpSocket,
    worker_listener: TcpListener,
    coordinator_listener: TcpListener,
    /// Coordinator connection, blocking outside of [`Leader::poll_coordinator`].
    coordinator: Option<Channel<TcpStream>>,
    /// Worker connections in accept order.
    peers: BTreeMap<Token, Peer>,
    next_token: usize,
    running: bool,
}

impl Leader {
    /// Binds the leader endpoints.
    pub fn bind(config: NetworkConfig) -> Result<Leader, LeaderError> {
        let ports = config.ports();
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

        let poll = Poll::new().map_err(LeaderError::Poll)?;

        let mut worker_listener = TcpListener::bind(SocketAddr::new(any, ports.worker))
            .map_err(|source| LeaderError::Bind { port: ports.worker, source })?;
        let mut coordinator_listener = TcpListener::bind(SocketAddr::new(any, ports.coordinator))
            .map_err(|source| LeaderError::Bind { port: ports.coordinator, source })?;
        let mut discovery = UdpSocket::bind(SocketAddr::new(any, ports.discovery))
            .map_err(|source| LeaderError::Bind { port: ports.discovery, source })?;

        let registry = poll.registry();
        registry
            .register(&mut discovery, DISCOVERY, Interest::READABLE)
            .map_err(LeaderError::Poll)?;
        registry
            .register(&mut worker_listener, WORKER_LISTENER, Interest::READABLE)
            .map_err(LeaderError::Poll)?;
        registry
            .register(&mut coordinator_listener, COORDINATOR_LISTENER, Interest::READABLE)
            .map_err(LeaderError::Poll)?;

        log::info!(
            "leader listening (discovery: {}, workers: {}, coordinator: {})",
            ports.discovery,
            ports.worker,
            ports.coordinator
        );

        return Ok(Leader {
            config,
            poll,
            discovery,
            worker_listener,
            coordinator_listener,
            coordinator: None,
            peers: BTreeMap::new(),
            next_token: FIRST_WORKER,
            running: true,
        });
    }

    /// Runs the event loop until the leader hands off or the work is finished.
    pub fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        while self.running {
            let timeout = if self.has_pending_work() {
                Some(Duration::ZERO)
            } else {
                None
            };

            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("leader poll failed: {}", err);
                break;
            }

            let mut readable = Vec::new();
            let mut exceptional = Vec::new();
            for event in events.iter() {
                if event.is_error() {
                    exceptional.push(event.token());
                } else {
                    readable.push(event.token());
                }
            }

            if let Err(halt) = self.step(&readable, &exceptional) {
                self.halt(halt);
            }
        }

        self.close_all();
        log::info!("leader finished");
    }

    /// Checks if queued messages can be handled without waiting for new events.
    /// Worker messages are handled only while the coordinator is connected.
    fn has_pending_work(&self) -> bool {
        match &self.coordinator {
            Some(channel) => channel.has_buffered() || self.peers.values().any(|peer| !peer.inbox.is_empty()),
            None => false,
        }
    }

    fn step(&mut self, readable: &[Token], exceptional: &[Token]) -> Result<(), Halt> {
        self.handle_inputs(readable)?;
        if self.coordinator.is_some() {
            self.handle_outputs()?;
        }
        self.handle_conditions(exceptional)?;

        return Ok(());
    }

    fn handle_inputs(&mut self, readable: &[Token]) -> Result<(), Halt> {
        let mut coordinator_readable = false;

        for &token in readable {
            match token {
                DISCOVERY => self.answer_discovery(),
                WORKER_LISTENER => self.accept_workers(),
                COORDINATOR_LISTENER => self.accept_coordinator(),
                COORDINATOR => coordinator_readable = true,
                token => self.receive_from_worker(token),
            }
        }

        let buffered = self.coordinator.as_ref().map_or(false, |channel| channel.has_buffered());
        if coordinator_readable || buffered {
            if let Some(message) = self.poll_coordinator()? {
                return Err(halt_on(message));
            }
        }

        return Ok(());
    }

    fn handle_outputs(&mut self) -> Result<(), Halt> {
        let pending: Vec<Token> = self
            .peers
            .iter()
            .filter(|(_, peer)| !peer.inbox.is_empty())
            .map(|(token, _)| *token)
            .collect();

        for token in pending {
            let message = match self.peers.get_mut(&token).and_then(|peer| peer.inbox.pop_front()) {
                Some(message) => message,
                None => continue,
            };

            match message {
                Message::Request => self.hand_out_task(token)?,
                Message::Accepted(size) => self.collect_result(token, size)?,
                Message::Ready => self.deliver_task(token),
                other => {
                    log::warn!("unexpected message from worker: {}", other);
                    self.remove_worker(token);
                }
            }
        }

        return Ok(());
    }

    fn handle_conditions(&mut self, exceptional: &[Token]) -> Result<(), Halt> {
        for &token in exceptional {
            match token {
                DISCOVERY | WORKER_LISTENER | COORDINATOR_LISTENER => {
                    log::warn!("error condition on leader endpoint {:?}", token)
                }
                COORDINATOR => {
                    let err = self
                        .coordinator
                        .as_ref()
                        .and_then(|channel| channel.get_ref().take_error().ok().flatten())
                        .map_or(ProtocolError::Closed, ProtocolError::IO);
                    return Err(Halt::CoordinatorLost(err));
                }
                token => self.remove_worker(token),
            }
        }

        return Ok(());
    }

    /// Answers every pending discovery request with this leader's address.
    fn answer_discovery(&mut self) {
        let mut buf = [0; MIN_RECEIVE_BUFFER];
        loop {
            let (len, addr) = match self.discovery.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("discovery request not received: {}", err);
                    break;
                }
            };

            match Message::decode_bytes(&buf[..len]) {
                Ok(Message::Discover) => {
                    if let Err(err) = self.discovery.send_to(Message::Acknowledged.encode().as_bytes(), addr) {
                        log::warn!("discovery reply to {} not sent: {}", addr, err);
                    } else {
                        log::debug!("discovery reply sent to {}", addr);
                    }
                }
                Ok(message) => log::debug!("ignoring discovery datagram from {}: {}", addr, message),
                Err(err) => log::debug!("ignoring discovery datagram from {}: {}", addr, err),
            }
        }
    }

    fn accept_workers(&mut self) {
        loop {
            let (mut stream, addr) = match self.worker_listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("worker connection not accepted: {}", err);
                    break;
                }
            };

            let token = Token(self.next_token);
            self.next_token += 1;

            if let Err(err) = self.poll.registry().register(&mut stream, token, Interest::READABLE) {
                log::warn!("worker connection ({}) not registered: {}", addr, err);
                continue;
            }

            log::info!("connected to worker ({})", addr);
            self.peers.insert(token, Peer::new(stream, addr));
        }
    }

    fn accept_coordinator(&mut self) {
        loop {
            let (mut stream, addr) = match self.coordinator_listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("coordinator connection not accepted: {}", err);
                    break;
                }
            };

            if self.coordinator.is_some() {
                log::warn!("rejecting coordinator connection ({}), a coordinator is already connected", addr);
                continue;
            }

            if let Err(err) = set_nonblocking(&stream, false) {
                log::warn!("coordinator connection ({}) not set up: {}", addr, err);
                continue;
            }
            if let Err(err) = self.poll.registry().register(&mut stream, COORDINATOR, Interest::READABLE) {
                log::warn!("coordinator connection ({}) not registered: {}", addr, err);
                continue;
            }

            log::info!("connected to coordinator ({})", addr);
            self.coordinator = Some(Channel::new(stream, format!("coordinator ({})", addr)));
        }
    }

    fn receive_from_worker(&mut self, token: Token) {
        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return,
        };

        if let Err(err) = peer.fill() {
            log::info!("worker ({}) disconnected: {}", peer.addr, err);
            self.remove_worker(token);
        }
    }

    /// Checks the coordinator connection for data received outside of an exchange.
    fn poll_coordinator(&mut self) -> Result<Option<Message>, ProtocolError> {
        let channel = match self.coordinator.as_mut() {
            Some(channel) => channel,
            None => return Ok(None),
        };

        let available = if channel.has_buffered() {
            Ok(1)
        } else {
            set_nonblocking(channel.get_ref(), true)?;
            let available = channel.fill();
            set_nonblocking(channel.get_ref(), false)?;
            available
        };

        match available {
            Ok(0) => Err(ProtocolError::Closed),
            Ok(_) => channel.receive().map(Some),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn coordinator(&mut self) -> Result<&mut Channel<TcpStream>, Halt> {
        self.coordinator
            .as_mut()
            .ok_or(Halt::CoordinatorLost(ProtocolError::Closed))
    }

    /// Requests a task from the coordinator and announces it to the worker.
    fn hand_out_task(&mut self, token: Token) -> Result<(), Halt> {
        let task = self.request_lists()?;

        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return Ok(()),
        };

        match peer.send(&Message::Accepted(task.len())) {
            Ok(()) => peer.outbox.push_back(task),
            Err(err) => {
                log::warn!("task not announced to worker ({}): {}", peer.addr, err);
                self.remove_worker(token);
            }
        }

        return Ok(());
    }

    fn request_lists(&mut self) -> Result<Vec<u8>, Halt> {
        let coordinator = self.coordinator()?;

        coordinator.send(&Message::Request)?;
        let size = match coordinator.receive()? {
            Message::Accepted(size) => size,
            other => return Err(halt_on(other)),
        };

        coordinator.send(&Message::Ready)?;
        let task = coordinator.receive_payload(size)?;

        return Ok(task);
    }

    /// Receives a merged run from the worker and forwards it to the coordinator.
    fn collect_result(&mut self, token: Token, size: usize) -> Result<(), Halt> {
        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return Ok(()),
        };

        let payload = match peer.receive_payload(size) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("sorted list not received from worker ({}): {}", peer.addr, err);
                self.remove_worker(token);
                return Ok(());
            }
        };

        self.forward_result(&payload)?;

        if let Some(peer) = self.peers.get_mut(&token) {
            peer.completed += 1;
        }

        return Ok(());
    }

    fn forward_result(&mut self, payload: &[u8]) -> Result<(), Halt> {
        let coordinator = self.coordinator()?;

        coordinator.send(&Message::Accepted(payload.len()))?;
        match coordinator.receive()? {
            Message::Ready => {}
            other => return Err(halt_on(other)),
        }

        coordinator.send_payload(payload)?;
        match coordinator.receive()? {
            Message::Acknowledged => Ok(()),
            other => Err(halt_on(other)),
        }
    }

    /// Sends the queued task to a worker that reported it is ready.
    fn deliver_task(&mut self, token: Token) {
        let peer = match self.peers.get_mut(&token) {
            Some(peer) => peer,
            None => return,
        };

        let result = match peer.outbox.pop_front() {
            Some(task) => peer.send_payload(&task),
            None => Err(ProtocolError::Unexpected(Message::Ready)),
        };

        if let Err(err) = result {
            log::warn!("task not delivered to worker ({}): {}", peer.addr, err);
            self.remove_worker(token);
        }
    }

    fn halt(&mut self, halt: Halt) {
        match halt {
            Halt::Finished => {
                log::info!("work finished, releasing workers");
                self.send_to_workers(&Message::Finished);
                thread::sleep(self.config.linger());
            }
            Halt::Election => {
                log::info!("leader election requested by coordinator");
                self.elect_successor();
            }
            Halt::CoordinatorLost(err) => {
                log::warn!("disconnected from coordinator: {}", err);
                self.elect_successor();
            }
        }

        self.running = false;
    }

    /// Promotes the worker with the most completed tasks.
    fn elect_successor(&mut self) {
        loop {
            let completed = self.peers.iter().map(|(token, peer)| (*token, peer.completed));
            let token = match elect(completed) {
                Some(token) => token,
                None => {
                    log::warn!("no worker left to take over leadership");
                    return;
                }
            };

            let peer = match self.peers.get_mut(&token) {
                Some(peer) => peer,
                None => return,
            };

            match peer.send(&Message::Promote) {
                Ok(()) => {
                    log::info!("new leader elected ({}, tasks: {})", peer.addr, peer.completed);
                    return;
                }
                Err(err) => {
                    log::warn!("worker ({}) not promoted: {}", peer.addr, err);
                    self.remove_worker(token);
                }
            }
        }
    }

    fn send_to_workers(&mut self, message: &Message) {
        let tokens: Vec<Token> = self.peers.keys().copied().collect();

        for token in tokens {
            let failed = match self.peers.get_mut(&token) {
                Some(peer) => peer.send(message).err(),
                None => None,
            };
            if let Some(err) = failed {
                log::warn!("message not sent to worker: {}", err);
                self.remove_worker(token);
            }
        }
    }

    fn remove_worker(&mut self, token: Token) {
        if let Some(mut peer) = self.peers.remove(&token) {
            log::info!("removing worker ({})", peer.addr);
            let _ = self.poll.registry().deregister(&mut peer.stream);
        }
    }

    fn close_coordinator(&mut self) {
        if let Some(mut channel) = self.coordinator.take() {
            log::info!("closing connection to {}", channel.peer());
            let _ = self.poll.registry().deregister(channel.get_mut());
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.peers.keys().copied().collect();
        for token in tokens {
            self.remove_worker(token);
        }
        self.close_coordinator();
    }
}

#[cfg(test)]
mod test {
    use std::io::prelude::*;
    use std::io::BufReader;
    use std::net::{Ipv4Addr, SocketAddr, TcpStream};
    use std::thread;
    use std::time::Duration;

    use rstest::*;

    use super::{
        elect, spawn_leader, Halt, Leader, LeaderError, COORDINATOR, COORDINATOR_LISTENER, MAX_MESSAGE_LEN,
        WORKER_LISTENER,
    };
    use crate::config::NetworkConfig;
    use crate::discovery::Discovery;
    use crate::merger::merge;
    use crate::partition::{Applied, PartitionTracker};
    use crate::protocol::{Message, Payload, ResultPayload, TaskPayload, MIN_RECEIVE_BUFFER};

    #[rstest]
    #[case(vec![], None)]
    #[case(vec![(4, 0)], Some(4))]
    #[case(vec![(4, 1), (5, 3), (6, 2)], Some(5))]
    #[case(vec![(4, 2), (5, 2)], Some(4))]
    #[case(vec![(4, 0), (5, 2), (6, 2), (7, 1)], Some(5))]
    fn test_elect(#[case] completed: Vec<(usize, usize)>, #[case] expected: Option<usize>) {
        assert_eq!(elect(completed), expected);
    }

    #[test]
    fn test_elect_tie_is_stable() {
        let completed = vec![("first", 3), ("second", 3)];
        for _ in 0..10 {
            assert_eq!(elect(completed.clone()), Some("first"));
        }
    }

    /// Scripted peer speaking the line protocol over a blocking stream.
    struct Script {
        reader: BufReader<TcpStream>,
    }

    impl Script {
        fn connect(port: u16) -> Script {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
            for _ in 0..50 {
                if let Ok(stream) = TcpStream::connect(addr) {
                    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
                    return Script {
                        reader: BufReader::new(stream),
                    };
                }
                thread::sleep(Duration::from_millis(20));
            }
            panic!("leader not reachable on port {}", port);
        }

        fn send(&mut self, message: Message) {
            self.reader.get_mut().write_all(message.encode().as_bytes()).unwrap();
        }

        fn send_payload(&mut self, payload: &[u8]) {
            self.reader.get_mut().write_all(payload).unwrap();
        }

        fn receive(&mut self) -> Message {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            Message::decode(&line).unwrap()
        }

        fn receive_payload(&mut self, size: usize) -> Vec<u8> {
            let mut payload = vec![0; size];
            self.reader.read_exact(&mut payload).unwrap();
            payload
        }

        fn is_closed(&mut self) -> bool {
            let mut buf = [0; 16];
            matches!(self.reader.read(&mut buf), Ok(0) | Err(_))
        }
    }

    fn accepted_size(message: Message) -> usize {
        match message {
            Message::Accepted(size) => size,
            other => panic!("unexpected message: {}", other),
        }
    }

    /// Answers a list request on the coordinator side with the next tracker task.
    fn serve_task(coordinator: &mut Script, tracker: &mut PartitionTracker<i64>) -> TaskPayload {
        assert_eq!(coordinator.receive(), Message::Request);

        let task = TaskPayload::from(tracker.acquire_task().unwrap());
        let bytes = task.to_bytes().unwrap();
        coordinator.send(Message::Accepted(bytes.len()));
        assert_eq!(coordinator.receive(), Message::Ready);
        coordinator.send_payload(&bytes);

        task
    }

    #[test]
    fn test_answers_discovery() {
        let config = NetworkConfig::loopback(45100);
        let leader = Leader::bind(config.clone()).unwrap();
        thread::spawn(move || leader.run());

        let found = Discovery::for_worker(&config).find_leader().unwrap();
        assert_eq!(found, Some(Ipv4Addr::LOCALHOST.into()));
    }

    #[test]
    fn test_second_bind_fails() {
        let config = NetworkConfig::loopback(45110);
        let _leader = Leader::bind(config.clone()).unwrap();

        assert!(matches!(Leader::bind(config), Err(LeaderError::Bind { port: 45111, .. })));
    }

    #[test]
    fn test_task_cycle_and_election() {
        let config = NetworkConfig::loopback(45120);
        let ports = config.ports();
        let handle = spawn_leader(config, Duration::ZERO).unwrap();

        let mut coordinator = Script::connect(ports.coordinator);
        let mut worker = Script::connect(ports.worker);

        // a second coordinator is turned away
        let mut intruder = Script::connect(ports.coordinator);
        assert!(intruder.is_closed());

        worker.send(Message::Request);
        assert_eq!(coordinator.receive(), Message::Request);

        let task = TaskPayload {
            index: 0,
            a: vec![5],
            b: vec![3],
            num_iter: 0,
        }
        .to_bytes()
        .unwrap();
        coordinator.send(Message::Accepted(task.len()));
        assert_eq!(coordinator.receive(), Message::Ready);
        coordinator.send_payload(&task);

        let size = accepted_size(worker.receive());
        worker.send(Message::Ready);
        assert_eq!(worker.receive_payload(size), task);

        let result = ResultPayload {
            index: 0,
            sorted: vec![3, 5],
            num_iter: 0,
        }
        .to_bytes()
        .unwrap();
        worker.send(Message::Accepted(result.len()));
        assert_eq!(worker.receive(), Message::Ready);
        worker.send_payload(&result);

        let size = accepted_size(coordinator.receive());
        assert_eq!(size, result.len());
        coordinator.send(Message::Ready);
        assert_eq!(coordinator.receive_payload(size), result);
        coordinator.send(Message::Elect);

        // the only worker takes over and the leader steps down
        assert_eq!(worker.receive(), Message::Promote);
        assert!(worker.is_closed());
        assert!(coordinator.is_closed());
        handle.join().unwrap();
    }

    #[test]
    fn test_finished_releases_workers() {
        let config = NetworkConfig::loopback(45130);
        let ports = config.ports();
        let handle = spawn_leader(config, Duration::ZERO).unwrap();

        let mut coordinator = Script::connect(ports.coordinator);
        let mut first = Script::connect(ports.worker);
        let mut second = Script::connect(ports.worker);
        thread::sleep(Duration::from_millis(100));

        // finished is noticed without any worker request
        coordinator.send(Message::Finished);

        assert_eq!(first.receive(), Message::Finished);
        assert_eq!(second.receive(), Message::Finished);
        handle.join().unwrap();
    }

    #[test]
    fn test_lost_coordinator_promotes_worker() {
        let config = NetworkConfig::loopback(45140);
        let ports = config.ports();
        let handle = spawn_leader(config, Duration::ZERO).unwrap();

        let coordinator = Script::connect(ports.coordinator);
        let mut worker = Script::connect(ports.worker);
        // make sure the worker is registered before the coordinator goes away
        worker.send(Message::Request);
        thread::sleep(Duration::from_millis(100));
        drop(coordinator);

        assert_eq!(worker.receive(), Message::Promote);
        handle.join().unwrap();
    }

    #[test]
    fn test_coordinator_error_condition_promotes_worker() {
        let config = NetworkConfig::loopback(45150);
        let ports = config.ports();
        let mut leader = Leader::bind(config).unwrap();

        let _coordinator = Script::connect(ports.coordinator);
        let mut worker = Script::connect(ports.worker);
        thread::sleep(Duration::from_millis(50));

        leader.step(&[WORKER_LISTENER, COORDINATOR_LISTENER], &[]).unwrap();
        assert!(leader.coordinator.is_some());
        assert_eq!(leader.peers.len(), 1);

        match leader.step(&[], &[COORDINATOR]) {
            Err(halt @ Halt::CoordinatorLost(_)) => leader.halt(halt),
            other => panic!("unexpected step result: {:?}", other),
        }

        assert!(!leader.running);
        assert_eq!(worker.receive(), Message::Promote);
    }

    #[test]
    fn test_lost_worker_task_is_redelivered() {
        let config = NetworkConfig::loopback(45160);
        let ports = config.ports();
        let handle = spawn_leader(config, Duration::ZERO).unwrap();
        let mut tracker = PartitionTracker::new(vec![5, 3]);

        let mut coordinator = Script::connect(ports.coordinator);
        let mut first = Script::connect(ports.worker);
        let mut second = Script::connect(ports.worker);

        // the first worker goes away right after its task is announced
        first.send(Message::Request);
        let lost = serve_task(&mut coordinator, &mut tracker);
        accepted_size(first.receive());
        drop(first);

        second.send(Message::Request);
        let redelivered = serve_task(&mut coordinator, &mut tracker);
        assert_eq!(redelivered, lost);

        let size = accepted_size(second.receive());
        second.send(Message::Ready);
        let task = TaskPayload::from_bytes(&second.receive_payload(size)).unwrap();
        assert_eq!(task, lost);

        let result = ResultPayload {
            index: task.index,
            sorted: merge(task.a, task.b),
            num_iter: task.num_iter,
        }
        .to_bytes()
        .unwrap();
        second.send(Message::Accepted(result.len()));
        assert_eq!(second.receive(), Message::Ready);
        second.send_payload(&result);

        let size = accepted_size(coordinator.receive());
        coordinator.send(Message::Ready);
        let result = ResultPayload::from_bytes(&coordinator.receive_payload(size)).unwrap();
        assert_eq!(
            tracker.apply_result(result.index, result.sorted, result.num_iter),
            Applied::EpochAdvanced
        );
        assert_eq!(tracker.as_slice(), &[3, 5]);

        coordinator.send(Message::Acknowledged);
        coordinator.send(Message::Finished);
        assert_eq!(second.receive(), Message::Finished);
        handle.join().unwrap();
    }

    #[test]
    fn test_unterminated_worker_message_drops_worker() {
        let config = NetworkConfig::loopback(45170);
        let ports = config.ports();
        spawn_leader(config.clone(), Duration::ZERO).unwrap();

        let mut worker = Script::connect(ports.worker);
        let _ = worker
            .reader
            .get_mut()
            .write_all(&vec![b'6'; MAX_MESSAGE_LEN + MIN_RECEIVE_BUFFER]);
        assert!(worker.is_closed());

        // the leader keeps serving
        let found = Discovery::for_worker(&config).find_leader().unwrap();
        assert_eq!(found, Some(Ipv4Addr::LOCALHOST.into()));
    }
}
