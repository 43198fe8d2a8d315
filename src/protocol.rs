//! Wire protocol.
//!
//! Every control message is a line `"<code> <comment>"` terminated by a newline. Messages announcing a
//! bulk transfer carry the payload size in parentheses at the end of the comment, e.g.
//! `"700 Request accepted. Send size: (52)"`. The payload itself is a JSON object sent as exactly
//! the announced number of bytes once the receiver answers with `"900 Ready to receive"`.

use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::partition::Task;

/// Minimum capacity of a bulk payload receive buffer.
pub const MIN_RECEIVE_BUFFER: usize = 4096;

/// Returns the receive buffer capacity for a payload of the announced size.
pub fn receive_buffer_len(announced: usize) -> usize {
    announced.max(MIN_RECEIVE_BUFFER)
}

/// Protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// `100`: leader discovery request.
    Discover,
    /// `200`: discovery reply or sorted run receipt.
    Acknowledged,
    /// `300`: the recipient becomes the next leader.
    Promote,
    /// `400`: the coordinator requests a leader election.
    Elect,
    /// `500`: all work is finished.
    Finished,
    /// `600`: request for a task or for lists.
    Request,
    /// `700`: request accepted, a payload of the given size follows.
    Accepted(usize),
    /// `900`: ready to receive the announced payload.
    Ready,
}

impl Message {
    /// Returns the message code.
    pub fn code(&self) -> u16 {
        match self {
            Message::Discover => 100,
            Message::Acknowledged => 200,
            Message::Promote => 300,
            Message::Elect => 400,
            Message::Finished => 500,
            Message::Request => 600,
            Message::Accepted(_) => 700,
            Message::Ready => 900,
        }
    }

    /// Encodes the message as a newline terminated line.
    pub fn encode(&self) -> String {
        format!("{}\n", self)
    }

    /// Decodes a message from its text form. Surrounding whitespace is ignored.
    pub fn decode(text: &str) -> Result<Message, ProtocolError> {
        let text = text.trim();
        let code = text
            .split_whitespace()
            .next()
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| ProtocolError::Malformed(text.to_string()))?;

        let message = match code {
            100 => Message::Discover,
            200 => Message::Acknowledged,
            300 => Message::Promote,
            400 => Message::Elect,
            500 => Message::Finished,
            600 => Message::Request,
            700 => Message::Accepted(parse_size(text)?),
            900 => Message::Ready,
            code => return Err(ProtocolError::UnknownCode(code)),
        };

        return Ok(message);
    }

    /// Decodes a message from raw bytes.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Message, ProtocolError> {
        match std::str::from_utf8(bytes) {
            Ok(text) => Message::decode(text),
            Err(_) => Err(ProtocolError::Malformed(String::from_utf8_lossy(bytes).into_owned())),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Discover => write!(f, "100 Searching for Leader"),
            Message::Acknowledged => write!(f, "200 ok"),
            Message::Promote => write!(f, "300 Become a Leader"),
            Message::Elect => write!(f, "400 Initialize Leader Election"),
            Message::Finished => write!(f, "500 All done"),
            Message::Request => write!(f, "600 Give some task"),
            Message::Accepted(size) => write!(f, "700 Request accepted. Send size: ({})", size),
            Message::Ready => write!(f, "900 Ready to receive"),
        }
    }
}

/// Extracts the number between the first `(` and the following `)`.
fn parse_size(text: &str) -> Result<usize, ProtocolError> {
    let malformed = || ProtocolError::Malformed(text.to_string());

    let open = text.find('(').ok_or_else(malformed)?;
    let close = text[open + 1..].find(')').ok_or_else(malformed)? + open + 1;

    text[open + 1..close].trim().parse().map_err(|_| malformed())
}

/// Protocol error.
#[derive(Debug)]
pub enum ProtocolError {
    /// Common I/O error.
    IO(io::Error),
    /// Peer closed the connection.
    Closed,
    /// Message is not in `<code> <comment>` form.
    Malformed(String),
    /// Message code is not a part of the protocol.
    UnknownCode(u16),
    /// Message is valid but not expected at this point of the exchange.
    Unexpected(Message),
    /// Connection closed before the whole payload was received.
    Truncated { expected: usize, partial: Vec<u8> },
    /// Payload serialization or deserialization error.
    Payload(serde_json::Error),
}

impl Error for ProtocolError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            ProtocolError::IO(err) => Some(err),
            ProtocolError::Payload(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            ProtocolError::IO(err) => write!(f, "I/O operation failed: {}", err),
            ProtocolError::Closed => write!(f, "connection closed by peer"),
            ProtocolError::Malformed(text) => write!(f, "malformed message: {:?}", text),
            ProtocolError::UnknownCode(code) => write!(f, "unknown message code: {}", code),
            ProtocolError::Unexpected(message) => write!(f, "unexpected message: {}", message),
            ProtocolError::Truncated { expected, partial } => {
                write!(f, "payload truncated: {} of {} bytes received", partial.len(), expected)
            }
            ProtocolError::Payload(err) => write!(f, "payload format error: {}", err),
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::IO(err)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Payload(err)
    }
}

/// Bulk payload interface. Provides methods for converting a payload to and from its wire form.
pub trait Payload: Sized + Serialize + DeserializeOwned {
    /// Serializes the payload.
    fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes the payload.
    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Pair of sorted runs to be merged.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TaskPayload {
    pub index: usize,
    pub a: Vec<i64>,
    pub b: Vec<i64>,
    pub num_iter: u64,
}

impl Payload for TaskPayload {}

impl From<Task<i64>> for TaskPayload {
    fn from(task: Task<i64>) -> Self {
        TaskPayload {
            index: task.index,
            a: task.a,
            b: task.b,
            num_iter: task.epoch,
        }
    }
}

/// Merged run produced from a [`TaskPayload`].
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResultPayload {
    pub index: usize,
    pub sorted: Vec<i64>,
    pub num_iter: u64,
}

impl Payload for ResultPayload {}

/// Message channel over a byte stream.
///
/// Reads and writes are blocking as long as the underlying stream is.
pub struct Channel<S: Read + Write> {
    reader: io::BufReader<S>,
    peer: String,
}

impl<S: Read + Write> Channel<S> {
    /// Creates a channel over the stream. `peer` names the remote side in log records.
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Channel {
            reader: io::BufReader::with_capacity(MIN_RECEIVE_BUFFER, stream),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn get_ref(&self) -> &S {
        self.reader.get_ref()
    }

    pub fn get_mut(&mut self) -> &mut S {
        self.reader.get_mut()
    }

    /// Checks if received data is waiting in the channel buffer.
    pub fn has_buffered(&self) -> bool {
        !self.reader.buffer().is_empty()
    }

    /// Returns the number of received bytes available without reading the stream again,
    /// reading the stream once if the buffer is empty. Zero means the peer closed the connection.
    pub fn fill(&mut self) -> io::Result<usize> {
        Ok(self.reader.fill_buf()?.len())
    }

    /// Reads and discards everything until the peer closes the connection.
    pub fn drain(&mut self) -> io::Result<u64> {
        io::copy(&mut self.reader, &mut io::sink())
    }

    /// Sends a control message.
    pub fn send(&mut self, message: &Message) -> Result<(), ProtocolError> {
        log::debug!("message to {}: {}", self.peer, message);

        let stream = self.reader.get_mut();
        stream.write_all(message.encode().as_bytes())?;
        stream.flush()?;

        return Ok(());
    }

    /// Receives a control message.
    pub fn receive(&mut self) -> Result<Message, ProtocolError> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Err(ProtocolError::Closed);
        }

        log::debug!("message from {}: {}", self.peer, line.trim_end());

        Message::decode(&line)
    }

    /// Sends a bulk payload.
    pub fn send_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        log::debug!("sending {} payload bytes to {}", payload.len(), self.peer);

        let stream = self.reader.get_mut();
        stream.write_all(payload)?;
        stream.flush()?;

        return Ok(());
    }

    /// Receives exactly `size` bytes of a bulk payload.
    pub fn receive_payload(&mut self, size: usize) -> Result<Vec<u8>, ProtocolError> {
        let mut payload = Vec::with_capacity(receive_buffer_len(size));
        (&mut self.reader).take(size as u64).read_to_end(&mut payload)?;

        if payload.len() < size {
            return Err(ProtocolError::Truncated {
                expected: size,
                partial: payload,
            });
        }

        log::debug!("received {} payload bytes from {}", payload.len(), self.peer);

        return Ok(payload);
    }
}

#[cfg(test)]
mod test {
    use std::io::prelude::*;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    use rstest::*;

    use super::{
        receive_buffer_len, Channel, Message, Payload, ProtocolError, ResultPayload, TaskPayload, MIN_RECEIVE_BUFFER,
    };
    use crate::partition::Task;

    #[rstest]
    #[case("100 Searching for Leader", Message::Discover)]
    #[case("200 ok", Message::Acknowledged)]
    #[case("200 Sorted List Received\n", Message::Acknowledged)]
    #[case("300 Become a Leader", Message::Promote)]
    #[case("400 Initialize Leader Election", Message::Elect)]
    #[case("500 All done\n", Message::Finished)]
    #[case("600 Give some lists", Message::Request)]
    #[case("700 Request accepted. Send size: (52)", Message::Accepted(52))]
    #[case("700 Sending sorted list (7) (9)", Message::Accepted(7))]
    #[case("  900 Ready to receive\r\n", Message::Ready)]
    #[case("900", Message::Ready)]
    fn test_decode(#[case] text: &str, #[case] expected: Message) {
        assert_eq!(Message::decode(text).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("hello")]
    #[case("700 Send size: 52")]
    #[case("700 Send size: (abc)")]
    #[case("700 Send size: (52")]
    fn test_decode_malformed(#[case] text: &str) {
        assert!(matches!(Message::decode(text), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_unknown_code() {
        assert!(matches!(Message::decode("800 Whatever"), Err(ProtocolError::UnknownCode(800))));
    }

    #[test]
    fn test_encode() {
        assert_eq!(Message::Accepted(15).encode(), "700 Request accepted. Send size: (15)\n");
        assert_eq!(Message::Finished.encode(), "500 All done\n");
        assert_eq!(Message::decode(&Message::Promote.encode()).unwrap(), Message::Promote);
    }

    #[rstest]
    #[case(0, MIN_RECEIVE_BUFFER)]
    #[case(100, MIN_RECEIVE_BUFFER)]
    #[case(4096, 4096)]
    #[case(10000, 10000)]
    fn test_receive_buffer_len(#[case] announced: usize, #[case] expected: usize) {
        assert_eq!(receive_buffer_len(announced), expected);
    }

    #[test]
    fn test_payload_format() {
        let task = TaskPayload::from(Task {
            index: 4,
            a: vec![1, 3],
            b: vec![2],
            epoch: 1,
        });
        let json: serde_json::Value = serde_json::from_slice(&task.to_bytes().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"index": 4, "a": [1, 3], "b": [2], "num_iter": 1}));

        let result = ResultPayload::from_bytes(br#"{"index": 4, "sorted": [1, 2, 3], "num_iter": 1}"#).unwrap();
        assert_eq!(
            result,
            ResultPayload {
                index: 4,
                sorted: vec![1, 2, 3],
                num_iter: 1
            }
        );

        assert!(matches!(
            ResultPayload::from_bytes(b"500 All done"),
            Err(ProtocolError::Payload(_))
        ));
    }

    fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn test_channel_exchange() {
        let (client, server) = connected_pair();

        let peer = thread::spawn(move || {
            let mut channel = Channel::new(server, "client");
            let size = match channel.receive().unwrap() {
                Message::Accepted(size) => size,
                other => panic!("unexpected message: {}", other),
            };
            channel.send(&Message::Ready).unwrap();
            let payload = channel.receive_payload(size).unwrap();
            channel.send(&Message::Acknowledged).unwrap();
            payload
        });

        let mut channel = Channel::new(client, "server");
        let payload = b"{\"index\": 0, \"sorted\": [1], \"num_iter\": 0}".to_vec();
        channel.send(&Message::Accepted(payload.len())).unwrap();
        assert_eq!(channel.receive().unwrap(), Message::Ready);
        channel.send_payload(&payload).unwrap();
        assert_eq!(channel.receive().unwrap(), Message::Acknowledged);

        assert_eq!(peer.join().unwrap(), payload);
    }

    #[test]
    fn test_channel_truncated_payload() {
        let (mut client, server) = connected_pair();

        client.write_all(Message::Promote.encode().as_bytes()).unwrap();
        drop(client);

        let mut channel = Channel::new(server, "client");
        match channel.receive_payload(100) {
            Err(ProtocolError::Truncated { expected, partial }) => {
                assert_eq!(expected, 100);
                assert_eq!(Message::decode_bytes(&partial).unwrap(), Message::Promote);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(matches!(channel.receive(), Err(ProtocolError::Closed)));
    }
}
