//! Blocking SSH agent client for the identity listing.
//!
//! One `REQUEST_IDENTITIES` message and its reply is enough to tell
//! "nothing listening", "reachable but locked" and "serving N keys" apart.
//! Messages are the `ssh_agent_lib::proto` types; each travels behind a
//! big-endian `u32` length prefix.

use ssh_agent_lib::proto::{Request, Response};
use ssh_encoding::{Decode, Encode};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub use ssh_agent_lib::proto::Identity;

/// Messages larger than this are treated as protocol errors.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// Default per-candidate bound on a probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[source] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("message of {0} bytes exceeds limit")]
    TooLarge(usize),

    #[error("encoding failed: {0}")]
    Encode(#[source] ssh_encoding::Error),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected reply to identity request")]
    UnexpectedReply,
}

/// What the agent said to a listing request.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentReply {
    Identities(Vec<Identity>),
    /// The agent answered `FAILURE`. Reachable, but not serving keys.
    Failure,
}

impl AgentReply {
    pub fn key_count(&self) -> usize {
        match self {
            AgentReply::Identities(ids) => ids.len(),
            AgentReply::Failure => 0,
        }
    }
}

/// Ask the agent at `path` for its identities.
pub fn request_identities(path: &Path, timeout: Duration) -> Result<AgentReply, ProbeError> {
    let mut stream = UnixStream::connect(path).map_err(ProbeError::Connect)?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(ProbeError::Transport)?;
    stream
        .set_write_timeout(Some(timeout))
        .map_err(ProbeError::Transport)?;

    write_message(&mut stream, &Request::RequestIdentities)?;
    let body = read_message(&mut stream)?;
    match decode::<Response>(&body)? {
        Response::IdentitiesAnswer(ids) => Ok(AgentReply::Identities(ids)),
        Response::Failure => Ok(AgentReply::Failure),
        _ => Err(ProbeError::UnexpectedReply),
    }
}

/// Write one length-prefixed message.
pub fn write_message(out: &mut impl Write, message: &impl Encode) -> Result<(), ProbeError> {
    let len = message.encoded_len().map_err(ProbeError::Encode)?;
    let mut buf = Vec::with_capacity(len + 4);
    (len as u32).encode(&mut buf).map_err(ProbeError::Encode)?;
    message.encode(&mut buf).map_err(ProbeError::Encode)?;
    out.write_all(&buf).map_err(ProbeError::Transport)
}

/// Read one length-prefixed message body.
pub fn read_message(input: &mut impl Read) -> Result<Vec<u8>, ProbeError> {
    let mut len_buf = [0u8; 4];
    input
        .read_exact(&mut len_buf)
        .map_err(ProbeError::Transport)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 {
        return Err(ProbeError::Malformed("empty message".into()));
    }
    if len > MAX_MESSAGE_LEN {
        return Err(ProbeError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    input.read_exact(&mut body).map_err(ProbeError::Transport)?;
    Ok(body)
}

/// Decode a message body with its length prefix already stripped.
pub fn decode<T>(body: &[u8]) -> Result<T, ProbeError>
where
    T: Decode,
    T::Error: std::fmt::Display,
{
    let mut reader = body;
    T::decode(&mut reader).map_err(|e| ProbeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_identity, FakeAgent, FakeReply};
    use std::os::unix::net::UnixListener;

    fn framed(message: &impl Encode) -> Vec<u8> {
        let mut buf = Vec::new();
        write_message(&mut buf, message).unwrap();
        buf
    }

    #[test]
    fn request_is_a_single_type_byte() {
        assert_eq!(framed(&Request::RequestIdentities), [0, 0, 0, 1, 11]);
    }

    #[test]
    fn identities_answer_survives_the_wire() {
        let frame = framed(&Response::IdentitiesAnswer(vec![
            test_identity("work"),
            test_identity("home"),
        ]));
        let body = read_message(&mut frame.as_slice()).unwrap();
        match decode::<Response>(&body).unwrap() {
            Response::IdentitiesAnswer(ids) => {
                assert_eq!(ids.len(), 2);
                assert_eq!(ids[0].comment, "work");
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[test]
    fn rejects_truncated_and_oversized() {
        let frame = framed(&Response::IdentitiesAnswer(vec![test_identity("x")]));
        let body = &frame[4..frame.len() - 2];
        assert!(matches!(decode::<Response>(body), Err(ProbeError::Malformed(_))));

        let huge = ((MAX_MESSAGE_LEN + 1) as u32).to_be_bytes();
        assert!(matches!(
            read_message(&mut huge.as_slice()),
            Err(ProbeError::TooLarge(_))
        ));
        assert!(matches!(
            read_message(&mut [0u8, 0, 0, 0].as_slice()),
            Err(ProbeError::Malformed(_))
        ));
    }

    #[test]
    fn empty_answer_means_locked_not_absent() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::with_keys(dir.path().join("agent.sock"), 0).unwrap();
        let reply = request_identities(agent.path(), DEFAULT_PROBE_TIMEOUT).unwrap();
        assert_eq!(reply, AgentReply::Identities(vec![]));
    }

    #[test]
    fn failure_counts_as_zero_keys() {
        let dir = tempfile::tempdir().unwrap();
        let agent = FakeAgent::start(dir.path().join("agent.sock"), FakeReply::Failure).unwrap();
        let reply = request_identities(agent.path(), DEFAULT_PROBE_TIMEOUT).unwrap();
        assert_eq!(reply, AgentReply::Failure);
        assert_eq!(reply.key_count(), 0);
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = request_identities(&dir.path().join("nope.sock"), DEFAULT_PROBE_TIMEOUT)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)));
    }

    #[test]
    fn silent_listener_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mute.sock");
        let _listener = UnixListener::bind(&path).unwrap();
        let start = std::time::Instant::now();
        let err = request_identities(&path, Duration::from_millis(100)).unwrap_err();
        assert!(matches!(err, ProbeError::Transport(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
