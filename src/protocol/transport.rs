use std::io::{self, ErrorKind, Read, Write};

use bincode::error::{DecodeError, EncodeError};
use log::{debug, trace};
use thiserror::Error;

use crate::config::{RECV_TIMEOUT_KEY, SEND_TIMEOUT_KEY};

use super::{
    INT_SIZE_TAG, RequestFrame, ResponseFrame, WORD_SIZE, WireConfig, request_payload_len,
    response_len, wire_config,
};

/// Largest request a [`ProtocolTransport`] accepts unless told otherwise.
pub const DEFAULT_MAX_ATOMS: usize = 1_000_000_000;

/// Request payloads are buffered in steps of this size, so a large announced atom count only
/// costs memory once the bytes actually arrive.
const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to apply socket option '{key}': {source}")]
    TimeoutConfig {
        key: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("send timed out; raise '{key}' if the peer legitimately needs longer", key = SEND_TIMEOUT_KEY)]
    SendTimeout,

    #[error("receive timed out; raise '{key}' if the model legitimately needs longer", key = RECV_TIMEOUT_KEY)]
    RecvTimeout,

    #[error("send failed: {0}")]
    Send(#[source] io::Error),

    #[error("receive failed: {0}")]
    Recv(#[source] io::Error),

    #[error("peer closed the connection after {received} of {expected} bytes")]
    IncompleteTransfer { expected: usize, received: usize },

    #[error("failed to encode frame: {0}")]
    Serialize(#[from] EncodeError),

    #[error("failed to decode frame: {0}")]
    Deserialize(#[from] DecodeError),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::SendTimeout | Self::RecvTimeout)
    }
}

fn timed_out(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Frame codec over a bidirectional byte stream.
///
/// Clients call [`send_request`](Self::send_request) followed by
/// [`recv_response`](Self::recv_response); servers call [`read_request`](Self::read_request)
/// followed by [`write_response`](Self::write_response).
pub struct ProtocolTransport<T: Read + Write> {
    stream: T,
    config: WireConfig,
    max_atoms: usize,
}

impl<T: Read + Write> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self {
            stream,
            config: wire_config(),
            max_atoms: DEFAULT_MAX_ATOMS,
        }
    }

    /// Caps the atom count accepted by [`read_request`](Self::read_request).
    pub fn with_max_atoms(mut self, max_atoms: usize) -> Self {
        self.max_atoms = max_atoms;
        self
    }

    pub fn into_inner(self) -> T {
        self.stream
    }

    pub fn send_request(&mut self, frame: &RequestFrame) -> Result<(), TransportError> {
        let n_atoms = frame.n_atoms();
        debug!("sending request for {n_atoms} particles");

        let mut word = [0u8; WORD_SIZE];
        bincode::encode_into_slice(INT_SIZE_TAG, &mut word, self.config)?;
        self.send_all(&word)?;

        bincode::encode_into_slice(n_atoms as i32, &mut word, self.config)?;
        self.send_all(&word)?;

        let payload = frame.payload(self.config)?;
        self.send_all(&payload)?;
        self.stream.flush().map_err(|e| self.send_failure(e))?;

        trace!("request sent: {} payload bytes", payload.len());
        Ok(())
    }

    pub fn recv_response(&mut self, n_atoms: usize) -> Result<ResponseFrame, TransportError> {
        let expected = response_len(n_atoms);
        let mut buf = vec![0u8; expected];

        let received = self.recv_into(&mut buf)?;
        if received < expected {
            return Err(TransportError::IncompleteTransfer { expected, received });
        }

        let resp = ResponseFrame::decode(n_atoms, &buf, self.config)?;
        debug!("received response: energy {}", resp.energy);
        Ok(resp)
    }

    /// Reads the next request, or `None` if the peer closed the connection between frames.
    pub fn read_request(&mut self) -> Result<Option<RequestFrame>, TransportError> {
        let mut word = [0u8; WORD_SIZE];
        match self.recv_into(&mut word)? {
            0 => return Ok(None),
            n if n < WORD_SIZE => {
                return Err(TransportError::IncompleteTransfer {
                    expected: WORD_SIZE,
                    received: n,
                });
            }
            _ => {}
        }

        let tag: i32 = self.decode_word(&word)?;
        if tag != INT_SIZE_TAG {
            return Err(TransportError::Protocol(format!(
                "unsupported integer width {tag}"
            )));
        }

        self.recv_exact(&mut word)?;
        let n_atoms: i32 = self.decode_word(&word)?;
        let n_atoms = usize::try_from(n_atoms)
            .ok()
            .filter(|n| *n <= self.max_atoms)
            .ok_or_else(|| {
                TransportError::Protocol(format!(
                    "atom count {n_atoms} outside 0..={}",
                    self.max_atoms
                ))
            })?;

        let payload = self.recv_payload(request_payload_len(n_atoms))?;

        let frame = RequestFrame::decode_payload(n_atoms, &payload, self.config)?;
        debug!("received request for {n_atoms} particles");
        Ok(Some(frame))
    }

    pub fn write_response(&mut self, resp: &ResponseFrame) -> Result<(), TransportError> {
        let bytes = bincode::encode_to_vec(resp, self.config)?;
        self.send_all(&bytes)?;
        self.stream.flush().map_err(|e| self.send_failure(e))?;

        trace!("response sent: {} bytes", bytes.len());
        Ok(())
    }

    fn decode_word(&self, word: &[u8]) -> Result<i32, TransportError> {
        let (value, _) = bincode::decode_from_slice(word, self.config)?;
        Ok(value)
    }

    /// Writes the whole buffer, resuming after partial writes.
    fn send_all(&mut self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(TransportError::Send(io::Error::from(ErrorKind::WriteZero)));
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(self.send_failure(e)),
            }
        }
        Ok(())
    }

    fn send_failure(&self, e: io::Error) -> TransportError {
        if timed_out(e.kind()) {
            TransportError::SendTimeout
        } else {
            TransportError::Send(e)
        }
    }

    /// Fills `buf` until it is full or the peer closes; returns the number of bytes read.
    fn recv_into(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    trace!("received {filled}/{} bytes", buf.len());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if timed_out(e.kind()) => return Err(TransportError::RecvTimeout),
                Err(e) => return Err(TransportError::Recv(e)),
            }
        }
        Ok(filled)
    }

    fn recv_payload(&mut self, len: usize) -> Result<Vec<u8>, TransportError> {
        let mut payload = Vec::with_capacity(len.min(READ_CHUNK));
        let mut chunk = vec![0u8; len.min(READ_CHUNK)];

        while payload.len() < len {
            let want = (len - payload.len()).min(READ_CHUNK);
            let received = self.recv_into(&mut chunk[..want])?;
            payload.extend_from_slice(&chunk[..received]);
            if received < want {
                return Err(TransportError::IncompleteTransfer {
                    expected: len,
                    received: payload.len(),
                });
            }
        }
        Ok(payload)
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let received = self.recv_into(buf)?;
        if received < buf.len() {
            return Err(TransportError::IncompleteTransfer {
                expected: buf.len(),
                received,
            });
        }
        Ok(())
    }
}
