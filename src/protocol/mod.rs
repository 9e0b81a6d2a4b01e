//! Client-server evaluation protocol.
//!
//! This module defines the binary protocol spoken between a simulation host and a remote model
//! process: one request frame carrying an atomic configuration, answered by one response frame
//! carrying the energy and the per-particle forces.
//!
//! # Overview
//!
//! Every evaluation step is a strict request/response exchange over a stream socket:
//!
//! ```text
//! Idle -> Connecting -> Sending -> Receiving -> Idle
//! ```
//!
//! When a connection is reused across steps the `Connecting` phase is skipped. A request is never
//! pipelined behind another one; the response of a step is consumed completely before the next
//! request is written.
//!
//! # Key Components
//!
//! - [`Endpoint`] and [`Connection`]: where to connect and the socket that results from it.
//! - [`ConnectionManager`]: drives one exchange per step under a [`ReusePolicy`].
//! - [`ProtocolTransport`]: the frame codec; writes requests and reads responses over any
//!   `Read + Write` stream, tolerating partial reads and writes.
//! - [`RequestFrame`] / [`ResponseFrame`]: the two frame types.
//! - [`ModelServer`]: a reference server answering requests with a [`Potential`].
//!
//! # Binary Format
//!
//! Integers are 4 bytes, floats are 8 byte IEEE-754, everything in native byte order with no
//! padding:
//!
//! ```text
//! request:  i32 int_size_tag (= 4) | i32 n_atoms | i32[n] species | f64[3n] coordinates | i32[n] contributing
//! response: f64 energy | f64[3n] forces
//! ```
//!
//! The response carries no atom count; its length is implied by the request that preceded it.
//!
//! # See Also
//!
//! - [`model`](crate::model): the host-facing wrapper built on top of this module.
//! - [`config`](crate::config): where endpoints and timeouts are read from.
mod connection;
mod request;
mod response;
mod server;
mod thread;
mod transport;

#[cfg(target_endian = "big")]
use bincode::config::BigEndian as NativeEndian;
#[cfg(target_endian = "little")]
use bincode::config::LittleEndian as NativeEndian;
use bincode::config::{Configuration, Fixint};
use thread::ThreadPool;

pub use connection::{Connection, ConnectionManager, DEFAULT_TIMEOUT, Endpoint, ReusePolicy};
pub use request::{FrameError, RequestFrame};
pub use response::ResponseFrame;
pub use server::{ModelServer, Potential, PotentialError, ServerOptions};
pub use transport::{ProtocolTransport, TransportError};

/// Size of every integer word on the wire.
pub const WORD_SIZE: usize = size_of::<i32>();

/// Size of every floating point value on the wire.
pub const FLOAT_SIZE: usize = size_of::<f64>();

/// Value of the leading word of every request.
pub const INT_SIZE_TAG: i32 = WORD_SIZE as i32;

pub(crate) type WireConfig = Configuration<NativeEndian, Fixint>;

/// Fixed-width, native byte order encoding used for every value on the wire.
pub(crate) fn wire_config() -> WireConfig {
    let config = bincode::config::standard().with_fixed_int_encoding();

    #[cfg(target_endian = "little")]
    let config = config.with_little_endian();
    #[cfg(target_endian = "big")]
    let config = config.with_big_endian();

    config
}

/// Number of payload bytes following the two header words of a request.
pub fn request_payload_len(n_atoms: usize) -> usize {
    n_atoms * (2 * WORD_SIZE + 3 * FLOAT_SIZE)
}

/// Number of bytes in the response to a request for `n_atoms` particles.
pub fn response_len(n_atoms: usize) -> usize {
    FLOAT_SIZE + n_atoms * 3 * FLOAT_SIZE
}
