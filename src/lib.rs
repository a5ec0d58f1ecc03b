//! # Tor Onion Core
//!
//! The client half of a Tor circuit: the cell wire format, the onion crypto
//! layered over relay cells, and the per-circuit session state machine.
//!
//! ## Architecture
//!
//! ```text
//! application threads
//!   ↓ send_relay_cell / open_dir_stream / wait_for_*
//! Circuit (queue, streams, state)
//!   ↓ OnionCrypto (one cursor per hop, each direction)
//! Guard (connection to the first relay, supplied by the caller)
//!   ↓ CellCodec
//! Tor Network
//! ```
//!
//! ## Features
//!
//! - **Cells**: fixed and variable-length framing, VERSIONS through DESTROY
//! - **CREATE_FAST**: KDF-TOR key derivation with constant-time KH check
//! - **Onion crypto**: AES-128-CTR layers with SHA-1 running digests
//! - **Sessions**: thread-safe inbound queue with blocking waits, directory
//!   streams, SENDME flow control
//!
//! The transport itself (TLS link, reader loop, path selection) lives
//! outside this crate behind the [`protocol::Guard`] trait.

pub mod protocol;
mod error;

pub use error::{ErrorCode, Result, TorError};
pub use protocol::{
    Cell, CellCodec, CellCommand, ChanMsg, Circuit, CircuitConfig, CircuitState, DestroyReason,
    RelayCell, RelayCommand, RelayMsg,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
