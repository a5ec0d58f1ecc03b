//! Tor protocol implementation
//!
//! This module implements the client side of a Tor circuit:
//! - Cell protocol (fixed and variable-length channel cells)
//! - Relay cell layout and messages
//! - KDF-TOR / CREATE_FAST key derivation
//! - Onion crypto (layered encryption and running digests)
//! - Circuit session (handshake, queueing, streams, teardown)
//! - SENDME flow control

mod cell;
mod circuit;
mod codec;
mod crypto;
mod flow_control;
mod peer;
mod relay;
mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use cell::{
    Cell, CellCommand, CertEntry, ChanMsg, DestroyReason, NetAddr, RelayBody, CELL_BODY_LEN,
    FAST_KEY_LEN,
};
pub use circuit::{Circuit, CircuitConfig, CircuitState, Incoming, CLIENT_CIRC_ID_FLAG};
pub use codec::CellCodec;
pub use crypto::{
    create_fast_reply, kdf_tor, CircuitKeys, CryptState, HopKeys, OnionCrypto, CIPHER_KEY_LEN,
    DIGEST_LEN,
};
pub use flow_control::{CircuitFlowControl, RecvWindow, SendWindow, StreamFlowControl};
pub use peer::{Consensus, Guard, Relay};
pub use relay::{
    RelayCell, RelayCommand, RelayMsg, DIGEST_RANGE, END_REASON_DONE, END_REASON_MISC,
    RELAY_HEADER_LEN, RELAY_PAYLOAD_LEN, SENDME_TAG_LEN,
};
pub use stream::{Stream, StreamMap};
