//! Collaborators a circuit talks to
//!
//! The live relay connection, the relays on the path, and the network
//! consensus are owned elsewhere; a circuit only sees them through these
//! traits.

use std::sync::Weak;

use super::cell::Cell;
use super::circuit::Circuit;

/// A relay on a circuit's path
pub trait Relay: Send + Sync {
    /// Flow-control hook: DATA arrived on `circuit` from this relay.
    ///
    /// Called with the circuit's stream table locked; implementations must
    /// not call back into the circuit.
    fn received(&self, circuit: &Circuit) {
        let _ = circuit;
    }
}

/// The live connection to the first hop
pub trait Guard: Relay {
    /// Put a cell on the wire. `false` means the transport failed.
    ///
    /// Relay cells are handed over with the circuit's forward crypto locked
    /// so that wire order matches keystream order. An implementation may
    /// deliver inbound cells to the circuit from here; SENDMEs those cells
    /// make due go out once this call has returned.
    fn send_cell(&self, cell: &Cell) -> bool;

    /// Register a circuit so inbound cells for `circ_id` reach it
    fn add_circuit(&self, circ_id: u32, circuit: Weak<Circuit>);

    /// Close the underlying connection
    fn terminate(&self) -> bool;
}

/// The part of the network consensus a circuit cares about
pub trait Consensus {
    /// Lowest SENDME version we are required to emit
    fn sendme_emit_min_version(&self) -> u8;
}
