//! Streams multiplexed on a circuit
//!
//! A `Stream` is the circuit's bookkeeping for one stream id: its flow
//! control windows and how much data has arrived for it. The `StreamMap`
//! owns every open stream plus the circuit-level windows, and lives behind
//! the circuit's stream-table lock.

use std::collections::HashMap;

use super::flow_control::{CircuitFlowControl, StreamFlowControl};
use crate::error::{Result, TorError};

/// One open stream
#[derive(Debug, Clone)]
pub struct Stream {
    stream_id: u16,
    flow_control: StreamFlowControl,
    cells_received: u64,
    bytes_received: u64,
}

impl Stream {
    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            flow_control: StreamFlowControl::new(stream_id),
            cells_received: 0,
            bytes_received: 0,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Data-received notification. Returns `true` when a stream-level
    /// SENDME is owed to the relay.
    pub fn received(&mut self, len: usize) -> bool {
        self.cells_received += 1;
        self.bytes_received += len as u64;
        self.flow_control.on_receive_data()
    }

    pub fn cells_received(&self) -> u64 {
        self.cells_received
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn flow_control(&self) -> &StreamFlowControl {
        &self.flow_control
    }

    pub fn flow_control_mut(&mut self) -> &mut StreamFlowControl {
        &mut self.flow_control
    }
}

/// Stream table for one circuit
#[derive(Debug, Default)]
pub struct StreamMap {
    streams: HashMap<u16, Stream>,
    circuit_window: CircuitFlowControl,
}

impl StreamMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream id; 0 is reserved for circuit-level messages
    pub fn insert(&mut self, stream_id: u16) -> Result<()> {
        if stream_id == 0 {
            return Err(TorError::Stream("stream id 0 is reserved".into()));
        }
        if self.streams.contains_key(&stream_id) {
            return Err(TorError::Stream(format!("stream {} already open", stream_id)));
        }
        self.streams.insert(stream_id, Stream::new(stream_id));
        Ok(())
    }

    pub fn get(&self, stream_id: u16) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn get_mut(&mut self, stream_id: u16) -> Option<&mut Stream> {
        self.streams.get_mut(&stream_id)
    }

    pub fn remove(&mut self, stream_id: u16) -> Option<Stream> {
        self.streams.remove(&stream_id)
    }

    pub fn contains(&self, stream_id: u16) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn circuit_window(&self) -> &CircuitFlowControl {
        &self.circuit_window
    }

    pub fn circuit_window_mut(&mut self) -> &mut CircuitFlowControl {
        &mut self.circuit_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut map = StreamMap::new();
        map.insert(5).unwrap();
        assert!(map.contains(5));
        assert!(map.insert(5).is_err());

        assert_eq!(map.remove(5).map(|s| s.stream_id()), Some(5));
        assert!(!map.contains(5));
        // Id is free again
        map.insert(5).unwrap();
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_stream_zero_reserved() {
        let mut map = StreamMap::new();
        assert!(map.insert(0).is_err());
        assert!(map.is_empty());
    }

    #[test]
    fn test_received_counts_and_sendme() {
        let mut stream = Stream::new(9);
        for i in 1..=50 {
            assert_eq!(stream.received(10), i == 50);
        }
        assert_eq!(stream.cells_received(), 50);
        assert_eq!(stream.bytes_received(), 500);
    }
}
