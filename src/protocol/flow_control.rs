//! SENDME flow control bookkeeping
//!
//! Each stream and each circuit keeps a send window (cells we may still
//! send) and a receive counter (cells until we owe the relay a SENDME).
//!
//! ## Window Values (tor-spec.txt section 7):
//!
//! - **Initial window:** 1000 cells (circuit), 500 cells (stream)
//! - **Increment:** 100 cells per SENDME (circuit), 50 cells (stream)

use crate::error::{Result, TorError};

/// Cells we may still send before the relay acknowledges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendWindow {
    window: u16,
    increment: u16,
}

impl SendWindow {
    fn new(initial: u16, increment: u16) -> Self {
        Self {
            window: initial,
            increment,
        }
    }

    pub fn available(&self) -> u16 {
        self.window
    }

    /// Take one cell out of the window
    pub fn take(&mut self) -> Option<()> {
        self.window = self.window.checked_sub(1)?;
        Some(())
    }

    /// Relay acknowledged one increment
    pub fn refill(&mut self) {
        self.window = self.window.saturating_add(self.increment);
    }
}

/// Cells received since our last SENDME
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvWindow {
    until_sendme: u16,
    increment: u16,
}

impl RecvWindow {
    fn new(increment: u16) -> Self {
        Self {
            until_sendme: increment,
            increment,
        }
    }

    /// Count a delivered cell; `true` when a SENDME is now owed
    pub fn on_receive(&mut self) -> bool {
        self.until_sendme = self.until_sendme.saturating_sub(1);
        if self.until_sendme == 0 {
            self.until_sendme = self.increment;
            return true;
        }
        false
    }
}

/// Circuit-level flow control
#[derive(Debug, Clone)]
pub struct CircuitFlowControl {
    pub send: SendWindow,
    pub recv: RecvWindow,
}

impl CircuitFlowControl {
    /// Initial circuit window size (tor-spec.txt: 1000 cells)
    pub const INITIAL_WINDOW: u16 = 1000;

    /// Window increment per SENDME (tor-spec.txt: 100 cells)
    pub const WINDOW_INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            send: SendWindow::new(Self::INITIAL_WINDOW, Self::WINDOW_INCREMENT),
            recv: RecvWindow::new(Self::WINDOW_INCREMENT),
        }
    }

    /// Count an outgoing DATA cell
    pub fn on_send(&mut self) -> Result<()> {
        self.send.take().ok_or_else(|| {
            TorError::Stream("Circuit send window exhausted - cannot send".into())
        })
    }

    /// Count an incoming DATA cell; `true` if a circuit SENDME is owed
    pub fn on_receive(&mut self) -> bool {
        let owed = self.recv.on_receive();
        if owed {
            log::debug!("Circuit recv window depleted, SENDME owed");
        }
        owed
    }

    pub fn on_sendme_received(&mut self) {
        self.send.refill();
        log::debug!("Circuit send window: {}", self.send.available());
    }
}

impl Default for CircuitFlowControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level flow control
#[derive(Debug, Clone)]
pub struct StreamFlowControl {
    pub stream_id: u16,
    pub send: SendWindow,
    pub recv: RecvWindow,
}

impl StreamFlowControl {
    /// Initial stream window size (tor-spec.txt: 500 cells)
    pub const INITIAL_WINDOW: u16 = 500;

    /// Window increment per SENDME (tor-spec.txt: 50 cells)
    pub const WINDOW_INCREMENT: u16 = 50;

    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            send: SendWindow::new(Self::INITIAL_WINDOW, Self::WINDOW_INCREMENT),
            recv: RecvWindow::new(Self::WINDOW_INCREMENT),
        }
    }

    /// Count an outgoing DATA cell
    pub fn on_send(&mut self) -> Result<()> {
        self.send.take().ok_or_else(|| {
            TorError::Stream(format!("Stream {} send window exhausted", self.stream_id))
        })
    }

    /// Count an incoming DATA cell; `true` if a stream SENDME is owed
    pub fn on_receive_data(&mut self) -> bool {
        let owed = self.recv.on_receive();
        if owed {
            log::debug!("Stream {} recv window depleted, SENDME owed", self.stream_id);
        }
        owed
    }

    pub fn on_sendme_received(&mut self) {
        self.send.refill();
        log::debug!(
            "Stream {} send window: {}",
            self.stream_id,
            self.send.available()
        );
    }

    pub fn is_blocked(&self) -> bool {
        self.send.available() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circuit_flow_control_window_exhaustion() {
        let mut fc = CircuitFlowControl::new();

        for _ in 0..1000 {
            fc.on_send().unwrap();
        }
        assert!(fc.on_send().is_err());

        fc.on_sendme_received();
        assert_eq!(fc.send.available(), 100);
    }

    #[test]
    fn test_circuit_flow_control_receive() {
        let mut fc = CircuitFlowControl::new();

        for i in 1..=100 {
            assert_eq!(fc.on_receive(), i == 100);
        }
        // Counter restarts after each SENDME
        for i in 1..=100 {
            assert_eq!(fc.on_receive(), i == 100);
        }
    }

    #[test]
    fn test_stream_flow_control_blocking() {
        let mut fc = StreamFlowControl::new(1);

        for _ in 0..500 {
            assert!(!fc.is_blocked());
            fc.on_send().unwrap();
        }

        assert!(fc.is_blocked());
        assert!(fc.on_send().is_err());

        fc.on_sendme_received();
        assert!(!fc.is_blocked());
        assert_eq!(fc.send.available(), 50);
    }

    #[test]
    fn test_interleaved_send_receive() {
        let mut fc = StreamFlowControl::new(1);

        for _ in 0..250 {
            fc.on_send().unwrap();
        }
        assert_eq!(fc.send.available(), 250);

        for i in 0..50 {
            assert_eq!(fc.on_receive_data(), i == 49);
        }

        // Receiving does not touch the send side
        assert_eq!(fc.send.available(), 250);
    }
}
