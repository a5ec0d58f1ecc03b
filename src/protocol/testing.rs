//! In-memory guard for unit tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::cell::Cell;
use super::circuit::Circuit;
use super::peer::{Guard, Relay};

/// Records everything a circuit hands it. Answers only when a cell has been
/// staged with [`FakeGuard::deliver_during_next_send`].
pub(crate) struct FakeGuard {
    sent: Mutex<Vec<Cell>>,
    staged: Mutex<Option<(Weak<Circuit>, Cell)>>,
    registered: Mutex<Vec<u32>>,
    terminations: AtomicUsize,
    send_ok: AtomicBool,
}

impl FakeGuard {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            staged: Mutex::new(None),
            registered: Mutex::new(Vec::new()),
            terminations: AtomicUsize::new(0),
            send_ok: AtomicBool::new(true),
        })
    }

    pub(crate) fn sent(&self) -> Vec<Cell> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn registered(&self) -> Vec<u32> {
        self.registered.lock().unwrap().clone()
    }

    pub(crate) fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_sends(&self) {
        self.send_ok.store(false, Ordering::SeqCst);
    }

    /// Feed `cell` to `circuit` from inside the next successful send, the
    /// way a guard with an inline reader would
    pub(crate) fn deliver_during_next_send(&self, circuit: &Arc<Circuit>, cell: Cell) {
        *self.staged.lock().unwrap() = Some((Arc::downgrade(circuit), cell));
    }
}

impl Relay for FakeGuard {}

impl Guard for FakeGuard {
    fn send_cell(&self, cell: &Cell) -> bool {
        if !self.send_ok.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().unwrap().push(cell.clone());

        let staged = self.staged.lock().unwrap().take();
        if let Some((circuit, inbound)) = staged {
            if let Some(circuit) = circuit.upgrade() {
                let _ = circuit.add_cell(inbound);
            }
        }
        true
    }

    fn add_circuit(&self, circ_id: u32, _circuit: Weak<Circuit>) {
        self.registered.lock().unwrap().push(circ_id);
    }

    fn terminate(&self) -> bool {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        true
    }
}
