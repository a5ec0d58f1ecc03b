//! Circuit session state machine
//!
//! A `Circuit` owns everything needed to talk over one circuit id on a
//! guard connection: the per-hop onion crypto, the queue of received cells
//! waiting to be collected, and the table of open streams.
//!
//! Inbound cells are fed in with [`Circuit::add_cell`] from the connection's
//! reader; application threads collect them with the `take_*` / `wait_for_*`
//! family and send with [`Circuit::send_cell`] / [`Circuit::send_relay_cell`].
//!
//! Locks are always taken in this order, never the reverse:
//! forward crypto → backward crypto → streams → pending. The queue of owed
//! SENDMEs is a leaf lock, held only to push or pop.
//!
//! SENDMEs owed by inbound DATA are queued and sent by whichever thread can
//! take the forward crypto. A guard delivering cells from inside its own
//! `send_cell` therefore never re-enters the forward lock: the outer send
//! flushes the queue once the guard returns.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::cell::{Cell, CellCommand, ChanMsg, DestroyReason, FAST_KEY_LEN};
use super::crypto::{HopKeys, OnionCrypto, DIGEST_LEN};
use super::peer::{Consensus, Guard, Relay};
use super::relay::{RelayCell, RelayCommand, RelayMsg, END_REASON_DONE, RELAY_PAYLOAD_LEN};
use super::stream::StreamMap;
use crate::error::{Result, TorError};

/// High bit marking a circuit id as chosen by the client
pub const CLIENT_CIRC_ID_FLAG: u32 = 0x8000_0000;

/// Configuration for a circuit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// How long `create_fast`, `open_dir_stream` and `recv_data` wait for
    /// the relay (`None` waits forever)
    pub wait_timeout: Option<Duration>,
    /// Send SENDMEs automatically when a receive window depletes
    pub auto_sendme: bool,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Some(Duration::from_secs(60)),
            auto_sendme: true,
        }
    }
}

/// Connection state of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Handshake not started or in progress
    NotSet,
    /// Keys established, cells may flow
    Connected,
    /// Terminal: torn down locally (NONE) or by the network
    Destroyed(DestroyReason),
}

/// A received item waiting in the pending queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    /// A channel cell that needed no onion crypto
    Cell(Cell),
    /// A decrypted and verified relay message
    Relay(RelayCell),
}

impl Incoming {
    /// Top-level cell command this item arrived as
    pub fn command(&self) -> CellCommand {
        match self {
            Incoming::Cell(cell) => cell.command(),
            Incoming::Relay(_) => CellCommand::Relay,
        }
    }
}

/// Queue of received cells plus the state waiters care about
struct Pending {
    cells: VecDeque<Incoming>,
    state: CircuitState,
}

/// A client circuit
pub struct Circuit {
    /// Circuit ID, with the client bit set
    circ_id: u32,

    /// Connection to the first hop
    guard: Arc<dyn Guard>,

    /// Hops after the guard
    relays: Vec<Arc<dyn Relay>>,

    config: CircuitConfig,

    /// Forward (client → relay) cursors, one per keyed hop
    forward: Mutex<OnionCrypto>,

    /// Backward (relay → client) cursors, one per keyed hop
    backward: Mutex<OnionCrypto>,

    pending: Mutex<Pending>,

    /// Signalled whenever `pending` changes
    arrived: Condvar,

    streams: Mutex<StreamMap>,

    /// SENDMEs owed to the relay: (stream id, backward digest when owed)
    sendmes: Mutex<VecDeque<(u16, [u8; DIGEST_LEN])>>,

    /// SENDME version for stream-level acknowledgements
    sendme_version: AtomicU8,
}

/// Lock a mutex, carrying on with the data if another thread panicked
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Circuit {
    /// Create a circuit on `guard` that still needs its CREATE_FAST handshake
    pub fn new(circ_id: u32, guard: Arc<dyn Guard>) -> Arc<Self> {
        Self::with_config(circ_id, guard, CircuitConfig::default())
    }

    /// Create with custom config
    pub fn with_config(circ_id: u32, guard: Arc<dyn Guard>, config: CircuitConfig) -> Arc<Self> {
        Self::build(
            circ_id,
            guard,
            Vec::new(),
            OnionCrypto::default(),
            OnionCrypto::default(),
            CircuitState::NotSet,
            config,
        )
    }

    /// Create a circuit whose keys were established elsewhere.
    ///
    /// `keys[0]` belongs to the guard and `keys[i + 1]` to `relays[i]`.
    pub fn with_hops(
        circ_id: u32,
        guard: Arc<dyn Guard>,
        relays: Vec<Arc<dyn Relay>>,
        keys: Vec<HopKeys>,
        config: CircuitConfig,
    ) -> Result<Arc<Self>> {
        if keys.len() != relays.len() + 1 {
            return Err(TorError::InvalidState(format!(
                "{} hops but {} sets of keys",
                relays.len() + 1,
                keys.len()
            )));
        }

        let mut forward = OnionCrypto::default();
        let mut backward = OnionCrypto::default();
        for hop in keys {
            let (f, b) = hop.into_layers();
            forward.push(f);
            backward.push(b);
        }

        Ok(Self::build(
            circ_id,
            guard,
            relays,
            forward,
            backward,
            CircuitState::Connected,
            config,
        ))
    }

    fn build(
        circ_id: u32,
        guard: Arc<dyn Guard>,
        relays: Vec<Arc<dyn Relay>>,
        forward: OnionCrypto,
        backward: OnionCrypto,
        state: CircuitState,
        config: CircuitConfig,
    ) -> Arc<Self> {
        let circuit = Arc::new(Self {
            circ_id: circ_id | CLIENT_CIRC_ID_FLAG,
            guard,
            relays,
            config,
            forward: Mutex::new(forward),
            backward: Mutex::new(backward),
            pending: Mutex::new(Pending {
                cells: VecDeque::new(),
                state,
            }),
            arrived: Condvar::new(),
            streams: Mutex::new(StreamMap::new()),
            sendmes: Mutex::new(VecDeque::new()),
            sendme_version: AtomicU8::new(0),
        });

        log::debug!(
            "Circuit {:#x} created with {} hop(s)",
            circuit.circ_id,
            circuit.hop_count()
        );
        circuit
            .guard
            .add_circuit(circuit.circ_id, Arc::downgrade(&circuit));
        circuit
    }

    /// Circuit id as it appears on the wire
    pub fn circ_id(&self) -> u32 {
        self.circ_id
    }

    pub fn state(&self) -> CircuitState {
        lock(&self.pending).state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == CircuitState::Connected
    }

    /// Number of relays on the path, guard included
    pub fn hop_count(&self) -> usize {
        self.relays.len() + 1
    }

    /// Number of hops with established keys
    pub fn keyed_hop_count(&self) -> usize {
        // Whoever holds the forward lock must flush owed SENDMEs after it
        lock(&self.backward).hop_count()
    }

    pub fn has_stream(&self, stream_id: u16) -> bool {
        lock(&self.streams).contains(stream_id)
    }

    pub fn stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Number of received items not yet collected
    pub fn pending_len(&self) -> usize {
        lock(&self.pending).cells.len()
    }

    pub fn sendme_version(&self) -> u8 {
        self.sendme_version.load(Ordering::Relaxed)
    }

    /// Pick up parameters negotiated through the consensus
    pub fn update_from_consensus(&self, consensus: &dyn Consensus) {
        let version = consensus.sendme_emit_min_version();
        self.sendme_version.store(version, Ordering::Relaxed);
        log::debug!("Circuit {:#x} SENDME version {}", self.circ_id, version);
    }

    // ===== Inbound =====

    /// Deliver a cell received from the guard for this circuit.
    ///
    /// Relay cells are decrypted and verified here, strictly in call order.
    /// Any error is fatal to the circuit: it has already been torn down
    /// when this returns `Err`, and the caller should unregister it. That
    /// covers a failure to send a SENDME this cell made due.
    pub fn add_cell(&self, cell: Cell) -> Result<()> {
        if let CircuitState::Destroyed(reason) = self.state() {
            log::debug!(
                "Circuit {:#x} dropping {:?} cell, destroyed ({})",
                self.circ_id,
                cell.command(),
                reason.name()
            );
            return Ok(());
        }

        let mut sendmes_owed = Vec::new();
        if let Err(e) = self.deliver(cell, &mut sendmes_owed) {
            self.tear_down(&e);
            return Err(e);
        }

        if sendmes_owed.is_empty() {
            return Ok(());
        }
        lock(&self.sendmes).extend(sendmes_owed);
        self.flush_sendmes()
    }

    fn tear_down(&self, cause: &TorError) {
        log::error!("Circuit {:#x} torn down: {}", self.circ_id, cause);
        if let Err(send_err) = self.destroy() {
            log::warn!(
                "Circuit {:#x} could not send DESTROY: {}",
                self.circ_id,
                send_err
            );
        }
    }

    fn deliver(
        &self,
        cell: Cell,
        sendmes_owed: &mut Vec<(u16, [u8; DIGEST_LEN])>,
    ) -> Result<()> {
        match cell.msg() {
            ChanMsg::Relay { body } => {
                let body = **body;
                let mut backward = lock(&self.backward);
                let relay = backward.open(body)?;
                log::debug!(
                    "Circuit {:#x} received relay cmd {} on stream {}",
                    self.circ_id,
                    relay.command_byte(),
                    relay.stream_id
                );
                // Still holding the backward lock: queue order == arrival order
                let mut owed = Vec::new();
                self.dispatch_relay(relay, &mut owed)?;
                let tag = backward.last_digest().unwrap_or_default();
                sendmes_owed.extend(owed.into_iter().map(|stream_id| (stream_id, tag)));
                Ok(())
            }
            ChanMsg::Destroy { reason } => {
                self.destroyed(*reason);
                self.push(Incoming::Cell(cell));
                Ok(())
            }
            _ => {
                self.push(Incoming::Cell(cell));
                Ok(())
            }
        }
    }

    fn dispatch_relay(&self, relay: RelayCell, sendmes_owed: &mut Vec<u16>) -> Result<()> {
        let stream_id = relay.stream_id;
        match &relay.msg {
            RelayMsg::Data(data) => {
                let mut streams = lock(&self.streams);
                let stream_owes = streams
                    .get_mut(stream_id)
                    .ok_or(TorError::UnknownStream(stream_id))?
                    .received(data.len());
                let circuit_owes = streams.circuit_window_mut().on_receive();
                self.notify_last_hop();
                drop(streams);

                if self.config.auto_sendme {
                    if stream_owes {
                        sendmes_owed.push(stream_id);
                    }
                    if circuit_owes {
                        sendmes_owed.push(0);
                    }
                }
            }
            RelayMsg::End { reason } => {
                if lock(&self.streams).remove(stream_id).is_some() {
                    log::info!(
                        "Circuit {:#x} stream {} ended (reason {})",
                        self.circ_id,
                        stream_id,
                        reason
                    );
                }
            }
            RelayMsg::Sendme { .. } => {
                let mut streams = lock(&self.streams);
                if stream_id == 0 {
                    streams.circuit_window_mut().on_sendme_received();
                } else if let Some(stream) = streams.get_mut(stream_id) {
                    stream.flow_control_mut().on_sendme_received();
                }
                return Ok(());
            }
            _ => {}
        }

        self.push(Incoming::Relay(relay));
        Ok(())
    }

    /// Tell the far end of the path that data arrived
    fn notify_last_hop(&self) {
        match self.relays.last() {
            Some(relay) => relay.received(self),
            None => self.guard.received(self),
        }
    }

    fn push(&self, item: Incoming) {
        lock(&self.pending).cells.push_back(item);
        self.arrived.notify_all();
    }

    fn set_state(&self, state: CircuitState) {
        let mut pending = lock(&self.pending);
        if let CircuitState::Destroyed(_) = pending.state {
            return;
        }
        pending.state = state;
        drop(pending);
        self.arrived.notify_all();
    }

    // ===== Retrieval =====

    /// Remove the first queued relay message for `stream_id` whose command
    /// is one of `commands`
    pub fn take_relay_cell(&self, stream_id: u16, commands: &[RelayCommand]) -> Option<RelayCell> {
        Self::take_relay_from(&mut lock(&self.pending).cells, stream_id, commands)
    }

    /// Remove the first queued channel cell with the given command
    pub fn take_cell(&self, command: CellCommand) -> Option<Cell> {
        Self::take_cell_from(&mut lock(&self.pending).cells, command)
    }

    /// Block until a relay message matching `take_relay_cell` arrives.
    ///
    /// Returns `None` straight away if the circuit is not connected and
    /// nothing is queued, once the circuit is destroyed with no match
    /// queued, or when `timeout` expires.
    pub fn wait_for_relay_cell(
        &self,
        stream_id: u16,
        commands: &[RelayCommand],
        timeout: Option<Duration>,
    ) -> Option<RelayCell> {
        self.wait_for(timeout, true, |cells| {
            Self::take_relay_from(cells, stream_id, commands)
        })
    }

    /// Block until a channel cell with `command` arrives.
    ///
    /// Unlike `wait_for_relay_cell` this also waits on a circuit that is
    /// not connected yet, since that is where the handshake reply lands.
    pub fn wait_for_cell(&self, command: CellCommand, timeout: Option<Duration>) -> Option<Cell> {
        self.wait_for(timeout, false, |cells| Self::take_cell_from(cells, command))
    }

    fn wait_for<T>(
        &self,
        timeout: Option<Duration>,
        give_up_when_idle: bool,
        mut take: impl FnMut(&mut VecDeque<Incoming>) -> Option<T>,
    ) -> Option<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = lock(&self.pending);

        if give_up_when_idle
            && pending.state != CircuitState::Connected
            && pending.cells.is_empty()
        {
            return None;
        }

        loop {
            if let Some(found) = take(&mut pending.cells) {
                return Some(found);
            }
            if let CircuitState::Destroyed(_) = pending.state {
                return None;
            }

            pending = match deadline {
                None => self
                    .arrived
                    .wait(pending)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.arrived
                        .wait_timeout(pending, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn take_relay_from(
        cells: &mut VecDeque<Incoming>,
        stream_id: u16,
        commands: &[RelayCommand],
    ) -> Option<RelayCell> {
        let pos = cells.iter().position(|item| match item {
            Incoming::Relay(relay) => {
                relay.stream_id == stream_id
                    && commands.iter().any(|c| *c as u8 == relay.command_byte())
            }
            Incoming::Cell(_) => false,
        })?;
        match cells.remove(pos)? {
            Incoming::Relay(relay) => Some(relay),
            Incoming::Cell(_) => None,
        }
    }

    fn take_cell_from(cells: &mut VecDeque<Incoming>, command: CellCommand) -> Option<Cell> {
        let pos = cells.iter().position(|item| match item {
            Incoming::Cell(cell) => cell.command() == command,
            Incoming::Relay(_) => false,
        })?;
        match cells.remove(pos)? {
            Incoming::Cell(cell) => Some(cell),
            Incoming::Relay(_) => None,
        }
    }

    // ===== Outbound =====

    fn ensure_not_destroyed(&self) -> Result<()> {
        match self.state() {
            CircuitState::Destroyed(reason) => Err(TorError::circuit_destroyed(reason)),
            _ => Ok(()),
        }
    }

    /// Hand a channel cell to the guard unmodified
    pub fn send_cell(&self, cell: &Cell) -> Result<()> {
        self.ensure_not_destroyed()?;
        if self.guard.send_cell(cell) {
            Ok(())
        } else {
            Err(TorError::SendFailed)
        }
    }

    /// Onion-encrypt a relay message for the last hop and send it
    pub fn send_relay_cell(&self, relay: &RelayCell) -> Result<()> {
        self.ensure_not_destroyed()?;

        // Held across the send so wire order matches keystream order
        let result = {
            let mut forward = lock(&self.forward);
            self.seal_and_send(&mut forward, relay)
        };
        result?;

        // Cells the guard delivered during the send may have owed SENDMEs.
        // A failure there has already torn the circuit down.
        let _ = self.flush_sendmes();
        Ok(())
    }

    fn seal_and_send(&self, forward: &mut OnionCrypto, relay: &RelayCell) -> Result<()> {
        let body = forward.seal(relay)?;
        let cell = Cell::relay(self.circ_id, body);

        log::debug!(
            "Circuit {:#x} sending relay cmd {} on stream {} through {} layer(s)",
            self.circ_id,
            relay.command_byte(),
            relay.stream_id,
            forward.hop_count()
        );

        if self.guard.send_cell(&cell) {
            Ok(())
        } else {
            Err(TorError::SendFailed)
        }
    }

    /// Send every queued SENDME, unless another send holds the forward
    /// crypto; that holder flushes on its way out.
    fn flush_sendmes(&self) -> Result<()> {
        loop {
            {
                let mut forward = match self.forward.try_lock() {
                    Ok(forward) => forward,
                    Err(TryLockError::Poisoned(e)) => e.into_inner(),
                    Err(TryLockError::WouldBlock) => return Ok(()),
                };

                loop {
                    let next = lock(&self.sendmes).pop_front();
                    let Some((stream_id, tag)) = next else {
                        break;
                    };
                    let sendme = self.sendme_cell(stream_id, tag);
                    let sent = self
                        .ensure_not_destroyed()
                        .and_then(|()| self.seal_and_send(&mut forward, &sendme));
                    if let Err(e) = sent {
                        lock(&self.sendmes).clear();
                        drop(forward);
                        if !matches!(e, TorError::CircuitDestroyed { .. }) {
                            self.tear_down(&e);
                        }
                        return Err(e);
                    }
                }
            }

            // Something queued between our last pop and the unlock
            if lock(&self.sendmes).is_empty() {
                return Ok(());
            }
        }
    }

    /// SENDME for `stream_id`. Circuit-level (stream 0) acknowledgements
    /// always use version 0; stream-level ones use the consensus version.
    fn sendme_cell(&self, stream_id: u16, tag: [u8; DIGEST_LEN]) -> RelayCell {
        let version = if stream_id == 0 {
            0
        } else {
            self.sendme_version()
        };
        log::debug!(
            "Circuit {:#x} sending SENDME v{} for stream {}",
            self.circ_id,
            version,
            stream_id
        );
        RelayCell::new(stream_id, RelayMsg::sendme(version, tag))
    }

    // ===== Handshake =====

    /// Run the CREATE_FAST handshake with the guard.
    ///
    /// On a bad confirmation value the guard connection is terminated and
    /// `HandshakeFailed` is returned.
    pub fn create_fast(&self) -> Result<()> {
        if self.state() != CircuitState::NotSet || self.keyed_hop_count() != 0 {
            return Err(TorError::InvalidState(format!(
                "circuit {:#x} already past its handshake",
                self.circ_id
            )));
        }

        let mut client_material = Zeroizing::new([0u8; FAST_KEY_LEN]);
        rand::thread_rng().fill_bytes(&mut client_material[..]);

        log::info!("Sending CREATE_FAST on circuit {:#x}", self.circ_id);
        self.send_cell(&Cell::new(
            self.circ_id,
            ChanMsg::CreateFast {
                key_material: *client_material,
            },
        ))?;

        let reply = match self.wait_for_cell(CellCommand::CreatedFast, self.config.wait_timeout) {
            Some(reply) => reply,
            None => {
                return Err(match self.state() {
                    CircuitState::Destroyed(reason) => TorError::circuit_destroyed(reason),
                    _ => TorError::Timeout("CREATED_FAST".into()),
                })
            }
        };

        let ChanMsg::CreatedFast { key_material, kh } = reply.into_msg() else {
            return Err(TorError::Internal("CREATED_FAST queue held another cell".into()));
        };

        let keys = HopKeys::kdf_tor(&client_material[..], &key_material)?;
        if !keys.verify(&kh) {
            log::warn!(
                "CREATED_FAST confirmation mismatch on circuit {:#x}, terminating guard connection",
                self.circ_id
            );
            let terminated = self.guard.terminate();
            self.set_state(CircuitState::Destroyed(DestroyReason::NONE));
            return Err(TorError::HandshakeFailed(format!(
                "KH mismatch on circuit {:#x} (connection terminated: {})",
                self.circ_id, terminated
            )));
        }

        let (forward, backward) = keys.into_layers();
        lock(&self.forward).push(forward);
        lock(&self.backward).push(backward);
        self.set_state(CircuitState::Connected);

        log::info!("Circuit {:#x} connected via CREATE_FAST", self.circ_id);
        Ok(())
    }

    // ===== Streams =====

    /// Open a directory stream on the last hop.
    ///
    /// Returns `true` once the relay answers CONNECTED; `false` if it
    /// answers END or nothing arrives before the wait gives up.
    pub fn open_dir_stream(&self, stream_id: u16) -> Result<bool> {
        lock(&self.streams).insert(stream_id)?;

        if let Err(e) = self.send_relay_cell(&RelayCell::new(stream_id, RelayMsg::BeginDir)) {
            lock(&self.streams).remove(stream_id);
            return Err(e);
        }

        let reply = self.wait_for_relay_cell(
            stream_id,
            &[RelayCommand::Connected, RelayCommand::End],
            self.config.wait_timeout,
        );

        match reply {
            Some(RelayCell {
                msg: RelayMsg::Connected(_),
                ..
            }) => {
                log::info!("Circuit {:#x} directory stream {} open", self.circ_id, stream_id);
                Ok(true)
            }
            // END already dropped the stream entry
            Some(_) => Ok(false),
            None => {
                lock(&self.streams).remove(stream_id);
                Ok(false)
            }
        }
    }

    /// Send application data on an open stream, split into DATA cells
    pub fn send_data(&self, stream_id: u16, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(RELAY_PAYLOAD_LEN) {
            {
                let mut streams = lock(&self.streams);
                let stream = streams
                    .get_mut(stream_id)
                    .ok_or_else(|| TorError::Stream(format!("stream {} is not open", stream_id)))?;
                stream.flow_control_mut().on_send()?;
                streams.circuit_window_mut().on_send()?;
            }
            self.send_relay_cell(&RelayCell::new(stream_id, RelayMsg::Data(chunk.to_vec())))?;
        }
        Ok(())
    }

    /// Next DATA payload on a stream; `None` once the relay has ended it
    pub fn recv_data(&self, stream_id: u16, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        match self.wait_for_relay_cell(
            stream_id,
            &[RelayCommand::Data, RelayCommand::End],
            timeout,
        ) {
            Some(RelayCell {
                msg: RelayMsg::Data(data),
                ..
            }) => Ok(Some(data)),
            Some(_) => Ok(None),
            None => Err(match self.state() {
                CircuitState::Destroyed(reason) => TorError::circuit_destroyed(reason),
                CircuitState::NotSet => {
                    TorError::InvalidState(format!("circuit {:#x} not connected", self.circ_id))
                }
                CircuitState::Connected => TorError::Timeout(format!("data on stream {}", stream_id)),
            }),
        }
    }

    /// Close a stream from our side
    pub fn close_stream(&self, stream_id: u16) -> Result<()> {
        if lock(&self.streams).remove(stream_id).is_none() {
            return Err(TorError::Stream(format!("stream {} is not open", stream_id)));
        }
        log::info!("Closing stream {} on circuit {:#x}", stream_id, self.circ_id);
        self.send_relay_cell(&RelayCell::new(
            stream_id,
            RelayMsg::End {
                reason: END_REASON_DONE,
            },
        ))
    }

    /// Acknowledge received data with a SENDME.
    ///
    /// The SENDME is queued behind any already owed and sent as soon as the
    /// forward crypto is free; a v1 SENDME carries the current backward
    /// digest of the last hop.
    pub fn handle_sendme(&self, stream_id: u16) -> Result<()> {
        self.ensure_not_destroyed()?;
        let tag = lock(&self.backward).last_digest().unwrap_or_default();
        lock(&self.sendmes).push_back((stream_id, tag));
        self.flush_sendmes()
    }

    // ===== Teardown =====

    /// Tear the circuit down from our side.
    ///
    /// Always sends reason NONE: clients must not tell relays why.
    /// Calling this on a destroyed circuit does nothing.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut pending = lock(&self.pending);
            if let CircuitState::Destroyed(_) = pending.state {
                return Ok(());
            }
            pending.state = CircuitState::Destroyed(DestroyReason::NONE);
        }
        self.arrived.notify_all();

        log::info!("Destroying circuit {:#x}", self.circ_id);
        if self
            .guard
            .send_cell(&Cell::destroy(self.circ_id, DestroyReason::NONE))
        {
            Ok(())
        } else {
            Err(TorError::SendFailed)
        }
    }

    /// Record a teardown initiated by the network
    pub fn destroyed(&self, reason: DestroyReason) {
        log::info!(
            "Circuit {:#x} destroyed by relay: {} ({})",
            self.circ_id,
            reason.name(),
            reason.code()
        );
        self.set_state(CircuitState::Destroyed(reason));
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("circ_id", &format_args!("{:#x}", self.circ_id))
            .field("hops", &self.hop_count())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
