//! Circuit state machine
//!
//! A `Circuit` owns the ordered hop chain (`Node`s), the table of streams
//! multiplexed on it, its control-cell queue, and the flow-control window.
//! Lifecycle: hops are added one at a time during construction
//! (`create_first_hop`, then `extend` per additional hop), the circuit is
//! marked established once the full route answered, and teardown runs
//! soft (deferring while streams remain) or forced.
//!
//! Ordering invariant: the forward digest chain advances with every byte
//! sent, so encode-and-transmit is serialized under the circuit lock —
//! two senders interleaving between encode and write would desynchronize
//! the digests irrecoverably.

use crate::config::Config;
use crate::connection::CellLink;
use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand};
use crate::protocol::flow_control::DeliveryWindow;
use crate::protocol::node::{Node, DH_PUBLIC_LEN, HANDSHAKE_REPLY_LEN};
use crate::protocol::relay_cell::{self, RelayCell, RelayCommand};
use crate::protocol::stream::TorStream;
use crate::queue::{CellHandler, CellQueue, QueuedCell};
use crate::router::{CircuitEvents, Router};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// DESTROY reason sent on local teardown
pub const DESTROY_REASON_FINISHED: u8 = 9;

struct CircuitInner {
    /// Hop chain, client-role nodes in route order
    nodes: Vec<Node>,

    /// Number of hops with a completed handshake. Encode/decode never
    /// touch `nodes[i]` for `i >= established_count`.
    established_count: usize,

    established: bool,
    closed: bool,
    destructed: bool,

    /// Inbound BEGINs for unknown stream ids are accepted only when set
    rendezvous_accepting: bool,

    streams: HashMap<u16, Arc<TorStream>>,

    /// Rotating start point for stream-id allocation
    stream_id_hint: u16,

    /// Total streams registered over the circuit's lifetime
    streams_opened: u32,

    /// Stream failures charged against this circuit
    failures: u32,

    window: DeliveryWindow,

    created_at: Instant,
    built_at: Option<Instant>,
    last_used: Instant,
}

/// One onion-routing circuit over a transport connection
pub struct Circuit {
    /// Circuit id, unique within the owning connection
    pub id: u16,

    config: Config,
    link: Arc<dyn CellLink>,
    events: Arc<dyn CircuitEvents>,
    queue: Arc<CellQueue>,
    flow_handler: Mutex<Option<Arc<dyn CellHandler>>>,
    inner: Mutex<CircuitInner>,
}

impl Circuit {
    pub fn new(
        id: u16,
        config: Config,
        link: Arc<dyn CellLink>,
        events: Arc<dyn CircuitEvents>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let window = DeliveryWindow::new(config.circuit_window, config.circuit_increment);
        Arc::new(Self {
            id,
            config,
            link,
            events,
            queue: Arc::new(CellQueue::new()),
            flow_handler: Mutex::new(None),
            inner: Mutex::new(CircuitInner {
                nodes: Vec::new(),
                established_count: 0,
                established: false,
                closed: false,
                destructed: false,
                rendezvous_accepting: false,
                streams: HashMap::new(),
                stream_id_hint: rand::random(),
                streams_opened: 0,
                failures: 0,
                window,
                created_at: now,
                built_at: None,
                last_used: now,
            }),
        })
    }

    /// Control-cell queue (CREATED answers, circuit-level relay cells)
    pub fn queue(&self) -> &Arc<CellQueue> {
        &self.queue
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn events(&self) -> &Arc<dyn CircuitEvents> {
        &self.events
    }

    // ------------------------------------------------------------------
    // Construction steps (driven by the builder)
    // ------------------------------------------------------------------

    /// Handshake with the first hop: send CREATE carrying the onion skin,
    /// wait for CREATED, finalize the hop's keys.
    pub fn create_first_hop(&self, router: &Router) -> Result<()> {
        if self.inner.lock().established_count != 0 {
            return Err(TorError::CircuitBuildFailed(
                "first hop already created".into(),
            ));
        }

        let mut node = Node::client(router.clone());
        let skin = router.onion_key.encrypt(node.dh_public())?;
        if skin.len() > Cell::PAYLOAD_SIZE {
            return Err(TorError::ProtocolViolation(format!(
                "onion skin of {} bytes exceeds cell payload",
                skin.len()
            )));
        }

        self.link
            .send_cell(&Cell::new(self.id, CellCommand::Create, &skin))?;
        let created = self
            .queue
            .receive_cell(CellCommand::Created, self.config.create_timeout)?;

        node.finish_dh(
            &created.payload[..DH_PUBLIC_LEN],
            &created.payload[DH_PUBLIC_LEN..HANDSHAKE_REPLY_LEN],
        )?;

        let mut inner = self.inner.lock();
        inner.nodes.push(node);
        inner.established_count = 1;
        log::debug!("circuit {}: first hop {} up", self.id, router.nickname);
        Ok(())
    }

    /// Extend the circuit by one hop: EXTEND relayed through the
    /// established chain, answered by EXTENDED (Y || KH).
    pub fn extend(&self, router: &Router) -> Result<()> {
        let mut node = Node::client(router.clone());
        let skin = router.onion_key.encrypt(node.dh_public())?;
        let fingerprint = router.fingerprint_bytes()?;

        let mut data = Vec::with_capacity(4 + 2 + skin.len() + fingerprint.len());
        data.extend_from_slice(&router.address.octets());
        data.extend_from_slice(&router.or_port.to_be_bytes());
        data.extend_from_slice(&skin);
        data.extend_from_slice(&fingerprint);

        let extend = RelayCell::new(RelayCommand::Extend, 0, data)?;
        // EXTEND travels as RELAY_EARLY while the circuit is still building
        self.send_relay(&extend, None, true)?;

        let extended = self
            .queue
            .receive_relay_cell(RelayCommand::Extended, self.config.extend_timeout)?;
        if extended.data.len() < HANDSHAKE_REPLY_LEN {
            return Err(TorError::ProtocolViolation(format!(
                "EXTENDED payload of {} bytes is short",
                extended.data.len()
            )));
        }
        node.finish_dh(
            &extended.data[..DH_PUBLIC_LEN],
            &extended.data[DH_PUBLIC_LEN..HANDSHAKE_REPLY_LEN],
        )?;

        let mut inner = self.inner.lock();
        inner.nodes.push(node);
        inner.established_count += 1;
        log::debug!(
            "circuit {}: extended to {} ({} hops)",
            self.id,
            router.nickname,
            inner.established_count
        );
        Ok(())
    }

    /// Flip to `Established`, install the circuit-level flow-control
    /// handler and notify listeners.
    pub fn mark_established(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock();
            inner.established = true;
            inner.built_at = Some(Instant::now());
        }
        *self.flow_handler.lock() = Some(Arc::new(CircuitFlowHandler {
            circuit: Arc::downgrade(self),
        }));
        log::info!(
            "circuit {} established with {} hops",
            self.id,
            self.established_count()
        );
        self.events.circuit_built(self.id);
    }

    // ------------------------------------------------------------------
    // Send path
    // ------------------------------------------------------------------

    /// Encode and transmit a relay cell addressed to the last hop
    pub fn send_relay_cell(&self, cell: &RelayCell) -> Result<()> {
        self.send_relay(cell, None, false)
    }

    fn send_relay(&self, cell: &RelayCell, target: Option<usize>, early: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.destructed {
            return Err(TorError::CircuitClosed(format!(
                "circuit {} is destructed",
                self.id
            )));
        }
        let count = inner.established_count;
        if count == 0 {
            return Err(TorError::CircuitClosed(format!(
                "circuit {} has no established hops",
                self.id
            )));
        }

        let payload = relay_cell::encode(&mut inner.nodes[..count], target, cell)?;
        let wire = if early {
            Cell::relay_early(self.id, payload)
        } else {
            Cell::relay(self.id, payload)
        };
        // Transmit while still holding the lock: wire order must match the
        // order the forward digests were advanced in.
        self.link.send_cell(&wire)?;
        inner.last_used = Instant::now();
        Ok(())
    }

    /// Keep-alive padding (used by the pool sweeper)
    pub fn send_padding(&self) -> Result<()> {
        self.link.send_cell(&Cell::padding(self.id))
    }

    // ------------------------------------------------------------------
    // Inbound path (called from the connection's dispatcher thread)
    // ------------------------------------------------------------------

    /// Route one inbound cell addressed to this circuit
    pub fn handle_inbound(self: &Arc<Self>, cell: Cell) {
        // Flow control sees the raw cell first, best-effort
        if let Some(handler) = self.flow_handler.lock().clone() {
            if let Err(e) = handler.handle(&QueuedCell::Control(cell.clone())) {
                log::debug!("circuit {}: flow-control handler error: {}", self.id, e);
            }
        }

        match cell.command {
            CellCommand::Relay | CellCommand::RelayEarly => {
                let mut payload = cell.payload;
                match self.decode_relay(&mut payload) {
                    Ok((hop, relay)) => self.route_relay(hop, relay),
                    Err(e) => {
                        log::warn!("circuit {}: relay decode failed: {}", self.id, e);
                        // A digest/crypto failure means the cipher state is
                        // out of step with the peer; the circuit is unusable.
                        if e.is_fatal() {
                            self.force_abandon();
                        }
                    }
                }
            }
            CellCommand::Destroy => {
                let reason = cell.payload[0];
                log::info!(
                    "circuit {} destroyed by peer: {}",
                    self.id,
                    TorError::circuit_destroyed(reason)
                );
                self.peer_destroyed();
            }
            _ => self.queue.add(QueuedCell::Control(cell)),
        }
    }

    fn decode_relay(&self, payload: &mut [u8; Cell::PAYLOAD_SIZE]) -> Result<(usize, RelayCell)> {
        let mut inner = self.inner.lock();
        let count = inner.established_count;
        relay_cell::decode(&mut inner.nodes[..count], payload)
    }

    fn route_relay(self: &Arc<Self>, hop: usize, cell: RelayCell) {
        if cell.stream_id == 0 {
            // Credit from the peer; sending is never gated on it, so the
            // cell carries no further state.
            if cell.command == RelayCommand::Sendme {
                log::trace!("circuit {}: sendme from hop {}", self.id, hop);
                return;
            }
            // Circuit-level control traffic (EXTENDED, INTRODUCE2, ...)
            self.queue.add(QueuedCell::Relay(cell));
            return;
        }

        let stream = self.inner.lock().streams.get(&cell.stream_id).cloned();
        match stream {
            Some(stream) => stream.queue().add(QueuedCell::Relay(cell)),
            None if cell.command == RelayCommand::Begin && self.rendezvous_accepting() => {
                if let Err(e) = self.accept_inbound_begin(cell) {
                    log::warn!("circuit {}: inbound BEGIN rejected: {}", self.id, e);
                }
            }
            None => log::debug!(
                "circuit {}: dropping RELAY_{:?} from hop {} for unknown stream {}",
                self.id,
                cell.command,
                hop,
                cell.stream_id
            ),
        }
    }

    // ------------------------------------------------------------------
    // Flow control
    // ------------------------------------------------------------------

    fn note_inbound_relay(self: &Arc<Self>) {
        let owed = {
            let mut inner = self.inner.lock();
            if !inner.established || inner.destructed {
                return;
            }
            inner.window.deliver()
        };
        if owed {
            if let Err(e) = self.send_circuit_sendme() {
                log::debug!("circuit {}: sendme not sent: {}", self.id, e);
            }
        }
    }

    /// Replenish the senders' credit: one SENDME to every established hop
    fn send_circuit_sendme(&self) -> Result<()> {
        let count = self.inner.lock().established_count;
        for hop in 0..count {
            let sendme = RelayCell::new(RelayCommand::Sendme, 0, Vec::new())?;
            self.send_relay(&sendme, Some(hop), false)?;
        }
        log::debug!("circuit {}: sendme sent to {} hops", self.id, count);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Open a stream to `host:port` through the circuit's exit hop
    pub fn open_stream(self: &Arc<Self>, host: &str, port: u16) -> Result<Arc<TorStream>> {
        TorStream::open(self, host, port)
    }

    /// Allocate a stream id unique within this circuit: linear scan from a
    /// rotating offset, skipping zero and live ids.
    pub fn assign_stream_id(&self) -> Result<u16> {
        let mut inner = self.inner.lock();
        if inner.streams.len() >= u16::MAX as usize {
            return Err(TorError::ResourceExhausted(format!(
                "circuit {}: stream table full",
                self.id
            )));
        }
        let start = inner.stream_id_hint;
        for offset in 1..=u16::MAX {
            let candidate = start.wrapping_add(offset);
            if candidate == 0 || inner.streams.contains_key(&candidate) {
                continue;
            }
            inner.stream_id_hint = candidate;
            return Ok(candidate);
        }
        Err(TorError::ResourceExhausted(format!(
            "circuit {}: no free stream id",
            self.id
        )))
    }

    pub(crate) fn register_stream(&self, stream: Arc<TorStream>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(TorError::CircuitClosed(format!(
                "circuit {} no longer accepts streams",
                self.id
            )));
        }
        if inner.streams.insert(stream.id, stream).is_some() {
            return Err(TorError::ProtocolViolation(
                "stream id already registered".into(),
            ));
        }
        inner.streams_opened += 1;
        Ok(())
    }

    /// Drop a stream from the table. Mandatory before the stream's
    /// resources are released.
    pub(crate) fn remove_stream(&self, id: u16) -> bool {
        self.inner.lock().streams.remove(&id).is_some()
    }

    pub fn stream_count(&self) -> usize {
        self.inner.lock().streams.len()
    }

    /// Accept a hidden-service BEGIN for a not-yet-known stream id
    fn accept_inbound_begin(self: &Arc<Self>, cell: RelayCell) -> Result<Arc<TorStream>> {
        TorStream::accept(self, cell.stream_id)
    }

    /// Charge one stream failure against this circuit; past both the
    /// absolute threshold and the failure ratio the circuit self-closes to
    /// stop attracting more streams.
    pub(crate) fn note_stream_failure(self: &Arc<Self>) {
        let close_now = {
            let mut inner = self.inner.lock();
            inner.failures += 1;
            inner.failures > self.config.max_stream_failures
                && inner.failures as f32
                    > inner.streams_opened as f32 * self.config.stream_failure_ratio
        };
        if close_now {
            log::info!("circuit {}: too many stream failures, closing", self.id);
            if let Err(e) = self.close(false) {
                log::debug!("circuit {}: deferred self-close: {}", self.id, e);
            }
        }
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    /// Close the circuit. Soft close (`force=false`) stops accepting new
    /// streams but defers teardown with `NotCloseable` while streams
    /// remain; forced close ends every live stream first.
    pub fn close(self: &Arc<Self>, force: bool) -> Result<()> {
        let streams: Vec<Arc<TorStream>> = {
            let mut inner = self.inner.lock();
            if inner.destructed {
                return Ok(());
            }
            inner.closed = true;
            inner.streams.values().cloned().collect()
        };

        if !streams.is_empty() {
            if force {
                for stream in streams {
                    stream.force_close();
                }
            } else {
                let remaining = self.stream_count();
                if remaining > 0 {
                    return Err(TorError::NotCloseable(remaining));
                }
            }
        }

        self.teardown(true);
        Ok(())
    }

    /// Peer sent DESTROY: no notification goes back, everything local is
    /// torn down.
    fn peer_destroyed(self: &Arc<Self>) {
        self.abandon_streams();
        self.teardown(false);
    }

    /// Force-close without wire notification (transport failure, fatal
    /// crypto desync, abandoned construction).
    pub fn force_abandon(self: &Arc<Self>) {
        self.abandon_streams();
        self.teardown(false);
    }

    fn abandon_streams(&self) {
        let streams: Vec<Arc<TorStream>> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.streams.values().cloned().collect()
        };
        for stream in streams {
            stream.abandon();
        }
    }

    fn teardown(&self, send_destroy: bool) {
        {
            let mut inner = self.inner.lock();
            if inner.destructed {
                return;
            }
            inner.closed = true;
            inner.destructed = true;
            inner.streams.clear();
        }
        if send_destroy {
            // Only the first hop is told directly; the rest of the chain
            // learns of the teardown from it.
            if let Err(e) = self
                .link
                .send_cell(&Cell::destroy(self.id, DESTROY_REASON_FINISHED))
            {
                log::debug!("circuit {}: destroy not sent: {}", self.id, e);
            }
        }
        self.queue.close();
        self.link.release_circuit(self.id);
        self.events.circuit_closed(self.id);
        log::debug!("circuit {} destructed", self.id);
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    pub fn is_established(&self) -> bool {
        let inner = self.inner.lock();
        inner.established && !inner.closed
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn is_destructed(&self) -> bool {
        self.inner.lock().destructed
    }

    pub fn established_count(&self) -> usize {
        self.inner.lock().established_count
    }

    /// Mark the circuit as accepting hidden-service inbound BEGINs
    pub fn set_rendezvous_accepting(&self, accepting: bool) {
        self.inner.lock().rendezvous_accepting = accepting;
    }

    pub fn rendezvous_accepting(&self) -> bool {
        self.inner.lock().rendezvous_accepting
    }

    pub fn age(&self) -> Duration {
        self.inner.lock().created_at.elapsed()
    }

    pub fn idle(&self) -> Duration {
        self.inner.lock().last_used.elapsed()
    }

    pub(crate) fn touch(&self) {
        self.inner.lock().last_used = Instant::now();
    }

    /// Pool ranking: fast setup ranks high, every charged failure
    /// multiplies the rank down. Unusable circuits rank at zero.
    pub fn rank(&self) -> f32 {
        let inner = self.inner.lock();
        if !inner.established || inner.closed {
            return 0.0;
        }
        let setup = inner
            .built_at
            .map(|t| t.duration_since(inner.created_at))
            .unwrap_or(self.config.ranking_latency_ref);
        let latency_factor =
            self.config.ranking_latency_ref.as_secs_f32() / setup.as_secs_f32().max(0.001);
        self.config.ranking_failure_base.powi(inner.failures as i32) * latency_factor
    }
}

/// Circuit-level flow control: counts inbound relay cells and never claims
struct CircuitFlowHandler {
    circuit: Weak<Circuit>,
}

impl CellHandler for CircuitFlowHandler {
    fn handle(&self, cell: &QueuedCell) -> Result<bool> {
        if let QueuedCell::Control(cell) = cell {
            if cell.command.is_relay() {
                if let Some(circuit) = self.circuit.upgrade() {
                    circuit.note_inbound_relay();
                }
            }
        }
        Ok(false)
    }
}
