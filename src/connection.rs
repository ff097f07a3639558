//! Transport connections and cell dispatch
//!
//! The actual byte transport (TCP, TLS, anything duplex) stays outside
//! this crate behind `Transport`/`LinkReader`/`LinkWriter`. A
//! `TransportConnection` owns the circuits multiplexed on one link and
//! runs the dispatcher: a dedicated reader thread that is the sole owner
//! of inbound decode order for the link. `ConnectionDirectory` shares one
//! connection per router identity.

use crate::config::Config;
use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand};
use crate::protocol::circuit::Circuit;
use crate::router::{CircuitEvents, Router};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reading half of a duplex link. `read_cell` blocks until one full cell
/// is available; `Ok(false)` signals a clean end of stream.
pub trait LinkReader: Send {
    fn read_cell(&mut self, buf: &mut [u8; Cell::SIZE]) -> Result<bool>;
}

/// Writing half of a duplex link
pub trait LinkWriter: Send {
    fn write_cell(&mut self, cell: &[u8; Cell::SIZE]) -> Result<()>;
}

/// Dialer for duplex byte links to routers
pub trait Transport: Send + Sync {
    fn connect(&self, router: &Router) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)>;
}

/// What a circuit needs from the layer below: serialized cell transmission
/// and release of its circuit-id slot on teardown.
pub trait CellLink: Send + Sync {
    fn send_cell(&self, cell: &Cell) -> Result<()>;
    fn release_circuit(&self, circuit_id: u16);
}

/// Short fingerprint prefix for log lines
fn short_tag(fingerprint: &str) -> &str {
    &fingerprint[..8.min(fingerprint.len())]
}

/// One transport link to a router, multiplexing circuits by circuit id
pub struct TransportConnection {
    fingerprint: String,
    writer: Mutex<Box<dyn LinkWriter>>,
    circuits: Mutex<HashMap<u16, Arc<Circuit>>>,
    closed: AtomicBool,
}

impl TransportConnection {
    fn tag(&self) -> &str {
        short_tag(&self.fingerprint)
    }

    /// Dial `router` and spawn the dispatcher thread
    pub fn open(transport: &dyn Transport, router: &Router) -> Result<Arc<Self>> {
        let (reader, writer) = transport.connect(router)?;
        let connection = Arc::new(Self {
            fingerprint: router.fingerprint.clone(),
            writer: Mutex::new(writer),
            circuits: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        connection.spawn_dispatcher(reader)?;
        log::debug!("link to {} ({}) up", router.nickname, short_tag(&router.fingerprint));
        Ok(connection)
    }

    /// The dispatcher is the sole owner of inbound decode order for this
    /// link; it runs until EOF, a read error, or `close`.
    fn spawn_dispatcher(self: &Arc<Self>, mut reader: Box<dyn LinkReader>) -> Result<()> {
        let connection = Arc::clone(self);
        let name = format!("dispatch-{}", short_tag(&self.fingerprint));
        std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let mut buf = [0u8; Cell::SIZE];
                loop {
                    match reader.read_cell(&mut buf) {
                        Ok(true) => connection.dispatch(&buf),
                        Ok(false) => {
                            log::debug!("link {}: closed by peer", connection.tag());
                            break;
                        }
                        Err(e) => {
                            if !connection.is_closed() {
                                log::warn!("link {}: read error: {}", connection.tag(), e);
                            }
                            break;
                        }
                    }
                }
                connection.close();
            })
            .map_err(|e| TorError::Transport(format!("dispatcher thread: {}", e)))?;
        Ok(())
    }

    /// Route one wire cell to its circuit
    fn dispatch(&self, bytes: &[u8; Cell::SIZE]) {
        let cell = match Cell::from_bytes(bytes) {
            Ok(cell) => cell,
            Err(e) => {
                log::warn!("link {}: dropping unparseable cell: {}", self.tag(), e);
                return;
            }
        };
        if cell.command == CellCommand::Padding {
            return;
        }
        let circuit = self.circuits.lock().get(&cell.circuit_id).cloned();
        match circuit {
            Some(circuit) => circuit.handle_inbound(cell),
            None => log::debug!(
                "link {}: dropping {:?} for unknown circuit {}",
                self.tag(),
                cell.command,
                cell.circuit_id
            ),
        }
    }

    /// Allocate a random non-zero circuit id unused on this link and bind
    /// a fresh circuit to it.
    pub fn new_circuit(
        self: &Arc<Self>,
        config: &Config,
        events: Arc<dyn CircuitEvents>,
    ) -> Result<Arc<Circuit>> {
        if self.is_closed() {
            return Err(TorError::Transport("connection is closed".into()));
        }
        let mut circuits = self.circuits.lock();
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let id: u16 = rng.gen();
            if id == 0 || circuits.contains_key(&id) {
                continue;
            }
            let link: Arc<dyn CellLink> = Arc::clone(self) as Arc<dyn CellLink>;
            let circuit = Circuit::new(id, config.clone(), link, events);
            circuits.insert(id, Arc::clone(&circuit));
            return Ok(circuit);
        }
        Err(TorError::ResourceExhausted(
            "no free circuit id on this connection".into(),
        ))
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close the link, force-abandoning every circuit on it
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let circuits: Vec<Arc<Circuit>> = {
            let mut map = self.circuits.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        if !circuits.is_empty() {
            log::info!(
                "link {}: closing with {} live circuits",
                self.tag(),
                circuits.len()
            );
        }
        for circuit in circuits {
            circuit.force_abandon();
        }
    }
}

impl CellLink for TransportConnection {
    fn send_cell(&self, cell: &Cell) -> Result<()> {
        if self.is_closed() {
            return Err(TorError::Transport("connection is closed".into()));
        }
        self.writer.lock().write_cell(&cell.to_bytes())
    }

    fn release_circuit(&self, circuit_id: u16) {
        let now_empty = {
            let mut circuits = self.circuits.lock();
            circuits.remove(&circuit_id);
            circuits.is_empty()
        };
        // The last circuit going away takes the link down with it
        if now_empty && !self.is_closed() {
            log::debug!("link {}: last circuit released, closing", self.tag());
            self.close();
        }
    }
}

/// One shared connection per router identity, dialed on demand
pub struct ConnectionDirectory {
    transport: Arc<dyn Transport>,
    connections: Mutex<HashMap<String, Arc<TransportConnection>>>,
}

impl ConnectionDirectory {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the open connection to `router` or dial a new one
    pub fn connect(&self, router: &Router) -> Result<Arc<TransportConnection>> {
        if let Some(existing) = self.connections.lock().get(&router.fingerprint) {
            if !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }

        // Dial outside the map lock
        let fresh = TransportConnection::open(self.transport.as_ref(), router)?;

        let mut connections = self.connections.lock();
        match connections.get(&router.fingerprint) {
            // Lost the race to another dialer; use theirs
            Some(existing) if !existing.is_closed() => {
                let existing = Arc::clone(existing);
                drop(connections);
                fresh.close();
                Ok(existing)
            }
            _ => {
                connections.insert(router.fingerprint.clone(), Arc::clone(&fresh));
                Ok(fresh)
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Close every connection (cascades to circuits and streams)
    pub fn close_all(&self) {
        let connections: Vec<Arc<TransportConnection>> = {
            let mut map = self.connections.lock();
            map.drain().map(|(_, c)| c).collect()
        };
        for connection in connections {
            connection.close();
        }
    }
}
