//! End-to-end engine scenarios against an in-process relay chain.
//!
//! The mock network answers CREATE/EXTEND deterministically with real
//! server-side handshakes, so every cell crosses the same onion
//! encryption, digest chains and dispatch machinery as against a live
//! relay.

use onionlink::connection::{ConnectionDirectory, LinkReader, LinkWriter, Transport};
use onionlink::protocol::cell::{Cell, CellCommand};
use onionlink::protocol::circuit::DESTROY_REASON_FINISHED;
use onionlink::protocol::node::{Node, DH_PUBLIC_LEN};
use onionlink::protocol::relay_cell::{self, RelayCell, RelayCommand};
use onionlink::router::{NoEvents, Router, RouterSelector};
use onionlink::{CircuitBuilder, Config, Result, TorError};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Routers known to the mock network, keyed by hex fingerprint
struct Registry {
    routers: Mutex<HashMap<String, Router>>,
}

/// Everything one mock connection observed and replied
struct ChainState {
    entry: Router,
    hops: Vec<Node>,
    inbound: VecDeque<[u8; Cell::SIZE]>,
    open: bool,
    circuit_id: u16,
    destroy_reason: Option<u8>,
    begins: Vec<String>,
    data_chunks: Vec<Vec<u8>>,
    ends: Vec<(u16, u8)>,
    circuit_sendme_hops: Vec<usize>,
    stream_sendmes: u32,
    connected_streams: Vec<u16>,
}

/// One mock relay chain behind one transport link. Server-side hops are
/// real `Node`s, so the chain decodes client cells and encodes replies
/// with the same codec the client uses, from the opposite role.
struct Chain {
    registry: Arc<Registry>,
    state: Mutex<ChainState>,
    cond: Condvar,
}

impl Chain {
    fn handle_cell(&self, bytes: &[u8; Cell::SIZE]) {
        let cell = Cell::from_bytes(bytes).expect("client sends well-formed cells");
        let mut st = self.state.lock();
        match cell.command {
            CellCommand::Padding => {}
            CellCommand::Create => {
                st.circuit_id = cell.circuit_id;
                let entry = st.entry.clone();
                let (node, reply) = Node::respond(entry, &cell.payload[..DH_PUBLIC_LEN])
                    .expect("CREATE handshake");
                st.hops.push(node);
                st.inbound
                    .push_back(Cell::new(cell.circuit_id, CellCommand::Created, &reply).to_bytes());
                self.cond.notify_all();
            }
            CellCommand::Relay | CellCommand::RelayEarly => {
                let mut payload = cell.payload;
                let (hop, relay) = relay_cell::decode(&mut st.hops, &mut payload)
                    .expect("relay cell recognized by some hop");
                self.handle_relay(&mut st, cell.circuit_id, hop, relay);
            }
            CellCommand::Destroy => {
                st.destroy_reason = Some(cell.payload[0]);
            }
            other => panic!("mock chain got unexpected {:?}", other),
        }
    }

    fn handle_relay(&self, st: &mut ChainState, circuit_id: u16, hop: usize, relay: RelayCell) {
        match relay.command {
            RelayCommand::Extend => {
                assert_eq!(relay.stream_id, 0);
                assert_eq!(hop, st.hops.len() - 1, "EXTEND must address the last hop");
                let data = &relay.data;
                let fingerprint = hex::encode(&data[data.len() - 20..]);
                let target = self
                    .registry
                    .routers
                    .lock()
                    .get(&fingerprint)
                    .cloned()
                    .expect("EXTEND names a known router");
                // Plaintext onion key in tests: the skin is the raw public
                let skin = &data[6..data.len() - 20];
                let (node, reply) = Node::respond(target, skin).expect("EXTEND handshake");
                st.hops.push(node);
                let extended = RelayCell::new(RelayCommand::Extended, 0, reply.to_vec())
                    .expect("EXTENDED fits");
                self.reply_relay(st, circuit_id, hop, &extended);
            }
            RelayCommand::Begin => {
                assert_eq!(hop, st.hops.len() - 1, "BEGIN must address the exit");
                let target =
                    String::from_utf8_lossy(&relay.data[..relay.data.len().saturating_sub(1)])
                        .into_owned();
                st.begins.push(target);
                let connected = RelayCell::new(RelayCommand::Connected, relay.stream_id, Vec::new())
                    .expect("CONNECTED fits");
                self.reply_relay(st, circuit_id, hop, &connected);
            }
            RelayCommand::Connected => st.connected_streams.push(relay.stream_id),
            RelayCommand::Data => st.data_chunks.push(relay.data),
            RelayCommand::End => st
                .ends
                .push((relay.stream_id, relay.data.first().copied().unwrap_or(0))),
            RelayCommand::Sendme => {
                if relay.stream_id == 0 {
                    st.circuit_sendme_hops.push(hop);
                } else {
                    st.stream_sendmes += 1;
                }
            }
            other => panic!("mock chain got unexpected RELAY_{:?}", other),
        }
    }

    /// Encode a reply as originated by `hop` and queue it for the client
    fn reply_relay(&self, st: &mut ChainState, circuit_id: u16, hop: usize, cell: &RelayCell) {
        let payload =
            relay_cell::encode(&mut st.hops[..=hop], Some(hop), cell).expect("mock reply encode");
        st.inbound.push_back(Cell::relay(circuit_id, payload).to_bytes());
        self.cond.notify_all();
    }

    /// Inject a DATA cell as sent by the exit hop
    fn push_data_from_exit(&self, stream_id: u16, data: &[u8]) {
        let mut st = self.state.lock();
        let hop = st.hops.len() - 1;
        let circuit_id = st.circuit_id;
        let cell = RelayCell::new(RelayCommand::Data, stream_id, data.to_vec()).expect("data fits");
        self.reply_relay(&mut st, circuit_id, hop, &cell);
    }

    /// Inject a hidden-service style inbound BEGIN from the exit hop
    fn push_begin_from_exit(&self, stream_id: u16) {
        let mut st = self.state.lock();
        let hop = st.hops.len() - 1;
        let circuit_id = st.circuit_id;
        let mut data = b"caller:0".to_vec();
        data.push(0);
        let cell = RelayCell::new(RelayCommand::Begin, stream_id, data).expect("begin fits");
        self.reply_relay(&mut st, circuit_id, hop, &cell);
    }

    /// Tear the circuit down from the network side
    fn push_destroy(&self, reason: u8) {
        let mut st = self.state.lock();
        let circuit_id = st.circuit_id;
        st.inbound.push_back(Cell::destroy(circuit_id, reason).to_bytes());
        self.cond.notify_all();
    }

    fn shutdown(&self) {
        self.state.lock().open = false;
        self.cond.notify_all();
    }
}

struct MockReader {
    chain: Arc<Chain>,
}

impl LinkReader for MockReader {
    fn read_cell(&mut self, buf: &mut [u8; Cell::SIZE]) -> Result<bool> {
        let mut st = self.chain.state.lock();
        loop {
            if let Some(cell) = st.inbound.pop_front() {
                buf.copy_from_slice(&cell);
                return Ok(true);
            }
            if !st.open {
                return Ok(false);
            }
            self.chain.cond.wait(&mut st);
        }
    }
}

struct MockWriter {
    chain: Arc<Chain>,
}

impl LinkWriter for MockWriter {
    fn write_cell(&mut self, cell: &[u8; Cell::SIZE]) -> Result<()> {
        self.chain.handle_cell(cell);
        Ok(())
    }
}

struct MockNetwork {
    registry: Arc<Registry>,
    chains: Mutex<Vec<Arc<Chain>>>,
}

impl MockNetwork {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Registry {
                routers: Mutex::new(HashMap::new()),
            }),
            chains: Mutex::new(Vec::new()),
        })
    }

    fn router(&self, name: &str) -> Router {
        let router = Router::for_tests(name);
        self.registry
            .routers
            .lock()
            .insert(router.fingerprint.clone(), router.clone());
        router
    }

    fn chain(&self, index: usize) -> Arc<Chain> {
        Arc::clone(&self.chains.lock()[index])
    }

    fn shutdown(&self) {
        for chain in self.chains.lock().iter() {
            chain.shutdown();
        }
    }
}

impl Transport for MockNetwork {
    fn connect(&self, router: &Router) -> Result<(Box<dyn LinkReader>, Box<dyn LinkWriter>)> {
        let chain = Arc::new(Chain {
            registry: Arc::clone(&self.registry),
            state: Mutex::new(ChainState {
                entry: router.clone(),
                hops: Vec::new(),
                inbound: VecDeque::new(),
                open: true,
                circuit_id: 0,
                destroy_reason: None,
                begins: Vec::new(),
                data_chunks: Vec::new(),
                ends: Vec::new(),
                circuit_sendme_hops: Vec::new(),
                stream_sendmes: 0,
                connected_streams: Vec::new(),
            }),
            cond: Condvar::new(),
        });
        self.chains.lock().push(Arc::clone(&chain));
        Ok((
            Box::new(MockReader {
                chain: Arc::clone(&chain),
            }),
            Box::new(MockWriter { chain }),
        ))
    }
}

struct FixedSelector {
    route: Vec<Router>,
}

impl RouterSelector for FixedSelector {
    fn select_route(&self, len: usize, exclude: &[String]) -> Result<Vec<Router>> {
        let route: Vec<Router> = self
            .route
            .iter()
            .filter(|r| !exclude.contains(&r.fingerprint))
            .take(len)
            .cloned()
            .collect();
        if route.len() < len {
            return Err(TorError::NoRoute("mock directory exhausted".into()));
        }
        Ok(route)
    }

    fn punish(&self, _fingerprint: &str) {}
}

fn engine(config: Config) -> (Arc<MockNetwork>, CircuitBuilder) {
    let _ = env_logger::builder().is_test(true).try_init();
    let network = MockNetwork::new();
    let route = vec![
        network.router("guard"),
        network.router("middle"),
        network.router("exit"),
    ];
    let directory = Arc::new(ConnectionDirectory::new(
        Arc::clone(&network) as Arc<dyn Transport>
    ));
    let builder = CircuitBuilder::new(
        config,
        Arc::new(FixedSelector { route }),
        directory,
        Arc::new(NoEvents),
    );
    (network, builder)
}

fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn test_three_hop_build_and_teardown() {
    let (network, builder) = engine(Config::default());
    let circuit = builder.build().unwrap();

    assert!(circuit.is_established());
    assert_eq!(circuit.established_count(), 3);
    let chain = network.chain(0);
    assert_eq!(chain.state.lock().hops.len(), 3);

    circuit.close(false).unwrap();
    assert!(circuit.is_destructed());
    assert_eq!(
        chain.state.lock().destroy_reason,
        Some(DESTROY_REASON_FINISHED)
    );
    network.shutdown();
}

#[test]
fn test_stream_data_chunking_and_end() {
    let (network, builder) = engine(Config::default());
    let circuit = builder.build().unwrap();
    let chain = network.chain(0);

    let stream = circuit.open_stream("example.com", 80).unwrap();
    assert!(stream.is_established());
    assert_eq!(chain.state.lock().begins, vec!["example.com:80".to_string()]);

    // 600 bytes must leave as one full cell and one 102-byte remainder
    let outbound: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    stream.write_all(&outbound).unwrap();
    {
        let st = chain.state.lock();
        let lengths: Vec<usize> = st.data_chunks.iter().map(|c| c.len()).collect();
        assert_eq!(lengths, vec![498, 102]);
        let received: Vec<u8> = st.data_chunks.concat();
        assert_eq!(received, outbound);
    }

    // Inbound bytes come back through the sink in arrival order
    chain.push_data_from_exit(stream.id, b"hello ");
    chain.push_data_from_exit(stream.id, b"caller");
    let mut buf = [0u8; 64];
    let mut got = Vec::new();
    while got.len() < 12 {
        let n = stream.read(&mut buf, Duration::from_secs(5)).unwrap();
        assert!(n > 0, "unexpected EOF");
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, b"hello caller");

    let stream_id = stream.id;
    stream.close().unwrap();
    assert!(stream.is_closed());
    assert_eq!(circuit.stream_count(), 0);
    assert_eq!(chain.state.lock().ends, vec![(stream_id, 6)]);

    circuit.close(false).unwrap();
    network.shutdown();
}

#[test]
fn test_flow_control_sendme_cadence() {
    let config = Config {
        circuit_window: 10,
        circuit_increment: 2,
        stream_window: 10,
        stream_increment: 2,
        ..Config::default()
    };
    let (network, builder) = engine(config);
    let circuit = builder.build().unwrap();
    let chain = network.chain(0);
    let stream = circuit.open_stream("example.com", 80).unwrap();

    // CONNECTED was the 1st post-build relay cell; the 8 DATA cells are
    // 2..=9, so the circuit window (10/2) fires on 2, 4, 6 and 8 — each
    // firing sends one SENDME to every one of the 3 hops. The stream
    // window counts DATA only: it fires on the 2nd, 4th, 6th and 8th DATA.
    for _ in 0..8 {
        chain.push_data_from_exit(stream.id, b"x");
    }

    wait_until("circuit sendmes", || {
        chain.state.lock().circuit_sendme_hops.len() == 12
    });
    wait_until("stream sendmes", || chain.state.lock().stream_sendmes == 4);
    {
        let st = chain.state.lock();
        for hop in 0..3 {
            assert_eq!(
                st.circuit_sendme_hops.iter().filter(|&&h| h == hop).count(),
                4,
                "hop {} sendme count",
                hop
            );
        }
    }

    let mut buf = [0u8; 16];
    let n = stream.read(&mut buf, Duration::from_secs(5)).unwrap();
    assert!(n > 0);

    stream.close().unwrap();
    circuit.close(false).unwrap();
    network.shutdown();
}

#[test]
fn test_peer_destroy_cascades() {
    let (network, builder) = engine(Config::default());
    let circuit = builder.build().unwrap();
    let chain = network.chain(0);
    let stream = circuit.open_stream("example.com", 80).unwrap();

    chain.push_destroy(4);
    wait_until("circuit teardown", || circuit.is_destructed());
    assert!(stream.is_closed());
    assert_eq!(circuit.stream_count(), 0);
    // Nothing goes back on the wire for a peer-initiated destroy
    assert_eq!(chain.state.lock().destroy_reason, None);
    network.shutdown();
}

#[test]
fn test_rendezvous_inbound_begin_is_accepted() {
    let (network, builder) = engine(Config::default());
    let circuit = builder.build().unwrap();
    let chain = network.chain(0);
    circuit.set_rendezvous_accepting(true);

    chain.push_begin_from_exit(42);
    wait_until("CONNECTED answer", || {
        chain.state.lock().connected_streams.contains(&42)
    });
    assert_eq!(circuit.stream_count(), 1);

    circuit.close(true).unwrap();
    network.shutdown();
}

#[test]
fn test_inbound_begin_dropped_without_rendezvous_flag() {
    let (network, builder) = engine(Config::default());
    let circuit = builder.build().unwrap();
    let chain = network.chain(0);

    chain.push_begin_from_exit(42);
    // Give the dispatcher time to (not) act on it
    std::thread::sleep(Duration::from_millis(100));
    assert!(chain.state.lock().connected_streams.is_empty());
    assert_eq!(circuit.stream_count(), 0);

    circuit.close(false).unwrap();
    network.shutdown();
}
