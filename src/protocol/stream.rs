//! Streams multiplexed on a circuit
//!
//! A `TorStream` is one logical bidirectional channel: BEGIN/CONNECTED to
//! open, DATA cells of at most 498 bytes each way, END with a one-byte
//! reason to close. Inbound bytes flow through the stream's queue handlers
//! into a blocking byte sink the application reads from; control answers
//! (CONNECTED) stay in the queue for the opener to receive.

use crate::error::{Result, TorError};
use crate::protocol::circuit::Circuit;
use crate::protocol::flow_control::DeliveryWindow;
use crate::protocol::relay_cell::{RelayCell, RelayCommand};
use crate::queue::{CellHandler, CellQueue, QueuedCell};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// END reason: closed normally
pub const END_REASON_DONE: u8 = 6;

/// END reason: the owning circuit went away
pub const END_REASON_DESTROY: u8 = 5;

struct StreamState {
    established: bool,
    closed: bool,
    closed_reason: Option<u8>,
}

/// One logical connection through a circuit's exit hop
pub struct TorStream {
    /// Stream id, non-zero and unique within the owning circuit
    pub id: u16,

    circuit: Weak<Circuit>,
    queue: Arc<CellQueue>,
    sink: ByteSink,
    state: Mutex<StreamState>,
}

impl TorStream {
    /// Wire up a stream on a circuit: queue, byte sink, and the
    /// flow-control and demux handlers. No cells are sent.
    pub(crate) fn attach(circuit: &Arc<Circuit>, id: u16) -> Arc<Self> {
        let stream = Arc::new(Self {
            id,
            circuit: Arc::downgrade(circuit),
            queue: Arc::new(CellQueue::new()),
            sink: ByteSink::new(),
            state: Mutex::new(StreamState {
                established: false,
                closed: false,
                closed_reason: None,
            }),
        });

        let config = circuit.config();
        // Flow control first (it never claims), then the demux that
        // consumes DATA and END.
        stream.queue.add_handler(Arc::new(StreamFlowHandler {
            stream: Arc::downgrade(&stream),
            window: Mutex::new(DeliveryWindow::new(
                config.stream_window,
                config.stream_increment,
            )),
        }));
        stream.queue.add_handler(Arc::new(StreamSinkHandler {
            stream: Arc::downgrade(&stream),
        }));
        stream
    }

    /// Client-side open: BEGIN to `host:port`, wait for CONNECTED.
    /// Failure is charged against the circuit's ranking.
    pub(crate) fn open(circuit: &Arc<Circuit>, host: &str, port: u16) -> Result<Arc<Self>> {
        let id = circuit.assign_stream_id()?;
        let stream = Self::attach(circuit, id);
        circuit.register_stream(Arc::clone(&stream))?;

        let mut target = format!("{}:{}", host, port).into_bytes();
        target.push(0);

        let connected = RelayCell::new(RelayCommand::Begin, id, target)
            .and_then(|begin| circuit.send_relay_cell(&begin))
            .and_then(|_| {
                stream
                    .queue
                    .receive_relay_cell(RelayCommand::Connected, circuit.config().stream_connect_timeout)
            });

        match connected {
            Ok(_) => {
                stream.state.lock().established = true;
                log::debug!(
                    "circuit {}: stream {} connected to {}:{}",
                    circuit.id,
                    id,
                    host,
                    port
                );
                circuit.events().stream_built(circuit.id, id);
                Ok(stream)
            }
            Err(e) => {
                log::warn!("circuit {}: stream {} failed to open: {}", circuit.id, id, e);
                circuit.remove_stream(id);
                stream.queue.close();
                circuit.note_stream_failure();
                Err(e)
            }
        }
    }

    /// Server-side accept for a hidden-service inbound BEGIN: the stream
    /// is live immediately and CONNECTED goes straight back.
    pub(crate) fn accept(circuit: &Arc<Circuit>, id: u16) -> Result<Arc<Self>> {
        let stream = Self::attach(circuit, id);
        circuit.register_stream(Arc::clone(&stream))?;
        stream.state.lock().established = true;

        let connected = RelayCell::new(RelayCommand::Connected, id, Vec::new())?;
        if let Err(e) = circuit.send_relay_cell(&connected) {
            circuit.remove_stream(id);
            stream.queue.close();
            return Err(e);
        }
        log::debug!("circuit {}: accepted inbound stream {}", circuit.id, id);
        circuit.events().stream_built(circuit.id, id);
        Ok(stream)
    }

    pub(crate) fn queue(&self) -> &Arc<CellQueue> {
        &self.queue
    }

    /// Send application bytes, chunked into DATA cells of at most
    /// `RelayCell::MAX_DATA_SIZE` bytes each.
    pub fn write_all(&self, bytes: &[u8]) -> Result<()> {
        self.check_open()?;
        let circuit = self.circuit()?;
        for chunk in bytes.chunks(RelayCell::MAX_DATA_SIZE) {
            let cell = RelayCell::new(RelayCommand::Data, self.id, chunk.to_vec())?;
            circuit.send_relay_cell(&cell)?;
        }
        Ok(())
    }

    /// Read received bytes into `buf`, blocking until at least one byte is
    /// available. Returns 0 once the stream ended and the sink drained.
    pub fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let n = self.sink.read(buf, timeout)?;
        if n > 0 {
            if let Some(circuit) = self.circuit.upgrade() {
                circuit.touch();
            }
        }
        Ok(n)
    }

    /// Close normally (END reason DONE)
    pub fn close(&self) -> Result<()> {
        self.close_with_reason(END_REASON_DONE)
    }

    /// Close with an explicit END reason code
    pub fn close_with_reason(&self, reason: u8) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            state.closed_reason = Some(reason);
        }

        if let Some(circuit) = self.circuit.upgrade() {
            match RelayCell::new(RelayCommand::End, self.id, vec![reason]) {
                Ok(end) => {
                    if let Err(e) = circuit.send_relay_cell(&end) {
                        log::debug!("stream {}: END not sent: {}", self.id, e);
                    }
                }
                Err(e) => log::debug!("stream {}: END not built: {}", self.id, e),
            }
            circuit.remove_stream(self.id);
            circuit.events().stream_closed(circuit.id, self.id);
        }

        self.sink.close();
        self.queue.close();
        Ok(())
    }

    /// Forced close on behalf of the owning circuit's teardown
    pub(crate) fn force_close(&self) {
        if let Err(e) = self.close_with_reason(END_REASON_DESTROY) {
            log::debug!("stream {}: forced close: {}", self.id, e);
        }
    }

    /// Local teardown with no wire traffic (peer destroy, dead transport)
    pub(crate) fn abandon(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.closed_reason = Some(END_REASON_DESTROY);
        }
        if let Some(circuit) = self.circuit.upgrade() {
            circuit.remove_stream(self.id);
            circuit.events().stream_closed(circuit.id, self.id);
        }
        self.sink.close();
        self.queue.close();
    }

    /// The exit (or the remote onion service) ended the stream
    fn remote_ended(&self, reason: u8) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.closed_reason = Some(reason);
        }
        log::debug!("stream {} ended by remote: {}", self.id, TorError::StreamEnded(reason));
        if let Some(circuit) = self.circuit.upgrade() {
            circuit.remove_stream(self.id);
            circuit.events().stream_closed(circuit.id, self.id);
        }
        self.sink.close();
        self.queue.close();
    }

    fn deliver_bytes(&self, bytes: &[u8]) {
        self.sink.push(bytes);
        if let Some(circuit) = self.circuit.upgrade() {
            circuit.touch();
        }
    }

    fn send_sendme(&self) -> Result<()> {
        let circuit = self.circuit()?;
        let sendme = RelayCell::new(RelayCommand::Sendme, self.id, Vec::new())?;
        circuit.send_relay_cell(&sendme)
    }

    fn circuit(&self) -> Result<Arc<Circuit>> {
        self.circuit
            .upgrade()
            .ok_or_else(|| TorError::CircuitClosed("owning circuit is gone".into()))
    }

    fn check_open(&self) -> Result<()> {
        let state = self.state.lock();
        if state.closed {
            return Err(match state.closed_reason {
                Some(reason) => TorError::StreamEnded(reason),
                None => TorError::Stream(format!("stream {} is closed", self.id)),
            });
        }
        Ok(())
    }

    pub fn is_established(&self) -> bool {
        let state = self.state.lock();
        state.established && !state.closed
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// END reason observed or sent, once closed
    pub fn closed_reason(&self) -> Option<u8> {
        self.state.lock().closed_reason
    }
}

/// Stream-level flow control: counts delivered DATA cells, never claims
struct StreamFlowHandler {
    stream: Weak<TorStream>,
    window: Mutex<DeliveryWindow>,
}

impl CellHandler for StreamFlowHandler {
    fn handle(&self, cell: &QueuedCell) -> Result<bool> {
        if let QueuedCell::Relay(cell) = cell {
            if cell.command == RelayCommand::Data && self.window.lock().deliver() {
                if let Some(stream) = self.stream.upgrade() {
                    stream.send_sendme()?;
                }
            }
        }
        Ok(false)
    }
}

/// Demultiplexer: DATA bytes go to the sink, END closes the stream; both
/// are claimed. Everything else (CONNECTED, RESOLVED, ...) stays queued.
struct StreamSinkHandler {
    stream: Weak<TorStream>,
}

impl CellHandler for StreamSinkHandler {
    fn handle(&self, cell: &QueuedCell) -> Result<bool> {
        let stream = match self.stream.upgrade() {
            Some(stream) => stream,
            None => return Ok(false),
        };
        if let QueuedCell::Relay(cell) = cell {
            match cell.command {
                RelayCommand::Data => {
                    stream.deliver_bytes(&cell.data);
                    return Ok(true);
                }
                RelayCommand::End => {
                    let reason = cell.data.first().copied().unwrap_or(0);
                    stream.remote_ended(reason);
                    return Ok(true);
                }
                // Peer credit; nothing gates on it
                RelayCommand::Sendme => return Ok(true),
                _ => {}
            }
        }
        Ok(false)
    }
}

/// Blocking byte buffer between the dispatcher and the application reader
struct ByteSink {
    inner: Mutex<SinkInner>,
    cond: Condvar,
}

struct SinkInner {
    buf: VecDeque<u8>,
    closed: bool,
}

impl ByteSink {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                buf: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    fn push(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.buf.extend(bytes);
        drop(inner);
        self.cond.notify_all();
    }

    fn close(&self) {
        self.inner.lock().closed = true;
        self.cond.notify_all();
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if !inner.buf.is_empty() {
                let n = buf.len().min(inner.buf.len());
                for slot in buf.iter_mut().take(n) {
                    // drain preserves arrival order
                    *slot = inner.buf.pop_front().unwrap_or(0);
                }
                return Ok(n);
            }
            if inner.closed {
                return Ok(0);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TorError::Timeout("stream data".into()));
            }
            self.cond.wait_for(&mut inner, deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::protocol::circuit::tests::RecordingLink;
    use crate::router::NoEvents;

    fn circuit_for_tests() -> Arc<Circuit> {
        Circuit::new(1, Config::default(), RecordingLink::new(), Arc::new(NoEvents))
    }

    #[test]
    fn test_sink_push_read() {
        let sink = ByteSink::new();
        sink.push(b"hello ");
        sink.push(b"world");
        let mut buf = [0u8; 64];
        let n = sink.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn test_sink_partial_read_keeps_rest() {
        let sink = ByteSink::new();
        sink.push(b"abcdef");
        let mut buf = [0u8; 4];
        assert_eq!(sink.read(&mut buf, Duration::from_millis(10)).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        let n = sink.read(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(&buf[..n], b"ef");
    }

    #[test]
    fn test_sink_eof_after_close() {
        let sink = ByteSink::new();
        sink.push(b"tail");
        sink.close();
        let mut buf = [0u8; 8];
        // Buffered bytes still drain, then EOF
        assert_eq!(sink.read(&mut buf, Duration::from_millis(10)).unwrap(), 4);
        assert_eq!(sink.read(&mut buf, Duration::from_millis(10)).unwrap(), 0);
    }

    #[test]
    fn test_sink_read_times_out() {
        let sink = ByteSink::new();
        let mut buf = [0u8; 8];
        assert!(matches!(
            sink.read(&mut buf, Duration::from_millis(20)),
            Err(TorError::Timeout(_))
        ));
    }

    #[test]
    fn test_data_cells_reach_the_sink_claimed() {
        let circuit = circuit_for_tests();
        let stream = TorStream::attach(&circuit, 5);

        let data = RelayCell::new(RelayCommand::Data, 5, b"payload".to_vec()).unwrap();
        stream.queue().add(QueuedCell::Relay(data));

        // Claimed by the demux handler, so the queue stays empty
        assert!(stream.queue().is_empty());
        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf, Duration::from_millis(50)).unwrap();
        assert_eq!(&buf[..n], b"payload");
    }

    #[test]
    fn test_end_closes_and_removes_stream() {
        let circuit = circuit_for_tests();
        let stream = TorStream::attach(&circuit, 5);
        circuit.register_stream(Arc::clone(&stream)).unwrap();
        assert_eq!(circuit.stream_count(), 1);

        let end = RelayCell::new(RelayCommand::End, 5, vec![END_REASON_DONE]).unwrap();
        stream.queue().add(QueuedCell::Relay(end));

        assert!(stream.is_closed());
        assert_eq!(stream.closed_reason(), Some(END_REASON_DONE));
        assert_eq!(circuit.stream_count(), 0);
        // Drained sink reports EOF, not timeout
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf, Duration::from_millis(10)).unwrap(), 0);
    }

    #[test]
    fn test_connected_stays_queued() {
        let circuit = circuit_for_tests();
        let stream = TorStream::attach(&circuit, 5);
        let connected = RelayCell::new(RelayCommand::Connected, 5, Vec::new()).unwrap();
        stream.queue().add(QueuedCell::Relay(connected));
        assert_eq!(stream.queue().len(), 1);
    }

    #[test]
    fn test_write_on_closed_stream_fails() {
        let circuit = circuit_for_tests();
        let stream = TorStream::attach(&circuit, 5);
        circuit.register_stream(Arc::clone(&stream)).unwrap();
        stream.abandon();
        assert!(matches!(
            stream.write_all(b"late"),
            Err(TorError::StreamEnded(END_REASON_DESTROY))
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let circuit = circuit_for_tests();
        let stream = TorStream::attach(&circuit, 5);
        circuit.register_stream(Arc::clone(&stream)).unwrap();
        stream.close().unwrap();
        stream.close().unwrap();
        assert_eq!(stream.closed_reason(), Some(END_REASON_DONE));
    }
}
