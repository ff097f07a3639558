//! Cell delivery queues
//!
//! Every circuit and stream owns a `CellQueue`: a thread-safe FIFO with a
//! blocking, timeout-bounded `get`, plus a pipeline of handlers consulted
//! before a cell is enqueued. A handler that claims a cell removes it from
//! delivery entirely — flow control and stream-byte demultiplexing are
//! implemented this way. Unclaimed cells wait in the FIFO for a typed
//! receive.

use crate::error::{Result, TorError};
use crate::protocol::cell::{Cell, CellCommand};
use crate::protocol::relay_cell::{RelayCell, RelayCommand};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A cell as seen by a queue: either a raw control cell or a decoded
/// relay cell.
#[derive(Debug, Clone)]
pub enum QueuedCell {
    Control(Cell),
    Relay(RelayCell),
}

impl QueuedCell {
    fn describe(&self) -> String {
        match self {
            QueuedCell::Control(c) => format!("{:?}", c.command),
            QueuedCell::Relay(r) => format!("RELAY_{:?}", r.command),
        }
    }
}

/// Pipeline stage consulted before a cell reaches the FIFO.
///
/// Returning `Ok(true)` claims the cell (it is consumed); `Ok(false)`
/// passes it on. Handler errors are logged and treated as "not claimed" so
/// a misbehaving handler cannot stall delivery.
pub trait CellHandler: Send + Sync {
    fn handle(&self, cell: &QueuedCell) -> Result<bool>;
}

struct Inner {
    cells: VecDeque<QueuedCell>,
    closed: bool,
}

/// Thread-safe FIFO of inbound cells with blocking receive
pub struct CellQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
    handlers: Mutex<Vec<Arc<dyn CellHandler>>>,
}

impl CellQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                cells: VecDeque::new(),
                closed: false,
            }),
            cond: Condvar::new(),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Append a handler to the pipeline (consulted in registration order)
    pub fn add_handler(&self, handler: Arc<dyn CellHandler>) {
        self.handlers.lock().push(handler);
    }

    /// Offer a cell to the handler pipeline, then enqueue it if unclaimed.
    /// Cells arriving after `close` are dropped.
    pub fn add(&self, cell: QueuedCell) {
        // Snapshot the pipeline so handlers run without holding the lock
        let handlers: Vec<_> = self.handlers.lock().clone();
        for handler in &handlers {
            match handler.handle(&cell) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    log::debug!("queue handler error on {}: {}", cell.describe(), e);
                }
            }
        }

        let mut inner = self.inner.lock();
        if inner.closed {
            log::debug!("dropping {} on closed queue", cell.describe());
            return;
        }
        inner.cells.push_back(cell);
        drop(inner);
        self.cond.notify_one();
    }

    /// Blocking receive. Returns `None` once the timeout elapses or the
    /// queue is closed.
    pub fn get(&self, timeout: Duration) -> Option<QueuedCell> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(cell) = inner.cells.pop_front() {
                return Some(cell);
            }
            if inner.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let result = self.cond.wait_for(&mut inner, deadline - now);
            if result.timed_out() && inner.cells.is_empty() {
                return None;
            }
        }
    }

    /// Receive a control cell of the expected command, failing on anything
    /// else.
    pub fn receive_cell(&self, expected: CellCommand, timeout: Duration) -> Result<Cell> {
        match self.get(timeout) {
            Some(QueuedCell::Control(cell)) if cell.command == expected => Ok(cell),
            Some(other) => Err(TorError::UnexpectedCell {
                expected: format!("{:?}", expected),
                got: other.describe(),
            }),
            None => self.no_answer(format!("{:?}", expected)),
        }
    }

    /// Receive a relay cell of the expected command, failing on anything
    /// else.
    pub fn receive_relay_cell(&self, expected: RelayCommand, timeout: Duration) -> Result<RelayCell> {
        match self.get(timeout) {
            Some(QueuedCell::Relay(cell)) if cell.command == expected => Ok(cell),
            Some(other) => Err(TorError::UnexpectedCell {
                expected: format!("RELAY_{:?}", expected),
                got: other.describe(),
            }),
            None => self.no_answer(format!("RELAY_{:?}", expected)),
        }
    }

    fn no_answer<T>(&self, expected: String) -> Result<T> {
        if self.inner.lock().closed {
            Err(TorError::QueueClosed)
        } else {
            Err(TorError::Timeout(expected))
        }
    }

    /// Close the queue, waking every blocked waiter with a "closed" result
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.cells.clear();
        drop(inner);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of cells waiting for delivery
    pub fn len(&self) -> usize {
        self.inner.lock().cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CellQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fifo_order() {
        let queue = CellQueue::new();
        queue.add(QueuedCell::Control(Cell::padding(1)));
        queue.add(QueuedCell::Control(Cell::padding(2)));

        match queue.get(Duration::from_millis(10)) {
            Some(QueuedCell::Control(c)) => assert_eq!(c.circuit_id, 1),
            other => panic!("unexpected: {:?}", other),
        }
        match queue.get(Duration::from_millis(10)) {
            Some(QueuedCell::Control(c)) => assert_eq!(c.circuit_id, 2),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_get_times_out() {
        let queue = CellQueue::new();
        let start = Instant::now();
        assert!(queue.get(Duration::from_millis(20)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_close_wakes_waiter() {
        let queue = Arc::new(CellQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.get(Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        queue.close();
        assert!(waiter.join().unwrap().is_none());
    }

    #[test]
    fn test_typed_receive_mismatch() {
        let queue = CellQueue::new();
        queue.add(QueuedCell::Control(Cell::padding(1)));
        let err = queue
            .receive_cell(CellCommand::Created, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TorError::UnexpectedCell { .. }));
    }

    #[test]
    fn test_receive_on_closed_queue() {
        let queue = CellQueue::new();
        queue.close();
        let err = queue
            .receive_cell(CellCommand::Created, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, TorError::QueueClosed));
    }

    struct ClaimData {
        claimed: AtomicUsize,
    }

    impl CellHandler for ClaimData {
        fn handle(&self, cell: &QueuedCell) -> Result<bool> {
            if let QueuedCell::Relay(r) = cell {
                if r.command == RelayCommand::Data {
                    self.claimed.fetch_add(1, Ordering::SeqCst);
                    return Ok(true);
                }
            }
            Ok(false)
        }
    }

    #[test]
    fn test_handler_claims_cell() {
        let queue = CellQueue::new();
        let handler = Arc::new(ClaimData {
            claimed: AtomicUsize::new(0),
        });
        queue.add_handler(handler.clone());

        let data = RelayCell::new(RelayCommand::Data, 1, vec![1]).unwrap();
        queue.add(QueuedCell::Relay(data));
        let end = RelayCell::new(RelayCommand::End, 1, vec![6]).unwrap();
        queue.add(QueuedCell::Relay(end));

        // The DATA cell was claimed; only END reaches the FIFO
        assert_eq!(handler.claimed.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 1);
        let cell = queue
            .receive_relay_cell(RelayCommand::End, Duration::from_millis(10))
            .unwrap();
        assert_eq!(cell.command, RelayCommand::End);
    }
}
