//! Prebuilt circuit pool
//!
//! Keeps a small set of established circuits warm so that opening a
//! stream does not pay the full construction latency. A background
//! sweeper retires closed, aged and idle circuits, sends keep-alive
//! padding on the rest, and replenishes to the configured minimum.
//! Individual sweep failures are logged and swallowed; a failed build
//! attempt must not stop the maintenance loop.

use crate::config::Config;
use crate::error::Result;
use crate::protocol::builder::CircuitBuilder;
use crate::protocol::circuit::Circuit;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;

struct PoolShared {
    circuits: Mutex<Vec<Arc<Circuit>>>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

pub struct CircuitPool {
    builder: Arc<CircuitBuilder>,
    config: Config,
    shared: Arc<PoolShared>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl CircuitPool {
    pub fn new(builder: Arc<CircuitBuilder>) -> Self {
        let config = builder.config().clone();
        Self {
            builder,
            config,
            shared: Arc::new(PoolShared {
                circuits: Mutex::new(Vec::new()),
                shutdown: Mutex::new(false),
                wake: Condvar::new(),
            }),
            sweeper: Mutex::new(None),
        }
    }

    /// Spawn the background sweeper. Safe to call once.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let builder = Arc::clone(&self.builder);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("circuit-pool".into())
            .spawn(move || loop {
                {
                    let mut shutdown = shared.shutdown.lock();
                    if !*shutdown {
                        shared
                            .wake
                            .wait_for(&mut shutdown, config.pool_sweep_interval);
                    }
                    if *shutdown {
                        return;
                    }
                }
                Self::sweep(&shared, &builder, &config);
            });
        match handle {
            Ok(handle) => *sweeper = Some(handle),
            Err(e) => log::warn!("circuit pool sweeper not started: {}", e),
        }
    }

    /// One maintenance pass: prune, keep alive, replenish
    fn sweep(shared: &PoolShared, builder: &CircuitBuilder, config: &Config) {
        let (retired, keep): (Vec<Arc<Circuit>>, Vec<Arc<Circuit>>) = {
            let mut circuits = shared.circuits.lock();
            let (retired, keep): (Vec<_>, Vec<_>) = circuits.drain(..).partition(|c| {
                c.is_closed()
                    || c.age() > config.pool_max_age
                    || c.idle() > config.pool_max_idle
            });
            *circuits = keep.clone();
            (retired, keep)
        };

        for circuit in retired {
            log::debug!("pool: retiring circuit {}", circuit.id);
            if let Err(e) = circuit.close(true) {
                log::debug!("pool: circuit {} close failed: {}", circuit.id, e);
            }
        }

        for circuit in &keep {
            if let Err(e) = circuit.send_padding() {
                log::debug!("pool: keep-alive for circuit {} failed: {}", circuit.id, e);
            }
        }

        let mut live = keep.len();
        while live < config.pool_min_circuits {
            match builder.build() {
                Ok(circuit) => {
                    log::debug!("pool: replenished with circuit {}", circuit.id);
                    shared.circuits.lock().push(circuit);
                    live += 1;
                }
                Err(e) => {
                    // Swallowed: the next sweep tries again
                    log::warn!("pool: replenish failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Hand out the best-ranked pooled circuit, building one on demand
    /// when the pool is empty.
    pub fn take(&self) -> Result<Arc<Circuit>> {
        let best = {
            let mut circuits = self.shared.circuits.lock();
            circuits.retain(|c| !c.is_closed());
            let best_index = circuits
                .iter()
                .enumerate()
                .filter(|(_, c)| c.is_established())
                .max_by(|(_, a), (_, b)| {
                    a.rank()
                        .partial_cmp(&b.rank())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(i, _)| i);
            best_index.map(|i| circuits.remove(i))
        };
        match best {
            Some(circuit) => Ok(circuit),
            None => self.builder.build(),
        }
    }

    /// Park a circuit back in the pool (dropped if the pool is full or the
    /// circuit became unusable).
    pub fn put(&self, circuit: Arc<Circuit>) {
        if !circuit.is_established() {
            return;
        }
        let mut circuits = self.shared.circuits.lock();
        if circuits.len() >= self.config.pool_max_circuits {
            drop(circuits);
            log::debug!("pool full, closing returned circuit {}", circuit.id);
            if let Err(e) = circuit.close(false) {
                log::debug!("pool: circuit {} close deferred: {}", circuit.id, e);
            }
            return;
        }
        circuits.push(circuit);
    }

    pub fn len(&self) -> usize {
        self.shared.circuits.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop the sweeper and close every pooled circuit
    pub fn shutdown(&self) {
        {
            let mut shutdown = self.shared.shutdown.lock();
            if *shutdown {
                return;
            }
            *shutdown = true;
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.sweeper.lock().take() {
            if handle.join().is_err() {
                log::warn!("circuit pool sweeper panicked");
            }
        }
        let circuits: Vec<Arc<Circuit>> = self.shared.circuits.lock().drain(..).collect();
        for circuit in circuits {
            if let Err(e) = circuit.close(true) {
                log::debug!("pool shutdown: circuit {}: {}", circuit.id, e);
            }
        }
    }
}

impl Drop for CircuitPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
