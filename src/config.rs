//! Engine configuration
//!
//! Every tuning knob lives here so that callers can adjust timeouts, flow
//! control windows and the circuit ranking heuristic without touching the
//! protocol code. Defaults follow the reference network parameters.

use std::time::Duration;

/// Configuration for circuit construction, flow control and pooling
#[derive(Debug, Clone)]
pub struct Config {
    /// Default number of hops in a new circuit
    pub route_length: usize,

    /// How long to wait for a CREATED answer from the first hop
    pub create_timeout: Duration,

    /// How long to wait for an EXTENDED answer per additional hop
    pub extend_timeout: Duration,

    /// How long to wait for CONNECTED after sending BEGIN
    pub stream_connect_timeout: Duration,

    /// Hard deadline for one circuit build including all retries
    pub max_build_duration: Duration,

    /// How many rebuilt routes to try before giving up
    pub build_retry_limit: u32,

    /// Circuit-level delivery window (cells)
    pub circuit_window: u32,

    /// Circuit-level SENDME increment (cells)
    pub circuit_increment: u32,

    /// Stream-level delivery window (cells)
    pub stream_window: u32,

    /// Stream-level SENDME increment (cells)
    pub stream_increment: u32,

    /// Absolute stream-failure count past which a circuit self-closes
    pub max_stream_failures: u32,

    /// Stream failures must also exceed this multiple of streams opened
    /// before the circuit self-closes
    pub stream_failure_ratio: f32,

    /// Ranking: base of the exponential per-failure punishment (0..1)
    pub ranking_failure_base: f32,

    /// Ranking: reference setup latency; faster circuits rank above 1x
    pub ranking_latency_ref: Duration,

    /// Minimum number of established circuits the pool keeps ready
    pub pool_min_circuits: usize,

    /// Maximum number of pooled circuits
    pub pool_max_circuits: usize,

    /// Pooled circuits older than this are retired
    pub pool_max_age: Duration,

    /// Pooled circuits idle longer than this are retired
    pub pool_max_idle: Duration,

    /// Sleep between background maintenance sweeps
    pub pool_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            route_length: 3,
            create_timeout: Duration::from_secs(20),
            extend_timeout: Duration::from_secs(20),
            stream_connect_timeout: Duration::from_secs(30),
            max_build_duration: Duration::from_secs(120),
            build_retry_limit: 5,
            circuit_window: 1000,
            circuit_increment: 100,
            stream_window: 500,
            stream_increment: 50,
            max_stream_failures: 3,
            stream_failure_ratio: 0.5,
            ranking_failure_base: 0.75,
            ranking_latency_ref: Duration::from_secs(10),
            pool_min_circuits: 1,
            pool_max_circuits: 3,
            pool_max_age: Duration::from_secs(600),
            pool_max_idle: Duration::from_secs(300),
            pool_sweep_interval: Duration::from_secs(30),
        }
    }
}
