//! Wire protocol and circuit core: cells, onion relay encryption, per-hop
//! handshakes, circuits and streams.

pub mod builder;
pub mod cell;
pub mod circuit;
pub mod flow_control;
pub mod node;
pub mod relay_cell;
pub mod stream;
