//! # onionlink
//!
//! Client-side onion-routing circuit engine: fixed 512-byte cells, layered
//! AES-128-CTR relay encryption with per-hop running SHA1 digests, and the
//! TAP-style 1024-bit Diffie-Hellman handshake, together with the circuit,
//! stream, dispatch and pooling machinery that drives them.
//!
//! What stays outside the crate, behind traits: router directories and
//! route selection ([`router::RouterSelector`]), the byte transport
//! ([`connection::Transport`]), and the asymmetric wrapping of onion skins
//! ([`router::OnionSkinCipher`]).
//!
//! ## Typical use
//!
//! ```no_run
//! use onionlink::{CircuitBuilder, Config, ConnectionDirectory};
//! use onionlink::router::NoEvents;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # fn run(selector: Arc<dyn onionlink::RouterSelector>,
//! #        transport: Arc<dyn onionlink::Transport>) -> onionlink::Result<()> {
//! let directory = Arc::new(ConnectionDirectory::new(transport));
//! let builder = CircuitBuilder::new(Config::default(), selector, directory, Arc::new(NoEvents));
//!
//! let circuit = builder.build()?;
//! let stream = circuit.open_stream("example.com", 80)?;
//! stream.write_all(b"GET / HTTP/1.0\r\n\r\n")?;
//! let mut buf = [0u8; 4096];
//! let n = stream.read(&mut buf, Duration::from_secs(30))?;
//! stream.close()?;
//! # let _ = n;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod router;

pub use config::Config;
pub use connection::{ConnectionDirectory, Transport, TransportConnection};
pub use error::{Result, TorError};
pub use pool::CircuitPool;
pub use protocol::builder::CircuitBuilder;
pub use protocol::circuit::Circuit;
pub use protocol::stream::TorStream;
pub use router::{CircuitEvents, OnionSkinCipher, Router, RouterSelector};
