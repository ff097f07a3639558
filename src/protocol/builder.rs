//! Circuit construction
//!
//! Drives the CREATE/EXTEND sequence over a route picked by the external
//! selector. A failed hop is punished and the route rebuilt around the
//! prefix that already answered, bounded by both a retry count and a hard
//! construction deadline.

use crate::config::Config;
use crate::connection::ConnectionDirectory;
use crate::error::{Result, TorError};
use crate::protocol::circuit::Circuit;
use crate::router::{CircuitEvents, Router, RouterSelector};
use std::sync::Arc;
use std::time::Instant;

pub struct CircuitBuilder {
    config: Config,
    selector: Arc<dyn RouterSelector>,
    directory: Arc<ConnectionDirectory>,
    events: Arc<dyn CircuitEvents>,
}

impl CircuitBuilder {
    pub fn new(
        config: Config,
        selector: Arc<dyn RouterSelector>,
        directory: Arc<ConnectionDirectory>,
        events: Arc<dyn CircuitEvents>,
    ) -> Self {
        Self {
            config,
            selector,
            directory,
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build a circuit of the configured default length
    pub fn build(&self) -> Result<Arc<Circuit>> {
        self.build_with_length(self.config.route_length)
    }

    /// Build a circuit of `len` hops, retrying with rebuilt routes
    pub fn build_with_length(&self, len: usize) -> Result<Arc<Circuit>> {
        if len == 0 {
            return Err(TorError::CircuitBuildFailed(
                "route length must be at least 1".into(),
            ));
        }

        let deadline = Instant::now() + self.config.max_build_duration;
        // Hops that already answered in a previous attempt get reused as
        // the route prefix.
        let mut confirmed: Vec<Router> = Vec::new();
        let mut last_error = TorError::CircuitBuildFailed("no attempt made".into());

        for attempt in 1..=self.config.build_retry_limit {
            if Instant::now() >= deadline {
                log::warn!("circuit build deadline exceeded after {} attempts", attempt - 1);
                break;
            }

            let route = match self.assemble_route(len, &confirmed) {
                Ok(route) => route,
                Err(e) => {
                    log::warn!("route selection failed: {}", e);
                    last_error = e;
                    continue;
                }
            };

            match self.attempt(&route) {
                Ok(circuit) => return Ok(circuit),
                Err((failed_index, e)) => {
                    log::warn!(
                        "circuit attempt {}/{} failed at hop {} ({}): {}",
                        attempt,
                        self.config.build_retry_limit,
                        failed_index,
                        route[failed_index].nickname,
                        e
                    );
                    self.selector.punish(&route[failed_index].fingerprint);
                    confirmed = route[..failed_index].to_vec();
                    last_error = e;
                }
            }
        }

        Err(TorError::CircuitBuildFailed(format!(
            "gave up after {} attempts: {}",
            self.config.build_retry_limit, last_error
        )))
    }

    fn assemble_route(&self, len: usize, confirmed: &[Router]) -> Result<Vec<Router>> {
        let exclude: Vec<String> = confirmed.iter().map(|r| r.fingerprint.clone()).collect();
        let fresh = self.selector.select_route(len - confirmed.len(), &exclude)?;
        let mut route = confirmed.to_vec();
        route.extend(fresh);
        Ok(route)
    }

    /// One full construction pass over `route`. On failure returns the
    /// index of the hop that did not come up.
    fn attempt(&self, route: &[Router]) -> std::result::Result<Arc<Circuit>, (usize, TorError)> {
        let connection = self.directory.connect(&route[0]).map_err(|e| (0, e))?;
        let circuit = connection
            .new_circuit(&self.config, Arc::clone(&self.events))
            .map_err(|e| (0, e))?;

        if let Err(e) = circuit.create_first_hop(&route[0]) {
            circuit.force_abandon();
            return Err((0, e));
        }
        for (i, hop) in route.iter().enumerate().skip(1) {
            if let Err(e) = circuit.extend(hop) {
                circuit.force_abandon();
                return Err((i, e));
            }
        }

        circuit.mark_established();
        Ok(circuit)
    }
}
