//! Remote instrument protocol client contract.
//!
//! Acquisition machines poll remote nodes through [`ProtocolClient`]. The
//! transport itself (OPC UA, Modbus, ...) lives outside this crate; a read
//! either yields a [`RemoteValue`] or nothing for that tick.
//!
//! [`MockProtocolClient`] simulates a set of nodes for testing without
//! physical hardware.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;

/// A value read from a remote node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemoteValue {
    /// Value in the tag base unit
    pub value: f64,
    /// Source timestamp reported by the server
    pub timestamp: DateTime<Utc>,
}

/// Reads live values from remote instruments.
pub trait ProtocolClient: Send + Sync {
    /// Read the node identified by `namespace` on the server at `address`.
    ///
    /// Returns `None` when the node could not be read.
    fn read_value(&self, address: &str, namespace: &str) -> Option<RemoteValue>;
}

#[derive(Debug, Clone, Copy)]
struct SimulatedNode {
    base: f64,
    /// Relative noise amplitude (0.05 = ±5%)
    noise: f64,
}

/// Simulated protocol client.
///
/// Nodes must be registered before they can be read; unknown nodes
/// behave like unreachable ones and return `None`.
#[derive(Debug, Default)]
pub struct MockProtocolClient {
    nodes: RwLock<HashMap<(String, String), SimulatedNode>>,
}

impl MockProtocolClient {
    /// Client without simulated nodes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node that always returns `value`.
    pub fn with_node(self, address: &str, namespace: &str, value: f64) -> Self {
        self.set_node(address, namespace, value);
        self
    }

    /// Register a node returning `base` with ±`noise` relative jitter.
    pub fn with_noisy_node(self, address: &str, namespace: &str, base: f64, noise: f64) -> Self {
        self.nodes.write().insert(
            (address.to_string(), namespace.to_string()),
            SimulatedNode {
                base,
                noise: noise.abs(),
            },
        );
        self
    }

    /// Set (or replace) the fixed value served by a node.
    pub fn set_node(&self, address: &str, namespace: &str, value: f64) {
        self.nodes.write().insert(
            (address.to_string(), namespace.to_string()),
            SimulatedNode {
                base: value,
                noise: 0.0,
            },
        );
    }

    /// Make a node unreachable.
    pub fn remove_node(&self, address: &str, namespace: &str) {
        self.nodes
            .write()
            .remove(&(address.to_string(), namespace.to_string()));
    }
}

impl ProtocolClient for MockProtocolClient {
    fn read_value(&self, address: &str, namespace: &str) -> Option<RemoteValue> {
        let node = *self
            .nodes
            .read()
            .get(&(address.to_string(), namespace.to_string()))?;

        let value = if node.noise > 0.0 {
            let mut rng = rand::thread_rng();
            node.base * (1.0 + rng.gen_range(-node.noise..node.noise))
        } else {
            node.base
        };

        Some(RemoteValue {
            value,
            timestamp: Utc::now(),
        })
    }
}
