//! Bridge Registry
//!
//! Read-only view over the configured bridge table.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::BridgeConfig;
use crate::error::{OracleError, OracleResult};

/// Configured bridges, indexed by id. Immutable after startup.
#[derive(Debug, Clone, Default)]
pub struct BridgeRegistry {
    bridges: BTreeMap<String, Arc<BridgeConfig>>,
}

impl BridgeRegistry {
    pub fn new(bridges: Vec<BridgeConfig>) -> OracleResult<Self> {
        let mut map = BTreeMap::new();
        for bridge in bridges {
            bridge.validate()?;
            let id = bridge.id.clone();
            if map.insert(id.clone(), Arc::new(bridge)).is_some() {
                return Err(OracleError::InvalidConfig(format!("duplicate bridge id {}", id)));
            }
        }
        Ok(Self { bridges: map })
    }

    /// All bridges, ordered by id.
    pub fn list_bridges(&self) -> Vec<Arc<BridgeConfig>> {
        self.bridges.values().cloned().collect()
    }

    pub fn get_bridge(&self, id: &str) -> OracleResult<Arc<BridgeConfig>> {
        self.bridges
            .get(id)
            .cloned()
            .ok_or_else(|| OracleError::UnknownBridge(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.bridges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bridges.is_empty()
    }
}
