//! Oracle Service
//!
//! Wires the pipeline together and runs it: one watcher task and one
//! dispatcher task per bridge, each on its own schedule. A failing bridge only
//! affects itself; errors are logged with the bridge id and the tasks keep
//! going.
//!
//! The service also keeps the per-bridge health snapshot served by
//! `GET /health` and the pause state driven by the API and by repeated chain
//! outages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Config, HealthConfig};
use crate::connector::ConnectorPool;
use crate::crypto::CryptoService;
use crate::error::{OracleError, OracleResult};
use crate::monitor::{EventWatcher, TickReport};
use crate::registry::BridgeRegistry;
use crate::relay::{DispatchReport, RelayDispatcher};
use crate::storage::OracleStore;
use crate::types::ChainSide;
use crate::validator::ValidationEngine;

// ============================================================================
// PAUSE CONTROL
// ============================================================================

/// Pause state of one bridge.
#[derive(Debug, Default)]
pub struct BridgeControl {
    manual: AtomicBool,
    paused_until: Mutex<Option<Instant>>,
    consecutive_failures: AtomicU32,
}

impl BridgeControl {
    pub fn pause(&self) {
        self.manual.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.manual.store(false, Ordering::SeqCst);
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if let Ok(mut until) = self.paused_until.lock() {
            *until = None;
        }
    }

    pub fn is_manually_paused(&self) -> bool {
        self.manual.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        if self.is_manually_paused() {
            return true;
        }
        match self.paused_until.lock() {
            Ok(until) => until.map(|t| Instant::now() < t).unwrap_or(false),
            Err(_) => false,
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    /// Counts a chain outage; returns true when it triggered an automatic pause.
    pub fn record_unavailable(&self, threshold: u32, pause: Duration) -> bool {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if threshold == 0 || failures < threshold {
            return false;
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if let Ok(mut until) = self.paused_until.lock() {
            *until = Some(Instant::now() + pause);
        }
        true
    }
}

// ============================================================================
// HEALTH
// ============================================================================

/// Watcher progress of one bridge side.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SideHealth {
    pub side: ChainSide,
    pub chain_id: u64,
    pub latest_block: Option<u64>,
    pub last_processed_block: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Entry of the `/health` response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeHealth {
    pub id: String,
    /// Lowest cursor of the two sides
    pub last_processed_block: u64,
    pub pending_jobs: usize,
    pub failed_jobs: usize,
    pub healthy: bool,
    pub paused: bool,
    pub sides: Vec<SideHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub bridges: Vec<BridgeHealth>,
}

/// Last watcher outcome per bridge side.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    sides: Arc<RwLock<HashMap<(String, ChainSide), SideHealth>>>,
}

impl HealthRegistry {
    pub async fn record_tick(&self, bridge_id: &str, side: ChainSide, chain_id: u64, report: &TickReport) {
        let mut sides = self.sides.write().await;
        sides.insert(
            (bridge_id.to_string(), side),
            SideHealth {
                side,
                chain_id,
                latest_block: Some(report.latest_block),
                last_processed_block: report.cursor,
                last_success_at: Some(Utc::now()),
                last_error: None,
            },
        );
    }

    pub async fn record_error(&self, bridge_id: &str, side: ChainSide, chain_id: u64, cursor: u64, err: &OracleError) {
        let mut sides = self.sides.write().await;
        let entry = sides
            .entry((bridge_id.to_string(), side))
            .or_insert_with(|| SideHealth {
                side,
                chain_id,
                latest_block: None,
                last_processed_block: cursor,
                last_success_at: None,
                last_error: None,
            });
        entry.last_error = Some(err.to_string());
    }

    async fn side(&self, bridge_id: &str, side: ChainSide) -> Option<SideHealth> {
        self.sides
            .read()
            .await
            .get(&(bridge_id.to_string(), side))
            .cloned()
    }
}

/// Whether a side is within the lag and staleness thresholds.
fn side_is_healthy(side: &SideHealth, thresholds: &HealthConfig, now: DateTime<Utc>) -> bool {
    let Some(last_success) = side.last_success_at else {
        return false;
    };
    let stale = now
        .signed_duration_since(last_success)
        .to_std()
        .map(|age| age > Duration::from_secs(thresholds.max_stale_secs))
        .unwrap_or(false);
    let lag = side
        .latest_block
        .map(|latest| latest.saturating_sub(side.last_processed_block))
        .unwrap_or(u64::MAX);
    !stale && lag <= thresholds.max_lag_blocks
}

// ============================================================================
// SERVICE IMPLEMENTATION
// ============================================================================

pub struct OracleService {
    config: Arc<Config>,
    registry: Arc<BridgeRegistry>,
    store: OracleStore,
    pool: ConnectorPool,
    engine: Arc<ValidationEngine>,
    crypto: Option<Arc<CryptoService>>,
    health: HealthRegistry,
    controls: BTreeMap<String, Arc<BridgeControl>>,
}

impl OracleService {
    /// Builds the service and all per-bridge components.
    pub fn new(
        config: Arc<Config>,
        store: OracleStore,
        pool: ConnectorPool,
        crypto: Option<Arc<CryptoService>>,
    ) -> OracleResult<Self> {
        let registry = Arc::new(BridgeRegistry::new(config.bridges.clone())?);
        let engine = Arc::new(ValidationEngine::new(
            &config,
            registry.clone(),
            store.clone(),
            crypto.clone(),
        ));
        let controls = registry
            .list_bridges()
            .iter()
            .map(|bridge| (bridge.id.clone(), Arc::new(BridgeControl::default())))
            .collect();

        for bridge in registry.list_bridges() {
            for side in ChainSide::BOTH {
                pool.get(bridge.side(side).chain_id)?;
            }
        }

        Ok(Self {
            config,
            registry,
            store,
            pool,
            engine,
            crypto,
            health: HealthRegistry::default(),
            controls,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BridgeRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &OracleStore {
        &self.store
    }

    pub fn engine(&self) -> &Arc<ValidationEngine> {
        &self.engine
    }

    pub fn crypto(&self) -> Option<&Arc<CryptoService>> {
        self.crypto.as_ref()
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn control(&self, bridge_id: &str) -> OracleResult<Arc<BridgeControl>> {
        self.controls
            .get(bridge_id)
            .cloned()
            .ok_or_else(|| OracleError::UnknownBridge(bridge_id.to_string()))
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.oracle.polling_interval_ms)
    }

    /// Spawns the watcher and dispatcher tasks of every bridge.
    pub fn spawn(self: &Arc<Self>) -> OracleResult<Vec<JoinHandle<()>>> {
        let mut handles = Vec::new();

        for bridge in self.registry.list_bridges() {
            let mut watchers = Vec::new();
            for side in ChainSide::BOTH {
                watchers.push(EventWatcher::new(
                    bridge.clone(),
                    side,
                    self.pool.get(bridge.side(side).chain_id)?,
                    self.store.clone(),
                    self.engine.clone(),
                )?);
            }
            let service = self.clone();
            let bridge_id = bridge.id.clone();
            handles.push(tokio::spawn(async move {
                service.run_watchers(&bridge_id, watchers).await;
            }));

            match (&self.crypto, self.config.oracle.relay_enabled) {
                (Some(crypto), true) => {
                    let dispatcher = RelayDispatcher::new(
                        bridge.clone(),
                        self.store.clone(),
                        &self.pool,
                        crypto.clone(),
                        self.config.relay.clone(),
                    )?;
                    let service = self.clone();
                    let bridge_id = bridge.id.clone();
                    handles.push(tokio::spawn(async move {
                        service.run_dispatcher(&bridge_id, dispatcher).await;
                    }));
                }
                _ => info!(bridge = %bridge.id, "Relaying disabled for this process"),
            }

            info!(
                bridge = %bridge.id,
                home = %bridge.home.name,
                foreign = %bridge.foreign.name,
                required_signatures = bridge.required_signatures,
                validators = bridge.validators.len(),
                "Bridge started"
            );
        }
        Ok(handles)
    }

    /// One watcher tick over both sides of a bridge, followed by the quorum
    /// deadline check. Returns whether any side hit a chain outage.
    pub async fn watch_once(&self, bridge_id: &str, watchers: &[EventWatcher]) -> OracleResult<bool> {
        let bridge = self.registry.get_bridge(bridge_id)?;
        let control = self.control(bridge_id)?;
        let mut unavailable = false;

        for watcher in watchers {
            let side = watcher.side();
            let chain_id = bridge.side(side).chain_id;
            match watcher.poll_once().await {
                Ok(report) => {
                    self.health.record_tick(bridge_id, side, chain_id, &report).await;
                }
                Err(e) => {
                    let cursor = watcher.cursor().unwrap_or(bridge.side(side).start_block);
                    self.health.record_error(bridge_id, side, chain_id, cursor, &e).await;
                    if matches!(e, OracleError::ChainUnavailable { .. }) {
                        unavailable = true;
                    }
                    warn!(bridge = %bridge_id, side = %side, "Watcher tick failed: {}", e);
                }
            }
        }

        if unavailable {
            let pause = Duration::from_secs(self.config.oracle.pause_secs);
            if control.record_unavailable(self.config.oracle.pause_after_failures, pause) {
                warn!(
                    bridge = %bridge_id,
                    pause_secs = pause.as_secs(),
                    "Pausing bridge after repeated chain outages"
                );
            }
        } else {
            control.record_success();
        }

        if let Err(e) = self.engine.check_quorum_deadlines(bridge_id) {
            error!(bridge = %bridge_id, "Quorum deadline check failed: {}", e);
        }
        if let Err(e) = self.engine.prune_inbox(bridge_id) {
            error!(bridge = %bridge_id, "Attestation inbox pruning failed: {}", e);
        }
        Ok(unavailable)
    }

    async fn run_watchers(&self, bridge_id: &str, watchers: Vec<EventWatcher>) {
        let interval = self.poll_interval();
        loop {
            let paused = self
                .control(bridge_id)
                .map(|control| control.is_paused())
                .unwrap_or(false);
            if paused {
                debug!(bridge = %bridge_id, "Bridge paused, skipping watcher tick");
            } else if let Err(e) = self.watch_once(bridge_id, &watchers).await {
                error!(bridge = %bridge_id, "Watcher error: {}", e);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn run_dispatcher(&self, bridge_id: &str, dispatcher: RelayDispatcher) {
        let interval = self.poll_interval();
        loop {
            let paused = self
                .control(bridge_id)
                .map(|control| control.is_paused())
                .unwrap_or(false);
            if paused {
                debug!(bridge = %bridge_id, "Bridge paused, skipping dispatcher tick");
            } else {
                match dispatcher.tick().await {
                    Ok(report) if report != DispatchReport::default() => {
                        debug!(bridge = %bridge_id, ?report, "Dispatcher tick");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(bridge = %bridge_id, "Dispatcher tick failed: {}", e),
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Health of every bridge, evaluated now.
    pub async fn health_report(&self) -> OracleResult<HealthReport> {
        let now = Utc::now();
        let thresholds = &self.config.health;
        let mut bridges = Vec::new();

        for bridge in self.registry.list_bridges() {
            let counts = self.store.job_counts(&bridge.id)?;
            let paused = self.control(&bridge.id)?.is_paused();

            let mut sides = Vec::new();
            for side in ChainSide::BOTH {
                let chain = bridge.side(side);
                let entry = match self.health.side(&bridge.id, side).await {
                    Some(entry) => entry,
                    None => SideHealth {
                        side,
                        chain_id: chain.chain_id,
                        latest_block: None,
                        last_processed_block: self
                            .store
                            .cursor(&bridge.id, side)?
                            .unwrap_or(chain.start_block),
                        last_success_at: None,
                        last_error: None,
                    },
                };
                sides.push(entry);
            }

            let healthy = !paused && sides.iter().all(|s| side_is_healthy(s, thresholds, now));
            bridges.push(BridgeHealth {
                id: bridge.id.clone(),
                last_processed_block: sides
                    .iter()
                    .map(|s| s.last_processed_block)
                    .min()
                    .unwrap_or_default(),
                pending_jobs: counts.pending,
                failed_jobs: counts.failed,
                healthy,
                paused,
                sides,
            });
        }

        Ok(HealthReport {
            healthy: bridges.iter().all(|b| b.healthy),
            bridges,
        })
    }
}
