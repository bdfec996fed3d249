//! Configuration for the tracking engine.

use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::ops::Range;
use std::str::FromStr;
use std::time::Duration;
use txtrack_protocol::StoreRef;

/// Default number of update+delete units accumulated before a flush.
pub const DEFAULT_BATCH_THRESHOLD: u64 = 100;
/// Default number of nodes per worker sub-batch.
pub const DEFAULT_NODE_BATCH_SIZE: usize = 10;
/// Default bounded history capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// How nodes are assigned to shards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardMethod {
    /// Single unsharded index; every node is owned.
    All,
    /// Hash of the node id modulo the shard count.
    DbId,
    /// Hash of the ACL id modulo the shard count.
    AclId,
    /// Contiguous node id range `[start, end)`.
    DbIdRange {
        /// First owned node id.
        start: u64,
        /// First node id past the range.
        end: u64,
    },
}

impl ShardMethod {
    /// Returns true for DB id range sharding.
    pub fn is_db_id_range(&self) -> bool {
        matches!(self, ShardMethod::DbIdRange { .. })
    }
}

/// Static shard routing configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardConfig {
    /// Routing method.
    pub method: ShardMethod,
    /// Total number of shards.
    pub shard_count: u32,
    /// This shard's instance number (0-based).
    pub shard_instance: u32,
    /// Property the repository returns for property-based routing.
    pub shard_property: Option<String>,
}

impl ShardConfig {
    /// Creates an unsharded configuration.
    pub fn unsharded() -> Self {
        Self {
            method: ShardMethod::All,
            shard_count: 1,
            shard_instance: 0,
            shard_property: None,
        }
    }

    /// Creates a hashed configuration.
    pub fn hashed(method: ShardMethod, shard_count: u32, shard_instance: u32) -> Self {
        Self {
            method,
            shard_count,
            shard_instance,
            shard_property: None,
        }
    }

    /// Creates a DB id range configuration owning `[start, end)`.
    pub fn db_id_range(start: u64, end: u64) -> Self {
        Self {
            method: ShardMethod::DbIdRange { start, end },
            shard_count: 1,
            shard_instance: 0,
            shard_property: None,
        }
    }

    /// Sets the shard property.
    pub fn with_shard_property(mut self, property: impl Into<String>) -> Self {
        self.shard_property = Some(property.into());
        self
    }
}

impl Default for ShardConfig {
    fn default() -> Self {
        Self::unsharded()
    }
}

/// Configuration for the metadata tracker.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Update+delete units accumulated before a batch is flushed.
    pub batch_threshold: u64,
    /// Maximum nodes per worker sub-batch.
    pub node_batch_size: usize,
    /// Worker pool size.
    pub worker_threads: usize,
    /// Transaction id range probed for the repository's first transaction.
    pub initial_tx_range: Range<u64>,
    /// Whether non-owned nodes produce cascade markers.
    pub cascade_enabled: bool,
    /// Whether to probe for the next-commit-time service.
    pub probe_next_commit_time: bool,
    /// Whether to probe for the commit-time-range service.
    pub probe_commit_time_range: bool,
    /// Width of one fetch window.
    pub time_step: Duration,
    /// Maximum transactions per fetch window.
    pub max_window_results: usize,
    /// How far behind the cursor each cycle re-scans.
    pub hole_retention: Duration,
    /// Transactions younger than this are left for the next cycle.
    pub lag: Duration,
    /// Capacity of the bounded transaction history.
    pub history_capacity: usize,
    /// Store whose nodes are tracked.
    pub store: StoreRef,
    /// Shard routing.
    pub shard: ShardConfig,
}

impl TrackerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
            node_batch_size: DEFAULT_NODE_BATCH_SIZE,
            worker_threads: 4,
            initial_tx_range: 0..2000,
            cascade_enabled: true,
            probe_next_commit_time: true,
            probe_commit_time_range: true,
            time_step: Duration::from_secs(60 * 60),
            max_window_results: 2000,
            hole_retention: Duration::from_secs(60 * 60),
            lag: Duration::from_secs(1),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            store: StoreRef::default(),
            shard: ShardConfig::unsharded(),
        }
    }

    /// Sets the batch threshold.
    pub fn with_batch_threshold(mut self, threshold: u64) -> Self {
        self.batch_threshold = threshold;
        self
    }

    /// Sets the worker sub-batch size.
    pub fn with_node_batch_size(mut self, size: usize) -> Self {
        self.node_batch_size = size;
        self
    }

    /// Sets the worker pool size.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Sets the initial transaction id probe range.
    pub fn with_initial_tx_range(mut self, range: Range<u64>) -> Self {
        self.initial_tx_range = range;
        self
    }

    /// Enables or disables cascade markers.
    pub fn with_cascade(mut self, enabled: bool) -> Self {
        self.cascade_enabled = enabled;
        self
    }

    /// Enables or disables both repository service probes.
    pub fn with_service_probes(mut self, enabled: bool) -> Self {
        self.probe_next_commit_time = enabled;
        self.probe_commit_time_range = enabled;
        self
    }

    /// Sets the fetch window width.
    pub fn with_time_step(mut self, step: Duration) -> Self {
        self.time_step = step;
        self
    }

    /// Sets the maximum results per window.
    pub fn with_max_window_results(mut self, max: usize) -> Self {
        self.max_window_results = max;
        self
    }

    /// Sets the hole retention re-scan depth.
    pub fn with_hole_retention(mut self, retention: Duration) -> Self {
        self.hole_retention = retention;
        self
    }

    /// Sets the indexing lag.
    pub fn with_lag(mut self, lag: Duration) -> Self {
        self.lag = lag;
        self
    }

    /// Sets the tracked store.
    pub fn with_store(mut self, store: StoreRef) -> Self {
        self.store = store;
        self
    }

    /// Sets the shard routing.
    pub fn with_shard(mut self, shard: ShardConfig) -> Self {
        self.shard = shard;
        self
    }

    /// Returns the window width in milliseconds.
    pub fn time_step_ms(&self) -> u64 {
        duration_ms(self.time_step)
    }

    /// Returns the hole retention in milliseconds.
    pub fn hole_retention_ms(&self) -> u64 {
        duration_ms(self.hole_retention)
    }

    /// Returns the lag in milliseconds.
    pub fn lag_ms(&self) -> u64 {
        duration_ms(self.lag)
    }

    /// Checks that the settings are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_batch_size == 0 {
            return Err(ConfigError::OutOfRange("node batch size must be > 0".into()));
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::OutOfRange("worker threads must be > 0".into()));
        }
        if self.max_window_results == 0 {
            return Err(ConfigError::OutOfRange("max window results must be > 0".into()));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::OutOfRange("history capacity must be > 0".into()));
        }
        if self.time_step_ms() == 0 {
            return Err(ConfigError::OutOfRange("time step must be at least 1ms".into()));
        }
        if self.initial_tx_range.start >= self.initial_tx_range.end {
            return Err(ConfigError::OutOfRange(format!(
                "initial transaction range {:?} is empty",
                self.initial_tx_range
            )));
        }
        let shard = &self.shard;
        if shard.shard_count == 0 || shard.shard_instance >= shard.shard_count {
            return Err(ConfigError::OutOfRange(format!(
                "shard instance {} out of range for {} shard(s)",
                shard.shard_instance, shard.shard_count
            )));
        }
        if let ShardMethod::DbIdRange { start, end } = shard.method {
            if start >= end {
                return Err(ConfigError::OutOfRange(format!(
                    "shard range {start}-{end} is empty"
                )));
            }
        }
        Ok(())
    }

    /// Builds a configuration from core properties.
    ///
    /// Unknown keys are ignored and missing keys keep their defaults.
    pub fn from_properties(props: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::new();

        if let Some(v) = parse::<u64>(props, "alfresco.transactionDocsBatchSize")? {
            config.batch_threshold = v;
        }
        if let Some(v) = parse::<usize>(props, "alfresco.nodeBatchSize")? {
            config.node_batch_size = v;
        }
        if let Some(v) = parse::<usize>(props, "alfresco.corePoolSize")? {
            config.worker_threads = v;
        }
        if let Some(v) = parse::<bool>(props, "alfresco.cascade.tracker.enabled")? {
            config.cascade_enabled = v;
        }
        if let Some(v) = parse::<u64>(props, "alfresco.hole.retention")? {
            config.hole_retention = Duration::from_millis(v);
        }
        if let Some(v) = parse::<u64>(props, "alfresco.lag")? {
            config.lag = Duration::from_millis(v);
        }
        if let Some(range) = parse_range(props, "solr.initial.transaction.range")? {
            config.initial_tx_range = range;
        }
        if let Some(stores) = props.get("alfresco.stores") {
            config.store = parse_store_ref(stores).ok_or_else(|| invalid("alfresco.stores", stores))?;
        }
        if let Some(method) = props.get("shard.method") {
            config.shard = parse_shard(props, method)?;
        }
        if let Some(property) = props.get("shard.key") {
            config.shard.shard_property = Some(property.clone());
        }

        config.validate()?;
        Ok(config)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse<T: FromStr>(props: &BTreeMap<String, String>, key: &str) -> Result<Option<T>, ConfigError> {
    props
        .get(key)
        .map(|raw| raw.trim().parse::<T>().map_err(|_| invalid(key, raw)))
        .transpose()
}

fn parse_range(
    props: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<Range<u64>>, ConfigError> {
    let Some(raw) = props.get(key) else {
        return Ok(None);
    };
    let (lo, hi) = raw.trim().split_once('-').ok_or_else(|| invalid(key, raw))?;
    let lo = lo.trim().parse::<u64>().map_err(|_| invalid(key, raw))?;
    let hi = hi.trim().parse::<u64>().map_err(|_| invalid(key, raw))?;
    Ok(Some(lo..hi))
}

fn parse_store_ref(raw: &str) -> Option<StoreRef> {
    let (protocol, identifier) = raw.trim().split_once("://")?;
    if protocol.is_empty() || identifier.is_empty() {
        return None;
    }
    Some(StoreRef::new(protocol, identifier))
}

fn parse_shard(props: &BTreeMap<String, String>, method: &str) -> Result<ShardConfig, ConfigError> {
    let count = parse::<u32>(props, "shard.count")?.unwrap_or(1);
    let instance = parse::<u32>(props, "shard.instance")?.unwrap_or(0);
    let method = match method.trim() {
        "DB_ID" => ShardMethod::DbId,
        "ACL_ID" | "MOD_ACL_ID" => ShardMethod::AclId,
        "DB_ID_RANGE" => {
            let range = parse_range(props, "shard.range")?
                .ok_or_else(|| invalid("shard.range", ""))?;
            ShardMethod::DbIdRange {
                start: range.start,
                end: range.end,
            }
        }
        other => return Err(invalid("shard.method", other)),
    };
    Ok(ShardConfig {
        method,
        shard_count: count,
        shard_instance: instance,
        shard_property: None,
    })
}
