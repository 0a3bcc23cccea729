use crate::InferenceError;
use crate::page_store::StoreOptions;
use crate::reasoner::ReasonerOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 56734;
pub const READY_MARKER_DIR: &str = "online_infer";
pub const READY_MARKER_FILE: &str = "server_ready";

/// Where new observations land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPartition {
    FirstAvailable,
    Partition(u32),
}

/// How partial grounding enumerates ground rules touching the special partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroundingPolicy {
    /// Every subset of partial targets. Exact, expensive.
    Powerset,
    /// At most one atom per ground rule comes from the special partition.
    SingleSpecialAtom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    /// Terms per page. Derived from `memory_budget_bytes` when unset.
    pub page_capacity: Option<usize>,
    pub memory_budget_bytes: usize,
    pub shuffle_page: bool,
    pub randomize_page_access: bool,
    pub seed: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./online_state/cache"),
            page_capacity: None,
            memory_budget_bytes: 64 * 1_048_576,
            shuffle_page: true,
            randomize_page_access: true,
            seed: 4,
        }
    }
}

impl CacheConfig {
    /// Largest page the term pool may hold: the explicit capacity, or as many
    /// pooled terms of `bytes_per_term` as fit in the memory budget.
    pub fn page_capacity(&self, bytes_per_term: usize) -> usize {
        match self.page_capacity {
            Some(capacity) => capacity,
            None => (self.memory_budget_bytes / bytes_per_term.max(1)).max(1),
        }
    }
}

/// Which term representation the cache holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    #[default]
    Sgd,
    Dcd,
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sgd" => Ok(Algorithm::Sgd),
            "dcd" => Ok(Algorithm::Dcd),
            other => Err(format!("unknown algorithm '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerConfig {
    pub algorithm: Algorithm,
    pub step_size: f32,
    pub max_epochs_per_round: usize,
    pub tolerance: f32,
}

impl Default for ReasonerConfig {
    fn default() -> Self {
        let defaults = ReasonerOptions::default();
        Self {
            algorithm: Algorithm::default(),
            step_size: defaults.step_size,
            max_epochs_per_round: defaults.max_epochs_per_round,
            tolerance: defaults.tolerance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    pub host: String,
    /// Zero asks the OS for a free port; the bound address is written to the
    /// readiness marker.
    pub port: u16,
    /// Negative means the first available read partition.
    pub read_partition: i64,
    pub partial_grounding_powerset: bool,
    pub ready_marker: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub cache: CacheConfig,
    pub reasoner: ReasonerConfig,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            read_partition: -1,
            partial_grounding_powerset: false,
            ready_marker: None,
            output_dir: None,
            cache: CacheConfig::default(),
            reasoner: ReasonerConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, raw: &str) -> Result<T, InferenceError> {
    raw.trim()
        .parse()
        .map_err(|_| InferenceError::Config(format!("invalid value for {}: '{}'", name, raw)))
}

fn parse_flag(name: &str, raw: &str) -> Result<bool, InferenceError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(InferenceError::Config(format!("invalid value for {}: '{}'", name, raw))),
    }
}

impl OnlineConfig {
    /// Defaults, then the JSON file if given, then `ONLINE_*` environment
    /// variables (a `.env` file is honoured). Validated before returning.
    pub fn load(path: Option<&Path>) -> Result<Self, InferenceError> {
        dotenv::dotenv().ok();
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, InferenceError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            InferenceError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| InferenceError::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    pub fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) -> Result<(), InferenceError> {
        if let Some(v) = get("ONLINE_HOST") {
            self.host = v;
        }
        if let Some(v) = get("ONLINE_PORT") {
            self.port = parse_var("ONLINE_PORT", &v)?;
        }
        if let Some(v) = get("ONLINE_READ_PARTITION") {
            self.read_partition = parse_var("ONLINE_READ_PARTITION", &v)?;
        }
        if let Some(v) = get("ONLINE_PARTIAL_GROUNDING_POWERSET") {
            self.partial_grounding_powerset = parse_flag("ONLINE_PARTIAL_GROUNDING_POWERSET", &v)?;
        }
        if let Some(v) = get("ONLINE_READY_MARKER") {
            self.ready_marker = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ONLINE_OUTPUT_DIR") {
            self.output_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ONLINE_CACHE_DIR") {
            self.cache.cache_dir = PathBuf::from(v);
        }
        if let Some(v) = get("ONLINE_PAGE_CAPACITY") {
            self.cache.page_capacity = Some(parse_var("ONLINE_PAGE_CAPACITY", &v)?);
        }
        if let Some(v) = get("ONLINE_MEMORY_BUDGET_BYTES") {
            self.cache.memory_budget_bytes = parse_var("ONLINE_MEMORY_BUDGET_BYTES", &v)?;
        }
        if let Some(v) = get("ONLINE_SHUFFLE_PAGE") {
            self.cache.shuffle_page = parse_flag("ONLINE_SHUFFLE_PAGE", &v)?;
        }
        if let Some(v) = get("ONLINE_RANDOMIZE_PAGE_ACCESS") {
            self.cache.randomize_page_access = parse_flag("ONLINE_RANDOMIZE_PAGE_ACCESS", &v)?;
        }
        if let Some(v) = get("ONLINE_SEED") {
            self.cache.seed = parse_var("ONLINE_SEED", &v)?;
        }
        if let Some(v) = get("ONLINE_ALGORITHM") {
            self.reasoner.algorithm = parse_var("ONLINE_ALGORITHM", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), InferenceError> {
        if self.host.trim().is_empty() || self.host.contains(char::is_whitespace) {
            return Err(InferenceError::Config(format!("invalid host: '{}'", self.host)));
        }
        if self.read_partition > u32::MAX as i64 {
            return Err(InferenceError::Config(format!(
                "read partition out of range: {}",
                self.read_partition
            )));
        }
        if self.cache.page_capacity == Some(0) {
            return Err(InferenceError::Config("page capacity must be positive".to_string()));
        }
        if self.cache.page_capacity.is_none() && self.cache.memory_budget_bytes == 0 {
            return Err(InferenceError::Config(
                "either page_capacity or memory_budget_bytes must be set".to_string(),
            ));
        }
        if !(self.reasoner.step_size > 0.0) {
            return Err(InferenceError::Config(format!(
                "step size must be positive, got {}",
                self.reasoner.step_size
            )));
        }
        if self.reasoner.max_epochs_per_round == 0 {
            return Err(InferenceError::Config("max_epochs_per_round must be positive".to_string()));
        }
        Ok(())
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn read_partition(&self) -> ReadPartition {
        if self.read_partition < 0 {
            ReadPartition::FirstAvailable
        } else {
            ReadPartition::Partition(self.read_partition as u32)
        }
    }

    pub fn grounding_policy(&self) -> GroundingPolicy {
        if self.partial_grounding_powerset {
            GroundingPolicy::Powerset
        } else {
            GroundingPolicy::SingleSpecialAtom
        }
    }

    pub fn ready_marker_path(&self) -> PathBuf {
        self.ready_marker
            .clone()
            .unwrap_or_else(default_ready_marker_path)
    }

    /// Store options for a pool whose slots take `bytes_per_term` each.
    pub fn store_options(&self, bytes_per_term: usize) -> StoreOptions {
        StoreOptions {
            shuffle_page: self.cache.shuffle_page,
            randomize_page_access: self.cache.randomize_page_access,
            seed: self.cache.seed,
            readonly: false,
            max_page_capacity: Some(self.cache.page_capacity(bytes_per_term)),
        }
    }

    pub fn reasoner_options(&self) -> ReasonerOptions {
        ReasonerOptions {
            step_size: self.reasoner.step_size,
            max_epochs_per_round: self.reasoner.max_epochs_per_round,
            tolerance: self.reasoner.tolerance,
        }
    }
}

pub fn default_ready_marker_path() -> PathBuf {
    std::env::temp_dir().join(READY_MARKER_DIR).join(READY_MARKER_FILE)
}
