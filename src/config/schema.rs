use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{Limits, LimitsOverride, NodeId};
use crate::daemon::drc::{AllocFailurePolicy, DrcParams, DrcSettings};
use crate::daemon::fridge::{Deferment, DefermentKind, FridgeParams};
use crate::daemon::recovery::RecoveryKind;
use crate::daemon::state::GraceParams;
use crate::daemon::transport::RdmaParams;

use super::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub server: ServerConfig,
    pub drc: DrcConfig,
    pub lease: LeaseConfig,
    pub workers: WorkersConfig,
    pub recovery: RecoveryConfig,
    pub rdma: RdmaConfig,
    pub limits: Limits,
    pub logging: LoggingConfig,
}

// ===== node =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: NodeId,
    /// Server epoch baked into client ids. Derived from the boot time when unset.
    pub epoch: Option<u32>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: NodeId::numbered(0),
            epoch: None,
        }
    }
}

impl NodeConfig {
    pub fn resolve_epoch(&self) -> u32 {
        self.epoch
            .unwrap_or_else(|| (crate::core::WallClock::now().as_secs() as u32).max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfigOverride {
    pub name: Option<NodeId>,
    pub epoch: Option<u32>,
}

impl NodeConfigOverride {
    pub fn apply_to(&self, target: &mut NodeConfig) {
        if let Some(name) = self.name.as_ref() {
            target.name = name.clone();
        }
        if self.epoch.is_some() {
            target.epoch = self.epoch;
        }
    }
}

// ===== server =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// ONC RPC over TCP.
    pub tcp_listen: Vec<String>,
    /// ONC RPC over UDP; `None` disables the datagram socket.
    pub udp_listen: Option<String>,
    /// 9P over TCP.
    pub ninep_listen: Option<String>,
    pub poll_interval_ms: u64,
    /// How long teardown waits for in-flight requests.
    pub drain_timeout_ms: u64,
    /// How long a retransmission waits for its original to finish.
    pub dup_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_listen: vec!["0.0.0.0:2049".to_string()],
            udp_listen: Some("0.0.0.0:2049".to_string()),
            ninep_listen: None,
            poll_interval_ms: 200,
            drain_timeout_ms: 30_000,
            dup_wait_ms: 30_000,
        }
    }
}

impl ServerConfig {
    pub fn tcp_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        self.tcp_listen
            .iter()
            .map(|raw| parse_addr("server.tcp_listen", raw))
            .collect()
    }

    pub fn udp_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.udp_listen
            .as_deref()
            .map(|raw| parse_addr("server.udp_listen", raw))
            .transpose()
    }

    pub fn ninep_addr(&self) -> Result<Option<SocketAddr>, ConfigError> {
        self.ninep_listen
            .as_deref()
            .map(|raw| parse_addr("server.ninep_listen", raw))
            .transpose()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn dup_wait(&self) -> Duration {
        Duration::from_millis(self.dup_wait_ms)
    }
}

fn parse_addr(field: &'static str, raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.trim().parse().map_err(|err| ConfigError::Invalid {
        field,
        reason: format!("`{raw}` is not a socket address: {err}"),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfigOverride {
    pub tcp_listen: Option<Vec<String>>,
    pub udp_listen: Option<String>,
    pub ninep_listen: Option<String>,
    pub poll_interval_ms: Option<u64>,
    pub drain_timeout_ms: Option<u64>,
    pub dup_wait_ms: Option<u64>,
}

impl ServerConfigOverride {
    pub fn apply_to(&self, target: &mut ServerConfig) {
        if let Some(tcp) = self.tcp_listen.as_ref() {
            target.tcp_listen = tcp.clone();
        }
        if let Some(udp) = self.udp_listen.as_ref() {
            target.udp_listen = Some(udp.clone());
        }
        if let Some(ninep) = self.ninep_listen.as_ref() {
            target.ninep_listen = Some(ninep.clone());
        }
        if let Some(value) = self.poll_interval_ms {
            target.poll_interval_ms = value;
        }
        if let Some(value) = self.drain_timeout_ms {
            target.drain_timeout_ms = value;
        }
        if let Some(value) = self.dup_wait_ms {
            target.dup_wait_ms = value;
        }
    }
}

// ===== drc =====

/// One duplicate request cache table's sizing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct DrcTableConfig {
    pub npart: usize,
    pub size: usize,
    pub hiwat: usize,
    /// Live entries beyond which allocation fails; twice `size` when unset.
    pub hard_cap: Option<usize>,
    /// Always on for TCP, whose tables can pass to a later connection from
    /// the same address.
    pub checksum: bool,
    /// Completed entries older than this are not replayed.
    pub max_age_secs: Option<u64>,
}

impl DrcTableConfig {
    fn tcp_default() -> Self {
        Self::from_params(DrcParams::tcp_default())
    }

    fn udp_default() -> Self {
        Self::from_params(DrcParams::udp_default())
    }

    fn from_params(params: DrcParams) -> Self {
        Self {
            npart: params.npart,
            size: params.maxsize,
            hiwat: params.hiwat,
            hard_cap: None,
            checksum: params.checksum,
            max_age_secs: params.max_age.map(|age| age.as_secs()),
        }
    }

    pub fn params(&self, on_alloc_failure: AllocFailurePolicy, limits: &Limits) -> DrcParams {
        let params = DrcParams::with_limits(
            self.npart,
            self.size,
            self.hiwat,
            self.checksum,
            self.max_age_secs.map(Duration::from_secs),
            limits,
        )
        .with_alloc_failure(on_alloc_failure);
        match self.hard_cap {
            Some(cap) => params.with_hard_cap(cap),
            None => params,
        }
    }
}

impl Default for DrcTableConfig {
    fn default() -> Self {
        Self::tcp_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DrcTableConfigOverride {
    pub npart: Option<usize>,
    pub size: Option<usize>,
    pub hiwat: Option<usize>,
    pub hard_cap: Option<usize>,
    pub checksum: Option<bool>,
    pub max_age_secs: Option<u64>,
}

impl DrcTableConfigOverride {
    pub fn apply_to(&self, target: &mut DrcTableConfig) {
        if let Some(value) = self.npart {
            target.npart = value;
        }
        if let Some(value) = self.size {
            target.size = value;
        }
        if let Some(value) = self.hiwat {
            target.hiwat = value;
        }
        if self.hard_cap.is_some() {
            target.hard_cap = self.hard_cap;
        }
        if let Some(value) = self.checksum {
            target.checksum = value;
        }
        if self.max_age_secs.is_some() {
            target.max_age_secs = self.max_age_secs;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrcConfig {
    pub enabled: bool,
    pub on_alloc_failure: AllocFailurePolicy,
    /// How long a closed TCP connection's table waits for its client.
    pub recycle_expire_secs: u64,
    pub tcp: DrcTableConfig,
    pub udp: DrcTableConfig,
}

impl Default for DrcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_alloc_failure: AllocFailurePolicy::FailOpen,
            recycle_expire_secs: 600,
            tcp: DrcTableConfig::tcp_default(),
            udp: DrcTableConfig::udp_default(),
        }
    }
}

impl DrcConfig {
    pub fn settings(&self, limits: &Limits) -> DrcSettings {
        DrcSettings {
            enabled: self.enabled,
            tcp: self.tcp.params(self.on_alloc_failure, limits),
            udp: self.udp.params(self.on_alloc_failure, limits),
            recycle_expire: Duration::from_secs(self.recycle_expire_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DrcConfigOverride {
    pub enabled: Option<bool>,
    pub on_alloc_failure: Option<AllocFailurePolicy>,
    pub recycle_expire_secs: Option<u64>,
    pub tcp: Option<DrcTableConfigOverride>,
    pub udp: Option<DrcTableConfigOverride>,
}

impl DrcConfigOverride {
    pub fn apply_to(&self, target: &mut DrcConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(policy) = self.on_alloc_failure {
            target.on_alloc_failure = policy;
        }
        if let Some(value) = self.recycle_expire_secs {
            target.recycle_expire_secs = value;
        }
        if let Some(tcp) = self.tcp.as_ref() {
            tcp.apply_to(&mut target.tcp);
        }
        if let Some(udp) = self.udp.as_ref() {
            udp.apply_to(&mut target.udp);
        }
    }
}

// ===== lease / grace =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub lifetime_secs: u64,
    pub grace_secs: u64,
    /// How long non-reclaim requests wait while grace is being entered.
    pub entering_wait_ms: u64,
    /// Skip the grace period entirely (no recovery semantics).
    pub graceless: bool,
    pub reaper_interval_ms: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        let grace = GraceParams::default();
        Self {
            lifetime_secs: 60,
            grace_secs: grace.grace_period.as_secs(),
            entering_wait_ms: grace.entering_wait.as_millis() as u64,
            graceless: grace.graceless,
            reaper_interval_ms: 10_000,
        }
    }
}

impl LeaseConfig {
    pub fn lifetime(&self) -> Duration {
        Duration::from_secs(self.lifetime_secs.max(1))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms.max(1))
    }

    pub fn grace_params(&self) -> GraceParams {
        GraceParams {
            grace_period: Duration::from_secs(self.grace_secs),
            entering_wait: Duration::from_millis(self.entering_wait_ms),
            graceless: self.graceless,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LeaseConfigOverride {
    pub lifetime_secs: Option<u64>,
    pub grace_secs: Option<u64>,
    pub entering_wait_ms: Option<u64>,
    pub graceless: Option<bool>,
    pub reaper_interval_ms: Option<u64>,
}

impl LeaseConfigOverride {
    pub fn apply_to(&self, target: &mut LeaseConfig) {
        if let Some(value) = self.lifetime_secs {
            target.lifetime_secs = value;
        }
        if let Some(value) = self.grace_secs {
            target.grace_secs = value;
        }
        if let Some(value) = self.entering_wait_ms {
            target.entering_wait_ms = value;
        }
        if let Some(value) = self.graceless {
            target.graceless = value;
        }
        if let Some(value) = self.reaper_interval_ms {
            target.reaper_interval_ms = value;
        }
    }
}

// ===== workers =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub thr_min: usize,
    /// Zero means unbounded.
    pub thr_max: usize,
    pub deferment: DefermentKind,
    /// Submitter wait under the `block` deferment.
    pub block_timeout_ms: u64,
    /// Idle time before threads above `thr_min` exit.
    pub thread_delay_ms: Option<u64>,
    /// Threads for recovery watch callbacks.
    pub general_max: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            thr_min: 2,
            thr_max: 64,
            deferment: DefermentKind::Queue,
            block_timeout_ms: 5_000,
            thread_delay_ms: Some(60_000),
            general_max: 4,
        }
    }
}

impl WorkersConfig {
    pub fn fridge_params(&self, limits: &Limits) -> FridgeParams {
        let deferment = match self.deferment {
            DefermentKind::Queue => Deferment::Queue,
            DefermentKind::Block => Deferment::Block {
                timeout: Duration::from_millis(self.block_timeout_ms),
            },
            DefermentKind::Fail => Deferment::Fail,
        };
        let mut params = FridgeParams::new(self.thr_max, deferment).with_min(self.thr_min);
        if let Some(delay) = self.thread_delay_ms {
            params = params.with_thread_delay(Duration::from_millis(delay));
        }
        params.max_spawn_per_start = limits.max_spawn_per_start;
        params
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorkersConfigOverride {
    pub thr_min: Option<usize>,
    pub thr_max: Option<usize>,
    pub deferment: Option<DefermentKind>,
    pub block_timeout_ms: Option<u64>,
    pub thread_delay_ms: Option<u64>,
    pub general_max: Option<usize>,
}

impl WorkersConfigOverride {
    pub fn apply_to(&self, target: &mut WorkersConfig) {
        if let Some(value) = self.thr_min {
            target.thr_min = value;
        }
        if let Some(value) = self.thr_max {
            target.thr_max = value;
        }
        if let Some(value) = self.deferment {
            target.deferment = value;
        }
        if let Some(value) = self.block_timeout_ms {
            target.block_timeout_ms = value;
        }
        if self.thread_delay_ms.is_some() {
            target.thread_delay_ms = self.thread_delay_ms;
        }
        if let Some(value) = self.general_max {
            target.general_max = value;
        }
    }
}

// ===== recovery =====

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecoveryConfig {
    pub backend: RecoveryKind,
    /// Record root; the data dir's `recovery/` when unset.
    pub root: Option<PathBuf>,
    /// Shared grace database directory for the cluster backend.
    pub cluster_db: Option<PathBuf>,
}

impl RecoveryConfig {
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(crate::paths::recovery_dir)
    }

    pub fn cluster_db(&self) -> PathBuf {
        self.cluster_db.clone().unwrap_or_else(crate::paths::grace_db_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RecoveryConfigOverride {
    pub backend: Option<RecoveryKind>,
    pub root: Option<PathBuf>,
    pub cluster_db: Option<PathBuf>,
}

impl RecoveryConfigOverride {
    pub fn apply_to(&self, target: &mut RecoveryConfig) {
        if let Some(backend) = self.backend {
            target.backend = backend;
        }
        if let Some(root) = self.root.as_ref() {
            target.root = Some(root.clone());
        }
        if let Some(db) = self.cluster_db.as_ref() {
            target.cluster_db = Some(db.clone());
        }
    }
}

// ===== rdma =====

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmaConfig {
    pub inbound_buffers: usize,
    pub outbound_buffers: usize,
    pub buffer_bytes: usize,
    pub send_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        let params = RdmaParams::default();
        Self {
            inbound_buffers: params.inbound_buffers,
            outbound_buffers: params.outbound_buffers,
            buffer_bytes: params.buffer_bytes,
            send_timeout_ms: params.send_timeout.as_millis() as u64,
            poll_interval_ms: params.poll_interval.as_millis() as u64,
        }
    }
}

impl RdmaConfig {
    pub fn params(&self) -> RdmaParams {
        RdmaParams {
            inbound_buffers: self.inbound_buffers.max(1),
            outbound_buffers: self.outbound_buffers.max(1),
            buffer_bytes: self.buffer_bytes,
            send_timeout: Duration::from_millis(self.send_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RdmaConfigOverride {
    pub inbound_buffers: Option<usize>,
    pub outbound_buffers: Option<usize>,
    pub buffer_bytes: Option<usize>,
    pub send_timeout_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl RdmaConfigOverride {
    pub fn apply_to(&self, target: &mut RdmaConfig) {
        if let Some(value) = self.inbound_buffers {
            target.inbound_buffers = value;
        }
        if let Some(value) = self.outbound_buffers {
            target.outbound_buffers = value;
        }
        if let Some(value) = self.buffer_bytes {
            target.buffer_bytes = value;
        }
        if let Some(value) = self.send_timeout_ms {
            target.send_timeout_ms = value;
        }
        if let Some(value) = self.poll_interval_ms {
            target.poll_interval_ms = value;
        }
    }
}

// ===== logging =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Tree,
    Pretty,
    Compact,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Daily,
    Hourly,
    Minutely,
    Never,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub stdout: bool,
    pub stdout_format: LogFormat,
    /// `EnvFilter` directives used when `LOG` is unset.
    pub filter: Option<String>,
    pub file: FileLoggingConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            stdout: true,
            stdout_format: LogFormat::Tree,
            filter: None,
            file: FileLoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileLoggingConfig {
    pub enabled: bool,
    pub dir: Option<PathBuf>,
    pub format: LogFormat,
    pub rotation: LogRotation,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl Default for FileLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            format: LogFormat::Json,
            rotation: LogRotation::Daily,
            retention_max_age_days: Some(7),
            retention_max_files: Some(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfigOverride {
    pub stdout: Option<bool>,
    pub stdout_format: Option<LogFormat>,
    pub filter: Option<String>,
    pub file: Option<FileLoggingConfigOverride>,
}

impl LoggingConfigOverride {
    pub fn apply_to(&self, target: &mut LoggingConfig) {
        if let Some(stdout) = self.stdout {
            target.stdout = stdout;
        }
        if let Some(format) = self.stdout_format {
            target.stdout_format = format;
        }
        if let Some(filter) = self.filter.as_ref() {
            target.filter = Some(filter.clone());
        }
        if let Some(file) = self.file.as_ref() {
            file.apply_to(&mut target.file);
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FileLoggingConfigOverride {
    pub enabled: Option<bool>,
    pub dir: Option<PathBuf>,
    pub format: Option<LogFormat>,
    pub rotation: Option<LogRotation>,
    pub retention_max_age_days: Option<u64>,
    pub retention_max_files: Option<usize>,
}

impl FileLoggingConfigOverride {
    pub fn apply_to(&self, target: &mut FileLoggingConfig) {
        if let Some(enabled) = self.enabled {
            target.enabled = enabled;
        }
        if let Some(dir) = self.dir.as_ref() {
            target.dir = Some(dir.clone());
        }
        if let Some(format) = self.format {
            target.format = format;
        }
        if let Some(rotation) = self.rotation {
            target.rotation = rotation;
        }
        if let Some(days) = self.retention_max_age_days {
            target.retention_max_age_days = Some(days);
        }
        if let Some(files) = self.retention_max_files {
            target.retention_max_files = Some(files);
        }
    }
}

// ===== layer =====

/// One config file's contents; every field optional.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ConfigLayer {
    pub node: NodeConfigOverride,
    pub server: ServerConfigOverride,
    pub drc: DrcConfigOverride,
    pub lease: LeaseConfigOverride,
    pub workers: WorkersConfigOverride,
    pub recovery: RecoveryConfigOverride,
    pub rdma: RdmaConfigOverride,
    pub limits: LimitsOverride,
    pub logging: LoggingConfigOverride,
}

impl ConfigLayer {
    pub fn apply_to(&self, base: &mut Config) {
        self.node.apply_to(&mut base.node);
        self.server.apply_to(&mut base.server);
        self.drc.apply_to(&mut base.drc);
        self.lease.apply_to(&mut base.lease);
        self.workers.apply_to(&mut base.workers);
        self.recovery.apply_to(&mut base.recovery);
        self.rdma.apply_to(&mut base.rdma);
        self.limits.apply_to(&mut base.limits);
        self.logging.apply_to(&mut base.logging);
    }
}
