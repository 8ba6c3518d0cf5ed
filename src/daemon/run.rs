//! Server runner.
//!
//! `nfsd run` builds a [`Runtime`] from the resolved config and then waits on
//! signals: SIGTERM/SIGINT shut down, SIGHUP reloads.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::dispatch::Dispatcher;
use super::drc::DrcRegistry;
use super::drc::policy::{NFS_PROGRAM, NFS_V4};
use super::fridge::{Deferment, Fridge, FridgeCommand, FridgeParams};
use super::interp::{GraceStatus, OpTable, Program};
use super::recovery::{SharedRecovery, open_backend};
use super::server::Server;
use super::state::{ClientTable, GraceManager, NoState, Reaper, StateRelease};
use super::transport::{StreamListener, TransportKind, UdpChannel};
use crate::config::Config;
use crate::core::{SharedClock, system_clock};
use crate::{Error, Result};

const NFS_V3: u32 = 3;
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Op table served when no interpreter is plugged in: NFSv3 and NFSv4 NULL.
pub fn default_ops() -> OpTable {
    OpTable::new()
        .with_program(
            Program::new(NFS_PROGRAM, GraceStatus::NFS4)
                .with_version(NFS_V3)
                .with_version(NFS_V4),
        )
}

/// Everything a running server owns.
pub struct Runtime {
    config: Config,
    server: Arc<Server>,
    clients: Arc<ClientTable>,
    grace: Arc<GraceManager>,
    drc: Arc<DrcRegistry>,
    reaper: Reaper,
    general: Arc<Fridge>,
    tcp_addrs: Vec<SocketAddr>,
    udp_addr: Option<SocketAddr>,
    ninep_addr: Option<SocketAddr>,
}

impl Runtime {
    /// Build every subsystem and start serving. Any init failure aborts.
    pub fn start(config: Config, ops: OpTable) -> Result<Self> {
        Self::start_with(config, ops, system_clock(), Arc::new(NoState))
    }

    pub fn start_with(
        config: Config,
        ops: OpTable,
        clock: SharedClock,
        release: Arc<dyn StateRelease>,
    ) -> Result<Self> {
        let limits = config.limits.clone().normalized();
        let node = config.node.name.clone();
        let recovery: SharedRecovery = open_backend(
            config.recovery.backend,
            &config.recovery.root(),
            &node,
            &config.recovery.cluster_db(),
        )?;

        let epoch = config.node.resolve_epoch();
        let clients = Arc::new(ClientTable::new(
            epoch,
            config.lease.lifetime(),
            clock.clone(),
            recovery.clone(),
            release,
        ));
        let grace = Arc::new(GraceManager::new(
            recovery,
            clock.clone(),
            config.lease.grace_params(),
        ));
        // Clients of the previous boot get their reclaim window.
        grace.start_grace(None)?;

        let drc = Arc::new(DrcRegistry::new(config.drc.settings(&limits), clock));
        let workers = Fridge::new("worker", config.workers.fridge_params(&limits))?;
        let general = Arc::new(Fridge::new(
            "general",
            FridgeParams::new(config.workers.general_max.max(1), Deferment::Queue),
        )?);
        let dispatcher = Arc::new(
            Dispatcher::new(Arc::new(ops), clients.clone(), grace.clone(), workers)
                .with_dup_wait(config.server.dup_wait()),
        );
        let server = Arc::new(
            Server::new(dispatcher, drc.clone(), limits.clone())
                .with_drain_timeout(config.server.drain_timeout()),
        );

        let poll = config.server.poll_interval();
        let mut tcp_addrs = Vec::new();
        for addr in config.server.tcp_addrs()? {
            let listener = StreamListener::bind(addr, TransportKind::Tcp, limits.max_msg_bytes)?
                .with_poll_interval(poll);
            tcp_addrs.push(server.listen(listener).map_err(|e| Error::spawn("accept", e))?);
        }
        let udp_addr = match config.server.udp_addr()? {
            Some(addr) => {
                let channel = UdpChannel::bind_with_poll(addr, limits.max_msg_bytes, poll)?;
                let local = channel.local_addr();
                server.serve_udp(channel).map_err(|e| Error::spawn("udp reader", e))?;
                Some(local)
            }
            None => None,
        };
        let ninep_addr = match config.server.ninep_addr()? {
            Some(addr) => {
                let listener =
                    StreamListener::bind(addr, TransportKind::NinePTcp, limits.max_msg_bytes)?
                        .with_poll_interval(poll);
                Some(server.listen(listener).map_err(|e| Error::spawn("accept", e))?)
            }
            None => None,
        };

        let reaper = Reaper::start(
            clients.clone(),
            grace.clone(),
            drc.clone(),
            config.lease.reaper_interval(),
        )?;
        server
            .watch_recovery(general.clone())
            .map_err(|e| Error::spawn("grace watch", e))?;

        tracing::info!(
            node = %node,
            epoch,
            tcp = ?tcp_addrs,
            udp = ?udp_addr,
            ninep = ?ninep_addr,
            "server started"
        );
        Ok(Self {
            config,
            server,
            clients,
            grace,
            drc,
            reaper,
            general,
            tcp_addrs,
            udp_addr,
            ninep_addr,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub fn clients(&self) -> &Arc<ClientTable> {
        &self.clients
    }

    pub fn grace(&self) -> &Arc<GraceManager> {
        &self.grace
    }

    pub fn drc(&self) -> &Arc<DrcRegistry> {
        &self.drc
    }

    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp_addr
    }

    pub fn ninep_addr(&self) -> Option<SocketAddr> {
        self.ninep_addr
    }

    /// Apply a reloaded config. Grace is requested first so clients re-establish
    /// state under the new parameters; listeners and the recovery backend stay.
    pub fn reload(&mut self, config: Config) -> Result<()> {
        if self.server.dispatcher().ops().serves_nfs4() {
            let started = self.grace.start_grace(None)?;
            tracing::info!(started, "grace requested for reload");
        }
        let limits = config.limits.clone().normalized();
        self.drc.reconfigure(config.drc.settings(&limits));
        self.grace.set_params(config.lease.grace_params());
        self.reaper.kick();
        tracing::info!("config reloaded");
        self.config = config;
        Ok(())
    }

    pub fn shutdown(self) {
        self.server.shutdown(STOP_TIMEOUT);
        if let Err(err) = self.reaper.stop(STOP_TIMEOUT) {
            tracing::warn!(error = %err, "reaper did not stop cleanly");
        }
        if let Err(err) = self.general.sync_command(FridgeCommand::Stop, STOP_TIMEOUT) {
            tracing::warn!(error = %err, "general pool did not stop cleanly");
        }
        tracing::info!("server stopped");
    }
}

/// Run the server in the current process until SIGTERM or SIGINT.
pub fn run_server(config: Config, config_path: Option<PathBuf>) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        if let Err(err) = signal_hook::flag::register(signal, shutdown.clone()) {
            tracing::warn!(signal, error = %err, "failed to register signal handler");
        }
    }
    if let Err(err) = signal_hook::flag::register(signal_hook::consts::SIGHUP, reload.clone()) {
        tracing::warn!(error = %err, "failed to register SIGHUP handler");
    }

    let mut runtime = Runtime::start(config, default_ops())?;
    while !shutdown.load(Ordering::Relaxed) {
        if reload.swap(false, Ordering::Relaxed) {
            reload_from(&mut runtime, config_path.as_deref());
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    tracing::info!("shutdown signal received");
    runtime.shutdown();
    Ok(())
}

fn reload_from(runtime: &mut Runtime, config_path: Option<&Path>) {
    match crate::config::load(config_path) {
        Ok(config) => {
            if let Err(err) = runtime.reload(config) {
                tracing::error!(error = %err, "config reload failed");
            }
        }
        Err(err) => tracing::error!(error = %err, "config reload failed; keeping current config"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::core::ManualClock;
    use crate::daemon::interp::{NULL_PROC, RpcLookup};
    use crate::daemon::state::GracePhase;

    fn local_config(root: &Path) -> Config {
        let mut config = Config::default();
        config.server.tcp_listen = vec!["127.0.0.1:0".into()];
        config.server.udp_listen = Some("127.0.0.1:0".into());
        config.server.poll_interval_ms = 20;
        config.recovery.root = Some(root.to_path_buf());
        config.node.epoch = Some(7);
        config.logging.stdout = false;
        config
    }

    #[test]
    fn default_ops_answer_null_for_v3_and_v4() {
        let ops = default_ops();
        assert!(ops.serves_nfs4());
        for vers in [NFS_V3, NFS_V4] {
            assert!(matches!(
                ops.lookup_rpc(NFS_PROGRAM, vers, NULL_PROC),
                RpcLookup::Found { .. }
            ));
        }
        assert!(matches!(ops.lookup_rpc(NFS_PROGRAM, 4, 1), RpcLookup::ProcUnavail));
    }

    #[test]
    fn runtime_starts_and_reloads() {
        let temp = tempfile::tempdir().unwrap();
        let config = local_config(temp.path());
        let clock: SharedClock = Arc::new(ManualClock::new());
        let mut runtime =
            Runtime::start_with(config.clone(), default_ops(), clock, Arc::new(NoState)).unwrap();
        assert_eq!(runtime.tcp_addrs().len(), 1);
        assert!(runtime.udp_addr().is_some());
        assert_eq!(runtime.clients().epoch(), 7);
        // Nothing to reclaim on a first boot.
        assert_eq!(runtime.grace().phase(), GracePhase::Normal);

        let mut reloaded = config;
        reloaded.drc.enabled = false;
        reloaded.lease.grace_secs = 5;
        runtime.reload(reloaded).unwrap();
        assert!(!runtime.drc().settings().enabled);
        assert_eq!(runtime.config().lease.grace_secs, 5);
        runtime.shutdown();
    }
}
