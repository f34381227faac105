//! Background-loop supervision and graceful shutdown.
//!
//! The supervisor owns one broadcast shutdown channel. The periodic
//! loops (registry dirty-flag poll, metrics sampler + alert pass,
//! heartbeat tick, poison-pill poll, retry sweeper) each `select!`
//! between their timer and the channel. A termination signal, a raised
//! poison pill, or stdin EOF all funnel into the same shutdown sequence:
//! stop intake, drain in-flight handlers against a deadline, release
//! external resources, stamp the final heartbeat, checkpoint every
//! shard.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::mcp::server::McpServer;
use crate::observability::AlertChecker;

/// Poison-pill poll cadence.
const PILL_POLL_SECS: u64 = 5;

/// Metrics sampler cadence.
const SAMPLER_SECS: u64 = 5;

/// Alert evaluation cadence.
const ALERT_SECS: u64 = 30;

/// Retry sweeper cadence.
const SWEEP_SECS: u64 = 2;

/// Supervises the server run: loops, signals, shutdown.
pub struct Supervisor {
    server: Arc<McpServer>,
    config: RuntimeConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(server: Arc<McpServer>, config: RuntimeConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self {
            server,
            config,
            shutdown_tx,
        }
    }

    /// Run until shutdown completes. Exit of this function means every
    /// loop is stopped and the shards are checkpointed.
    pub async fn run(self) -> anyhow::Result<()> {
        let server = &self.server;

        server
            .metrics
            .update_heartbeat("running", server.registry.count() as i64);
        info!(tools = server.registry.count(), "server running");

        // Poison-pill trips are reported through this channel so the
        // main select can pick up the pill's own shutdown deadline.
        let (pill_tx, mut pill_rx) = mpsc::channel::<(String, i64)>(1);

        self.spawn_registry_poll();
        self.spawn_sampler();
        self.spawn_heartbeat();
        self.spawn_pill_poll(pill_tx);
        self.spawn_retry_sweeper();

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        let input_loop = {
            let server = Arc::clone(server);
            let shutdown_rx = self.shutdown_tx.subscribe();
            async move { server.run(shutdown_rx).await }
        };
        tokio::pin!(input_loop);

        let mut drain_secs = self.config.shutdown_timeout_seconds;
        tokio::select! {
            _ = &mut input_loop => {
                info!("input closed, shutting down");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down");
            }
            Some((reason, timeout)) = pill_rx.recv() => {
                warn!(reason = %reason, "poison pill triggered, shutting down");
                if timeout > 0 {
                    drain_secs = timeout as u64;
                }
            }
        }

        self.shutdown(drain_secs).await;
        Ok(())
    }

    /// The shutdown sequence (idempotent by construction: loops ignore
    /// repeated broadcast sends).
    async fn shutdown(&self, drain_secs: u64) {
        let server = &self.server;

        server
            .metrics
            .update_heartbeat("shutting_down", server.registry.count() as i64);

        // Stop intake and background loops.
        let _ = self.shutdown_tx.send(());

        // Drain in-flight handlers against the deadline.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(drain_secs);
        loop {
            if server.metrics.inflight_count() <= 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    inflight = server.metrics.inflight_count(),
                    "shutdown deadline exceeded, forcing shutdown"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        // Release external-tool resources (the CDP session).
        server.host.disconnect().await;

        // Final heartbeat before the shards close.
        server
            .metrics
            .update_heartbeat("stopped", server.registry.count() as i64);

        server.storage.checkpoint_all();
        info!("shutdown complete");
    }

    // -- background loops --------------------------------------------------

    fn spawn_registry_poll(&self) {
        let server = Arc::clone(&self.server);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_millis(self.config.polling_interval_ms.max(100));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        server.registry.poll_dirty_and_reload();
                    }
                }
            }
        });
    }

    fn spawn_sampler(&self) {
        let server = Arc::clone(&self.server);
        let alerts = AlertChecker::new(
            server.storage.metadata.clone(),
            server.storage.output.clone(),
        );
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut sample_tick = tokio::time::interval(Duration::from_secs(SAMPLER_SECS));
            let mut alert_tick = tokio::time::interval(Duration::from_secs(ALERT_SECS));
            sample_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            alert_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = sample_tick.tick() => {
                        server.metrics.sample_system_metrics();
                    }
                    _ = alert_tick.tick() => {
                        if let Err(e) = alerts.check_alerts() {
                            warn!(error = %e, "alert evaluation failed");
                        }
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(&self) {
        let server = Arc::clone(&self.server);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = Duration::from_secs(self.config.heartbeat_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        server
                            .metrics
                            .update_heartbeat("running", server.registry.count() as i64);
                    }
                }
            }
        });
    }

    fn spawn_pill_poll(&self, pill_tx: mpsc::Sender<(String, i64)>) {
        let server = Arc::clone(&self.server);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(PILL_POLL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        if let Some((reason, timeout)) = server.metrics.check_poison_pill() {
                            let _ = pill_tx.send((reason, timeout)).await;
                            break;
                        }
                    }
                }
            }
        });
    }

    fn spawn_retry_sweeper(&self) {
        let server = Arc::clone(&self.server);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let sweep_server = Arc::clone(&server);
                        let result = tokio::task::spawn_blocking(move || {
                            let executor = |tool: &str, params: &serde_json::Value| {
                                sweep_server.execute_tool_by_name(tool, params)
                            };
                            sweep_server.retry.sweep_due(executor)
                        })
                        .await;
                        match result {
                            Ok(Ok(stats)) if stats.dead_lettered > 0 || stats.succeeded > 0 => {
                                info!(?stats, "retry sweep");
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => warn!(error = %e, "retry sweep failed"),
                            Err(e) => warn!(error = %e, "retry sweep task failed"),
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::circuit::BreakerSet;
    use crate::execution::retry::RetrySweeper;
    use crate::mcp::handlers::browser::{BrowserTools, UnavailableTransport};
    use crate::mcp::handlers::toolbox::ToolboxTools;
    use crate::mcp::handlers::BuiltinHost;
    use crate::mcp::registry::ToolRegistry;
    use crate::observability::MetricsHub;
    use crate::storage::Storage;

    fn build(dir: &tempfile::TempDir) -> Arc<McpServer> {
        let storage = Storage::open(dir.path()).unwrap();
        storage.init_schemas(None).unwrap();
        let registry = Arc::new(ToolRegistry::new(storage.tools.clone()));
        registry.reload().unwrap();
        let breakers = Arc::new(BreakerSet::new(storage.execution.clone()));
        let retry = Arc::new(RetrySweeper::new(
            storage.execution.clone(),
            storage.output.clone(),
        ));
        let metrics = Arc::new(MetricsHub::new(
            storage.core.clone(),
            storage.metadata.clone(),
            storage.output.clone(),
        ));
        let host = BuiltinHost::new(
            BrowserTools::new(Arc::new(UnavailableTransport), 9222),
            ToolboxTools::new(
                storage.clone(),
                Arc::clone(&registry),
                Arc::clone(&breakers),
                Arc::clone(&retry),
                Arc::clone(&metrics),
            ),
        );
        McpServer::new(storage, registry, host, breakers, retry, metrics)
    }

    #[tokio::test]
    async fn test_shutdown_writes_stopped_heartbeat_and_truncates_wal() {
        let dir = tempfile::tempdir().unwrap();
        let server = build(&dir);
        let supervisor = Supervisor::new(Arc::clone(&server), RuntimeConfig::default());

        supervisor.shutdown(1).await;

        let status: String = server
            .storage
            .output
            .with(|c| c.query_row("SELECT status FROM heartbeat WHERE id = 1", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(status, "stopped");

        // After the checkpoint the WAL files are truncated to zero.
        for shard_name in crate::storage::SHARD_NAMES {
            let wal = format!(
                "{}-wal",
                crate::storage::shard_path(dir.path(), shard_name).display()
            );
            let len = std::fs::metadata(&wal).map(|m| m.len()).unwrap_or(0);
            assert_eq!(len, 0, "WAL not truncated for {shard_name}");
        }
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_inflight_until_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let server = build(&dir);
        let supervisor = Supervisor::new(Arc::clone(&server), RuntimeConfig::default());

        // Simulate a stuck handler.
        server.metrics.task_started();
        let started = std::time::Instant::now();
        supervisor.shutdown(1).await;
        assert!(started.elapsed() >= Duration::from_secs(1));
        server.metrics.task_finished();
    }

    #[tokio::test]
    async fn test_poison_pill_detected_by_poll() {
        let dir = tempfile::tempdir().unwrap();
        let server = build(&dir);
        server.metrics.trigger_poison_pill("test shutdown", "tests");
        let (reason, timeout) = server.metrics.check_poison_pill().unwrap();
        assert_eq!(reason, "test shutdown");
        assert_eq!(timeout, 60);
    }
}
