// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the solar-gateway project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::acquisition::{FieldId, InverterDriver};
use crate::buffer::{Record, Ring};
use crate::clock::GatewayClock;
use crate::config::Config;
use crate::control::{ControlPlane, RuntimeConfig};
use crate::diag::Diagnostics;
use crate::fota::{FileOtaPlatform, FotaEngine, FotaError};
use crate::store::KvStore;
use crate::transport::{CloudClient, InverterClient};
use crate::uplink::{UplinkContext, UplinkSettings};

/// Coordinates the gateway's background tasks
///
/// Owns the handles of the spawned tasks plus the state both loops share:
/// the sample ring, the control plane holding the current/next runtime
/// configuration, the diagnostics sink, and the gateway clock. The
/// `running` flag is polled by every task for graceful termination.
///
/// ### Task layout
///
/// * **acquisition** — periodic; polls the configured registers over the
///   inverter HTTP endpoint and pushes one record per tick
/// * **uplink** — periodic on the upload window; drains the ring, posts the
///   compressed authenticated payload, and applies the piggybacked reply
/// * **heartbeat** — periodic liveness log
pub struct Daemon {
    tasks: Vec<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
    config: Arc<RwLock<Config>>,
    ring: Arc<Ring>,
    clock: Arc<GatewayClock>,
    control: Arc<ControlPlane>,
    diag: Arc<Diagnostics>,
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

impl Daemon {
    /// Create a new daemon instance
    ///
    /// The shared state is created with defaults and re-created from the
    /// actual configuration when `launch()` runs.
    pub fn new() -> Self {
        Daemon {
            tasks: Vec::new(),
            running: Arc::new(AtomicBool::new(true)),
            config: Arc::new(RwLock::new(Config::default())),
            ring: Arc::new(Ring::new(512)),
            clock: Arc::new(GatewayClock::new()),
            control: Arc::new(ControlPlane::default()),
            diag: Arc::new(Diagnostics::new()),
        }
    }

    /// Launch all gateway tasks based on configuration
    ///
    /// Builds the persistent store, the inverter driver, the FOTA engine and
    /// the uplink context, performs the boot-time export-power write, then
    /// spawns the acquisition, uplink and heartbeat tasks.
    ///
    /// ### Errors
    ///
    /// Fails when the persistent store or the update bank directory cannot
    /// be opened, or when the configuration is unusable.
    pub async fn launch(&mut self, config: Arc<RwLock<Config>>) -> Result<()> {
        self.config = config;
        let cfg = self.config.read().await.clone();

        info!(
            "starting gateway {} (upload window {}s, sample period {}ms)",
            cfg.gateway.device_id, cfg.gateway.upload_interval_sec, cfg.gateway.sample_period_ms
        );
        if cfg.network.wifi_ssid.is_empty() {
            debug!("no Wi-Fi provisioning in config; assuming the host network is up");
        } else {
            info!(
                "network preconditions: ssid={} ntp={}",
                cfg.network.wifi_ssid, cfg.network.ntp_server
            );
        }

        // Epoch sync: until it succeeds, record timestamps stay monotonic-only.
        if self.clock.sync_from_system() {
            info!("epoch sync complete at {}", chrono::Local::now().to_rfc3339());
        } else {
            warn!("epoch sync unavailable, timestamps are monotonic-only");
        }

        let store = Arc::new(KvStore::open(&cfg.storage.path)?);

        // A runtime config staged before the last reset takes precedence
        // over the provisioning default.
        let initial_runtime = store
            .get_str("cfg", "runtime")
            .and_then(|json| serde_json::from_str::<RuntimeConfig>(&json).ok())
            .unwrap_or(RuntimeConfig {
                sampling_interval_ms: cfg.gateway.sample_period_ms,
                fields: FieldId::ALL.to_vec(),
            });
        self.ring = Arc::new(Ring::new(cfg.gateway.buffer_capacity));
        self.control = Arc::new(ControlPlane::new(initial_runtime));

        let driver = Arc::new(InverterDriver::new(
            InverterClient::new(&cfg.inverter),
            Arc::clone(&self.diag),
        ));

        // One mandatory write to the simulator once the network is up.
        if !driver.set_export_power(10, "boot").await {
            warn!("boot-time export-power write failed; continuing");
        }

        let platform = FileOtaPlatform::open(&cfg.fota.platform_dir)
            .map_err(|e| anyhow!("{}: {e}", FotaError::NoUpdatePartition.code()))?;
        let mut fota = FotaEngine::new(Box::new(platform), Arc::clone(&store));
        fota.set_progress_hook(Box::new(|written, total| {
            debug!("FOTA progress: {written}/{total} bytes");
        }));

        let uplink = UplinkContext::new(
            UplinkSettings {
                device_id: cfg.gateway.device_id.clone(),
                psk: cfg.security.psk.clone(),
                use_envelope: cfg.security.use_envelope,
            },
            CloudClient::new(&cfg.cloud),
            Arc::clone(&driver),
            Arc::clone(&self.ring),
            Arc::clone(&self.clock),
            Arc::clone(&self.control),
            Arc::clone(&self.diag),
            store,
            fota,
        );

        self.start_acquisition_task(driver)?;
        self.start_uplink_task(uplink, cfg.gateway.upload_interval_sec)?;
        self.start_heartbeat()?;

        Ok(())
    }

    /// Start the periodic acquisition task
    ///
    /// Each tick reads the currently-configured fields, timestamps the
    /// sample, pushes it into the ring, and sleeps until the next period
    /// boundary. The period is re-read every tick so a promoted
    /// configuration takes effect at the following boundary, never
    /// mid-window.
    fn start_acquisition_task(&mut self, driver: Arc<InverterDriver>) -> Result<()> {
        info!("starting acquisition task");
        let running = Arc::clone(&self.running);
        let ring = Arc::clone(&self.ring);
        let clock = Arc::clone(&self.clock);
        let control = Arc::clone(&self.control);
        let diag = Arc::clone(&self.diag);

        let task = tokio::spawn(async move {
            let mut next_tick = Instant::now();
            while running.load(Ordering::SeqCst) {
                let runtime = control.current();
                let period = Duration::from_millis(u64::from(runtime.sampling_interval_ms));

                let sample = if runtime.reads_full_map() {
                    driver.read_all().await
                } else {
                    driver.read_selected(&runtime.fields).await
                };
                // timestamp right after the read completes
                let epoch_ms = clock.now_epoch_ms();
                if let Some(sample) = sample {
                    if ring.push(Record { epoch_ms, sample }) {
                        diag.record_overflow();
                    }
                }

                next_tick += period;
                let now = Instant::now();
                if next_tick <= now {
                    // the read overran the period: skip to the next boundary
                    next_tick = now + period;
                }
                time::sleep_until(next_tick).await;
            }
            info!("acquisition task stopped");
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Start the periodic uplink task
    ///
    /// Runs one upload cycle per window. A cycle that fails leaves all
    /// state intact for the next window.
    fn start_uplink_task(&mut self, mut uplink: UplinkContext, interval_sec: u64) -> Result<()> {
        info!("starting uplink task (window {interval_sec}s)");
        let running = Arc::clone(&self.running);

        let task = tokio::spawn(async move {
            let period = Duration::from_secs(interval_sec.max(1));
            let mut next_window = Instant::now() + period;
            while running.load(Ordering::SeqCst) {
                time::sleep_until(next_window).await;
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                uplink.run_cycle().await;
                debug!("cloud status: {}", uplink.connection_status());

                next_window += period;
                let now = Instant::now();
                if next_window <= now {
                    next_window = now + period;
                }
            }
            info!("uplink task stopped");
            Ok(())
        });

        self.tasks.push(task);
        Ok(())
    }

    /// Start a heartbeat task that logs liveness periodically
    fn start_heartbeat(&mut self) -> Result<()> {
        info!("starting heartbeat monitor");
        let running = Arc::clone(&self.running);
        let task = tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                debug!("daemon heartbeat: running");
                time::sleep(Duration::from_secs(60)).await;
            }
            Ok(())
        });
        self.tasks.push(task);
        Ok(())
    }

    /// Shared sample ring (for tests and tooling).
    pub fn get_ring(&self) -> Arc<Ring> {
        Arc::clone(&self.ring)
    }

    /// Shared control plane.
    pub fn get_control_plane(&self) -> Arc<ControlPlane> {
        Arc::clone(&self.control)
    }

    /// Shared diagnostics sink.
    pub fn get_diagnostics(&self) -> Arc<Diagnostics> {
        Arc::clone(&self.diag)
    }

    /// Signal all tasks to stop gracefully
    ///
    /// Tasks observe the flag at their next tick; call `join()` afterwards
    /// to wait for them.
    pub fn shutdown(&self) {
        info!("shutting down daemon tasks");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for all tasks to complete
    ///
    /// Tasks sleeping through a long window are given a bounded grace
    /// period; a hung task is logged, not waited on forever.
    pub async fn join(self) -> Result<()> {
        for task in self.tasks {
            match tokio::time::timeout(Duration::from_secs(5), task).await {
                Ok(result) => {
                    if let Err(e) = result {
                        error!("task panicked: {e}");
                    }
                }
                Err(_) => {
                    warn!("task did not stop within the grace period");
                }
            }
        }
        Ok(())
    }
}
