//! Scanout lease broker.
//!
//! All slot-pool writes funnel through one task. Workloads ask it for a
//! slot; it walks the slot through its lifecycle, orchestrates serving via
//! the [`ControlHandle`], and stores the issued capability so a workload
//! that drops its connection can reclaim the same lease within the grace
//! period.
//!
//! # Slot lifecycle, as driven here
//!
//! ```text
//!  Disabled ──► Enabling ──► Enabled ──► Leased
//!     ▲            │                        │
//!     │            │ enable failed          │ release_lease
//!     │◄───────────┘ (unwind)               │ grace expiry
//!     │                                     │ encoder fault
//!     │                                     ▼
//!     └───────── Disabling ◄───────────── Enabled
//! ```
//!
//! Commands are handled one at a time, so two workloads racing for the
//! last slot cannot both see it free, and a release observed by the task
//! is fully torn down before the next request can reuse the slot.

pub mod config;
pub mod lease;

pub use config::BrokerConfig;
pub use lease::{CapabilityDescriptor, CapabilityIssuer, Lease, LocalCapabilityIssuer, WorkloadId};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::encoder::SlotFault;
use crate::error::{Error, Result};
use crate::pool::{SlotState, SlotTable};
use crate::server::ControlHandle;
use crate::stats::ServerStats;

/// One entry of a broker state snapshot.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub workload: WorkloadId,
    pub slot: u32,
    pub in_grace: bool,
    pub held_for: Duration,
}

enum Command {
    Request {
        workload: WorkloadId,
        mode: Option<(u32, u32)>,
        reply: oneshot::Sender<Result<Lease>>,
    },
    Release {
        workload: WorkloadId,
        reply: oneshot::Sender<Result<()>>,
    },
    ConnectionLost {
        workload: WorkloadId,
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<LeaseInfo>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the broker task. Cheap to clone.
#[derive(Clone)]
pub struct LeaseBroker {
    tx: mpsc::Sender<Command>,
}

impl LeaseBroker {
    /// Spawn the broker task.
    ///
    /// `faults` is the receiver handed out by
    /// [`EncoderSessions::start`](crate::encoder::EncoderSessions::start);
    /// a faulted slot is revoked as if its workload had released it.
    pub fn start(
        config: BrokerConfig,
        pool: Arc<SlotTable>,
        control: ControlHandle,
        issuer: Arc<dyn CapabilityIssuer>,
        faults: mpsc::Receiver<SlotFault>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let task = BrokerTask {
            config,
            pool,
            control,
            issuer,
            stats,
            leases: HashMap::new(),
        };
        tokio::spawn(task.run(rx, faults));
        Self { tx }
    }

    /// Request a lease using the broker's default display mode.
    pub async fn request_lease(&self, workload: impl Into<WorkloadId>) -> Result<Lease> {
        self.request(workload.into(), None).await
    }

    /// Request a lease with an explicit display mode.
    pub async fn request_lease_with_mode(
        &self,
        workload: impl Into<WorkloadId>,
        width: u32,
        height: u32,
    ) -> Result<Lease> {
        self.request(workload.into(), Some((width, height))).await
    }

    async fn request(&self, workload: WorkloadId, mode: Option<(u32, u32)>) -> Result<Lease> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Request {
                workload,
                mode,
                reply,
            })
            .await
            .map_err(|_| Error::BrokerClosed)?;
        rx.await.map_err(|_| Error::BrokerClosed)?
    }

    /// Release a lease and tear its slot all the way down.
    ///
    /// Releasing a workload with no live lease is a successful no-op, so
    /// a workload and a connection-loss path can both release without
    /// coordinating.
    pub async fn release_lease(&self, workload: impl Into<WorkloadId>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Release {
                workload: workload.into(),
                reply,
            })
            .await
            .map_err(|_| Error::BrokerClosed)?;
        rx.await.map_err(|_| Error::BrokerClosed)?
    }

    /// Report that the workload's connection dropped without a release.
    /// Its lease enters the grace period instead of dying immediately.
    pub async fn connection_lost(&self, workload: impl Into<WorkloadId>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::ConnectionLost {
                workload: workload.into(),
                reply,
            })
            .await
            .map_err(|_| Error::BrokerClosed)?;
        rx.await.map_err(|_| Error::BrokerClosed)?
    }

    /// Current leases, for diagnostics.
    pub async fn snapshot(&self) -> Result<Vec<LeaseInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| Error::BrokerClosed)?;
        rx.await.map_err(|_| Error::BrokerClosed)
    }

    /// Tear down every lease and stop the task.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown { reply })
            .await
            .map_err(|_| Error::BrokerClosed)?;
        rx.await.map_err(|_| Error::BrokerClosed)
    }
}

enum LeaseState {
    Active,
    Grace { deadline: Instant },
}

struct LeaseRecord {
    slot: u32,
    capability: CapabilityDescriptor,
    issued_at: Instant,
    state: LeaseState,
}

struct BrokerTask {
    config: BrokerConfig,
    pool: Arc<SlotTable>,
    control: ControlHandle,
    issuer: Arc<dyn CapabilityIssuer>,
    stats: Arc<ServerStats>,
    leases: HashMap<WorkloadId, LeaseRecord>,
}

impl BrokerTask {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut faults: mpsc::Receiver<SlotFault>,
    ) {
        let sweep_period = (self.config.grace_period / 2)
            .clamp(Duration::from_millis(100), Duration::from_secs(5));
        let mut sweep = tokio::time::interval(sweep_period);
        let mut faults_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => {
                            // Every handle is gone; nobody can release
                            // anything anymore, so do it ourselves.
                            self.shutdown_all().await;
                            break;
                        }
                    }
                }
                fault = faults.recv(), if faults_open => {
                    match fault {
                        Some(fault) => self.handle_fault(fault).await,
                        None => faults_open = false,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_grace(Instant::now()).await;
                }
            }
        }
        debug!("Lease broker task exiting");
    }

    /// Returns false when the task should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Request {
                workload,
                mode,
                reply,
            } => {
                let result = self.handle_request(workload, mode).await;
                let _ = reply.send(result);
                true
            }
            Command::Release { workload, reply } => {
                let result = self.handle_release(workload).await;
                let _ = reply.send(result);
                true
            }
            Command::ConnectionLost { workload, reply } => {
                let result = self.handle_connection_lost(workload).await;
                let _ = reply.send(result);
                true
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot_infos());
                true
            }
            Command::Shutdown { reply } => {
                self.shutdown_all().await;
                let _ = reply.send(());
                false
            }
        }
    }

    async fn handle_request(
        &mut self,
        workload: WorkloadId,
        mode: Option<(u32, u32)>,
    ) -> Result<Lease> {
        // A reconnecting workload gets its original lease back, original
        // capability included, as long as the grace period has not fired.
        if let Some(record) = self.leases.get_mut(&workload) {
            return match record.state {
                LeaseState::Grace { .. } => {
                    record.state = LeaseState::Active;
                    let lease = Lease {
                        slot_index: record.slot,
                        workload_id: workload.clone(),
                        capability: record.capability.clone(),
                        issued_at: record.issued_at,
                    };
                    self.stats.record_lease_reclaimed();
                    info!(workload = %workload, slot = lease.slot_index, "Lease reclaimed within grace");
                    Ok(lease)
                }
                LeaseState::Active => Err(Error::AlreadyLeased(workload.clone())),
            };
        }

        let (width, height) =
            mode.unwrap_or((self.config.default_width, self.config.default_height));
        let slot = self.pool.allocate_free_slot(width, height).await?;

        if let Err(err) = self.enable_with_timeout(slot, width, height).await {
            self.unwind_enable(slot).await;
            return Err(err);
        }

        self.pool
            .transition(slot, SlotState::Enabling, SlotState::Enabled)
            .await?;
        self.pool
            .transition(slot, SlotState::Enabled, SlotState::Leased)
            .await?;

        let capability = match self.issuer.issue(slot, &workload) {
            Ok(capability) => capability,
            Err(err) => {
                error!(workload = %workload, slot, error = %err, "Capability issue failed");
                self.teardown_slot(slot).await;
                return Err(err);
            }
        };

        let issued_at = Instant::now();
        self.leases.insert(
            workload.clone(),
            LeaseRecord {
                slot,
                capability: capability.clone(),
                issued_at,
                state: LeaseState::Active,
            },
        );
        self.stats.record_lease_issued();
        info!(workload = %workload, slot, width, height, "Lease issued");

        Ok(Lease {
            slot_index: slot,
            workload_id: workload,
            capability,
            issued_at,
        })
    }

    async fn handle_release(&mut self, workload: WorkloadId) -> Result<()> {
        let Some(record) = self.leases.remove(&workload) else {
            debug!(workload = %workload, "Release for unknown or already released lease");
            return Ok(());
        };
        self.teardown_slot(record.slot).await;
        self.stats.record_lease_released();
        info!(workload = %workload, slot = record.slot, "Lease released");
        Ok(())
    }

    async fn handle_connection_lost(&mut self, workload: WorkloadId) -> Result<()> {
        let grace = self.config.grace_period;

        if grace.is_zero() {
            if self.leases.contains_key(&workload) {
                warn!(workload = %workload, "Connection lost with zero grace; tearing down");
                if let Some(record) = self.leases.remove(&workload) {
                    self.teardown_slot(record.slot).await;
                    self.stats.record_lease_expired();
                }
            }
            return Ok(());
        }

        match self.leases.get_mut(&workload) {
            Some(record) if matches!(record.state, LeaseState::Active) => {
                record.state = LeaseState::Grace {
                    deadline: Instant::now() + grace,
                };
                warn!(workload = %workload, slot = record.slot, grace = ?grace, "Workload connection lost; lease in grace");
            }
            Some(_) => {
                debug!(workload = %workload, "Connection lost for lease already in grace");
            }
            None => {
                debug!(workload = %workload, "Connection lost for unknown workload");
            }
        }
        Ok(())
    }

    async fn handle_fault(&mut self, fault: SlotFault) {
        let workload = self
            .leases
            .iter()
            .find(|(_, record)| record.slot == fault.slot)
            .map(|(workload, _)| workload.clone());

        let Some(workload) = workload else {
            debug!(slot = fault.slot, "Fault on slot with no lease");
            return;
        };

        self.leases.remove(&workload);
        error!(
            workload = %workload,
            slot = fault.slot,
            failures = fault.failures,
            "Encoder fault; revoking lease"
        );
        self.teardown_slot(fault.slot).await;
    }

    async fn sweep_grace(&mut self, now: Instant) {
        let expired: Vec<WorkloadId> = self
            .leases
            .iter()
            .filter_map(|(workload, record)| match record.state {
                LeaseState::Grace { deadline } if now >= deadline => Some(workload.clone()),
                _ => None,
            })
            .collect();

        for workload in expired {
            if let Some(record) = self.leases.remove(&workload) {
                warn!(workload = %workload, slot = record.slot, "Grace expired; reclaiming slot");
                self.teardown_slot(record.slot).await;
                self.stats.record_lease_expired();
            }
        }
    }

    async fn shutdown_all(&mut self) {
        let workloads: Vec<WorkloadId> = self.leases.keys().cloned().collect();
        for workload in workloads {
            if let Some(record) = self.leases.remove(&workload) {
                self.teardown_slot(record.slot).await;
                self.stats.record_lease_released();
                info!(workload = %workload, slot = record.slot, "Lease torn down at shutdown");
            }
        }
    }

    fn snapshot_infos(&self) -> Vec<LeaseInfo> {
        let now = Instant::now();
        let mut infos: Vec<LeaseInfo> = self
            .leases
            .iter()
            .map(|(workload, record)| LeaseInfo {
                workload: workload.clone(),
                slot: record.slot,
                in_grace: matches!(record.state, LeaseState::Grace { .. }),
                held_for: now.saturating_duration_since(record.issued_at),
            })
            .collect();
        infos.sort_by_key(|info| info.slot);
        infos
    }

    async fn enable_with_timeout(&self, slot: u32, width: u32, height: u32) -> Result<()> {
        let timeout = self.config.enable_timeout;
        match tokio::time::timeout(timeout, self.control.enable_slot(slot, width, height)).await {
            Ok(Ok(_generation)) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Timeout {
                operation: "enable",
                slot,
                timeout,
            }),
        }
    }

    /// Best-effort rollback of a slot stuck in Enabling.
    async fn unwind_enable(&self, slot: u32) {
        if let Err(err) = self.control.disable_slot(slot).await {
            warn!(slot, error = %err, "Unwind disable failed");
        }
        if let Err(err) = self
            .pool
            .transition(slot, SlotState::Enabling, SlotState::Disabled)
            .await
        {
            warn!(slot, error = %err, "Unwind transition failed");
        }
    }

    /// Walk a leased slot down to Disabled.
    ///
    /// The serving teardown completes inside the Disabling window, so by
    /// the time the slot reads Disabled its encoder session is gone and
    /// every queued frame for it has been purged.
    async fn teardown_slot(&self, slot: u32) {
        if let Err(err) = self
            .pool
            .transition(slot, SlotState::Leased, SlotState::Enabled)
            .await
        {
            warn!(slot, error = %err, "Teardown transition failed");
        }
        if let Err(err) = self
            .pool
            .transition(slot, SlotState::Enabled, SlotState::Disabling)
            .await
        {
            warn!(slot, error = %err, "Teardown transition failed");
        }

        match tokio::time::timeout(self.config.teardown_timeout, self.control.disable_slot(slot))
            .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => warn!(slot, error = %err, "Disable failed during teardown"),
            Err(_) => warn!(
                slot,
                timeout = ?self.config.teardown_timeout,
                "Disable timed out during teardown"
            ),
        }

        if let Err(err) = self
            .pool
            .transition(slot, SlotState::Disabling, SlotState::Disabled)
            .await
        {
            warn!(slot, error = %err, "Teardown transition failed");
        }
    }
}
