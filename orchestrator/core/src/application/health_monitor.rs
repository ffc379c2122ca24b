// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Health Monitor - background probe loop over monitored sessions
//!
//! Each cycle snapshots the sessions in `MONITORING` and probes all of them
//! concurrently, every probe on its own tokio task under its own timeout.
//! A probe that errors, hangs or panics counts as a failed check for that
//! session only.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Detects unhealthy or expired sessions and hands them to the
//!   lifecycle controller's recycle path

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::lifecycle::{HealthVerdict, SessionLifecycleController};
use crate::domain::clock::Clock;
use crate::domain::collaborators::EventSink;
use crate::domain::events::HubEvent;
use crate::domain::runtime::HealthStatus;

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub failure_threshold: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Outcome of one monitoring cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCycleReport {
    pub checked: usize,
    pub healthy: usize,
    pub failed: usize,
    pub recycled: Vec<String>,
}

pub struct HealthMonitor {
    lifecycle: Arc<SessionLifecycleController>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: HealthMonitorConfig,
    shutdown_token: CancellationToken,
}

impl HealthMonitor {
    pub fn new(
        lifecycle: Arc<SessionLifecycleController>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: HealthMonitorConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            lifecycle,
            events,
            clock,
            config,
            shutdown_token,
        }
    }

    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!(
            interval = ?self.config.interval,
            timeout = ?self.config.timeout,
            threshold = self.config.failure_threshold,
            "Starting health monitor"
        );

        let mut tick = interval(self.config.interval);
        // The first tick completes immediately; sessions get one full interval.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    let report = self.run_cycle().await;
                    if report.checked > 0 {
                        debug!(
                            checked = report.checked,
                            healthy = report.healthy,
                            failed = report.failed,
                            recycled = report.recycled.len(),
                            "Health cycle completed"
                        );
                    }
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Shutdown signal received, stopping health monitor");
                    break;
                }
            }
        }
    }

    /// Probes every monitored session once.
    pub async fn run_cycle(&self) -> HealthCycleReport {
        let sessions = self.lifecycle.monitored_sessions();
        let mut report = HealthCycleReport {
            checked: sessions.len(),
            ..Default::default()
        };

        let probes: Vec<_> = sessions
            .into_iter()
            .map(|ctx| {
                let lifecycle = self.lifecycle.clone();
                let timeout = self.config.timeout;
                let name = ctx.session_name.clone();
                let handle = tokio::spawn(async move {
                    let backend = match lifecycle.backend(ctx.backend_kind) {
                        Ok(backend) => backend,
                        Err(e) => return Err(e.to_string()),
                    };
                    // Outer bound for backends that ignore the timeout.
                    match tokio::time::timeout(timeout, backend.health_check(&ctx, timeout)).await {
                        Ok(Ok(status)) => Ok(status),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!("health check timed out after {:?}", timeout)),
                    }
                });
                (name, handle)
            })
            .collect();

        for (name, handle) in probes {
            let status = match handle.await {
                Ok(Ok(status)) => status,
                Ok(Err(detail)) => HealthStatus::unhealthy(detail),
                Err(join_error) => HealthStatus::unhealthy(format!("health probe panicked: {}", join_error)),
            };

            if status.healthy {
                report.healthy += 1;
            } else {
                report.failed += 1;
                metrics::counter!("enclave_health_check_failures_total").increment(1);
            }

            let verdict = self.lifecycle.record_health_result(
                &name,
                status.healthy,
                self.config.failure_threshold,
            );

            match verdict {
                HealthVerdict::Healthy | HealthVerdict::Untracked => {}
                HealthVerdict::Unhealthy { failures } => {
                    warn!(
                        session = %name,
                        failures,
                        detail = ?status.detail,
                        "Session health check failed"
                    );
                    self.events.emit(HubEvent::SessionUnhealthy {
                        session_name: name.clone(),
                        consecutive_failures: failures,
                        detail: status.detail.clone(),
                        observed_at: self.clock.now(),
                    });
                }
                HealthVerdict::Recycle { reason } => {
                    warn!(session = %name, reason = %reason, "Recycling session");
                    if !status.healthy {
                        self.events.emit(HubEvent::SessionUnhealthy {
                            session_name: name.clone(),
                            consecutive_failures: self.config.failure_threshold,
                            detail: status.detail.clone(),
                            observed_at: self.clock.now(),
                        });
                    }
                    match self.lifecycle.recycle_session(&name).await {
                        Ok(true) => report.recycled.push(name),
                        Ok(false) => {}
                        Err(e) => warn!(session = %name, "Recycle failed: {}", e),
                    }
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::lifecycle::{LifecycleConfig, LifecycleDependencies, SessionRequest};
    use crate::application::volumes::VolumeResolver;
    use crate::domain::clock::ManualClock;
    use crate::domain::collaborators::{
        ImageVerificationMode, ImageVerifier, NullEventSink, ProfileEnvironmentSource,
        SecretsContext, SecretsProvider, VerificationResult,
    };
    use crate::domain::error::HubError;
    use crate::domain::runtime::{
        BackendError, ExecOutput, SessionBackend, SessionIdentity, SessionInfo, VolumeMount,
    };
    use crate::domain::session::{BackendKind, SessionContext};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{BTreeMap, HashMap};

    #[derive(Clone, Copy)]
    enum Probe {
        Healthy,
        Failing,
        Hanging,
        Panicking,
    }

    struct ScriptedBackend {
        probes: Mutex<HashMap<String, Probe>>,
    }

    #[async_trait]
    impl SessionBackend for ScriptedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Docker
        }

        async fn provision(
            &self,
            ctx: &SessionContext,
            _image: &str,
            _volumes: &[VolumeMount],
            _hardened: bool,
        ) -> Result<String, BackendError> {
            Ok(ctx.instance_name())
        }

        async fn configure(
            &self,
            _ctx: &SessionContext,
            _secrets: &BTreeMap<String, String>,
            _identity: &SessionIdentity,
        ) -> Result<(), BackendError> {
            Ok(())
        }

        async fn start(&self, _ctx: &SessionContext) -> Result<String, BackendError> {
            Ok("http://127.0.0.1".to_string())
        }

        async fn stop(&self, _ctx: &SessionContext, _timeout: Duration) -> Result<(), BackendError> {
            Ok(())
        }

        async fn remove(&self, _ctx: &SessionContext) -> Result<(), BackendError> {
            Ok(())
        }

        async fn health_check(
            &self,
            ctx: &SessionContext,
            _timeout: Duration,
        ) -> Result<HealthStatus, BackendError> {
            let probe = self
                .probes
                .lock()
                .get(&ctx.session_name)
                .copied()
                .unwrap_or(Probe::Healthy);
            match probe {
                Probe::Healthy => Ok(HealthStatus::healthy()),
                Probe::Failing => Err(BackendError::HealthCheck("exited".to_string())),
                Probe::Hanging => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(HealthStatus::healthy())
                }
                Probe::Panicking => panic!("probe blew up"),
            }
        }

        async fn exec_command(
            &self,
            _ctx: &SessionContext,
            _command: &[String],
        ) -> Result<ExecOutput, BackendError> {
            Err(BackendError::Exec("unsupported".to_string()))
        }

        async fn get_sessions_info(&self) -> Result<Vec<SessionInfo>, BackendError> {
            Ok(vec![])
        }
    }

    struct NoSecrets;

    #[async_trait]
    impl SecretsProvider for NoSecrets {
        async fn resolve(
            &self,
            _context: &SecretsContext,
        ) -> Result<BTreeMap<String, String>, HubError> {
            Ok(BTreeMap::new())
        }
    }

    struct AcceptAll;

    #[async_trait]
    impl ImageVerifier for AcceptAll {
        async fn verify(&self, _image: &str, _mode: ImageVerificationMode) -> VerificationResult {
            VerificationResult::verified()
        }
    }

    struct NoProfiles;

    #[async_trait]
    impl ProfileEnvironmentSource for NoProfiles {
        async fn read(&self, _profile: &str) -> BTreeMap<String, String> {
            BTreeMap::new()
        }
    }

    async fn setup(
        probes: &[(&str, Probe)],
        clock: Arc<ManualClock>,
    ) -> (Arc<SessionLifecycleController>, HealthMonitor) {
        let backend = ScriptedBackend {
            probes: Mutex::new(
                probes
                    .iter()
                    .map(|(name, probe)| (name.to_string(), *probe))
                    .collect(),
            ),
        };
        let lifecycle = Arc::new(SessionLifecycleController::new(
            LifecycleConfig {
                default_ttl: Duration::from_secs(600),
                ..Default::default()
            },
            LifecycleDependencies {
                backends: vec![Arc::new(backend)],
                secrets: Arc::new(NoSecrets),
                image_verifier: Arc::new(AcceptAll),
                volumes: VolumeResolver::new("/tmp/enclave", ".", vec![], Arc::new(NoProfiles)),
                events: Arc::new(NullEventSink),
                clock: clock.clone(),
            },
        ));
        for (name, _) in probes {
            lifecycle
                .run_pipeline(SessionRequest::new(*name, "developer", "alpine", BackendKind::Docker))
                .await
                .unwrap();
        }
        let monitor = HealthMonitor::new(
            lifecycle.clone(),
            Arc::new(NullEventSink),
            clock,
            HealthMonitorConfig {
                interval: Duration::from_secs(30),
                timeout: Duration::from_millis(50),
                failure_threshold: 3,
            },
            CancellationToken::new(),
        );
        (lifecycle, monitor)
    }

    #[tokio::test]
    async fn test_threshold_recycles_only_the_failing_session() {
        let clock = Arc::new(ManualClock::default());
        let (lifecycle, monitor) = setup(
            &[("good", Probe::Healthy), ("bad", Probe::Failing)],
            clock,
        )
        .await;

        for _ in 0..2 {
            let report = monitor.run_cycle().await;
            assert_eq!(report.failed, 1);
            assert!(report.recycled.is_empty());
        }
        let report = monitor.run_cycle().await;
        assert_eq!(report.recycled, vec!["bad".to_string()]);
        assert!(lifecycle.get_session("bad").is_none());
        assert!(lifecycle.get_session("good").is_some());
    }

    #[tokio::test]
    async fn test_hanging_and_panicking_probes_are_isolated() {
        let clock = Arc::new(ManualClock::default());
        let (lifecycle, monitor) = setup(
            &[
                ("good", Probe::Healthy),
                ("hang", Probe::Hanging),
                ("boom", Probe::Panicking),
            ],
            clock,
        )
        .await;

        let report = monitor.run_cycle().await;
        assert_eq!(report.checked, 3);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(lifecycle.get_session("hang").unwrap().health_failures, 1);
        assert_eq!(lifecycle.get_session("boom").unwrap().health_failures, 1);
    }

    #[tokio::test]
    async fn test_elapsed_ttl_recycles_healthy_session() {
        let clock = Arc::new(ManualClock::default());
        let (lifecycle, monitor) = setup(&[("old", Probe::Healthy)], clock.clone()).await;

        assert!(monitor.run_cycle().await.recycled.is_empty());
        clock.advance(chrono::Duration::seconds(601));
        assert_eq!(monitor.run_cycle().await.recycled, vec!["old".to_string()]);
        assert!(lifecycle.monitored_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancellation() {
        let clock = Arc::new(ManualClock::default());
        let (_lifecycle, monitor) = setup(&[], clock).await;
        let token = monitor.shutdown_token.clone();
        let handle = Arc::new(monitor).start();
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
