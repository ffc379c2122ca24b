// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Lima VM Session Backend
//!
//! Drives `limactl` as a subprocess. Each session maps to one instance named
//! `enclave-<session>`. Mounts and the port forward are injected with
//! `--set` expressions at create time, so the template itself stays generic.
//!
//! All invocations go through [`CommandRunner`], which bounds each call by a
//! timeout and lets tests substitute scripted output.
//!
//! Hardened sessions are refused. The Lima host agent reaches the guest over
//! SSH for readiness and port forwarding, so the guest cannot run with a
//! read-only root and no administrative channel.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::config::VmBackendConfig;
use crate::domain::runtime::{
    BackendError, ExecOutput, HealthStatus, SessionBackend, SessionIdentity, SessionInfo,
    VolumeMount,
};
use crate::domain::session::{BackendKind, SessionContext};
use crate::infrastructure::secret_files;

const INSTANCE_PREFIX: &str = "enclave-";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn reports_missing_instance(&self) -> bool {
        let text = format!("{}{}", self.stdout, self.stderr).to_lowercase();
        text.contains("not found") || text.contains("does not exist")
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, BackendError>;
}

/// Runs commands with `tokio::process`, killing the child on timeout.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, BackendError> {
        debug!(program, ?args, "Running command");
        let child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BackendError::Unavailable(format!("failed to spawn {}: {}", program, e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout(timeout))?
            .map_err(|e| BackendError::Unavailable(format!("{} failed: {}", program, e)))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// One line of `limactl list --json`.
#[derive(Debug, Deserialize)]
struct LimaInstance {
    name: String,
    #[serde(default)]
    status: String,
}

fn parse_instances(stdout: &str) -> Vec<LimaInstance> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<LimaInstance>(line) {
            Ok(instance) => Some(instance),
            Err(e) => {
                warn!("Skipping unparseable limactl list line: {}", e);
                None
            }
        })
        .collect()
}

pub struct LimaBackend {
    config: VmBackendConfig,
    data_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl LimaBackend {
    pub fn new(config: VmBackendConfig, data_root: PathBuf) -> Self {
        Self::with_runner(config, data_root, Arc::new(TokioCommandRunner))
    }

    pub fn with_runner(
        config: VmBackendConfig,
        data_root: PathBuf,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            config,
            data_root,
            runner,
        }
    }

    async fn limactl(&self, args: Vec<String>) -> Result<CommandOutput, BackendError> {
        self.runner
            .run(&self.config.limactl, &args, self.config.command_timeout)
            .await
    }

    /// Images that already name a Lima template or file are used as-is.
    fn template_locator(&self, image: &str) -> String {
        if image.starts_with("template://")
            || image.ends_with(".yaml")
            || image.ends_with(".yml")
            || image.contains("://")
        {
            image.to_string()
        } else {
            format!("template://{}", self.config.template)
        }
    }

    fn create_args(
        &self,
        ctx: &SessionContext,
        image: &str,
        volumes: &[VolumeMount],
    ) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            format!("--name={}", ctx.instance_name()),
            "--tty=false".to_string(),
            format!("--cpus={}", self.config.cpus),
            format!("--memory={}", self.config.memory_gib),
        ];

        for volume in volumes {
            let writable = !volume.read_only;
            args.push("--set".to_string());
            args.push(format!(
                r#".mounts += [{{"location": "{}", "mountPoint": "{}", "writable": {}}}]"#,
                volume.host_path.display(),
                volume.target,
                writable
            ));
        }

        if let Some(port) = ctx.port {
            args.push("--set".to_string());
            args.push(format!(
                r#".portForwards += [{{"guestPort": {}, "hostIP": "127.0.0.1", "hostPort": {}}}]"#,
                self.config.guest_port, port
            ));
        }

        args.push("--set".to_string());
        args.push(".ssh.forwardAgent = false | .ssh.forwardX11 = false".to_string());

        args.push(self.template_locator(image));
        args
    }

    fn session_dir(&self, ctx: &SessionContext) -> PathBuf {
        self.data_root.join(&ctx.session_name)
    }
}

#[async_trait]
impl SessionBackend for LimaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Vm
    }

    async fn provision(
        &self,
        ctx: &SessionContext,
        image: &str,
        volumes: &[VolumeMount],
        hardened: bool,
    ) -> Result<String, BackendError> {
        if hardened {
            warn!(session = %ctx.session_name, "Refusing hardened session on the VM backend");
            return Err(BackendError::Provision(
                "hardened sessions are not supported by the VM backend".to_string(),
            ));
        }

        let session_dir = self.session_dir(ctx);
        secret_files::ensure_private_dir(&session_dir).map_err(|e| {
            BackendError::Provision(format!(
                "failed to create session directory {}: {}",
                session_dir.display(),
                e
            ))
        })?;

        let output = self
            .limactl(self.create_args(ctx, image, volumes))
            .await
            .map_err(|e| BackendError::Provision(e.to_string()))?;
        if !output.success() {
            return Err(BackendError::Provision(format!(
                "limactl create exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        info!(session = %ctx.session_name, "Created Lima instance {}", ctx.instance_name());
        Ok(ctx.instance_name())
    }

    async fn configure(
        &self,
        ctx: &SessionContext,
        secrets: &BTreeMap<String, String>,
        identity: &SessionIdentity,
    ) -> Result<(), BackendError> {
        let session_dir = self.session_dir(ctx);
        tokio::task::spawn_blocking({
            let secrets = secrets.clone();
            let identity = identity.clone();
            move || secret_files::write_session_secrets(&session_dir, &secrets, &identity)
        })
        .await
        .map_err(|e| BackendError::Configure(e.to_string()))?
        .map_err(|e| BackendError::Configure(e.to_string()))?;
        Ok(())
    }

    async fn start(&self, ctx: &SessionContext) -> Result<String, BackendError> {
        let output = self
            .limactl(vec!["start".to_string(), ctx.instance_name()])
            .await
            .map_err(|e| BackendError::Start(e.to_string()))?;
        if !output.success() {
            return Err(BackendError::Start(format!(
                "limactl start exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        let endpoint = match ctx.port {
            Some(port) => format!("http://127.0.0.1:{}", port),
            None => format!("lima://{}", ctx.instance_name()),
        };
        info!(session = %ctx.session_name, "Started Lima instance at {}", endpoint);
        Ok(endpoint)
    }

    async fn stop(&self, ctx: &SessionContext, timeout: Duration) -> Result<(), BackendError> {
        let name = ctx.instance_name();
        let graceful = self
            .runner
            .run(
                &self.config.limactl,
                &["stop".to_string(), name.clone()],
                timeout,
            )
            .await;
        match graceful {
            Ok(out) if out.success() || out.reports_missing_instance() => return Ok(()),
            Ok(out) => warn!(session = %ctx.session_name, "Graceful stop failed, forcing: {}", out.stderr.trim()),
            Err(e) => warn!(session = %ctx.session_name, "Graceful stop failed, forcing: {}", e),
        }

        let forced = self
            .limactl(vec!["stop".to_string(), "-f".to_string(), name])
            .await?;
        if forced.success() || forced.reports_missing_instance() {
            Ok(())
        } else {
            Err(BackendError::Stop(forced.stderr.trim().to_string()))
        }
    }

    async fn remove(&self, ctx: &SessionContext) -> Result<(), BackendError> {
        let output = self
            .limactl(vec![
                "delete".to_string(),
                "-f".to_string(),
                ctx.instance_name(),
            ])
            .await?;
        if !output.success() && !output.reports_missing_instance() {
            return Err(BackendError::Remove(output.stderr.trim().to_string()));
        }

        if let Err(e) = secret_files::remove_session_dir(&self.session_dir(ctx)) {
            warn!(session = %ctx.session_name, "Failed to remove session directory: {}", e);
        }
        info!(session = %ctx.session_name, "Deleted Lima instance");
        Ok(())
    }

    async fn health_check(
        &self,
        ctx: &SessionContext,
        timeout: Duration,
    ) -> Result<HealthStatus, BackendError> {
        let name = ctx.instance_name();
        let output = self
            .runner
            .run(
                &self.config.limactl,
                &["list".to_string(), "--json".to_string(), name.clone()],
                timeout,
            )
            .await?;
        if !output.success() {
            return Ok(HealthStatus::unhealthy(output.stderr.trim().to_string()));
        }

        let status = parse_instances(&output.stdout)
            .into_iter()
            .find(|i| i.name == name)
            .map(|i| i.status)
            .unwrap_or_else(|| "Missing".to_string());

        let health = if status == "Running" {
            HealthStatus::healthy()
        } else {
            HealthStatus::unhealthy(format!("instance is {}", status))
        };
        Ok(health.with_metric("status", serde_json::json!(status)))
    }

    async fn exec_command(
        &self,
        ctx: &SessionContext,
        command: &[String],
    ) -> Result<ExecOutput, BackendError> {
        let mut args = vec!["shell".to_string(), ctx.instance_name()];
        args.extend(command.iter().cloned());

        let output = self
            .limactl(args)
            .await
            .map_err(|e| BackendError::Exec(e.to_string()))?;
        Ok(ExecOutput {
            exit_code: output.exit_code as i64,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn get_sessions_info(&self) -> Result<Vec<SessionInfo>, BackendError> {
        let output = self
            .limactl(vec!["list".to_string(), "--json".to_string()])
            .await?;
        if !output.success() {
            return Err(BackendError::Unavailable(output.stderr.trim().to_string()));
        }

        Ok(parse_instances(&output.stdout)
            .into_iter()
            .filter_map(|instance| {
                let session_name = instance.name.strip_prefix(INSTANCE_PREFIX)?.to_string();
                Some(SessionInfo {
                    backend_kind: BackendKind::Vm,
                    session_name,
                    instance_id: instance.name,
                    status: instance.status,
                    image: None,
                })
            })
            .collect())
    }
}
