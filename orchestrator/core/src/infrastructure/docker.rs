// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Docker Session Backend
//!
//! Runs each session as one container named `enclave-<session>`, labelled
//! so the hub can enumerate what it owns. The container idles on
//! `tail -f /dev/null`; agent work happens through exec or the published
//! port bound to loopback.
//!
//! Hardened sessions get: all capabilities dropped, read-only root
//! filesystem with tmpfs for `/tmp` and `/run`, `no-new-privileges`,
//! memory, CPU and pid limits, read-only bind mounts and no TTY.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::service::{HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::domain::config::DockerBackendConfig;
use crate::domain::runtime::{
    BackendError, ExecOutput, HealthStatus, SessionBackend, SessionIdentity, SessionInfo,
    VolumeMount,
};
use crate::domain::session::{BackendKind, SessionContext};
use crate::infrastructure::secret_files;

pub const LABEL_SESSION: &str = "enclave.session";
pub const LABEL_ROLE: &str = "enclave.role";
pub const LABEL_MANAGED: &str = "enclave.managed";

pub struct DockerBackend {
    docker: Docker,
    config: DockerBackendConfig,
    data_root: PathBuf,
}

/// 404 (gone) and 304 (already in that state) are both success for teardown.
fn is_benign_teardown_error(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404 | 304,
            ..
        }
    )
}

/// Exit code reported when the daemon has no code for a finished exec.
const UNKNOWN_EXIT_CODE: i64 = -1;

fn exec_exit_code(reported: Option<i64>) -> i64 {
    reported.unwrap_or(UNKNOWN_EXIT_CODE)
}

impl DockerBackend {
    pub fn new(config: DockerBackendConfig, data_root: PathBuf) -> Result<Self, BackendError> {
        let docker = if let Some(path) = &config.socket_path {
            #[cfg(unix)]
            let result = Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION);

            #[cfg(windows)]
            let result = Docker::connect_with_named_pipe(path, 120, bollard::API_DEFAULT_VERSION);

            result.map_err(|e| {
                BackendError::Unavailable(format!(
                    "Failed to connect to Docker at {}: {}\n\n\
                     Ensure Docker is running and the socket path is correct.",
                    path, e
                ))
            })?
        } else {
            Docker::connect_with_local_defaults().map_err(|e| {
                BackendError::Unavailable(format!(
                    "Failed to connect to Docker: {}\n\n\
                     Common causes:\n\
                     - Docker daemon not running (check: docker ps)\n\
                     - Permission denied accessing Docker socket\n\
                     - On Linux: Current user not in 'docker' group",
                    e
                ))
            })?
        };

        Ok(Self {
            docker,
            config,
            data_root,
        })
    }

    /// Verify the Docker daemon is reachable.
    pub async fn healthcheck(&self) -> Result<(), BackendError> {
        self.docker.ping().await.map_err(|e| {
            BackendError::Unavailable(format!(
                "Cannot connect to Docker daemon: {}\n\nVerify with: docker ps",
                e
            ))
        })?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), BackendError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        info!("Pulling image: {}", image);
        let options = Some(CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(result) = stream.next().await {
            if let Err(e) = result {
                return Err(BackendError::Provision(format!(
                    "Failed to pull image {}: {}\n\nTry manually: docker pull {}",
                    image, e, image
                )));
            }
        }
        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    fn labels(ctx: &SessionContext) -> HashMap<String, String> {
        HashMap::from([
            (LABEL_SESSION.to_string(), ctx.session_name.clone()),
            (LABEL_ROLE.to_string(), ctx.role.clone()),
            (LABEL_MANAGED.to_string(), "true".to_string()),
        ])
    }

    fn binds(volumes: &[VolumeMount], hardened: bool) -> Vec<String> {
        volumes
            .iter()
            .map(|v| {
                let mode = if v.read_only || hardened { "ro" } else { "rw" };
                format!("{}:{}:{}", v.host_path.display(), v.target, mode)
            })
            .collect()
    }

    fn host_config(
        &self,
        ctx: &SessionContext,
        volumes: &[VolumeMount],
        hardened: bool,
    ) -> HostConfig {
        let container_port = format!("{}/tcp", self.config.container_port);
        let port_bindings = ctx.port.map(|port| {
            HashMap::from([(
                container_port,
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(port.to_string()),
                }]),
            )])
        });

        let mut host_config = HostConfig {
            binds: Some(Self::binds(volumes, hardened)),
            network_mode: self.config.network.clone(),
            port_bindings,
            memory: Some(self.config.memory_bytes),
            nano_cpus: Some(self.config.nano_cpus),
            ..Default::default()
        };

        if hardened {
            let tmpfs_opts = format!("rw,noexec,nosuid,size={}", self.config.tmpfs_size);
            host_config.cap_drop = Some(vec!["ALL".to_string()]);
            host_config.readonly_rootfs = Some(true);
            host_config.security_opt = Some(vec!["no-new-privileges:true".to_string()]);
            host_config.pids_limit = Some(self.config.pids_limit);
            host_config.tmpfs = Some(HashMap::from([
                ("/tmp".to_string(), tmpfs_opts.clone()),
                ("/run".to_string(), tmpfs_opts),
            ]));
        }

        host_config
    }
}

#[async_trait]
impl SessionBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn provision(
        &self,
        ctx: &SessionContext,
        image: &str,
        volumes: &[VolumeMount],
        hardened: bool,
    ) -> Result<String, BackendError> {
        self.ensure_image(image).await?;

        // Docker creates missing bind sources as root; create them ourselves.
        let session_dir = self.data_root.join(&ctx.session_name);
        secret_files::ensure_private_dir(&session_dir).map_err(|e| {
            BackendError::Provision(format!(
                "failed to create session directory {}: {}",
                session_dir.display(),
                e
            ))
        })?;

        let container_port = format!("{}/tcp", self.config.container_port);
        let config = Config {
            image: Some(image.to_string()),
            tty: Some(!hardened),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            env: Some(vec![
                format!("ENCLAVE_SESSION={}", ctx.session_name),
                format!("ENCLAVE_ROLE={}", ctx.role),
            ]),
            labels: Some(Self::labels(ctx)),
            exposed_ports: Some(HashMap::from([(container_port, HashMap::new())])),
            host_config: Some(self.host_config(ctx, volumes, hardened)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: ctx.instance_name(),
            platform: None,
        };

        let res = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| BackendError::Provision(e.to_string()))?;

        for warning in &res.warnings {
            warn!(session = %ctx.session_name, "Docker warning: {}", warning);
        }
        info!(session = %ctx.session_name, hardened, "Created session container: {}", res.id);
        Ok(res.id)
    }

    async fn configure(
        &self,
        ctx: &SessionContext,
        secrets: &BTreeMap<String, String>,
        identity: &SessionIdentity,
    ) -> Result<(), BackendError> {
        let session_dir = self.data_root.join(&ctx.session_name);
        let dir = tokio::task::spawn_blocking({
            let secrets = secrets.clone();
            let identity = identity.clone();
            move || secret_files::write_session_secrets(&session_dir, &secrets, &identity)
        })
        .await
        .map_err(|e| BackendError::Configure(e.to_string()))?
        .map_err(|e| BackendError::Configure(e.to_string()))?;

        debug!(session = %ctx.session_name, secrets = secrets.len(), "Secrets written to {}", dir.display());
        Ok(())
    }

    async fn start(&self, ctx: &SessionContext) -> Result<String, BackendError> {
        let name = ctx.instance_name();
        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BackendError::Start(format!("Failed to start container: {}", e)))?;

        let endpoint = match ctx.port {
            Some(port) => format!("http://127.0.0.1:{}", port),
            None => format!("docker://{}", name),
        };
        info!(session = %ctx.session_name, "Started session container at {}", endpoint);
        Ok(endpoint)
    }

    async fn stop(&self, ctx: &SessionContext, timeout: Duration) -> Result<(), BackendError> {
        let name = ctx.instance_name();
        let options = StopContainerOptions {
            t: timeout.as_secs() as i64,
        };

        match self.docker.stop_container(&name, Some(options)).await {
            Ok(()) => return Ok(()),
            Err(e) if is_benign_teardown_error(&e) => return Ok(()),
            Err(e) => warn!(session = %ctx.session_name, "Graceful stop failed, killing: {}", e),
        }

        match self
            .docker
            .kill_container(&name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_benign_teardown_error(&e) => Ok(()),
            // 409: not running any more
            Err(DockerError::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(BackendError::Stop(e.to_string())),
        }
    }

    async fn remove(&self, ctx: &SessionContext) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };

        match self
            .docker
            .remove_container(&ctx.instance_name(), Some(options))
            .await
        {
            Ok(()) => {}
            Err(e) if is_benign_teardown_error(&e) => {}
            Err(e) => return Err(BackendError::Remove(e.to_string())),
        }

        let session_dir = self.data_root.join(&ctx.session_name);
        if let Err(e) = secret_files::remove_session_dir(&session_dir) {
            warn!(session = %ctx.session_name, "Failed to remove session directory: {}", e);
        }
        info!(session = %ctx.session_name, "Removed session container");
        Ok(())
    }

    async fn health_check(
        &self,
        ctx: &SessionContext,
        timeout: Duration,
    ) -> Result<HealthStatus, BackendError> {
        let inspect = tokio::time::timeout(
            timeout,
            self.docker
                .inspect_container(&ctx.instance_name(), None::<InspectContainerOptions>),
        )
        .await
        .map_err(|_| BackendError::Timeout(timeout))?
        .map_err(|e| BackendError::HealthCheck(e.to_string()))?;

        let restarts = inspect.restart_count.unwrap_or(0);
        let state = inspect.state.unwrap_or_default();
        let status = state
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let health = if state.running.unwrap_or(false) {
            HealthStatus::healthy()
        } else {
            HealthStatus::unhealthy(format!("container is {}", status))
        };
        Ok(health
            .with_metric("status", serde_json::json!(status))
            .with_metric("restart_count", serde_json::json!(restarts)))
    }

    async fn exec_command(
        &self,
        ctx: &SessionContext,
        command: &[String],
    ) -> Result<ExecOutput, BackendError> {
        let exec_config = CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.to_vec()),
            ..Default::default()
        };

        let name = ctx.instance_name();
        let exec = self
            .docker
            .create_exec(&name, exec_config)
            .await
            .map_err(|e| BackendError::Exec(e.to_string()))?;

        let start_opts = StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let res = self
            .docker
            .start_exec(&exec.id, Some(start_opts))
            .await
            .map_err(|e| BackendError::Exec(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = res {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    Ok(_) => {}
                    Err(e) => return Err(BackendError::Exec(e.to_string())),
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| BackendError::Exec(format!("Failed to inspect exec: {}", e)))?;

        Ok(ExecOutput {
            exit_code: exec_exit_code(inspect.exit_code),
            stdout,
            stderr,
        })
    }

    async fn get_sessions_info(&self) -> Result<Vec<SessionInfo>, BackendError> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let session_name = c.labels.as_ref()?.get(LABEL_SESSION)?.clone();
                Some(SessionInfo {
                    backend_kind: BackendKind::Docker,
                    session_name,
                    instance_id: c.id.unwrap_or_default(),
                    status: c.state.unwrap_or_else(|| "unknown".to_string()),
                    image: c.image,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn backend() -> DockerBackend {
        // Connecting is lazy; no daemon is needed to build request bodies.
        DockerBackend::new(DockerBackendConfig::default(), PathBuf::from("/tmp/enclave-test"))
            .unwrap()
    }

    fn ctx(port: Option<u16>) -> SessionContext {
        let mut ctx = SessionContext::new(
            "dev-1",
            BackendKind::Docker,
            "developer",
            "ghcr.io/acme/dev@sha256:abc",
            true,
            Duration::from_secs(60),
            Utc::now(),
        );
        ctx.port = port;
        ctx
    }

    #[tokio::test]
    async fn test_hardened_host_config() {
        let volumes = vec![VolumeMount::new("/srv/repo", "/workspace", false)];
        let hc = backend().host_config(&ctx(Some(18080)), &volumes, true);

        assert_eq!(hc.cap_drop, Some(vec!["ALL".to_string()]));
        assert_eq!(hc.readonly_rootfs, Some(true));
        assert_eq!(hc.binds, Some(vec!["/srv/repo:/workspace:ro".to_string()]));
        let tmpfs = hc.tmpfs.unwrap();
        assert!(tmpfs.contains_key("/tmp"));
        assert!(tmpfs.contains_key("/run"));
        assert!(hc
            .security_opt
            .unwrap()
            .contains(&"no-new-privileges:true".to_string()));

        let bindings = hc.port_bindings.unwrap();
        let binding = bindings["8080/tcp"].as_ref().unwrap()[0].clone();
        assert_eq!(binding.host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(binding.host_port.as_deref(), Some("18080"));
    }

    #[tokio::test]
    async fn test_unhardened_keeps_requested_mount_mode() {
        let volumes = vec![
            VolumeMount::new("/srv/repo", "/workspace", false),
            VolumeMount::new("/srv/ref", "/ref", true),
        ];
        let hc = backend().host_config(&ctx(None), &volumes, false);

        assert!(hc.cap_drop.is_none());
        assert!(hc.readonly_rootfs.is_none());
        assert!(hc.port_bindings.is_none());
        assert_eq!(
            hc.binds,
            Some(vec![
                "/srv/repo:/workspace:rw".to_string(),
                "/srv/ref:/ref:ro".to_string()
            ])
        );
    }

    #[test]
    fn test_labels() {
        let labels = DockerBackend::labels(&ctx(None));
        assert_eq!(labels[LABEL_SESSION], "dev-1");
        assert_eq!(labels[LABEL_ROLE], "developer");
        assert_eq!(labels[LABEL_MANAGED], "true");
    }

    #[test]
    fn test_benign_teardown_errors() {
        let gone = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let broken = DockerError::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(is_benign_teardown_error(&gone));
        assert!(!is_benign_teardown_error(&broken));
    }

    #[test]
    fn test_missing_exec_exit_code_is_not_success() {
        assert_eq!(exec_exit_code(Some(0)), 0);
        assert_eq!(exec_exit_code(Some(2)), 2);
        assert_eq!(exec_exit_code(None), -1);
    }
}
