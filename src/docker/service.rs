//! Shared Docker client wrapper
//!
//! Every runtime primitive the daemon needs goes through one process-wide
//! `DockerService`, created lazily on first use.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use bollard::auth::DockerCredentials;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    KillContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum, PortBinding};
use bollard::Docker;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use tokio::io::AsyncWrite;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::error::{DaemonError, Result};

use super::allocations::PortMap;

static SHARED: OnceLock<DockerService> = OnceLock::new();

/// Mount description for `create`.
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub hostname: String,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub working_dir: Option<String>,
    pub mounts: Vec<MountSpec>,
    pub memory: i64,
    pub cpu_shares: i64,
    pub port_bindings: PortMap,
    pub exposed: Vec<String>,
    pub network_mode: Option<String>,
    pub dns: Vec<String>,
    pub tmpfs_size_mb: u64,
    pub userns_mode: Option<String>,
}

impl ContainerSpec {
    pub fn mount(mut self, source: &str, target: &str, read_only: bool) -> Self {
        self.mounts.push(MountSpec {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        });
        self
    }
}

/// Result of `inspect`.
#[derive(Debug, Clone, Default)]
pub struct ContainerStatus {
    pub status: String,
    pub running: bool,
    pub exit_code: i64,
    pub started_at: Option<String>,
}

/// Streams returned by `attach`: container output plus a writable stdin.
pub struct AttachedIo {
    pub output:
        Pin<Box<dyn Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[derive(Clone)]
pub struct DockerService {
    client: Arc<Docker>,
}

impl DockerService {
    pub fn new() -> Result<Self> {
        let client = Docker::connect_with_local_defaults()
            .map_err(|e| DaemonError::RuntimeUnavailable(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    /// The process-wide instance, created on first use.
    pub fn shared() -> Result<Self> {
        if let Some(service) = SHARED.get() {
            return Ok(service.clone());
        }

        let service = Self::new()?;
        Ok(SHARED.get_or_init(|| service).clone())
    }

    pub fn client(&self) -> &Docker {
        &self.client
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| DaemonError::RuntimeUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Pull an image, draining the progress stream. Credentials are looked
    /// up by registry host when the image names one.
    pub async fn pull(
        &self,
        image: &str,
        registries: &HashMap<String, RegistryConfig>,
    ) -> Result<()> {
        if self.client.inspect_image(image).await.is_ok() {
            debug!("image {} already present", image);
            return Ok(());
        }

        info!("pulling image {}", image);

        let credentials = registry_host(image)
            .and_then(|host| registries.get(host).map(|c| (host, c)))
            .map(|(host, creds)| DockerCredentials {
                username: Some(creds.username.clone()),
                password: Some(creds.password.clone()),
                serveraddress: Some(host.to_string()),
                ..Default::default()
            });

        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            let item = result?;
            if let Some(status) = item.status {
                debug!("pull {}: {}", image, status);
            }
        }

        Ok(())
    }

    /// Create a container and return its runtime id.
    pub async fn create(&self, spec: ContainerSpec) -> Result<String> {
        let mounts: Vec<Mount> = spec
            .mounts
            .iter()
            .map(|m| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .port_bindings
            .iter()
            .map(|(port, bindings)| (port.clone(), Some(bindings.clone())))
            .collect();

        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed
            .iter()
            .map(|port| (port.clone(), HashMap::new()))
            .collect();

        let mut tmpfs = HashMap::new();
        tmpfs.insert(
            "/tmp".to_string(),
            format!("rw,exec,nosuid,size={}M", spec.tmpfs_size_mb),
        );

        let host_config = HostConfig {
            mounts: Some(mounts),
            port_bindings: Some(port_bindings),
            tmpfs: Some(tmpfs),
            memory: (spec.memory > 0).then_some(spec.memory),
            cpu_shares: (spec.cpu_shares > 0).then_some(spec.cpu_shares),
            dns: (!spec.dns.is_empty()).then(|| spec.dns.clone()),
            network_mode: spec.network_mode.clone(),
            userns_mode: spec.userns_mode.clone(),
            ..Default::default()
        };

        let config = Config {
            hostname: Some(spec.hostname.clone()),
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            cmd: Some(spec.cmd.clone()),
            working_dir: spec.working_dir.clone(),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            open_stdin: Some(true),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self.client.create_container(Some(options), config).await?;
        info!("created container {} ({})", spec.name, response.id);

        Ok(response.id)
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        self.client.start_container::<String>(id, None).await?;
        Ok(())
    }

    pub async fn stop(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions {
            t: timeout_secs as _,
        };
        self.client.stop_container(id, Some(options)).await?;
        Ok(())
    }

    pub async fn kill(&self, id: &str, signal: &str) -> Result<()> {
        let options = KillContainerOptions { signal };
        match self.client.kill_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already gone or already stopped is as killed as it gets.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn restart(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = RestartContainerOptions {
            t: timeout_secs as _,
        };
        self.client.restart_container(id, Some(options)).await?;
        Ok(())
    }

    pub async fn remove(&self, id: &str, force: bool, keep_volumes: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            v: !keep_volumes,
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("container {} already gone", id);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn inspect(&self, id: &str) -> Result<ContainerStatus> {
        let info = self.client.inspect_container(id, None).await?;
        let state = info.state.unwrap_or_default();

        Ok(ContainerStatus {
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
            started_at: state.started_at.filter(|s| !s.is_empty()),
        })
    }

    /// Block until the container is no longer running; returns its exit code.
    pub async fn wait_not_running(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.client.wait_container(id, Some(options));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(e.into()),
            None => Err(DaemonError::Internal("wait stream ended unexpectedly".into())),
        }
    }

    /// Container log stream; `since` is epoch seconds.
    pub fn logs(
        &self,
        id: &str,
        follow: bool,
        since: Option<i64>,
    ) -> impl Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow,
            since: since.unwrap_or(0),
            ..Default::default()
        };

        self.client.logs(id, Some(options))
    }

    /// Hijack the container's stdio.
    pub async fn attach(&self, id: &str) -> Result<AttachedIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };

        let AttachContainerResults { output, input } =
            self.client.attach_container(id, Some(options)).await?;

        Ok(AttachedIo { output, input })
    }

    /// One-shot stats snapshot.
    pub async fn stats_once(&self, id: &str) -> Result<bollard::container::Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };

        let mut stream = self.client.stats(id, Some(options));
        match stream.next().await {
            Some(Ok(stats)) => Ok(stats),
            Some(Err(e)) => Err(e.into()),
            None => Err(DaemonError::Internal("stats stream ended unexpectedly".into())),
        }
    }

    /// Per-container writable-layer disk usage in bytes.
    pub async fn disk_usage(&self) -> Result<HashMap<String, u64>> {
        let usage = self.client.df().await?;

        let mut out = HashMap::new();
        for container in usage.containers.unwrap_or_default() {
            if let Some(id) = container.id {
                out.insert(id, container.size_rw.unwrap_or(0).max(0) as u64);
            }
        }

        Ok(out)
    }
}

/// The registry host prefix of an image reference, when it names one
/// (contains a dot or port before the first slash).
fn registry_host(image: &str) -> Option<&str> {
    let (head, _) = image.split_once('/')?;
    (head.contains('.') || head.contains(':')).then_some(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_host_detection() {
        assert_eq!(registry_host("alpine:3"), None);
        assert_eq!(registry_host("library/alpine"), None);
        assert_eq!(registry_host("ghcr.io/acme/img:1"), Some("ghcr.io"));
        assert_eq!(registry_host("localhost:5000/img"), Some("localhost:5000"));
    }

    #[test]
    fn spec_mount_builder_appends() {
        let spec = ContainerSpec::default()
            .mount("/host/data", "/mnt/data", false)
            .mount("/host/install", "/mnt/install", true);

        assert_eq!(spec.mounts.len(), 2);
        assert!(spec.mounts[1].read_only);
        assert_eq!(spec.mounts[0].target, "/mnt/data");
    }
}
