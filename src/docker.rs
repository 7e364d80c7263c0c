//! Docker runtime for waking and stopping backend containers

use crate::lifecycle::EnvironmentRuntime;
use async_trait::async_trait;
use bollard::container::{StartContainerOptions, StopContainerOptions};
use bollard::Docker;
use tracing::{debug, info};

/// Starts and stops existing containers by name or id
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit endpoint from the configuration
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's platform default socket
    pub async fn connect(endpoint: Option<&str>) -> anyhow::Result<Self> {
        let client = if let Some(host) = endpoint {
            connect_to_host(host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Docker::connect_with_socket_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!(
                "Docker daemon is not responding: {}. Ensure dockerd is running.",
                e
            )
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client })
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker endpoint: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

#[async_trait]
impl EnvironmentRuntime for DockerRuntime {
    async fn start(&self, id: &str) -> anyhow::Result<()> {
        match self
            .client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(_) => {
                info!(container = id, "Started Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = id, "Container was already running");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to start container '{}': {}", id, e)),
        }
    }

    async fn stop(&self, id: &str, grace_secs: u64) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: grace_secs as i64,
        };

        match self.client.stop_container(id, Some(options)).await {
            Ok(_) => {
                info!(container = id, "Stopped Docker container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container = id, "Container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container = id, "Container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!("Failed to stop container '{}': {}", id, e)),
        }
    }
}
