//! Docker daemon engine over bollard.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogOutput, RemoveContainerOptions,
    ResizeContainerTtyOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    HostConfig as DockerHostConfig, HostConfigLogConfig, Mount, MountTypeEnum,
    PortBinding as DockerPortBinding,
};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::stream::{BoxStream, StreamExt};
use url::Url;

use super::{ContainerEngine, ContainerIo, PullProgress};
use crate::error::EngineError;
use crate::session::config::ContainerConfig;

/// Client certificate material for a TLS-protected daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Where and how to reach a daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineEndpoint {
    pub url: Url,
    pub tls: Option<TlsMaterial>,
    pub timeout_secs: u64,
}

impl EngineEndpoint {
    /// `host:port` form bollard expects for TCP transports.
    fn address(&self) -> Result<String, EngineError> {
        let host = self.url.host_str().ok_or_else(|| EngineError::Connect {
            endpoint: self.url.to_string(),
            reason: "endpoint has no host".to_string(),
        })?;
        match self.url.port_or_known_default() {
            Some(port) => Ok(format!("{host}:{port}")),
            None => Ok(host.to_string()),
        }
    }
}

/// A Docker daemon. The bollard client pools its connections, so one
/// `DockerEngine` serves any number of concurrent sessions.
#[derive(Debug, Clone)]
pub struct DockerEngine {
    docker: Docker,
    endpoint: String,
}

impl DockerEngine {
    /// Build a client for `endpoint`: unix socket, TLS when certificate
    /// material is configured, plain HTTP otherwise.
    pub fn connect(endpoint: &EngineEndpoint) -> Result<Self, EngineError> {
        let label = endpoint.url.to_string();
        let connect_err = |e: BollardError| EngineError::Connect {
            endpoint: label.clone(),
            reason: e.to_string(),
        };

        let docker = if endpoint.url.scheme() == "unix" {
            Docker::connect_with_socket(
                endpoint.url.path(),
                endpoint.timeout_secs,
                API_DEFAULT_VERSION,
            )
            .map_err(connect_err)?
        } else if let Some(tls) = &endpoint.tls {
            Docker::connect_with_ssl(
                &endpoint.address()?,
                &tls.key,
                &tls.cert,
                &tls.ca,
                endpoint.timeout_secs,
                API_DEFAULT_VERSION,
            )
            .map_err(connect_err)?
        } else {
            Docker::connect_with_http(
                &endpoint.address()?,
                endpoint.timeout_secs,
                API_DEFAULT_VERSION,
            )
            .map_err(connect_err)?
        };

        Ok(Self {
            docker,
            endpoint: label,
        })
    }
}

fn is_not_found(error: &BollardError) -> bool {
    matches!(
        error,
        BollardError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Split `image` into the `fromImage` and `tag` parameters of a pull.
///
/// A reference without a tag pulls `latest`. Digest references are passed
/// through whole.
pub fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let name_start = image.rfind('/').map_or(0, |slash| slash + 1);
    match image[name_start..].rfind(':') {
        Some(colon) => {
            let colon = name_start + colon;
            (&image[..colon], &image[colon + 1..])
        }
        None => (image, "latest"),
    }
}

/// Translate an engine-neutral configuration into the Docker create body.
pub fn to_docker_config(config: &ContainerConfig) -> Config<String> {
    let exposed_ports = (!config.exposed_ports.is_empty()).then(|| {
        config
            .exposed_ports
            .iter()
            .map(|port| (port.to_string(), HashMap::new()))
            .collect()
    });

    let port_bindings = (!config.host.port_bindings.is_empty()).then(|| {
        config
            .host
            .port_bindings
            .iter()
            .map(|binding| {
                (
                    binding.container_port.to_string(),
                    Some(vec![DockerPortBinding {
                        host_ip: Some(binding.host_ip.clone()),
                        host_port: Some(binding.host_port.clone()),
                    }]),
                )
            })
            .collect()
    });

    let mounts = (!config.host.mounts.is_empty()).then(|| {
        config
            .host
            .mounts
            .iter()
            .map(|mount| Mount {
                typ: Some(MountTypeEnum::BIND),
                source: Some(mount.source.clone()),
                target: Some(mount.target.clone()),
                read_only: Some(mount.read_only),
                consistency: Some("default".to_string()),
                ..Default::default()
            })
            .collect()
    });

    let host_config = DockerHostConfig {
        network_mode: Some(config.host.network_mode.clone()),
        log_config: Some(HostConfigLogConfig {
            typ: Some(config.host.log_driver.clone()),
            config: None,
        }),
        pids_limit: Some(config.host.pids_limit),
        port_bindings,
        security_opt: Some(config.host.security_opt.clone()),
        cap_add: (!config.host.cap_add.is_empty()).then(|| config.host.cap_add.clone()),
        mounts,
        ..Default::default()
    };

    Config {
        image: Some(config.image.clone()),
        cmd: Some(config.cmd.clone()),
        tty: Some(config.tty),
        attach_stdin: Some(config.attach_stdin),
        attach_stdout: Some(config.attach_stdout),
        attach_stderr: Some(config.attach_stderr),
        open_stdin: Some(config.open_stdin),
        stdin_once: Some(config.stdin_once),
        user: (!config.user.is_empty()).then(|| config.user.clone()),
        exposed_ports,
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn info(&self) -> Result<serde_json::Value, EngineError> {
        let info = self
            .docker
            .info()
            .await
            .map_err(|e| EngineError::operation("info", &self.endpoint, e))?;
        serde_json::to_value(info).map_err(|e| EngineError::operation("info", &self.endpoint, e))
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(EngineError::operation("inspect_image", image, e)),
        }
    }

    fn pull_image(&self, image: &str) -> BoxStream<'static, Result<PullProgress, EngineError>> {
        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let target = image.to_string();

        self.docker
            .create_image(Some(options), None, None)
            .map(move |item| match item {
                Ok(info) => Ok(PullProgress {
                    id: info.id,
                    status: info.status.unwrap_or_default(),
                    progress: info.progress,
                }),
                Err(e) => Err(EngineError::operation("pull_image", target.as_str(), e)),
            })
            .boxed()
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String, EngineError> {
        let response = self
            .docker
            .create_container(
                None::<CreateContainerOptions<String>>,
                to_docker_config(config),
            )
            .await
            .map_err(|e| EngineError::operation("create_container", &config.image, e))?;

        for warning in &response.warnings {
            tracing::warn!(container = %response.id, "Engine warning on create: {}", warning);
        }
        Ok(response.id)
    }

    async fn attach_container(&self, id: &str) -> Result<ContainerIo, EngineError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let attached = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| EngineError::operation("attach_container", id, e))?;

        let output = attached
            .output
            .map(|chunk| chunk.map(LogOutput::into_bytes).map_err(EngineError::from));

        Ok(ContainerIo {
            output: Box::pin(output),
            input: attached.input,
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::operation("start_container", id, e))
    }

    async fn resize_container(
        &self,
        id: &str,
        height: u16,
        width: u16,
    ) -> Result<(), EngineError> {
        self.docker
            .resize_container_tty(id, ResizeContainerTtyOptions { height, width })
            .await
            .map_err(|e| EngineError::operation("resize_container", id, e))
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(EngineError::NotFound {
                what: format!("container: {id}"),
            }),
            Err(e) => Err(EngineError::operation("remove_container", id, e)),
        }
    }
}
