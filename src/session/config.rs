//! Engine-facing container configuration.
//!
//! The configuration is composed from small option functions applied over a
//! fixed base. Each option writes a disjoint set of fields, so the order in
//! which they are applied never changes the result.
//!
//! ```text
//! container options:  with_port ─ with_image ─ with_user
//! host options:       with_port_binding ─ with_security_options ─ with_host_mounts
//! ```

use crate::profiles::{BindMount, SecurityProfile};
use crate::session::request::{HostPort, SessionRequest};

/// Image used when the request does not name one.
pub const DEFAULT_IMAGE: &str = "alpine:latest";

/// Process-count ceiling applied to every container regardless of profile.
pub const PIDS_LIMIT: i64 = 5;

/// Network mode for every profile.
pub const NETWORK_MODE: &str = "default";

/// Logging driver for every profile. Container output is only ever relayed.
pub const LOG_DRIVER: &str = "none";

/// Interface exposed ports are bound on.
pub const HOST_BIND_IP: &str = "0.0.0.0";

/// A host port published to the container port of the same number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortBinding {
    pub container_port: HostPort,
    pub host_ip: String,
    pub host_port: String,
}

/// Host-side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub network_mode: String,
    pub log_driver: String,
    pub pids_limit: i64,
    pub port_bindings: Vec<PortBinding>,
    pub security_opt: Vec<String>,
    pub cap_add: Vec<String>,
    pub mounts: Vec<BindMount>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            network_mode: NETWORK_MODE.to_string(),
            log_driver: LOG_DRIVER.to_string(),
            pids_limit: PIDS_LIMIT,
            port_bindings: Vec::new(),
            security_opt: Vec::new(),
            cap_add: Vec::new(),
            mounts: Vec::new(),
        }
    }
}

/// Everything the engine needs to create a session container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub open_stdin: bool,
    pub stdin_once: bool,
    pub user: String,
    pub exposed_ports: Vec<HostPort>,
    pub host: HostConfig,
}

impl Default for ContainerConfig {
    /// Interactive shell with every stream attached.
    fn default() -> Self {
        Self {
            image: String::new(),
            cmd: vec!["sh".to_string()],
            tty: true,
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            open_stdin: true,
            stdin_once: true,
            user: String::new(),
            exposed_ports: Vec::new(),
            host: HostConfig::default(),
        }
    }
}

/// Transform over the container-level fields.
pub type ContainerOption = Box<dyn FnOnce(&mut ContainerConfig) + Send>;

/// Transform over the host-level fields.
pub type HostOption = Box<dyn FnOnce(&mut HostConfig) + Send>;

/// Expose `port` on the container. Touches `exposed_ports` only.
pub fn with_port(port: Option<HostPort>) -> ContainerOption {
    Box::new(move |cfg| {
        if let Some(port) = port {
            cfg.exposed_ports = vec![port];
        }
    })
}

/// Select the image, falling back to [`DEFAULT_IMAGE`]. Touches `image` only.
pub fn with_image(image: Option<&str>) -> ContainerOption {
    let image = image
        .filter(|image| !image.is_empty())
        .unwrap_or(DEFAULT_IMAGE)
        .to_string();
    Box::new(move |cfg| cfg.image = image)
}

/// Run as the profile's user. Touches `user` only.
pub fn with_user(profile: &SecurityProfile) -> ContainerOption {
    let user = profile.user().to_string();
    Box::new(move |cfg| cfg.user = user)
}

/// Publish `port` on every host interface. Touches `port_bindings` only.
pub fn with_port_binding(port: Option<HostPort>) -> HostOption {
    Box::new(move |cfg| {
        if let Some(port) = port {
            cfg.port_bindings = vec![PortBinding {
                container_port: port,
                host_ip: HOST_BIND_IP.to_string(),
                host_port: port.number().to_string(),
            }];
        }
    })
}

/// Apply the profile's seccomp policy and capabilities. Touches
/// `security_opt` and `cap_add` only.
pub fn with_security_options(profile: &SecurityProfile) -> HostOption {
    let security_opt = profile.seccomp().security_opt();
    let cap_add = profile.cap_add().to_vec();
    Box::new(move |cfg| {
        cfg.security_opt = security_opt;
        cfg.cap_add = cap_add;
    })
}

/// Bind the profile's host directories. Touches `mounts` only.
pub fn with_host_mounts(profile: &SecurityProfile) -> HostOption {
    let mounts = profile.mounts().to_vec();
    Box::new(move |cfg| cfg.mounts = mounts)
}

/// Apply container and host options over the base configuration.
pub fn new_container_config(
    opts: impl IntoIterator<Item = ContainerOption>,
    host_opts: impl IntoIterator<Item = HostOption>,
) -> ContainerConfig {
    let mut cfg = ContainerConfig::default();
    for opt in opts {
        opt(&mut cfg);
    }
    for opt in host_opts {
        opt(&mut cfg.host);
    }
    cfg
}

/// Build the container configuration for a validated request.
///
/// Pure: the same request and profile always produce the same configuration.
pub fn build(request: &SessionRequest, profile: &SecurityProfile) -> ContainerConfig {
    new_container_config(
        [
            with_port(request.port),
            with_image(request.image.as_deref()),
            with_user(profile),
        ],
        [
            with_port_binding(request.port),
            with_security_options(profile),
            with_host_mounts(profile),
        ],
    )
}
