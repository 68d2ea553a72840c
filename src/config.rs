//! Process configuration.
//!
//! Every flag can also be set from the environment; a `.env` file in the
//! working directory is loaded before parsing.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use url::Url;

use crate::engine::{EngineEndpoint, TlsMaterial};
use crate::error::ConfigError;

pub const DEFAULT_DOCKER_HOST: &str = "http://127.0.0.1:2375";
pub const DEFAULT_DOCKER_USERNS_HOST: &str = "http://127.0.0.1:2376";
pub const DEFAULT_FRONTEND_DIR: &str = "/usr/src/contained.af";

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "contained")]
#[command(about = "A game for learning about containers, capabilities, and syscalls")]
#[command(version)]
pub struct Config {
    /// Host to communicate with docker on
    #[arg(long = "dhost", env = "DOCKER_HOST", default_value = DEFAULT_DOCKER_HOST)]
    pub docker_host: String,

    /// Host to communicate with user namespace enabled docker on
    #[arg(long = "dusernshost", env = "DOCKER_USERNS_HOST", default_value = DEFAULT_DOCKER_USERNS_HOST)]
    pub docker_userns_host: String,

    /// Trust certs signed only by this CA for docker host
    #[arg(long = "dcacert", env = "DOCKER_CA_CERT")]
    pub docker_ca_cert: Option<PathBuf>,

    /// Path to TLS certificate file for docker host
    #[arg(long = "dcert", env = "DOCKER_CERT")]
    pub docker_cert: Option<PathBuf>,

    /// Path to TLS key file for docker host
    #[arg(long = "dkey", env = "DOCKER_KEY")]
    pub docker_key: Option<PathBuf>,

    /// Operating system of the docker host, shown on the index page
    #[arg(long = "os", env = "HOST_OS", default_value = "")]
    pub host_os: String,

    /// Directory that holds the static frontend files
    #[arg(long, env = "FRONTEND_DIR", default_value = DEFAULT_FRONTEND_DIR)]
    pub frontend: PathBuf,

    /// Port for server
    #[arg(long, env = "PORT", default_value_t = 10000)]
    pub port: u16,

    /// Enable debug logging
    #[arg(short, long, env = "DEBUG")]
    pub debug: bool,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    /// Engine request timeout in seconds
    #[arg(long, env = "ENGINE_TIMEOUT_SECS", default_value_t = 120)]
    pub engine_timeout: u64,
}

impl Config {
    /// Address the HTTP server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.port))
    }

    /// Certificate material, when configured. Partial material is an error.
    pub fn tls(&self) -> Result<Option<TlsMaterial>, ConfigError> {
        match (&self.docker_ca_cert, &self.docker_cert, &self.docker_key) {
            (Some(ca), Some(cert), Some(key)) => Ok(Some(TlsMaterial {
                ca: ca.clone(),
                cert: cert.clone(),
                key: key.clone(),
            })),
            (None, None, None) => Ok(None),
            _ => Err(ConfigError::InvalidValue {
                key: "dcacert/dcert/dkey".to_string(),
                message: "all three of the CA certificate, certificate and key are required for TLS"
                    .to_string(),
            }),
        }
    }

    /// The standard engine endpoint.
    pub fn standard_endpoint(&self) -> Result<EngineEndpoint, ConfigError> {
        self.endpoint("dhost", &self.docker_host)
    }

    /// The user-namespaced engine endpoint.
    pub fn namespaced_endpoint(&self) -> Result<EngineEndpoint, ConfigError> {
        self.endpoint("dusernshost", &self.docker_userns_host)
    }

    fn endpoint(&self, key: &str, raw: &str) -> Result<EngineEndpoint, ConfigError> {
        let url = Url::parse(raw).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("parsing docker daemon URL {raw:?}: {e}"),
        })?;
        match url.scheme() {
            "http" | "https" | "tcp" | "unix" => {}
            other => {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("unsupported scheme {other:?}"),
                });
            }
        }
        let tls = if url.scheme() == "unix" {
            None
        } else {
            self.tls()?
        };
        Ok(EngineEndpoint {
            url,
            tls,
            timeout_secs: self.engine_timeout,
        })
    }

    /// Check everything that can be checked without touching the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.standard_endpoint()?;
        self.namespaced_endpoint()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["contained"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config {
            docker_host: DEFAULT_DOCKER_HOST.to_string(),
            docker_userns_host: DEFAULT_DOCKER_USERNS_HOST.to_string(),
            docker_ca_cert: None,
            docker_cert: None,
            docker_key: None,
            host_os: String::new(),
            frontend: PathBuf::from(DEFAULT_FRONTEND_DIR),
            port: 10000,
            debug: false,
            log_format: LogFormat::Pretty,
            engine_timeout: 120,
        };
        assert_eq!(config.listen_addr().port(), 10000);
        let standard = config.standard_endpoint().unwrap();
        assert_eq!(standard.url.as_str(), "http://127.0.0.1:2375/");
        assert_eq!(standard.tls, None);
        assert_eq!(standard.timeout_secs, 120);
        assert_eq!(
            config.namespaced_endpoint().unwrap().url.port(),
            Some(2376)
        );
    }

    #[test]
    fn test_flags_parse() {
        let config = parse(&[
            "--dhost",
            "tcp://10.0.0.1:2375",
            "--dusernshost",
            "tcp://10.0.0.2:2376",
            "--os",
            "Linux 6.1",
            "--port",
            "8080",
            "-d",
            "--log-format",
            "json",
        ]);
        assert_eq!(config.docker_host, "tcp://10.0.0.1:2375");
        assert_eq!(config.host_os, "Linux 6.1");
        assert_eq!(config.port, 8080);
        assert!(config.debug);
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_tls_material() {
        let config = parse(&[
            "--dhost",
            "https://docker.example:2376",
            "--dcacert",
            "/certs/ca.pem",
            "--dcert",
            "/certs/cert.pem",
            "--dkey",
            "/certs/key.pem",
        ]);
        let tls = config.standard_endpoint().unwrap().tls.unwrap();
        assert_eq!(tls.ca, PathBuf::from("/certs/ca.pem"));
        assert_eq!(tls.key, PathBuf::from("/certs/key.pem"));
    }

    #[test]
    fn test_partial_tls_material_is_rejected() {
        let config = parse(&["--dcert", "/certs/cert.pem"]);
        match config.validate() {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, "dcacert/dcert/dkey"),
            other => panic!("expected InvalidValue, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_url_is_rejected() {
        let config = parse(&["--dhost", "not a url"]);
        assert!(matches!(
            config.standard_endpoint(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let config = parse(&["--dusernshost", "ftp://docker:21"]);
        let err = config.namespaced_endpoint().unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_unix_socket_ignores_tls() {
        let config = parse(&["--dhost", "unix:///var/run/docker.sock"]);
        let endpoint = config.standard_endpoint().unwrap();
        assert_eq!(endpoint.url.path(), "/var/run/docker.sock");
        assert_eq!(endpoint.tls, None);
    }
}
