//! Request parameter parsing and host port validation.

use std::fmt;
use std::ops::RangeInclusive;

use crate::error::{PortError, RequestError};
use crate::profiles::{DEFAULT_PROFILE, ProfileRegistry};

/// Host ports the infrastructure firewall leaves open.
pub const PORT_RANGE: RangeInclusive<u16> = 36100..=36110;

/// A validated TCP port inside [`PORT_RANGE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HostPort(u16);

impl HostPort {
    pub fn number(self) -> u16 {
        self.0
    }
}

impl fmt::Display for HostPort {
    /// Engine port key, e.g. `36105/tcp`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/tcp", self.0)
    }
}

/// Validate a requested host port.
///
/// An empty string means no port is exposed. Anything else must be an
/// unsigned decimal number inside [`PORT_RANGE`]; values outside it are
/// rejected, never clamped.
pub fn validate_port(value: &str) -> Result<Option<HostPort>, PortError> {
    if value.is_empty() {
        return Ok(None);
    }

    let malformed = || PortError::Malformed {
        value: value.to_string(),
    };
    if !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let number: u64 = value.parse().map_err(|_| malformed())?;

    match u16::try_from(number) {
        Ok(port) if PORT_RANGE.contains(&port) => Ok(Some(HostPort(port))),
        _ => Err(PortError::OutOfRange {
            port: number,
            min: *PORT_RANGE.start(),
            max: *PORT_RANGE.end(),
        }),
    }
}

/// Raw query parameters of a `/profiles` request. The first occurrence of a
/// repeated key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileQuery {
    pub port: Option<String>,
    pub image: Option<String>,
    pub profile: Option<String>,
    pub userns: Option<String>,
    pub selinux: Option<String>,
    pub apparmor: Option<String>,
}

impl ProfileQuery {
    /// Parse a URL query string (without the leading `?`).
    pub fn from_query_string(query: &str) -> Self {
        let mut parsed = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "port" => &mut parsed.port,
                "image" => &mut parsed.image,
                "profile" => &mut parsed.profile,
                "userns" => &mut parsed.userns,
                "selinux" => &mut parsed.selinux,
                "apparmor" => &mut parsed.apparmor,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        parsed
    }
}

/// A validated session request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Requested image; `None` selects the default image.
    pub image: Option<String>,
    pub port: Option<HostPort>,
    /// Canonical profile name.
    pub profile: String,
    /// Use the user-namespaced engine.
    pub userns: bool,
    /// Shown to the client only; does not alter engine configuration.
    pub selinux: bool,
    /// Shown to the client only; does not alter engine configuration.
    pub apparmor: bool,
}

impl SessionRequest {
    /// Validate raw parameters against the registry. Nothing here talks to the
    /// engine.
    pub fn parse(query: &ProfileQuery, registry: &ProfileRegistry) -> Result<Self, RequestError> {
        let profile = registry
            .canonical_name(query.profile.as_deref().unwrap_or(DEFAULT_PROFILE))?
            .to_string();
        let port = validate_port(query.port.as_deref().unwrap_or_default())?;

        Ok(Self {
            image: query.image.clone().filter(|image| !image.is_empty()),
            port,
            profile,
            userns: query.userns.as_deref() == Some("enabled"),
            selinux: query.selinux.as_deref() != Some("disabled"),
            apparmor: query.apparmor.as_deref() != Some("disabled"),
        })
    }
}
