//! Named security profiles.
//!
//! A profile is a fixed bundle of capability, seccomp, mount and user settings
//! applied to a session's container. The set of profiles is closed and built
//! once at startup; requests only ever look profiles up by name.
//!
//! | Profile | Capabilities added | Host mounts | User | Seccomp |
//! |---------|--------------------|-------------|------|---------|
//! | `default-docker` (`default`) | none | none | `nobody` | default allow-list |
//! | `weak-docker` (`weak`) | `NET_ADMIN`, `SYS_PTRACE`, `SYS_CHROOT` | `/var/tmp/shared` (rw) | `root` | default allow-list + `unshare` |
//!
//! Looking up a name that is not registered is a validation error. It never
//! falls back to the default profile.

mod seccomp;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use seccomp::SeccompPolicy;

use crate::error::ProfileError;

/// Canonical name of the least-privilege profile.
pub const DEFAULT_PROFILE: &str = "default-docker";

/// Canonical name of the deliberately weakened profile.
pub const WEAK_PROFILE: &str = "weak-docker";

/// Host directory shared read-write into weak containers.
pub const SHARED_HOST_DIR: &str = "/var/tmp/shared";

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// An immutable security profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityProfile {
    name: String,
    cap_add: Vec<String>,
    seccomp: SeccompPolicy,
    mounts: Vec<BindMount>,
    user: String,
}

impl SecurityProfile {
    pub fn new(
        name: impl Into<String>,
        seccomp: SeccompPolicy,
        cap_add: Vec<String>,
        mounts: Vec<BindMount>,
        user: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cap_add,
            seccomp,
            mounts,
            user: user.into(),
        }
    }

    /// Least privilege: no extra capabilities, no host mounts, unprivileged user.
    pub fn least_privilege() -> Result<Self, ProfileError> {
        Ok(Self::new(
            DEFAULT_PROFILE,
            SeccompPolicy::from_json(DEFAULT_PROFILE, seccomp::DEFAULT_POLICY)?,
            Vec::new(),
            Vec::new(),
            "nobody",
        ))
    }

    /// The weakened profile used for the escape challenge.
    pub fn weak() -> Result<Self, ProfileError> {
        Ok(Self::new(
            WEAK_PROFILE,
            SeccompPolicy::from_json(WEAK_PROFILE, seccomp::WEAK_POLICY)?,
            vec![
                "NET_ADMIN".to_string(),
                "SYS_PTRACE".to_string(),
                "SYS_CHROOT".to_string(),
            ],
            vec![BindMount {
                source: SHARED_HOST_DIR.to_string(),
                target: SHARED_HOST_DIR.to_string(),
                read_only: false,
            }],
            "root",
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cap_add(&self) -> &[String] {
        &self.cap_add
    }

    pub fn seccomp(&self) -> &SeccompPolicy {
        &self.seccomp
    }

    pub fn mounts(&self) -> &[BindMount] {
        &self.mounts
    }

    /// User the container process runs as.
    pub fn user(&self) -> &str {
        &self.user
    }
}

/// The closed set of profiles a request may name.
///
/// Membership (which names a request may use) and definitions (the policy
/// behind a name) are tracked separately, so a name that is accepted but has
/// no definition surfaces as [`ProfileError::MissingPolicy`] at resolution
/// time instead of silently picking something else.
#[derive(Debug, Default, Clone)]
pub struct ProfileRegistry {
    /// Accepted name (canonical or alias) -> canonical name.
    names: BTreeMap<String, String>,
    /// Canonical name -> definition.
    profiles: HashMap<String, Arc<SecurityProfile>>,
}

impl ProfileRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in `default-docker` and `weak-docker` profiles, with their
    /// short aliases.
    pub fn builtin() -> Result<Self, ProfileError> {
        Ok(Self::new()
            .with_profile(SecurityProfile::least_privilege()?, &["default"])
            .with_profile(SecurityProfile::weak()?, &["weak"]))
    }

    /// Register a profile under its own name and the given aliases.
    pub fn with_profile(mut self, profile: SecurityProfile, aliases: &[&str]) -> Self {
        let canonical = profile.name().to_string();
        self = self.allow(&canonical, aliases);
        self.profiles.insert(canonical, Arc::new(profile));
        self
    }

    /// Accept a name (and aliases) without attaching a definition.
    pub fn allow(mut self, canonical: &str, aliases: &[&str]) -> Self {
        self.names
            .insert(canonical.to_string(), canonical.to_string());
        for alias in aliases {
            self.names
                .insert((*alias).to_string(), canonical.to_string());
        }
        self
    }

    /// Canonical name for an accepted name.
    pub fn canonical_name(&self, name: &str) -> Result<&str, ProfileError> {
        self.names
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| ProfileError::Unknown {
                name: name.to_string(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains_key(name)
    }

    /// Look a profile up by canonical name or alias.
    pub fn resolve(&self, name: &str) -> Result<Arc<SecurityProfile>, ProfileError> {
        let canonical = self.canonical_name(name)?;
        self.profiles
            .get(canonical)
            .cloned()
            .ok_or_else(|| ProfileError::MissingPolicy {
                name: canonical.to_string(),
            })
    }

    /// Every accepted name, aliases included.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.keys().map(String::as_str)
    }

    /// Check that every accepted name resolves. Run once at startup.
    pub fn verify(&self) -> Result<(), ProfileError> {
        for name in self.names() {
            self.resolve(name)?;
        }
        Ok(())
    }
}
