//! Seccomp policy documents handed to the engine.
//!
//! The documents themselves live next to this file as JSON and are embedded at
//! compile time. They are parsed once when the registry is built so that a
//! malformed table fails the process at startup, never a session.

use serde::Deserialize;

use crate::error::ProfileError;

/// Allow-list shared by every profile.
pub(crate) const DEFAULT_POLICY: &str = include_str!("seccomp/default.json");

/// The default allow-list plus an unconditional `unshare`.
pub(crate) const WEAK_POLICY: &str = include_str!("seccomp/weak.json");

const ACT_ALLOW: &str = "SCMP_ACT_ALLOW";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyDocument {
    default_action: String,
    #[serde(default)]
    syscalls: Vec<SyscallRule>,
}

#[derive(Debug, Deserialize)]
struct SyscallRule {
    names: Vec<String>,
    action: String,
    #[serde(default)]
    includes: serde_json::Map<String, serde_json::Value>,
}

impl SyscallRule {
    fn is_unconditional_allow(&self) -> bool {
        self.action == ACT_ALLOW && self.includes.is_empty()
    }
}

/// A validated, compacted seccomp policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeccompPolicy {
    compact: String,
    default_action: String,
    always_allowed: Vec<String>,
}

impl SeccompPolicy {
    /// Parse and compact a policy document.
    pub fn from_json(profile: &str, raw: &str) -> Result<Self, ProfileError> {
        let invalid = |reason: String| ProfileError::InvalidPolicy {
            name: profile.to_string(),
            reason,
        };

        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|e| invalid(e.to_string()))?;
        let compact = serde_json::to_string(&value).map_err(|e| invalid(e.to_string()))?;
        let document: PolicyDocument =
            serde_json::from_value(value).map_err(|e| invalid(e.to_string()))?;

        let mut always_allowed: Vec<String> = document
            .syscalls
            .iter()
            .filter(|rule| rule.is_unconditional_allow())
            .flat_map(|rule| rule.names.iter().cloned())
            .collect();
        always_allowed.sort();
        always_allowed.dedup();

        Ok(Self {
            compact,
            default_action: document.default_action,
            always_allowed,
        })
    }

    /// The single-line JSON the engine receives.
    pub fn as_str(&self) -> &str {
        &self.compact
    }

    pub fn default_action(&self) -> &str {
        &self.default_action
    }

    /// Whether `syscall` is allowed without any capability or architecture
    /// condition.
    pub fn allows(&self, syscall: &str) -> bool {
        self.always_allowed
            .binary_search_by(|name| name.as_str().cmp(syscall))
            .is_ok()
    }

    /// Security options for the engine host config.
    pub fn security_opt(&self) -> Vec<String> {
        vec![
            "no-new-privileges".to_string(),
            format!("seccomp={}", self.compact),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_policies_parse() {
        let default = SeccompPolicy::from_json("default-docker", DEFAULT_POLICY).unwrap();
        let weak = SeccompPolicy::from_json("weak-docker", WEAK_POLICY).unwrap();
        assert_eq!(default.default_action(), "SCMP_ACT_ERRNO");
        assert_eq!(weak.default_action(), "SCMP_ACT_ERRNO");
    }

    #[test]
    fn test_only_weak_allows_unshare() {
        let default = SeccompPolicy::from_json("default-docker", DEFAULT_POLICY).unwrap();
        let weak = SeccompPolicy::from_json("weak-docker", WEAK_POLICY).unwrap();
        assert!(!default.allows("unshare"));
        assert!(weak.allows("unshare"));
        for syscall in ["read", "write", "execve", "exit_group"] {
            assert!(default.allows(syscall), "{syscall} should be allowed");
            assert!(weak.allows(syscall), "{syscall} should be allowed");
        }
    }

    #[test]
    fn test_capability_gated_syscalls_are_not_unconditional() {
        let weak = SeccompPolicy::from_json("weak-docker", WEAK_POLICY).unwrap();
        // Only allowed under CAP_SYS_MODULE.
        assert!(!weak.allows("init_module"));
        assert!(!weak.allows("reboot"));
    }

    #[test]
    fn test_compact_form_is_single_line_json() {
        let policy = SeccompPolicy::from_json("default-docker", DEFAULT_POLICY).unwrap();
        assert!(!policy.as_str().contains('\n'));
        let reparsed: serde_json::Value = serde_json::from_str(policy.as_str()).unwrap();
        assert_eq!(reparsed["defaultAction"], "SCMP_ACT_ERRNO");
    }

    #[test]
    fn test_security_opt_carries_no_new_privileges() {
        let policy = SeccompPolicy::from_json("default-docker", DEFAULT_POLICY).unwrap();
        let opts = policy.security_opt();
        assert_eq!(opts[0], "no-new-privileges");
        assert!(opts[1].starts_with("seccomp={"));
    }

    #[test]
    fn test_malformed_document_is_rejected() {
        let err = SeccompPolicy::from_json("broken", "{not json").unwrap_err();
        assert!(matches!(err, ProfileError::InvalidPolicy { ref name, .. } if name == "broken"));
        assert!(err.is_fatal());

        let err = SeccompPolicy::from_json("shapeless", r#"{"syscalls": []}"#).unwrap_err();
        assert!(matches!(err, ProfileError::InvalidPolicy { .. }));
    }
}
