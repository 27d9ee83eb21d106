//! Autostart collaborator interface.
//!
//! Registering the daemon with a platform service manager happens outside
//! the scheduler core. The core only asks what is available and requests an
//! install when the user explicitly runs `install`.

use serde::{Deserialize, Serialize};

/// Which registration mechanisms the platform offers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutostartCapability {
    pub primary_available: bool,
    pub fallback_available: bool,
}

impl AutostartCapability {
    pub fn any(&self) -> bool {
        self.primary_available || self.fallback_available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallMethod {
    Primary,
    Fallback,
}

impl std::fmt::Display for InstallMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstallMethod::Primary => f.write_str("primary"),
            InstallMethod::Fallback => f.write_str("fallback"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallOutcome {
    pub method_used: InstallMethod,
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("no autostart mechanism is available on this platform")]
    Unsupported,
    #[error("autostart install failed: {0}")]
    Failed(String),
}

/// Platform autostart registration.
pub trait Autostart: Send + Sync {
    fn query_capability(&self) -> AutostartCapability;

    /// Register the daemon, preferring the primary mechanism.
    fn install(&self) -> Result<InstallOutcome, InstallError>;
}

/// Used where no platform integration is compiled in.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedAutostart;

impl Autostart for UnsupportedAutostart {
    fn query_capability(&self) -> AutostartCapability {
        AutostartCapability::default()
    }

    fn install(&self) -> Result<InstallOutcome, InstallError> {
        Err(InstallError::Unsupported)
    }
}

/// Fixed-answer implementation for tests.
#[derive(Debug, Clone)]
pub struct StaticAutostart {
    pub capability: AutostartCapability,
    pub fail_with: Option<String>,
}

impl Autostart for StaticAutostart {
    fn query_capability(&self) -> AutostartCapability {
        self.capability
    }

    fn install(&self) -> Result<InstallOutcome, InstallError> {
        if let Some(reason) = &self.fail_with {
            return Err(InstallError::Failed(reason.clone()));
        }
        if self.capability.primary_available {
            Ok(InstallOutcome {
                method_used: InstallMethod::Primary,
            })
        } else if self.capability.fallback_available {
            Ok(InstallOutcome {
                method_used: InstallMethod::Fallback,
            })
        } else {
            Err(InstallError::Unsupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_reports_nothing_available() {
        let autostart = UnsupportedAutostart;
        assert!(!autostart.query_capability().any());
        assert!(matches!(autostart.install(), Err(InstallError::Unsupported)));
    }

    #[test]
    fn static_prefers_primary() {
        let autostart = StaticAutostart {
            capability: AutostartCapability {
                primary_available: true,
                fallback_available: true,
            },
            fail_with: None,
        };
        assert_eq!(autostart.install().unwrap().method_used, InstallMethod::Primary);
    }

    #[test]
    fn static_falls_back() {
        let autostart = StaticAutostart {
            capability: AutostartCapability {
                primary_available: false,
                fallback_available: true,
            },
            fail_with: None,
        };
        assert_eq!(autostart.install().unwrap().method_used, InstallMethod::Fallback);
    }
}
