//! Target platform of a VM instance

use serde::{Deserialize, Serialize};

pub const OS_LINUX: &str = "linux";
pub const OS_WINDOWS: &str = "windows";
pub const ARCH_AMD64: &str = "amd64";
pub const ARCH_ARM64: &str = "arm64";

/// OS and architecture requested for an instance.
///
/// Both fields may be left empty by the caller, in which case
/// [`Platform::with_defaults`] fills them in before the create flow runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Fill in default values for unset fields and reject unknown ones.
    ///
    /// Empty arch defaults to `amd64`, empty os to `linux`.
    pub fn with_defaults(mut self) -> crate::Result<Self> {
        if self.arch.is_empty() {
            self.arch = ARCH_AMD64.to_string();
        }
        if self.arch != ARCH_AMD64 && self.arch != ARCH_ARM64 {
            return Err(crate::Error::validation(format!(
                "invalid arch {}, has to be '{}/{}'",
                self.arch, ARCH_AMD64, ARCH_ARM64
            )));
        }
        if self.os.is_empty() {
            self.os = OS_LINUX.to_string();
        }
        if self.os != OS_LINUX && self.os != OS_WINDOWS {
            return Err(crate::Error::validation(format!(
                "invalid OS {}, has to be either '{}/{}'",
                self.os, OS_LINUX, OS_WINDOWS
            )));
        }
        Ok(self)
    }
}
