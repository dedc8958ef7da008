//! Resolved image facts
//!
//! An `ImageInfo` records, per platform, the default entrypoint and command
//! an image declares in its config. It is built once by the registry resolver
//! and then shared read-only through the image cache.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Normalized `os/arch` pair
///
/// Both halves are lowercased at construction so lookups never depend on the
/// casing a registry or the host happened to use.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Platform {
    os: String,
    arch: String,
}

impl Platform {
    pub fn new(os: impl AsRef<str>, arch: impl AsRef<str>) -> Self {
        Self {
            os: os.as_ref().trim().to_lowercase(),
            arch: arch.as_ref().trim().to_lowercase(),
        }
    }

    /// Platform of the running process, using OCI architecture names
    pub fn local() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            "x86" => "386",
            "powerpc64" => "ppc64le",
            other => other,
        };
        Self::new(std::env::consts::OS, arch)
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((os, arch)) if !os.trim().is_empty() && !arch.trim().is_empty() => {
                Ok(Platform::new(os, arch))
            }
            _ => Err(format!("platform must look like os/arch, got '{}'", s)),
        }
    }
}

/// Default process of an image: Docker `Entrypoint` and `Cmd`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageCommand {
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
}

/// Cached facts about one image reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Canonical reference the facts were resolved for
    pub reference: String,
    /// Digest of the top-level manifest (image or index)
    pub digest: String,
    commands: BTreeMap<Platform, ImageCommand>,
}

impl ImageInfo {
    pub fn new(reference: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            digest: digest.into(),
            commands: BTreeMap::new(),
        }
    }

    /// Records the default process for one platform
    pub fn add_command(&mut self, platform: Platform, command: ImageCommand) {
        self.commands.insert(platform, command);
    }

    pub fn command_for(&self, platform: &Platform) -> Option<&ImageCommand> {
        self.commands.get(platform)
    }

    pub fn platforms(&self) -> impl Iterator<Item = &Platform> {
        self.commands.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_is_normalized() {
        let a = Platform::new("Linux", "AMD64");
        let b: Platform = "linux/amd64".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "linux/amd64");
        assert!("linux".parse::<Platform>().is_err());
        assert!("/arm64".parse::<Platform>().is_err());
    }

    #[test]
    fn test_local_platform_uses_oci_names() {
        let local = Platform::local();
        assert_ne!(local.arch(), "x86_64");
        assert_ne!(local.arch(), "aarch64");
        assert_eq!(local.os(), std::env::consts::OS);
    }

    #[test]
    fn test_image_info_lookup_ignores_case() {
        let mut info = ImageInfo::new("docker.io/library/alpine:3.19", "sha256:abc");
        info.add_command(
            Platform::new("linux", "ARM64"),
            ImageCommand {
                entrypoint: vec![],
                cmd: vec!["/bin/sh".to_string()],
            },
        );

        let found = info.command_for(&Platform::new("LINUX", "arm64")).unwrap();
        assert_eq!(found.cmd, vec!["/bin/sh".to_string()]);
        assert!(info.command_for(&Platform::new("linux", "amd64")).is_none());
        assert_eq!(info.platforms().count(), 1);
    }
}
