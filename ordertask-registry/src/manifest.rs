//! Registry v2 document types
//!
//! Only the fields needed to find an image's default process are modeled:
//! the manifest (single image or multi-platform index), its descriptors and
//! the `config` blob's `Entrypoint`/`Cmd`.

use ordertask_core::domain::image::{ImageCommand, Platform};
use serde::Deserialize;
use std::collections::BTreeSet;

use crate::error::RegistryError;

pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Accept header sent on every manifest request
pub const MANIFEST_ACCEPT_HEADER: &str = "application/vnd.oci.image.index.v1+json, \
application/vnd.docker.distribution.manifest.list.v2+json, \
application/vnd.oci.image.manifest.v1+json, \
application/vnd.docker.distribution.manifest.v2+json";

/// Platform value registries use for attestation manifests inside an index
const UNKNOWN: &str = "unknown";

/// What a manifest media type describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// A single-platform image manifest with a config blob
    Image,
    /// A list of per-platform manifests
    Index,
}

impl ManifestKind {
    /// Classifies a media type, ignoring parameters such as `; charset=utf-8`
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let essence = media_type.split(';').next().unwrap_or_default().trim();
        match essence {
            MEDIA_TYPE_DOCKER_MANIFEST | MEDIA_TYPE_OCI_MANIFEST => Some(Self::Image),
            MEDIA_TYPE_DOCKER_MANIFEST_LIST | MEDIA_TYPE_OCI_INDEX => Some(Self::Index),
            _ => None,
        }
    }
}

/// Manifest document, either an image manifest or an index
///
/// The two shapes are distinguished by `config` vs `manifests` when the
/// registry leaves `mediaType` out of the body.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Manifest {
    pub fn parse(body: &[u8]) -> Result<Self, RegistryError> {
        serde_json::from_slice(body)
            .map_err(|e| RegistryError::InvalidManifest(format!("manifest is not valid JSON: {}", e)))
    }

    /// Resolves the manifest kind from the response header, the body, or its shape
    pub fn kind(&self, header_media_type: Option<&str>) -> Result<ManifestKind, RegistryError> {
        let declared = header_media_type
            .filter(|m| !m.trim().is_empty())
            .or(self.media_type.as_deref());

        match declared {
            Some(media_type) => ManifestKind::from_media_type(media_type)
                .ok_or_else(|| RegistryError::UnsupportedMediaType(media_type.to_string())),
            None if self.config.is_some() => Ok(ManifestKind::Image),
            None if !self.manifests.is_empty() => Ok(ManifestKind::Index),
            None => Err(RegistryError::InvalidManifest(
                "manifest has neither mediaType, config nor manifests".to_string(),
            )),
        }
    }

    /// Index entries that name a real platform, skipping attestation manifests
    ///
    /// Variants of one architecture (`linux/arm/v6`, `linux/arm/v7`) share an
    /// `os/arch` key; only the first listed entry is returned for it.
    pub fn platform_entries(&self) -> impl Iterator<Item = (&Descriptor, Platform)> {
        let mut seen = BTreeSet::new();
        self.manifests.iter().filter_map(move |descriptor| {
            let platform = descriptor.platform.as_ref()?;
            if platform.os == UNKNOWN || platform.architecture == UNKNOWN {
                return None;
            }
            let platform = platform.to_platform();
            seen.insert(platform.clone()).then_some((descriptor, platform))
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub platform: Option<DescriptorPlatform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DescriptorPlatform {
    pub os: String,
    pub architecture: String,
    #[serde(default)]
    pub variant: Option<String>,
}

impl DescriptorPlatform {
    pub fn to_platform(&self) -> Platform {
        Platform::new(&self.os, &self.architecture)
    }
}

/// Image config blob; only the runtime defaults are read
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigFile {
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub config: Option<ContainerConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

impl ImageConfigFile {
    pub fn parse(body: &[u8]) -> Result<Self, RegistryError> {
        serde_json::from_slice(body)
            .map_err(|e| RegistryError::InvalidManifest(format!("image config is not valid JSON: {}", e)))
    }

    /// Platform declared by the config, if both halves are present
    pub fn platform(&self) -> Option<Platform> {
        match (&self.os, &self.architecture) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => {
                Some(Platform::new(os, arch))
            }
            _ => None,
        }
    }

    pub fn command(&self) -> ImageCommand {
        let config = self.config.clone().unwrap_or_default();
        ImageCommand {
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
        }
    }
}

/// Parsed `WWW-Authenticate` bearer challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parses a `Bearer realm="...",service="...",scope="..."` challenge
///
/// Values are quote-aware, so scopes containing commas
/// (`repository:foo:pull,push`) survive intact. Returns `None` for other
/// schemes or when no realm is given.
pub fn parse_challenge(header: &str) -> Option<BearerChallenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;

    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after_eq)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_ascii_lowercase();

        let (value, remaining) = if let Some(quoted) = after_eq.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match after_eq.find(',') {
                Some(end) => (&after_eq[..end], &after_eq[end..]),
                None => (after_eq, ""),
            }
        };

        match key.as_str() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }

        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_type_classification() {
        assert_eq!(
            ManifestKind::from_media_type(MEDIA_TYPE_OCI_INDEX),
            Some(ManifestKind::Index)
        );
        assert_eq!(
            ManifestKind::from_media_type(MEDIA_TYPE_DOCKER_MANIFEST_LIST),
            Some(ManifestKind::Index)
        );
        assert_eq!(
            ManifestKind::from_media_type(&format!("{}; charset=utf-8", MEDIA_TYPE_OCI_MANIFEST)),
            Some(ManifestKind::Image)
        );
        assert_eq!(
            ManifestKind::from_media_type("application/vnd.docker.distribution.manifest.v1+prettyjws"),
            None
        );
    }

    #[test]
    fn test_index_keeps_first_variant_per_platform() {
        let body = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"digest": "sha256:v6", "platform": {"os": "linux", "architecture": "arm", "variant": "v6"}},
                {"digest": "sha256:v7", "platform": {"os": "linux", "architecture": "arm", "variant": "v7"}},
                {"digest": "sha256:x86", "platform": {"os": "linux", "architecture": "amd64"}}
            ]
        }"#;
        let manifest = Manifest::parse(body).unwrap();

        let entries: Vec<_> = manifest
            .platform_entries()
            .map(|(d, p)| (d.digest.clone(), p.to_string()))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("sha256:v6".to_string(), "linux/arm".to_string()),
                ("sha256:x86".to_string(), "linux/amd64".to_string()),
            ]
        );
    }

    #[test]
    fn test_index_skips_attestation_entries() {
        let body = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.index.v1+json",
            "manifests": [
                {"digest": "sha256:aaa", "platform": {"os": "linux", "architecture": "amd64"}},
                {"digest": "sha256:bbb", "platform": {"os": "linux", "architecture": "arm64", "variant": "v8"}},
                {"digest": "sha256:ccc", "platform": {"os": "unknown", "architecture": "unknown"}}
            ]
        }"#;
        let manifest = Manifest::parse(body).unwrap();
        assert_eq!(manifest.kind(None).unwrap(), ManifestKind::Index);

        let entries: Vec<_> = manifest
            .platform_entries()
            .map(|(d, p)| (d.digest.clone(), p.to_string()))
            .collect();
        assert_eq!(
            entries,
            vec![
                ("sha256:aaa".to_string(), "linux/amd64".to_string()),
                ("sha256:bbb".to_string(), "linux/arm64".to_string()),
            ]
        );
    }

    #[test]
    fn test_kind_inferred_from_shape() {
        let body = br#"{"schemaVersion": 2, "config": {"digest": "sha256:cfg", "size": 10}, "layers": []}"#;
        let manifest = Manifest::parse(body).unwrap();
        assert_eq!(manifest.kind(None).unwrap(), ManifestKind::Image);

        let err = Manifest::parse(br#"{"schemaVersion": 2}"#)
            .unwrap()
            .kind(None)
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidManifest(_)));
    }

    #[test]
    fn test_header_media_type_wins() {
        let body = br#"{"config": {"digest": "sha256:cfg"}}"#;
        let manifest = Manifest::parse(body).unwrap();
        let err = manifest.kind(Some("text/html")).unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedMediaType(m) if m == "text/html"));
    }

    #[test]
    fn test_config_file_command() {
        let body = br#"{
            "architecture": "amd64",
            "os": "linux",
            "config": {"Entrypoint": ["/docker-entrypoint.sh"], "Cmd": ["nginx", "-g", "daemon off;"]}
        }"#;
        let config = ImageConfigFile::parse(body).unwrap();
        assert_eq!(config.platform(), Some(Platform::new("linux", "amd64")));
        let command = config.command();
        assert_eq!(command.entrypoint, vec!["/docker-entrypoint.sh"]);
        assert_eq!(command.cmd, vec!["nginx", "-g", "daemon off;"]);

        let bare = ImageConfigFile::parse(br#"{"config": {"Cmd": null}}"#).unwrap();
        assert_eq!(bare.command(), ImageCommand::default());
    }

    #[test]
    fn test_parse_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull""#;
        let challenge = parse_challenge(header).unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/alpine:pull")
        );
    }

    #[test]
    fn test_parse_challenge_keeps_commas_inside_quotes() {
        let header = r#"Bearer realm="https://ghcr.io/token", scope="repository:org/app:pull,push""#;
        let challenge = parse_challenge(header).unwrap();
        assert_eq!(challenge.service, None);
        assert_eq!(challenge.scope.as_deref(), Some("repository:org/app:pull,push"));
    }

    #[test]
    fn test_parse_challenge_rejects_other_schemes() {
        assert!(parse_challenge(r#"Basic realm="registry""#).is_none());
        assert!(parse_challenge(r#"Bearer service="x""#).is_none());
    }
}
