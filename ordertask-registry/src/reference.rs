//! Image reference parsing
//!
//! Accepts the same short forms `docker pull` does (`alpine`,
//! `user/repo:tag`, `ghcr.io/org/app@sha256:...`) and normalizes them to a
//! canonical `registry/repository[:tag][@digest]` string, which is also the
//! image cache key.

use std::fmt;

use crate::error::{ResolveError, Result};

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";
const MAX_TAG_LEN: usize = 128;

/// Parsed and normalized image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses an image reference
    ///
    /// A missing tag defaults to `latest` unless a digest is given.
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ResolveError::malformed(input, "reference is empty"));
        }

        let (name_and_tag, digest) = match trimmed.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|reason| ResolveError::malformed(input, reason))?;
                (name, Some(digest.to_string()))
            }
            None => (trimmed, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port
        let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(pos) => {
                let split = last_slash + pos;
                (&name_and_tag[..split], Some(&name_and_tag[split + 1..]))
            }
            None => (name_and_tag, None),
        };

        if let Some(tag) = tag {
            validate_tag(tag).map_err(|reason| ResolveError::malformed(input, reason))?;
        }

        let (registry, repository) = split_registry(name);
        validate_registry(&registry).map_err(|reason| ResolveError::malformed(input, reason))?;
        validate_repository(&repository)
            .map_err(|reason| ResolveError::malformed(input, reason))?;

        let tag = match (tag, &digest) {
            (Some(tag), _) => Some(tag.to_string()),
            (None, Some(_)) => None,
            (None, None) => Some(DEFAULT_TAG.to_string()),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Canonical string form, used as the cache key
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Tag or digest to request from the manifests endpoint
    ///
    /// The digest wins when both are present.
    pub fn target(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Host serving the registry v2 API for this reference
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Splits `name` into registry and repository, applying Docker Hub defaults
fn split_registry(name: &str) -> (String, String) {
    let (registry, repository) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), name.to_string()),
    };

    let registry = if registry == "index.docker.io" {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry
    };

    // Docker Hub official images live under library/
    if registry == DEFAULT_REGISTRY && !repository.contains('/') {
        (registry, format!("library/{}", repository))
    } else {
        (registry, repository)
    }
}

fn validate_registry(registry: &str) -> std::result::Result<(), String> {
    let valid = !registry.is_empty()
        && registry
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'));
    if valid {
        Ok(())
    } else {
        Err(format!("invalid registry host '{}'", registry))
    }
}

fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("repository name is empty".to_string());
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err(format!("empty path component in '{}'", repository));
        }
        let chars_ok = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if !chars_ok {
            return Err(format!(
                "repository component '{}' must be lowercase alphanumerics and separators",
                component
            ));
        }
        let starts_ok = component.starts_with(|c: char| c.is_ascii_alphanumeric());
        let ends_ok = component.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok {
            return Err(format!(
                "repository component '{}' must start and end with an alphanumeric",
                component
            ));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return Err(format!("tag must be 1-{} characters", MAX_TAG_LEN));
    }
    let first_ok = tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_');
    let rest_ok = tag
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if first_ok && rest_ok {
        Ok(())
    } else {
        Err(format!("invalid tag '{}'", tag))
    }
}

fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    let Some((algorithm, hex)) = digest.split_once(':') else {
        return Err(format!("digest '{}' must look like algorithm:hex", digest));
    };
    let algorithm_ok = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '_' | '-'));
    let hex_ok = hex.len() >= 32 && hex.chars().all(|c| c.is_ascii_hexdigit());
    if algorithm_ok && hex_ok {
        Ok(())
    } else {
        Err(format!("invalid digest '{}'", digest))
    }
}
