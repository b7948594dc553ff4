//! Image reference parsing and normalization.
//!
//! A reference has the form `[server/][namespace/]image[:tag][@digest]`.
//! Missing parts fall back to Docker Hub conventions: server
//! `index.docker.io`, namespace `library`, tag `latest`. Two references are
//! equivalent iff all fields compare equal after case-folding the server.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_NAMESPACE, DEFAULT_SERVER, DEFAULT_TAG, MAX_IMAGE_REF_LEN};
use crate::error::{Error, Result};

/// A fully qualified image reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageReference {
    pub server: String,
    pub namespace: String,
    pub image: String,
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parses a user-supplied reference string, filling in defaults.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::InvalidImageReference {
                reference: raw.to_string(),
                reason: "empty image reference".to_string(),
            });
        }
        if raw.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::InvalidImageReference {
                reference: raw.chars().take(50).collect::<String>() + "...",
                reason: format!("exceeds {} bytes", MAX_IMAGE_REF_LEN),
            });
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/:.-_@".contains(c))
        {
            return Err(Error::InvalidImageReference {
                reference: raw.to_string(),
                reason: "contains invalid characters".to_string(),
            });
        }

        let (name, digest) = match raw.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (raw, None),
        };

        // The tag separator is a ':' after the last '/', so that
        // "registry.example.com:5000/app" parses its port correctly.
        let (path, tag) = match name.rfind(':') {
            Some(idx) if idx > name.rfind('/').unwrap_or(0) => {
                (&name[..idx], name[idx + 1..].to_string())
            }
            _ => (name, DEFAULT_TAG.to_string()),
        };

        let parts: Vec<&str> = path.split('/').collect();
        let (server, namespace, image) = match parts.as_slice() {
            [image] => (DEFAULT_SERVER.to_string(), DEFAULT_NAMESPACE.to_string(), image.to_string()),
            [first, image] => {
                // A first component with a dot or port is a registry host,
                // otherwise it is a Docker Hub namespace.
                if first.contains('.') || first.contains(':') {
                    (first.to_string(), DEFAULT_NAMESPACE.to_string(), image.to_string())
                } else {
                    (DEFAULT_SERVER.to_string(), first.to_string(), image.to_string())
                }
            }
            [server, rest @ ..] if rest.len() >= 2 => (
                server.to_string(),
                rest[..rest.len() - 1].join("/"),
                rest[rest.len() - 1].to_string(),
            ),
            _ => {
                return Err(Error::InvalidImageReference {
                    reference: raw.to_string(),
                    reason: "malformed repository path".to_string(),
                });
            }
        };

        let reference = Self {
            server,
            namespace,
            image,
            tag,
            digest,
        };
        reference.validate_components()?;
        Ok(reference)
    }

    /// Rejects components that could traverse the repository layout.
    fn validate_components(&self) -> Result<()> {
        let flat = [self.server.as_str(), self.image.as_str(), self.tag.as_str()];
        for component in flat.into_iter().chain(self.namespace.split('/')) {
            if component.is_empty() || component.contains("..") {
                return Err(Error::InvalidImageReference {
                    reference: self.canonical(),
                    reason: format!("invalid path component '{}'", component),
                });
            }
        }
        if let Some(digest) = &self.digest
            && !digest.starts_with("sha256:")
        {
            return Err(Error::InvalidImageReference {
                reference: self.canonical(),
                reason: "digest must be sha256".to_string(),
            });
        }
        Ok(())
    }

    /// Canonical string form, `server/namespace/image:tag[@digest]`.
    pub fn canonical(&self) -> String {
        match &self.digest {
            Some(digest) => format!(
                "{}/{}/{}:{}@{}",
                self.server, self.namespace, self.image, self.tag, digest
            ),
            None => format!("{}/{}/{}:{}", self.server, self.namespace, self.image, self.tag),
        }
    }

    /// Reference string understood by the registry client.
    pub fn registry_form(&self) -> String {
        format!("{}/{}/{}:{}", self.server, self.namespace, self.image, self.tag)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

impl PartialEq for ImageReference {
    fn eq(&self, other: &Self) -> bool {
        self.server.eq_ignore_ascii_case(&other.server)
            && self.namespace == other.namespace
            && self.image == other.image
            && self.tag == other.tag
            && self.digest == other.digest
    }
}

impl Eq for ImageReference {}
