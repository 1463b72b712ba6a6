//! Docker style image references.
use std::fmt::Display;

use once_cell::sync::Lazy;
use regex::Regex;

use super::ImageError;

pub const DEFAULT_REGISTRY: &str = "docker.io";
pub const DEFAULT_TAG: &str = "latest";
const OFFICIAL_REPOSITORY_PREFIX: &str = "library";

static REPOSITORY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*",
        r"(?:/[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*)*$"
    ))
    .expect("repository pattern is a valid regex")
});
static TAG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w][\w.-]{0,127}$").expect("tag pattern is a valid regex"));
static DIGEST_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-fA-F0-9]{32,}$")
        .expect("digest pattern is a valid regex")
});

/// A fully qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    /// Parses and normalizes a reference, filling in the default registry,
    /// the `library/` prefix for official images and the `latest` tag.
    pub fn parse(input: &str) -> Result<Self, ImageError> {
        let invalid = || ImageError::InvalidReference(input.to_owned());
        if input.is_empty() {
            return Err(invalid());
        }

        let (remainder, digest) = match input.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST_REGEX.is_match(digest) {
                    return Err(invalid());
                }
                (name, Some(digest.to_owned()))
            }
            None => (input, None),
        };

        // A colon after the last slash separates the tag; an earlier one
        // belongs to a registry port.
        let last_slash = remainder.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(remainder[split + 1..].to_owned()))
            }
            None => (remainder, None),
        };
        if let Some(tag) = &tag {
            if !TAG_REGEX.is_match(tag) {
                return Err(invalid());
            }
        }

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_owned(), rest.to_owned())
            }
            _ => (DEFAULT_REGISTRY.to_owned(), name.to_owned()),
        };
        let repository = if registry == DEFAULT_REGISTRY && !repository.contains('/') {
            format!("{OFFICIAL_REPOSITORY_PREFIX}/{repository}")
        } else {
            repository
        };
        if !REPOSITORY_REGEX.is_match(&repository) {
            return Err(invalid());
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_owned()),
            _ => tag,
        };
        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The shortest form a user would type, e.g. `alpine:latest`.
    pub fn familiar_name(&self) -> String {
        let repo = match self.registry.as_str() {
            DEFAULT_REGISTRY => self
                .repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_owned(),
            registry => format!("{registry}/{}", self.repository),
        };
        let mut out = repo;
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Last path segment of the repository, e.g. `alpine`.
    pub fn basename(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Name given to a container created from `reference` when the user did
/// not pick one: the image basename and the first five ID characters.
pub fn default_container_name(reference: &str, id: &str) -> String {
    let base = Reference::parse(reference)
        .map(|r| r.basename().to_owned())
        .unwrap_or_else(|_| "container".to_owned());
    let suffix = &id[..id.len().min(5)];
    format!("{base}-{suffix}")
}
