//! Source location patterns.
//!
//! `s3://bucket/transactions/**/*.parquet` splits into the bucket, a literal
//! listing prefix (`transactions`) and a glob matched against every listed
//! object key. Local paths use the literal directory as the store root and
//! match keys relative to it.

use std::fmt;
use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use object_store::path::Path as ObjectPath;
use url::Url;

use crate::error::{Error, Result};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    S3,
    Gcs,
    Azure,
    File,
    Memory,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::S3 => "s3",
            Scheme::Gcs => "gs",
            Scheme::Azure => "az",
            Scheme::File => "file",
            Scheme::Memory => "memory",
        }
    }

    pub fn is_remote(self) -> bool {
        matches!(self, Scheme::S3 | Scheme::Gcs | Scheme::Azure)
    }
}

#[derive(Debug, Clone)]
pub struct Location {
    raw: String,
    scheme: Scheme,
    /// Bucket or container; for `File` the absolute root directory.
    bucket: String,
    /// Literal key prefix used to narrow listing. Empty lists everything.
    prefix: String,
    pattern: Pattern,
}

fn invalid(raw: &str, reason: impl Into<String>) -> Error {
    Error::Location {
        location: raw.to_string(),
        reason: reason.into(),
    }
}

fn has_glob(segment: &str) -> bool {
    segment.contains(['*', '?', '['])
}

/// Split a key path into (literal prefix, glob over the full key).
fn split_key_pattern(key_path: &str) -> (String, String) {
    let segments: Vec<&str> = key_path.split('/').filter(|s| !s.is_empty()).collect();
    match segments.iter().position(|s| has_glob(s)) {
        Some(first_glob) => (segments[..first_glob].join("/"), segments.join("/")),
        None if segments.last().is_some_and(|s| s.ends_with(".parquet")) => {
            let parent = segments[..segments.len() - 1].join("/");
            (parent, segments.join("/"))
        }
        None if segments.is_empty() => (String::new(), "**/*.parquet".to_string()),
        None => {
            let dir = segments.join("/");
            let pattern = format!("{dir}/**/*.parquet");
            (dir, pattern)
        }
    }
}

impl Location {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid(raw, "location is empty"));
        }

        let (scheme, rest) = match trimmed.split_once("://") {
            Some((scheme, rest)) => {
                let scheme = match scheme.to_ascii_lowercase().as_str() {
                    "s3" | "s3a" => Scheme::S3,
                    "gs" | "gcs" => Scheme::Gcs,
                    "az" | "azure" | "abfs" => Scheme::Azure,
                    "file" => Scheme::File,
                    "memory" => Scheme::Memory,
                    other => return Err(invalid(raw, format!("unsupported scheme '{other}'"))),
                };
                (scheme, rest)
            }
            None => (Scheme::File, trimmed),
        };

        match scheme {
            Scheme::File => Self::parse_local(raw, trimmed, scheme, rest),
            Scheme::Memory => Self::build(raw, scheme, String::new(), rest),
            _ => {
                let (bucket, key_path) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(invalid(raw, "missing bucket or container"));
                }
                if has_glob(bucket) {
                    return Err(invalid(raw, "bucket names cannot contain wildcards"));
                }
                Self::build(raw, scheme, bucket.to_string(), key_path)
            }
        }
    }

    fn parse_local(raw: &str, trimmed: &str, scheme: Scheme, rest: &str) -> Result<Self> {
        let path: PathBuf = if trimmed.contains("://") {
            let url = Url::parse(trimmed).map_err(|e| invalid(raw, e.to_string()))?;
            url.to_file_path()
                .map_err(|_| invalid(raw, "not an absolute file:// path"))?
        } else {
            PathBuf::from(rest)
        };
        let path = if path.is_absolute() {
            path
        } else {
            std::env::current_dir()?.join(path)
        };
        let text = path
            .to_str()
            .ok_or_else(|| invalid(raw, "path is not valid UTF-8"))?
            .replace('\\', "/");

        // Keys are relative to the literal directory part of the path.
        let (dir, pattern) = split_key_pattern(&text);
        let relative = pattern
            .strip_prefix(dir.as_str())
            .unwrap_or(&pattern)
            .trim_start_matches('/')
            .to_string();
        let root = format!("/{dir}");
        let mut loc = Self::build(raw, scheme, root, &relative)?;
        loc.prefix.clear();
        Ok(loc)
    }

    fn build(raw: &str, scheme: Scheme, bucket: String, key_path: &str) -> Result<Self> {
        let (prefix, pattern) = split_key_pattern(key_path);
        let pattern = Pattern::new(&pattern).map_err(|e| invalid(raw, e.to_string()))?;
        Ok(Self {
            raw: raw.trim().to_string(),
            scheme,
            bucket,
            prefix,
            pattern,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn root_dir(&self) -> Option<&Path> {
        (self.scheme == Scheme::File).then(|| Path::new(&self.bucket))
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// Prefix to hand to `ObjectStore::list`, if any.
    pub fn list_prefix(&self) -> Option<ObjectPath> {
        (!self.prefix.is_empty()).then(|| ObjectPath::from(self.prefix.as_str()))
    }

    /// Whether a listed object key belongs to the dataset.
    pub fn matches(&self, key: &str) -> bool {
        self.pattern.matches_with(key, MATCH_OPTIONS)
    }

    /// Full URI of a key, for logs and error messages.
    pub fn uri_for(&self, key: &str) -> String {
        match self.scheme {
            Scheme::File => format!("{}/{}", self.bucket.trim_end_matches('/'), key),
            Scheme::Memory => format!("memory://{key}"),
            scheme => format!("{}://{}/{}", scheme.as_str(), self.bucket, key),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
