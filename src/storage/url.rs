//! Canonical reference forms for stores, images and datastore locations.
//!
//! ```text
//! <service>/storage/<store>           store
//! <service>/storage/<store>/<id>      image
//! ds://<datastore>/<path>             datastore-backed location
//! nfs://<host>/<path>?<opts>          NFS-backed volume store
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::Error;

/// Second path segment of every store and image URL.
pub const STORAGE_URL_PATH: &str = "storage";

pub const DATASTORE_SCHEME: &str = "ds";
pub const NFS_SCHEME: &str = "nfs";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("invalid uri path: {0}")]
    InvalidUriPath(String),
    #[error("not a storage path: {0}")]
    NotAStoragePath(String),
    #[error("invalid datastore url: {0}")]
    InvalidDatastoreUrl(String),
    #[error("invalid volume store {raw:?}: {reason}")]
    InvalidVolumeStore { raw: String, reason: &'static str },
}

impl From<UrlError> for Error {
    fn from(err: UrlError) -> Self {
        Error::InvalidArgument(err.to_string())
    }
}

/// Lexically clean a slash-separated path: collapse duplicate separators,
/// drop `.` and resolve `..` against the preceding element.
pub fn clean_path(path: &str) -> String {
    if path.is_empty() {
        return ".".to_owned();
    }
    let rooted = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();

    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if out.last().is_some_and(|s| *s != "..") {
                    out.pop();
                } else if !rooted {
                    out.push("..");
                }
            }
            s => out.push(s),
        }
    }

    let joined = out.join("/");
    match (rooted, joined.is_empty()) {
        (true, _) => format!("/{joined}"),
        (false, true) => ".".to_owned(),
        (false, false) => joined,
    }
}

fn storage_segments(u: &Url) -> Result<Vec<String>, UrlError> {
    let cleaned = clean_path(u.path());
    let segments: Vec<String> = cleaned.split('/').map(str::to_owned).collect();

    if segments.len() < 3 || segments[2].is_empty() {
        return Err(UrlError::InvalidUriPath(u.to_string()));
    }
    if segments[1] != STORAGE_URL_PATH {
        return Err(UrlError::NotAStoragePath(u.to_string()));
    }
    Ok(segments)
}

/// `<service>/storage/<name>`
pub fn store_url(service: &Url, name: &str) -> Result<Url, UrlError> {
    if name.is_empty() || name.contains('/') {
        return Err(UrlError::InvalidUriPath(name.to_owned()));
    }
    let mut u = service.clone();
    u.set_path(&format!("/{STORAGE_URL_PATH}/{name}"));
    u.set_query(None);
    Ok(u)
}

/// Name of the store a store or image URL refers to.
pub fn store_name(u: &Url) -> Result<String, UrlError> {
    storage_segments(u).map(|mut segments| segments.swap_remove(2))
}

/// `<service>/storage/<store>/<id>`
pub fn image_url(service: &Url, store: &str, id: &str) -> Result<Url, UrlError> {
    if id.is_empty() || id.contains('/') {
        return Err(UrlError::InvalidUriPath(id.to_owned()));
    }
    let mut u = store_url(service, store)?;
    u.set_path(&format!("/{STORAGE_URL_PATH}/{store}/{id}"));
    Ok(u)
}

/// Split an image URL into `(store, id)`.
pub fn image_ref(u: &Url) -> Result<(String, String), UrlError> {
    let segments = storage_segments(u)?;
    match segments.get(3) {
        Some(id) if !id.is_empty() => Ok((segments[2].clone(), id.clone())),
        _ => Err(UrlError::InvalidUriPath(u.to_string())),
    }
}

// ---------------------------------------------------------------------------
// Datastore locations
// ---------------------------------------------------------------------------

/// A location on a named datastore, `ds://<datastore>/<path>`.
///
/// `path` is always relative and cleaned; an empty path is the datastore
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatastoreUrl {
    pub datastore: String,
    pub path: String,
}

impl DatastoreUrl {
    pub fn new(datastore: impl Into<String>, path: &str) -> Self {
        let path = clean_path(path.trim_start_matches('/'));
        Self {
            datastore: datastore.into(),
            path: if path == "." { String::new() } else { path },
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let rest = raw
            .strip_prefix("ds://")
            .ok_or_else(|| UrlError::InvalidDatastoreUrl(raw.to_owned()))?;
        let (datastore, path) = rest.split_once('/').unwrap_or((rest, ""));
        if datastore.is_empty() {
            return Err(UrlError::InvalidDatastoreUrl(raw.to_owned()));
        }
        Ok(Self::new(datastore, path))
    }

    /// Append path elements.
    pub fn join(&self, rel: &str) -> Self {
        if self.path.is_empty() {
            Self::new(self.datastore.clone(), rel)
        } else {
            Self::new(self.datastore.clone(), &format!("{}/{}", self.path, rel))
        }
    }

    /// Last path element, or the empty string at the datastore root.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }

    /// The `[datastore] path` form used in VM config specs.
    pub fn bracketed(&self) -> String {
        format!("[{}] {}", self.datastore, self.path)
    }
}

impl fmt::Display for DatastoreUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ds://{}/{}", self.datastore, self.path)
    }
}

// ---------------------------------------------------------------------------
// Volume stores
// ---------------------------------------------------------------------------

/// A labelled volume store target as given on the install command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeStore {
    pub url: Url,
    pub label: String,
}

/// Parse `[scheme://]target/path[?opts]:label`. A missing scheme means `ds`.
pub fn parse_volume_store(raw: &str) -> Result<VolumeStore, UrlError> {
    let invalid = |reason| UrlError::InvalidVolumeStore {
        raw: raw.to_owned(),
        reason,
    };

    let (target, label) = raw.rsplit_once(':').ok_or_else(|| invalid("missing label"))?;
    if label.is_empty() || label.contains('/') {
        return Err(invalid("missing label"));
    }

    let target = if target.contains("://") {
        target.to_owned()
    } else {
        format!("{DATASTORE_SCHEME}://{target}")
    };

    let mut url = Url::parse(&target).map_err(|_| invalid("malformed url"))?;
    match url.scheme() {
        DATASTORE_SCHEME | NFS_SCHEME => {}
        _ => return Err(invalid("unsupported scheme")),
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host or datastore"));
    }

    let path = clean_path(url.path());
    url.set_path(if path == "." { "/" } else { &path });

    Ok(VolumeStore {
        url,
        label: label.to_owned(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
