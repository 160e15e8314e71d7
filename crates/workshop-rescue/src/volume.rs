// crates/workshop-rescue/src/volume.rs
// ============================================================================
// Module: Volume Clients
// Description: Transfers, removals, and existence checks against a volume.
// Purpose: Move snapshot files between local disk and durable storage.
// Dependencies: reqwest, tempfile, thiserror, url
// ============================================================================

//! ## Overview
//! [`VolumeClient`] is the seam between the rescue manager and storage.
//! [`FilesApiVolumeClient`] talks to a workspace Files API over HTTPS with a
//! bearer token; [`LocalVolumeClient`] maps `/Volumes/...` onto a local
//! directory (mounted volumes and tests).
//!
//! Every file that lands locally is streamed into a temporary file in the
//! destination directory, synced, and renamed into place, so a failed
//! transfer never leaves a half-written database behind.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::File;
use std::io;
use std::io::Read;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Body;
use reqwest::blocking::Client;
use reqwest::blocking::RequestBuilder;
use reqwest::blocking::Response;
use reqwest::redirect::Policy;
use tempfile::NamedTempFile;
use thiserror::Error;
use url::Url;

use crate::path::VolumePath;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default request timeout for snapshot transfers.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_secs(300);
/// Files API path prefix.
const FILES_API_SEGMENTS: [&str; 4] = ["api", "2.0", "fs", "files"];

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Volume transfer failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeError {
    /// Remote object does not exist.
    #[error("remote object not found: {0}")]
    NotFound(String),
    /// Credentials were rejected.
    #[error("volume authorization failed: {0}")]
    Auth(String),
    /// Network or protocol failure.
    #[error("volume transport error: {0}")]
    Transport(String),
    /// Local filesystem failure.
    #[error("volume io error: {0}")]
    Io(String),
    /// Invalid client configuration or request.
    #[error("invalid volume request: {0}")]
    Invalid(String),
}

impl VolumeError {
    /// Returns true for the normal "nothing stored yet" outcome.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// ============================================================================
// SECTION: Client Trait
// ============================================================================

/// Durable storage for snapshot files.
pub trait VolumeClient: Send + Sync {
    /// Downloads `remote` into `local`, returning the bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::NotFound`] when the object is absent.
    fn download(&self, remote: &VolumePath, local: &Path) -> Result<u64, VolumeError>;

    /// Uploads `local` to `remote`, overwriting, returning the bytes sent.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError`] when the file cannot be read or stored.
    fn upload(&self, local: &Path, remote: &VolumePath) -> Result<u64, VolumeError>;

    /// Returns true when `remote` exists.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError`] when existence cannot be determined.
    fn exists(&self, remote: &VolumePath) -> Result<bool, VolumeError>;

    /// Deletes `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::NotFound`] when the object is absent.
    fn remove(&self, remote: &VolumePath) -> Result<(), VolumeError>;
}

// ============================================================================
// SECTION: Files API Client
// ============================================================================

/// Files API client over HTTPS.
#[derive(Clone)]
pub struct FilesApiVolumeClient {
    /// HTTP client.
    client: Client,
    /// Workspace base URL.
    host: Url,
    /// Bearer token.
    token: String,
}

impl std::fmt::Debug for FilesApiVolumeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesApiVolumeClient")
            .field("host", &self.host.as_str())
            .field("token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl FilesApiVolumeClient {
    /// Builds a client for `host` using the default transfer timeout.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Invalid`] for a bad host or empty token.
    pub fn new(host: &str, token: impl Into<String>) -> Result<Self, VolumeError> {
        Self::with_timeout(host, token, DEFAULT_TRANSFER_TIMEOUT)
    }

    /// Builds a client with an explicit request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Invalid`] for a bad host or empty token, and
    /// [`VolumeError::Transport`] when the HTTP client cannot be built.
    pub fn with_timeout(
        host: &str,
        token: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, VolumeError> {
        let trimmed = host.trim();
        let candidate = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("https://{trimmed}")
        };
        let host = Url::parse(&candidate).map_err(|err| VolumeError::Invalid(err.to_string()))?;
        match host.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(VolumeError::Invalid(format!("unsupported volume scheme: {scheme}")));
            }
        }
        if host.cannot_be_a_base() || host.host().is_none() {
            return Err(VolumeError::Invalid(format!("volume host has no authority: {host}")));
        }
        let token = token.into();
        if token.trim().is_empty() {
            return Err(VolumeError::Invalid("volume token is empty".to_string()));
        }
        let client = Client::builder()
            .redirect(Policy::none())
            .timeout(timeout)
            .build()
            .map_err(|err| VolumeError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            host,
            token,
        })
    }

    /// Returns the Files API URL for `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`VolumeError::Invalid`] when the host cannot carry a path.
    pub fn endpoint(&self, remote: &VolumePath) -> Result<Url, VolumeError> {
        let mut url = self.host.clone();
        url.set_query(None);
        url.set_fragment(None);
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| VolumeError::Invalid(format!("volume host cannot be a base: {}", self.host)))?;
            segments.pop_if_empty();
            segments.extend(FILES_API_SEGMENTS);
            segments.extend(remote.segments());
        }
        Ok(url)
    }

    /// Attaches authorization to a request.
    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }
}

/// Maps a non-success response onto the error taxonomy.
fn check_status(response: Response, remote: &VolumePath) -> Result<Response, VolumeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(match status {
        StatusCode::NOT_FOUND => VolumeError::NotFound(remote.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            VolumeError::Auth(format!("http status {status} for {remote}"))
        }
        _ => VolumeError::Transport(format!("http status {status} for {remote}")),
    })
}

impl VolumeClient for FilesApiVolumeClient {
    fn download(&self, remote: &VolumePath, local: &Path) -> Result<u64, VolumeError> {
        let url = self.endpoint(remote)?;
        let response = self
            .authorized(self.client.get(url))
            .send()
            .map_err(|err| VolumeError::Transport(err.to_string()))?;
        let mut response = check_status(response, remote)?;
        write_atomically(local, &mut response)
    }

    fn upload(&self, local: &Path, remote: &VolumePath) -> Result<u64, VolumeError> {
        let mut url = self.endpoint(remote)?;
        url.query_pairs_mut().append_pair("overwrite", "true");
        let file = File::open(local).map_err(|err| VolumeError::Io(err.to_string()))?;
        let length = file.metadata().map_err(|err| VolumeError::Io(err.to_string()))?.len();
        let response = self
            .authorized(self.client.put(url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::sized(file, length))
            .send()
            .map_err(|err| VolumeError::Transport(err.to_string()))?;
        check_status(response, remote)?;
        Ok(length)
    }

    fn exists(&self, remote: &VolumePath) -> Result<bool, VolumeError> {
        let url = self.endpoint(remote)?;
        let response = self
            .authorized(self.client.head(url))
            .send()
            .map_err(|err| VolumeError::Transport(err.to_string()))?;
        match check_status(response, remote) {
            Ok(_) => Ok(true),
            Err(VolumeError::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn remove(&self, remote: &VolumePath) -> Result<(), VolumeError> {
        let url = self.endpoint(remote)?;
        let response = self
            .authorized(self.client.delete(url))
            .send()
            .map_err(|err| VolumeError::Transport(err.to_string()))?;
        check_status(response, remote).map(|_| ())
    }
}

// ============================================================================
// SECTION: Local Client
// ============================================================================

/// Volume rooted at a local directory.
///
/// `/Volumes/a/b/c/file` maps to `<root>/a/b/c/file`.
#[derive(Debug, Clone)]
pub struct LocalVolumeClient {
    /// Directory standing in for `/Volumes`.
    root: PathBuf,
}

impl LocalVolumeClient {
    /// Creates a client rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
        }
    }

    /// Returns the local location of `remote`.
    #[must_use]
    pub fn resolve(&self, remote: &VolumePath) -> PathBuf {
        remote.segments().skip(1).fold(self.root.clone(), |path, segment| path.join(segment))
    }
}

impl VolumeClient for LocalVolumeClient {
    fn download(&self, remote: &VolumePath, local: &Path) -> Result<u64, VolumeError> {
        let source = self.resolve(remote);
        let mut file = match File::open(&source) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(VolumeError::NotFound(remote.to_string()));
            }
            Err(err) => return Err(VolumeError::Io(err.to_string())),
        };
        write_atomically(local, &mut file)
    }

    fn upload(&self, local: &Path, remote: &VolumePath) -> Result<u64, VolumeError> {
        let mut file = File::open(local).map_err(|err| VolumeError::Io(err.to_string()))?;
        write_atomically(&self.resolve(remote), &mut file)
    }

    fn exists(&self, remote: &VolumePath) -> Result<bool, VolumeError> {
        Ok(self.resolve(remote).is_file())
    }

    fn remove(&self, remote: &VolumePath) -> Result<(), VolumeError> {
        match fs::remove_file(self.resolve(remote)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(VolumeError::NotFound(remote.to_string()))
            }
            Err(err) => Err(VolumeError::Io(err.to_string())),
        }
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Streams `reader` into `target` through a synced temporary sibling.
fn write_atomically(target: &Path, reader: &mut dyn Read) -> Result<u64, VolumeError> {
    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|err| VolumeError::Io(err.to_string()))?;
    let mut temp =
        NamedTempFile::new_in(parent).map_err(|err| VolumeError::Io(err.to_string()))?;
    let written = io::copy(reader, &mut temp).map_err(|err| VolumeError::Io(err.to_string()))?;
    temp.as_file().sync_all().map_err(|err| VolumeError::Io(err.to_string()))?;
    temp.persist(target).map_err(|err| VolumeError::Io(err.error.to_string()))?;
    Ok(written)
}

// ============================================================================
// SECTION: Tests
// ============================================================================
