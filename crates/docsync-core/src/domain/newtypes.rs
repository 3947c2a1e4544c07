//! Domain newtypes with validation
//!
//! Identifiers, change tokens, checksums and the two path flavours (local
//! absolute paths and repository paths). Invalid values are rejected at
//! construction, so the rest of the engine never re-validates them.

use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::DomainError;

// ============================================================================
// Local identity
// ============================================================================

/// Stable local identifier of a synchronized filesystem entry
///
/// The GUID is written into an extended attribute of the file or directory,
/// so it survives renames and moves performed while the client is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalGuid(Uuid);

impl LocalGuid {
    /// Create a new random LocalGuid
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a GUID from the raw bytes of an extended attribute value
    ///
    /// # Errors
    /// Returns `DomainError::InvalidId` if the bytes are not a textual UUID
    pub fn from_xattr_bytes(bytes: &[u8]) -> Result<Self, DomainError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| DomainError::InvalidId(format!("GUID attribute is not UTF-8: {e}")))?;
        text.trim_end_matches('\0').trim().parse()
    }
}

impl Default for LocalGuid {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LocalGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for LocalGuid {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| DomainError::InvalidId(format!("Invalid LocalGuid: {e}")))
    }
}

impl From<Uuid> for LocalGuid {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

// ============================================================================
// Remote identity
// ============================================================================

/// Identifier of an object in the remote repository
///
/// Remote ids are opaque strings issued by the repository. They must be
/// non-empty and free of control characters so they can be used as
/// storage keys and log fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemoteId(String);

impl RemoteId {
    /// Create a new RemoteId
    ///
    /// # Errors
    /// Returns error if the ID is empty or contains control characters
    pub fn new(id: String) -> Result<Self, DomainError> {
        if id.is_empty() {
            return Err(DomainError::InvalidRemoteId(
                "Remote ID cannot be empty".to_string(),
            ));
        }

        if id.chars().any(char::is_control) {
            return Err(DomainError::InvalidRemoteId(format!(
                "Remote ID contains control characters: {id:?}"
            )));
        }

        Ok(Self(id))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RemoteId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemoteId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemoteId {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemoteId> for String {
    fn from(id: RemoteId) -> Self {
        id.0
    }
}

/// Server-issued change token (opaque string)
///
/// Advances whenever a remote object's content or metadata changes. The
/// same type is used for the repository-wide change-log token.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChangeToken(String);

impl ChangeToken {
    /// Create a new ChangeToken
    ///
    /// # Errors
    /// Returns error if the token is empty
    pub fn new(token: String) -> Result<Self, DomainError> {
        if token.is_empty() {
            return Err(DomainError::InvalidChangeToken(
                "Change token cannot be empty".to_string(),
            ));
        }

        Ok(Self(token))
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ChangeToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeToken {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for ChangeToken {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<ChangeToken> for String {
    fn from(token: ChangeToken) -> Self {
        token.0
    }
}

// ============================================================================
// Checksum
// ============================================================================

/// Content checksum together with the name of the algorithm that produced it
///
/// Bundling both values makes "checksum without algorithm" unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    algorithm: String,
    #[serde(with = "hex_bytes")]
    digest: Vec<u8>,
}

impl Checksum {
    /// Name of the algorithm produced by the local filesystem adapter
    pub const SHA256: &'static str = "SHA-256";

    /// Create a new Checksum
    ///
    /// # Errors
    /// Returns error if the algorithm name or the digest is empty
    pub fn new(algorithm: impl Into<String>, digest: Vec<u8>) -> Result<Self, DomainError> {
        let algorithm = algorithm.into();
        if algorithm.trim().is_empty() {
            return Err(DomainError::InvalidChecksum(
                "Checksum algorithm cannot be empty".to_string(),
            ));
        }
        if digest.is_empty() {
            return Err(DomainError::InvalidChecksum(format!(
                "{algorithm} digest cannot be empty"
            )));
        }
        Ok(Self { algorithm, digest })
    }

    /// Create a SHA-256 checksum from a raw digest
    ///
    /// # Errors
    /// Returns error if the digest is not 32 bytes long
    pub fn sha256(digest: Vec<u8>) -> Result<Self, DomainError> {
        if digest.len() != 32 {
            return Err(DomainError::InvalidChecksum(format!(
                "SHA-256 digest must be 32 bytes, got {}",
                digest.len()
            )));
        }
        Self::new(Self::SHA256, digest)
    }

    /// Parse a digest stored as lowercase hex
    ///
    /// # Errors
    /// Returns error if `hex_digest` is not valid hex
    pub fn from_hex(algorithm: impl Into<String>, hex_digest: &str) -> Result<Self, DomainError> {
        let digest = hex::decode(hex_digest)
            .map_err(|e| DomainError::InvalidChecksum(format!("Invalid hex digest: {e}")))?;
        Self::new(algorithm, digest)
    }

    /// Algorithm name, e.g. `SHA-256`
    #[must_use]
    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    /// Raw digest bytes
    #[must_use]
    pub fn digest(&self) -> &[u8] {
        &self.digest
    }

    /// Digest as lowercase hex
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.digest)
    }
}

impl Display for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.to_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Path types
// ============================================================================

/// A validated absolute local path
///
/// SyncPath ensures the path is:
/// - Absolute (starts with /)
/// - Normalized (no . or .. components)
/// - Within the sync root when validated against one
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "PathBuf", into = "PathBuf")]
pub struct SyncPath(PathBuf);

impl SyncPath {
    /// Create a new SyncPath, validating it is absolute
    ///
    /// # Errors
    /// Returns `DomainError::InvalidPath` if the path is not absolute
    pub fn new(path: PathBuf) -> Result<Self, DomainError> {
        if !path.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "Path must be absolute: {}",
                path.display()
            )));
        }

        // Not canonicalized: the path may not exist yet
        let normalized = Self::normalize_path(&path)?;
        Ok(Self(normalized))
    }

    /// Get the inner path
    #[must_use]
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Convert to owned PathBuf
    #[must_use]
    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }

    /// Get the path relative to a root
    ///
    /// # Errors
    /// Returns error if this path is not within the root
    pub fn relative_to(&self, root: &SyncPath) -> Result<PathBuf, DomainError> {
        self.0
            .strip_prefix(&root.0)
            .map(|p| p.to_path_buf())
            .map_err(|_| {
                DomainError::PathNotInSyncRoot(format!(
                    "{} is not within {}",
                    self.0.display(),
                    root.0.display()
                ))
            })
    }

    /// Join a single path component to this SyncPath
    ///
    /// # Errors
    /// Returns error if the component contains separators or traversal
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty()
            || component == ".."
            || component == "."
            || component.contains('/')
        {
            return Err(DomainError::InvalidPath(format!(
                "Invalid path component: {component}"
            )));
        }

        Self::new(self.0.join(component))
    }

    /// Parent directory, `None` for `/`
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.parent().map(|p| Self(p.to_path_buf()))
    }

    /// Last path component as UTF-8, if any
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|n| n.to_str())
    }

    fn normalize_path(path: &Path) -> Result<PathBuf, DomainError> {
        use std::path::Component;

        let mut normalized = PathBuf::new();

        for component in path.components() {
            match component {
                Component::Prefix(p) => normalized.push(p.as_os_str()),
                Component::RootDir => normalized.push("/"),
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(DomainError::InvalidPath(
                            "Path escapes root via ..".to_string(),
                        ));
                    }
                }
                Component::Normal(c) => normalized.push(c),
            }
        }

        Ok(normalized)
    }
}

impl Display for SyncPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl TryFrom<PathBuf> for SyncPath {
    type Error = DomainError;

    fn try_from(path: PathBuf) -> Result<Self, Self::Error> {
        Self::new(path)
    }
}

impl From<SyncPath> for PathBuf {
    fn from(sync_path: SyncPath) -> Self {
        sync_path.0
    }
}

impl AsRef<Path> for SyncPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

/// A path inside the remote repository (must start with /)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RemotePath(String);

impl RemotePath {
    /// Create a new RemotePath
    ///
    /// # Errors
    /// Returns error if path doesn't start with `/`, contains `//` or `..`
    pub fn new(path: String) -> Result<Self, DomainError> {
        if !path.starts_with('/') {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path must start with '/': {path}"
            )));
        }

        if path.len() > 1 && path.contains("//") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains invalid double slashes: {path}"
            )));
        }

        if path.split('/').any(|segment| segment == "..") {
            return Err(DomainError::InvalidRemotePath(format!(
                "Remote path contains invalid traversal: {path}"
            )));
        }

        // A trailing slash is accepted on input but never stored
        let path = if path.len() > 1 {
            path.trim_end_matches('/').to_string()
        } else {
            path
        };

        Ok(Self(path))
    }

    /// Create the root path "/"
    #[must_use]
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Returns true for "/"
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Get the inner string reference
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Join a path component
    ///
    /// # Errors
    /// Returns error if component is invalid
    pub fn join(&self, component: &str) -> Result<Self, DomainError> {
        if component.is_empty() || component.contains('/') || component == ".." {
            return Err(DomainError::InvalidRemotePath(format!(
                "Invalid path component: {component}"
            )));
        }

        let new_path = if self.is_root() {
            format!("/{component}")
        } else {
            format!("{}/{component}", self.0)
        };

        Self::new(new_path)
    }

    /// Get the parent path
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }

        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Get the file name component
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }

        self.0.rsplit('/').next()
    }

    /// Path segments below `/`
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Remainder of this path below `prefix`, or `None` if not nested in it
    ///
    /// The comparison is segment-aware: `/ab` is not below `/a`.
    #[must_use]
    pub fn strip_prefix(&self, prefix: &RemotePath) -> Option<Vec<&str>> {
        let mine: Vec<&str> = self.segments().collect();
        let theirs: Vec<&str> = prefix.segments().collect();
        if mine.len() < theirs.len() || mine[..theirs.len()] != theirs[..] {
            return None;
        }
        Some(mine[theirs.len()..].to_vec())
    }
}

impl Display for RemotePath {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RemotePath {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

impl TryFrom<String> for RemotePath {
    type Error = DomainError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::new(s)
    }
}

impl From<RemotePath> for String {
    fn from(path: RemotePath) -> Self {
        path.0
    }
}

// ============================================================================
// Tests
// ============================================================================
