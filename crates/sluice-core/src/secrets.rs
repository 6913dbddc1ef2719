//! Secret lookup capability.
//!
//! Listeners resolve their access tokens through an injected
//! [`SecretResolver`] before accepting traffic. Resolution happens
//! concurrently during startup, so implementations must be `Send + Sync`.

use std::{collections::HashMap, fmt, path::PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reference to one key inside a named secret.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SecretRef {
    /// Secret name.
    pub name: String,
    /// Key within the secret.
    pub key: String,
}

impl SecretRef {
    /// Creates a secret reference.
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self { name: name.into(), key: key.into() }
    }
}

impl fmt::Display for SecretRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.key)
    }
}

/// Resolved secret material. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Bytes);

impl SecretValue {
    /// Wraps raw secret bytes.
    pub fn new(value: impl Into<Bytes>) -> Self {
        Self(value.into())
    }

    /// Raw bytes of the secret.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The secret as UTF-8 text.
    ///
    /// # Errors
    ///
    /// Returns [`SecretError::NotUtf8`] for binary secrets.
    pub fn as_str(&self, secret: &SecretRef) -> Result<&str, SecretError> {
        std::str::from_utf8(&self.0).map_err(|_| SecretError::NotUtf8 { secret: secret.clone() })
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretValue(<{} bytes redacted>)", self.0.len())
    }
}

/// Secret lookup failures.
#[derive(Debug, Error)]
pub enum SecretError {
    /// No such secret or key.
    #[error("secret {secret} not found")]
    NotFound {
        /// The missing reference
        secret: SecretRef,
    },

    /// Secret exists but is empty; an empty token would authenticate anyone.
    #[error("secret {secret} is empty")]
    Empty {
        /// The empty reference
        secret: SecretRef,
    },

    /// Secret is not valid UTF-8 where text is required.
    #[error("secret {secret} is not valid UTF-8")]
    NotUtf8 {
        /// The offending reference
        secret: SecretRef,
    },

    /// Reference contains characters that are not allowed in a name or key.
    #[error("invalid secret reference {secret}")]
    InvalidReference {
        /// The rejected reference
        secret: SecretRef,
    },

    /// Backend failure.
    #[error("failed to read secret {secret}: {message}")]
    Backend {
        /// Reference being read
        secret: SecretRef,
        /// Backend error message
        message: String,
    },
}

/// Resolves secret references to their values.
#[async_trait]
pub trait SecretResolver: Send + Sync + fmt::Debug {
    /// Looks up one key of a named secret.
    async fn resolve(&self, secret: &SecretRef) -> Result<SecretValue, SecretError>;
}

/// Fixed in-memory secret store.
#[derive(Debug, Default, Clone)]
pub struct InMemorySecrets {
    entries: HashMap<SecretRef, Bytes>,
}

impl InMemorySecrets {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a secret, builder style.
    #[must_use]
    pub fn with_secret(
        mut self,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Bytes>,
    ) -> Self {
        self.entries.insert(SecretRef::new(name, key), value.into());
        self
    }
}

#[async_trait]
impl SecretResolver for InMemorySecrets {
    async fn resolve(&self, secret: &SecretRef) -> Result<SecretValue, SecretError> {
        match self.entries.get(secret) {
            Some(value) if value.is_empty() => Err(SecretError::Empty { secret: secret.clone() }),
            Some(value) => Ok(SecretValue(value.clone())),
            None => Err(SecretError::NotFound { secret: secret.clone() }),
        }
    }
}

/// Secrets mounted as files, one directory per secret: `<root>/<name>/<key>`.
///
/// A single trailing newline is stripped, since secret files are commonly
/// created from shell input.
#[derive(Debug, Clone)]
pub struct FileSecrets {
    root: PathBuf,
}

impl FileSecrets {
    /// Creates a resolver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, secret: &SecretRef) -> Result<PathBuf, SecretError> {
        let valid = |part: &str| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && !part.contains(['/', '\\'])
        };
        if !valid(&secret.name) || !valid(&secret.key) {
            return Err(SecretError::InvalidReference { secret: secret.clone() });
        }
        Ok(self.root.join(&secret.name).join(&secret.key))
    }
}

#[async_trait]
impl SecretResolver for FileSecrets {
    async fn resolve(&self, secret: &SecretRef) -> Result<SecretValue, SecretError> {
        let path = self.path_for(secret)?;

        let mut contents = match tokio::fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SecretError::NotFound { secret: secret.clone() });
            },
            Err(e) => {
                return Err(SecretError::Backend { secret: secret.clone(), message: e.to_string() });
            },
        };

        if contents.ends_with(b"\n") {
            contents.pop();
            if contents.ends_with(b"\r") {
                contents.pop();
            }
        }

        if contents.is_empty() {
            return Err(SecretError::Empty { secret: secret.clone() });
        }

        Ok(SecretValue(Bytes::from(contents)))
    }
}
