use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::BusError;

/// Longest socket path the kernel accepts (`sun_path` minus its NUL).
pub const MAX_SOCKET_PATH: usize = 107;

/// Identity of a bus. Every process boarding the same name on the same host
/// joins the same bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusName(String);

impl BusName {
    pub fn new(name: impl Into<String>) -> Result<Self, BusError> {
        let name = name.into();
        let reason = if name.is_empty() {
            Some("must not be empty")
        } else if name == "." || name == ".." {
            Some("must not be a directory alias")
        } else if name.contains('/') {
            Some("must not contain '/'")
        } else if name.contains('\0') {
            Some("must not contain NUL")
        } else {
            None
        };

        match reason {
            Some(reason) => Err(BusError::InvalidName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the listening socket inside `dir`.
    pub fn socket_path(&self, dir: &Path) -> Result<PathBuf, BusError> {
        let path = dir.join(&self.0);
        if path.as_os_str().len() > MAX_SOCKET_PATH {
            return Err(BusError::InvalidName {
                name: self.0.clone(),
                reason: "socket path is too long",
            });
        }
        Ok(path)
    }

    /// Path of the election lock file inside `dir`.
    pub fn lock_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.lock", self.0))
    }
}

impl fmt::Display for BusName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for BusName {
    type Error = BusError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
