//! Pluggable path authorization.
//!
//! Every filesystem root the engine touches — the project directory and any
//! worktree a run executes in — goes through a `PathAuthorizer` before use.
//! Production code injects `AllowListAuthorizer`; tests inject `AllowAll`.

use std::path::{Path, PathBuf};

use crate::errors::AuthzError;

/// Capability that decides whether the engine may operate on a path.
pub trait PathAuthorizer: Send + Sync {
    fn authorize(&self, path: &Path) -> Result<(), AuthzError>;
}

/// Authorizes paths that resolve inside one of a fixed set of roots.
///
/// Roots are canonicalized at construction; candidate paths are
/// canonicalized at check time so symlinks cannot escape the allow-list.
pub struct AllowListAuthorizer {
    roots: Vec<PathBuf>,
}

impl AllowListAuthorizer {
    pub fn new(roots: Vec<PathBuf>) -> Result<Self, AuthzError> {
        let mut resolved = Vec::with_capacity(roots.len());
        for root in roots {
            let canonical = root.canonicalize().map_err(|source| AuthzError::Resolve {
                path: root.clone(),
                source,
            })?;
            resolved.push(canonical);
        }
        Ok(Self { roots: resolved })
    }
}

impl PathAuthorizer for AllowListAuthorizer {
    fn authorize(&self, path: &Path) -> Result<(), AuthzError> {
        let resolved = path.canonicalize().map_err(|source| AuthzError::Resolve {
            path: path.to_path_buf(),
            source,
        })?;
        if self.roots.iter().any(|root| resolved.starts_with(root)) {
            Ok(())
        } else {
            Err(AuthzError::Denied { path: resolved })
        }
    }
}

/// Test double that authorizes every path.
pub struct AllowAll;

impl PathAuthorizer for AllowAll {
    fn authorize(&self, _path: &Path) -> Result<(), AuthzError> {
        Ok(())
    }
}
