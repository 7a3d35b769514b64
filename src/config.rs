// src/config.rs

//! Project layout constants and environment-driven defaults.

use crate::error::{Error, Result};
use std::env;
use std::path::{Path, PathBuf};

/// Hidden state directory at the project root
pub const STATE_DIR: &str = ".cinchdb";

/// Metadata index filename inside the state directory
pub const METADATA_DB: &str = "metadata.db";

/// Name of the default database, branch, and tenant
pub const MAIN: &str = "main";

/// Reserved per-branch schema template tenant
pub const EMPTY_TENANT: &str = "__empty__";

/// Environment variable overriding project root discovery
pub const ENV_PROJECT_DIR: &str = "CINCHDB_PROJECT_DIR";

/// Environment variable selecting the default database
pub const ENV_DATABASE: &str = "CINCHDB_DATABASE";

/// Environment variable selecting the default branch
pub const ENV_BRANCH: &str = "CINCHDB_BRANCH";

/// Find the project root containing a `.cinchdb` state directory.
///
/// Honors `CINCHDB_PROJECT_DIR` when set; otherwise walks up from
/// `start` until a state directory is found.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    if let Ok(dir) = env::var(ENV_PROJECT_DIR) {
        let root = PathBuf::from(dir);
        if root.join(STATE_DIR).is_dir() {
            return Ok(root);
        }
        return Err(Error::NotFound(format!(
            "no {} directory under {} ({})",
            STATE_DIR,
            root.display(),
            ENV_PROJECT_DIR
        )));
    }

    let mut current = start.to_path_buf();
    loop {
        if current.join(STATE_DIR).is_dir() {
            return Ok(current);
        }
        if !current.pop() {
            return Err(Error::NotFound(format!(
                "no CinchDB project found above {}",
                start.display()
            )));
        }
    }
}

/// Default database selection for higher layers
pub fn default_database() -> String {
    env::var(ENV_DATABASE).unwrap_or_else(|_| MAIN.to_string())
}

/// Default branch selection for higher layers
pub fn default_branch() -> String {
    env::var(ENV_BRANCH).unwrap_or_else(|_| MAIN.to_string())
}
