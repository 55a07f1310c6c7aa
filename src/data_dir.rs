//! Location of the on-disk index.

use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::{Error, Result};

/// Environment variable overriding the default data directory.
pub const DATA_DIR_ENV: &str = "FACESYNC_DATA_DIR";

const XDG_PREFIX: &str = "facesync";
const INDEX_DB: &str = "index.redb";

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    /// Use `explicit` when given (from `--data-dir`), else
    /// `$FACESYNC_DATA_DIR` when set and non-empty, else
    /// `~/.local/share/facesync/`.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let root = match explicit {
            Some(path) => path.to_path_buf(),
            None => default_root()?,
        };
        Self::at(root)
    }

    /// Use `root` as the data directory, creating it if needed.
    pub fn at(root: PathBuf) -> Result<Self> {
        if root.exists() && !root.is_dir() {
            return Err(Error::DataDir(root));
        }
        fs::create_dir_all(&root).map_err(|_| Error::DataDir(root.clone()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the local ML index database.
    pub fn index_db(&self) -> PathBuf {
        self.root.join(INDEX_DB)
    }

    /// Whether an index database was already created here.
    pub fn has_index(&self) -> bool {
        self.index_db().is_file()
    }
}

fn default_root() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }
    xdg::BaseDirectories::with_prefix(XDG_PREFIX)
        .get_data_home()
        .ok_or_else(|| {
            Error::Config("could not determine XDG data home directory".into())
        })
}
