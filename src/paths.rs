//! File layout (§6.3). The shell is expected to pass these in explicitly
//! at worker-host construction time (§9 Design Notes — "the shell keeps
//! cross-cutting mutable state... the core implementation should accept
//! these as explicit dependencies"), grounded in the teacher's
//! `dirs::data_dir()`/`dirs::config_dir()` lookups in `main.rs`.

use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AppPaths {
    documents: PathBuf,
    app_name: String,
}

impl AppPaths {
    pub fn new(documents: impl Into<PathBuf>, app_name: impl Into<String>) -> Self {
        Self {
            documents: documents.into(),
            app_name: app_name.into(),
        }
    }

    /// Convenience constructor mirroring the teacher's `dirs::data_dir()`
    /// fallback chain, for CLI use when no explicit dir is given.
    pub fn discover(app_name: impl Into<String>) -> Option<Self> {
        dirs::document_dir()
            .or_else(dirs::data_dir)
            .map(|d| Self::new(d, app_name))
    }

    fn root(&self) -> PathBuf {
        self.documents.join(&self.app_name)
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.root().join("databases")
    }

    pub fn session_db_path(&self, session_id: &str) -> PathBuf {
        self.databases_dir().join(format!("{session_id}.db"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root().join("temp")
    }

    pub fn staging_db_path(&self, name: &str) -> PathBuf {
        self.temp_dir().join(format!("merge_{name}.db"))
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.root().join("merged")
    }

    pub fn merged_export_path(&self, safe_name: &str, yyyymmdd: &str) -> PathBuf {
        self.merged_dir()
            .join(format!("{safe_name}_merged_{yyyymmdd}.json"))
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.root().join("settings")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        fs::create_dir_all(self.databases_dir())?;
        fs::create_dir_all(self.temp_dir())?;
        fs::create_dir_all(self.merged_dir())?;
        fs::create_dir_all(self.settings_dir())?;
        Ok(())
    }

    /// Delete a session store and its WAL/SHM sidecars (§3 Lifecycle).
    pub fn delete_session_files(&self, session_id: &str) -> std::io::Result<()> {
        let db = self.session_db_path(session_id);
        remove_with_sidecars(&db)
    }

    /// Sweep the staging directory, as done on application start and
    /// after a successful merge (§5 Shared resources).
    pub fn sweep_staging(&self) -> std::io::Result<()> {
        let dir = self.temp_dir();
        if !dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with("merge_") {
                let _ = remove_with_sidecars(&path);
            }
        }
        Ok(())
    }
}

/// Remove a sqlite file along with its `-wal`/`-shm` sidecars. Missing
/// sidecars are not an error.
pub fn remove_with_sidecars(db_path: &Path) -> std::io::Result<()> {
    for suffix in ["", "-wal", "-shm"] {
        let p = if suffix.is_empty() {
            db_path.to_path_buf()
        } else {
            let mut s = db_path.as_os_str().to_os_string();
            s.push(suffix);
            PathBuf::from(s)
        };
        match fs::remove_file(&p) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
