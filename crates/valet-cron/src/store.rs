//! JSON-document job storage.
//!
//! The whole store is one pretty-printed `{ "jobs": [...] }` document,
//! rewritten in full on every change via write-temp-then-rename so a crash
//! mid-persist can never leave a torn file.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::CronJob;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreDoc {
    #[serde(default)]
    jobs: Vec<CronJob>,
}

pub struct CronStore {
    path: PathBuf,
}

impl CronStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all jobs. A missing store file is an empty store.
    pub fn load(&self) -> Result<Vec<CronJob>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("read cron store"),
        };
        let doc: StoreDoc = serde_json::from_str(&data).context("parse cron store")?;
        Ok(doc.jobs)
    }

    /// Persist the full job list atomically.
    pub fn save(&self, jobs: &[CronJob]) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("cron store path has no parent directory")?;
        std::fs::create_dir_all(dir).context("create cron store directory")?;

        let doc = serde_json::to_string_pretty(&StoreDoc {
            jobs: jobs.to_vec(),
        })
        .context("serialize cron store")?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir).context("create temp store file")?;
        tmp.write_all(doc.as_bytes()).context("write temp store file")?;
        tmp.persist(&self.path).context("rename temp store file")?;
        Ok(())
    }
}
