//! Serve log directory layout and the instance mapping file.
//!
//! Layout: `<serve root>/<model name>/<instance name>/` holds the server
//! output for one instance. A sibling `instance_mapping.txt` at the serve
//! root records `<instance id>:<directory>` lines for external log
//! discovery; it is rewritten (not appended) on each change and pruned
//! when an instance is removed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const MAPPING_FILE: &str = "instance_mapping.txt";

/// Serve log root for this worker.
#[derive(Debug, Clone)]
pub struct ServeLogDir {
    root: PathBuf,
}

impl ServeLogDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create (if needed) and return the log directory for one instance.
    pub fn ensure_instance_dir(&self, model_name: &str, instance_name: &str) -> Result<PathBuf> {
        let dir = self.root.join(model_name).join(instance_name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
        Ok(dir)
    }

    /// Record or replace the mapping entry for an instance.
    pub fn record_instance(&self, instance_id: i64, dir: &Path) -> Result<()> {
        let mut mappings = self.read_mappings();
        mappings.insert(instance_id, dir.display().to_string());
        self.write_mappings(&mappings)
    }

    /// Prune the mapping entry for an instance, if present.
    pub fn remove_instance(&self, instance_id: i64) -> Result<()> {
        let mut mappings = self.read_mappings();
        if mappings.remove(&instance_id).is_some() {
            self.write_mappings(&mappings)?;
        }
        Ok(())
    }

    /// Current mapping entries, malformed lines skipped.
    pub fn mappings(&self) -> BTreeMap<i64, String> {
        self.read_mappings()
    }

    fn mapping_path(&self) -> PathBuf {
        self.root.join(MAPPING_FILE)
    }

    fn read_mappings(&self) -> BTreeMap<i64, String> {
        let mut mappings = BTreeMap::new();
        let Ok(content) = fs::read_to_string(self.mapping_path()) else {
            return mappings;
        };
        for line in content.lines() {
            let line = line.trim();
            let Some((id, dir)) = line.split_once(':') else {
                continue;
            };
            if let Ok(id) = id.parse::<i64>() {
                mappings.insert(id, dir.to_string());
            }
        }
        mappings
    }

    /// Rewrite the mapping file via a temp file and rename, so readers
    /// never observe a partially written file.
    fn write_mappings(&self, mappings: &BTreeMap<i64, String>) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("failed to create serve log root {}", self.root.display()))?;
        let mut content = String::new();
        for (id, dir) in mappings {
            content.push_str(&format!("{id}:{dir}\n"));
        }
        let tmp = self.root.join(format!(".{MAPPING_FILE}.tmp"));
        fs::write(&tmp, content)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, self.mapping_path())
            .with_context(|| format!("failed to replace {}", self.mapping_path().display()))?;
        Ok(())
    }
}
