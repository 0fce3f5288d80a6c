//! Persistent memo of `repo:ref → CID` mappings.
//!
//! Successful pushes record their mappings here so later pulls resolve
//! without consulting the resolver chain. The in-memory map is authoritative
//! for the process lifetime; human-meaningful tags are additionally
//! persisted as `<location>/<repo>/<ref>` files that survive restarts.
//! Digest references (`sha256:…`) and self-mappings (`repo == cid`) live
//! only in memory.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::Result;

/// File-backed store of known CID mappings.
#[derive(Debug)]
pub struct CidStore {
    cids: RwLock<HashMap<String, String>>,
    location: PathBuf,
}

fn key(repo: &str, reference: &str) -> String {
    let reference = if reference.is_empty() {
        "latest"
    } else {
        reference
    };
    format!("{repo}:{reference}")
}

impl CidStore {
    /// Create a store rooted at `location`. The directory is created lazily
    /// on the first persisted write.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            cids: RwLock::new(HashMap::new()),
            location: location.into(),
        }
    }

    /// Record `repo:reference → cid`. An empty reference means `latest`.
    pub fn add(&self, repo: &str, reference: &str, cid: &str) {
        let k = key(repo, reference);
        let mut cids = match self.cids.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        cids.insert(k.clone(), cid.to_owned());

        // only name:tag references are persisted
        if repo != cid && !reference.starts_with("sha256:") {
            if let Err(err) = self.write_cid(&k, cid) {
                tracing::warn!(key = %k, %err, "failed to persist CID mapping");
            }
        }
    }

    /// Look up `repo:reference`. An in-memory hit wins; on miss the on-disk
    /// file is consulted.
    pub fn get(&self, repo: &str, reference: &str) -> Option<String> {
        let k = key(repo, reference);
        let cids = match self.cids.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match cids.get(&k) {
            Some(cid) => Some(cid.clone()),
            None => self.read_cid(&k).ok(),
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        match key.split_once(':') {
            Some((repo, reference)) => self.location.join(repo).join(reference),
            None => self.location.join(key),
        }
    }

    fn read_cid(&self, key: &str) -> Result<String> {
        Ok(fs::read_to_string(self.path_for(key))?)
    }

    fn write_cid(&self, key: &str, cid: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o777)
                .create(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(path)?;
        file.write_all(cid.as_bytes())?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn location(&self) -> &std::path::Path {
        &self.location
    }
}
