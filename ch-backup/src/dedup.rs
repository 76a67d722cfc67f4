//! Part deduplication against previous backups.
//!
//! A freshly frozen part is linked to an earlier copy only when the earlier
//! entry is not itself a link, its checksum, size and file list are equal,
//! and every object it needs still exists in storage. A miss only costs an
//! upload, so any doubt resolves to a miss.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::metadata::{BackupMetadata, PartMetadata};
use crate::storage::BackupLayout;
use crate::utils::errors::Result;

type PartKey = (String, String, String);

fn part_key(part: &PartMetadata) -> PartKey {
    (part.database.clone(), part.table.clone(), part.name.clone())
}

/// Earlier copy of a part that a new backup can link to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupMatch {
    /// Path of the backup storing the bytes
    pub backup_path: String,
    pub tarball: bool,
}

struct Candidate {
    name: String,
    path: String,
    parts: HashMap<PartKey, PartMetadata>,
}

pub struct DedupResolver {
    candidates: Vec<Candidate>,
}

impl DedupResolver {
    /// Complete backups finished after `now - age_limit`, newest first.
    pub fn select_candidates(
        backups: Vec<BackupMetadata>,
        age_limit: Duration,
        now: DateTime<Utc>,
    ) -> Vec<BackupMetadata> {
        let threshold = now - age_limit;
        let mut selected: Vec<BackupMetadata> = backups
            .into_iter()
            .filter(|b| b.end_time.is_some_and(|end| end > threshold))
            .collect();
        selected.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        selected
    }

    /// Build an index over `backups`, searched in the given order.
    pub fn new(backups: Vec<BackupMetadata>) -> Self {
        let candidates = backups
            .into_iter()
            .filter(|b| b.is_complete())
            .map(|b| Candidate {
                parts: b.parts().map(|p| (part_key(p), p.clone())).collect(),
                name: b.name,
                path: b.path,
            })
            .collect();
        Self { candidates }
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Find the most recent verified copy of `part`.
    pub async fn resolve(&self, part: &PartMetadata, layout: &BackupLayout) -> Result<Option<DedupMatch>> {
        let key = part_key(part);

        for candidate in &self.candidates {
            let Some(entry) = candidate.parts.get(&key) else {
                continue;
            };
            if entry.is_linked() || !entry.same_content(part) {
                continue;
            }

            let paths = layout.part_remote_paths(&candidate.path, entry);
            if !self.all_exist(layout, &paths).await {
                debug!(
                    backup = %candidate.name,
                    part = %part.name,
                    "Candidate part is missing from storage"
                );
                continue;
            }

            debug!(backup = %candidate.name, part = %part.name, "Part deduplicated");
            return Ok(Some(DedupMatch {
                backup_path: candidate.path.clone(),
                tarball: entry.tarball,
            }));
        }
        Ok(None)
    }

    async fn all_exist(&self, layout: &BackupLayout, paths: &[String]) -> bool {
        for path in paths {
            match layout.engine().path_exists(path).await {
                Ok(true) => {}
                Ok(false) => return false,
                Err(e) => {
                    warn!(path, error = %e, "Cannot verify deduplication source");
                    return false;
                }
            }
        }
        true
    }
}
