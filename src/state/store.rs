//! Durable JSON snapshot store with atomic replace.
//!
//! Writes go to a temporary sibling and are renamed over the target, so a
//! reader never observes a partial file. A snapshot that fails to decode is
//! quarantined next to the target and replaced by defaults.

use crate::config::schema::RingCaps;
use crate::error::{LoopError, LoopResult};
use crate::state::schema::{self, Snapshot};
use crate::types::*;
use chrono::Utc;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of [`StateStore::load`].
#[derive(Debug)]
pub struct Loaded {
    pub snapshot: Snapshot,
    /// Where a corrupt file was moved, if the load fell back to defaults.
    pub quarantined: Option<PathBuf>,
}

/// A record for [`StateStore::append_event`]. The store assigns its id.
#[derive(Debug, Clone)]
pub enum HistoryEntry {
    Thought(Thought),
    Task(Task),
    Evolution(EvolutionEvent),
    Guidance(GuidanceRecord),
}

/// Single-writer handle on the state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    caps: RingCaps,
    initial_level: f64,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, caps: RingCaps, initial_level: f64) -> Self {
        Self {
            path: path.into(),
            caps,
            initial_level,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Defaults for a state file that does not exist yet.
    pub fn empty(&self) -> Snapshot {
        Snapshot::empty(&self.caps, self.initial_level)
    }

    /// Load the most recent durable snapshot, or defaults.
    pub fn load(&self) -> LoopResult<Loaded> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state file at {}, starting fresh", self.path.display());
                return Ok(Loaded {
                    snapshot: self.empty(),
                    quarantined: None,
                });
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                // Not UTF-8.
                return self.quarantine(LoopError::StateCorrupt(e.to_string()));
            }
            Err(e) => return Err(LoopError::storage(&self.path, e)),
        };

        match schema::decode(&text) {
            Ok(mut snapshot) => {
                snapshot.apply_caps(&self.caps);
                Ok(Loaded {
                    snapshot,
                    quarantined: None,
                })
            }
            Err(err) => self.quarantine(err),
        }
    }

    fn quarantine(&self, err: LoopError) -> LoopResult<Loaded> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".corrupt-{stamp}"));
        let target = PathBuf::from(name);

        fs::rename(&self.path, &target).map_err(|e| LoopError::storage(&self.path, e))?;
        warn!(
            "State file {} is corrupt ({err}); moved to {}",
            self.path.display(),
            target.display()
        );

        let mut snapshot = self.empty();
        let id = snapshot.next_guidance_id();
        snapshot.guidance.push(GuidanceRecord {
            id,
            created_at: Utc::now(),
            category: Category::General,
            request_summary: format!("load {}", self.path.display()),
            response_text_truncated: err.to_string(),
            provider: "state_store".into(),
            source: Source::TemplateBank,
            latency_ms: 0,
            ok: false,
            warning: Some(err.label().into()),
        });

        Ok(Loaded {
            snapshot,
            quarantined: Some(target),
        })
    }

    /// Atomically replace the state file with `snapshot`.
    pub fn commit(&self, snapshot: &Snapshot) -> LoopResult<()> {
        let storage = |e| LoopError::storage(&self.path, e);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(storage)?;
        }

        let body = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| LoopError::storage(&self.path, e.into()))?;

        let tmp = self.temp_path();
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp);
            return Err(storage(e));
        }

        debug!(
            "Committed snapshot ({} thoughts) to {}",
            snapshot.thoughts.len(),
            self.path.display()
        );
        Ok(())
    }

    /// [`commit`](Self::commit) on the blocking pool.
    pub async fn commit_async(&self, snapshot: Snapshot) -> LoopResult<()> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.commit(&snapshot))
            .await
            .map_err(|e| {
                LoopError::storage(&self.path, std::io::Error::new(ErrorKind::Other, e))
            })?
    }

    /// Read, append within ring bounds, and commit. Returns the assigned id.
    ///
    /// Only for use while no orchestrator owns the file.
    pub fn append_event(&self, entry: HistoryEntry) -> LoopResult<u64> {
        let Loaded { mut snapshot, .. } = self.load()?;

        let id = match entry {
            HistoryEntry::Thought(mut t) => {
                t.id = snapshot.next_thought_id();
                let id = t.id;
                snapshot.thoughts.push(t);
                id
            }
            HistoryEntry::Task(mut t) => {
                t.id = snapshot.next_task_id();
                let id = t.id;
                snapshot.tasks_completed.push(t);
                id
            }
            HistoryEntry::Evolution(mut e) => {
                e.id = snapshot.next_evolution_id();
                let id = e.id;
                snapshot.evolutions.push(e);
                id
            }
            HistoryEntry::Guidance(mut g) => {
                g.id = snapshot.next_guidance_id();
                let id = g.id;
                snapshot.guidance.push(g);
                id
            }
        };

        snapshot.updated_at = Utc::now();
        self.commit(&snapshot)?;
        info!("Appended history entry {} to {}", id, self.path.display());
        Ok(id)
    }

    fn temp_path(&self) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state.json".into());
        self.path.with_file_name(format!(".{name}.tmp"))
    }
}
