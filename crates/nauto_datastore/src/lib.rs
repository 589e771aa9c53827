//! Narrow interface onto the datastore engine (spec.md §1: "the core
//! consumes a 'validate/commit this candidate tree' service"). The real
//! engine's candidate/running separation, locking, and rollback-on-error
//! machinery are out of scope; this crate defines the seam and an
//! in-memory implementation good enough to drive the controller core and
//! its tests end to end.

use async_trait::async_trait;
use nauto_model::{ConfigState, EditPath, EditScript, XmlTree};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum DatastoreError {
    #[error("mount point '{0}' has no candidate open")]
    NoCandidate(String),
    #[error("edit path not found: {0}")]
    PathNotFound(String),
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
}

/// A mount-point-scoped client onto candidate/running configuration
/// (spec.md §4.4 edit/validate/commit sequence).
#[async_trait]
pub trait DatastoreClient: Send + Sync {
    /// Replaces the whole candidate at `mount_point` with `tree` (used to
    /// seed a candidate from a freshly pulled running config).
    async fn write_candidate_replace(&self, mount_point: &str, tree: XmlTree) -> Result<(), DatastoreError>;

    /// Applies `script` to the open candidate at `mount_point`.
    async fn edit_candidate(&self, mount_point: &str, script: &EditScript) -> Result<(), DatastoreError>;

    async fn validate(&self, mount_point: &str) -> Result<(), DatastoreError>;

    /// Commits the open candidate at `mount_point` onto running. `level
    /// == ConfigState::Validate` runs a full `validate()` first (spec.md
    /// §4.3: "commit (validate level chosen by `config_state`)");
    /// `Closed`/`Yang` commit directly with no validation pass.
    async fn commit(&self, mount_point: &str, level: ConfigState) -> Result<(), DatastoreError>;

    async fn discard_candidate(&self, mount_point: &str) -> Result<(), DatastoreError>;

    /// Returns a human-readable unified diff between running and
    /// candidate, for the CLI's `diff` side channel (spec.md §4.5: "a
    /// human-readable text diff ... is a side channel, never the primary
    /// edit output").
    async fn diff(&self, mount_point: &str) -> Result<String, DatastoreError>;
}

#[derive(Default, Clone)]
struct MountState {
    running: XmlTree,
    candidate: Option<XmlTree>,
}

/// In-memory datastore: one `(running, candidate)` pair per mount point.
/// `fail_validate`/`fail_commit` let tests inject the failure paths
/// described in spec.md §8 scenario S6 without a real device.
pub struct InMemoryDatastore {
    mounts: Mutex<HashMap<String, MountState>>,
    fail_validate: Mutex<Vec<String>>,
    fail_commit: Mutex<Vec<String>>,
}

impl Default for InMemoryDatastore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        InMemoryDatastore {
            mounts: Mutex::new(HashMap::new()),
            fail_validate: Mutex::new(Vec::new()),
            fail_commit: Mutex::new(Vec::new()),
        }
    }

    /// Makes the next `validate()` at `mount_point` fail once.
    pub fn inject_validate_failure(&self, mount_point: &str) {
        self.fail_validate.lock().expect("lock poisoned").push(mount_point.to_string());
    }

    /// Makes the next `commit()` at `mount_point` fail once.
    pub fn inject_commit_failure(&self, mount_point: &str) {
        self.fail_commit.lock().expect("lock poisoned").push(mount_point.to_string());
    }

    pub fn running_snapshot(&self, mount_point: &str) -> Option<XmlTree> {
        self.mounts
            .lock()
            .expect("lock poisoned")
            .get(mount_point)
            .map(|m| m.running.clone())
    }

    pub fn candidate_snapshot(&self, mount_point: &str) -> Option<XmlTree> {
        self.mounts
            .lock()
            .expect("lock poisoned")
            .get(mount_point)
            .and_then(|m| m.candidate.clone())
    }
}

#[async_trait]
impl DatastoreClient for InMemoryDatastore {
    async fn write_candidate_replace(&self, mount_point: &str, tree: XmlTree) -> Result<(), DatastoreError> {
        let mut mounts = self.mounts.lock().expect("lock poisoned");
        let entry = mounts.entry(mount_point.to_string()).or_default();
        entry.candidate = Some(tree);
        Ok(())
    }

    async fn edit_candidate(&self, mount_point: &str, script: &EditScript) -> Result<(), DatastoreError> {
        let mut mounts = self.mounts.lock().expect("lock poisoned");
        let entry = mounts
            .get_mut(mount_point)
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;
        let candidate = entry
            .candidate
            .as_mut()
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;

        for path in &script.dels {
            let id = candidate
                .resolve_path(path)
                .ok_or_else(|| DatastoreError::PathNotFound(nauto_model::path_to_string(path)))?;
            candidate.remove_subtree(id);
        }
        for add in &script.adds {
            apply_add(candidate, &add.path, &add.subtree)?;
        }
        for change in &script.changes {
            apply_change(candidate, change)?;
        }
        Ok(())
    }

    async fn validate(&self, mount_point: &str) -> Result<(), DatastoreError> {
        let mut failures = self.fail_validate.lock().expect("lock poisoned");
        if let Some(pos) = failures.iter().position(|m| m == mount_point) {
            failures.remove(pos);
            return Err(DatastoreError::ValidationFailed(format!(
                "injected failure at '{mount_point}'"
            )));
        }
        let mounts = self.mounts.lock().expect("lock poisoned");
        mounts
            .get(mount_point)
            .and_then(|m| m.candidate.as_ref())
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;
        Ok(())
    }

    async fn commit(&self, mount_point: &str, level: ConfigState) -> Result<(), DatastoreError> {
        if level == ConfigState::Validate {
            self.validate(mount_point).await?;
        }
        {
            let mut failures = self.fail_commit.lock().expect("lock poisoned");
            if let Some(pos) = failures.iter().position(|m| m == mount_point) {
                failures.remove(pos);
                return Err(DatastoreError::CommitFailed(format!(
                    "injected failure at '{mount_point}'"
                )));
            }
        }
        let mut mounts = self.mounts.lock().expect("lock poisoned");
        let entry = mounts
            .get_mut(mount_point)
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;
        let candidate = entry
            .candidate
            .take()
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;
        entry.running = candidate;
        Ok(())
    }

    async fn discard_candidate(&self, mount_point: &str) -> Result<(), DatastoreError> {
        let mut mounts = self.mounts.lock().expect("lock poisoned");
        let entry = mounts
            .get_mut(mount_point)
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;
        entry.candidate = None;
        Ok(())
    }

    async fn diff(&self, mount_point: &str) -> Result<String, DatastoreError> {
        let mounts = self.mounts.lock().expect("lock poisoned");
        let entry = mounts
            .get(mount_point)
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;
        let candidate = entry
            .candidate
            .as_ref()
            .ok_or_else(|| DatastoreError::NoCandidate(mount_point.to_string()))?;

        let running_text = entry.running.to_xml_string();
        let candidate_text = candidate.to_xml_string();
        let diff = similar::TextDiff::from_lines(&running_text, &candidate_text);
        let mut out = String::new();
        for change in diff.iter_all_changes() {
            let sign = match change.tag() {
                similar::ChangeTag::Delete => "-",
                similar::ChangeTag::Insert => "+",
                similar::ChangeTag::Equal => " ",
            };
            out.push_str(sign);
            out.push_str(&change);
        }
        Ok(out)
    }
}

fn apply_add(tree: &mut XmlTree, path: &EditPath, subtree: &XmlTree) -> Result<(), DatastoreError> {
    let (last, rest) = path
        .split_last()
        .ok_or_else(|| DatastoreError::PathNotFound("empty add path".to_string()))?;
    let _ = last;
    let parent = tree
        .resolve_path(rest)
        .ok_or_else(|| DatastoreError::PathNotFound(nauto_model::path_to_string(path)))?;
    for child in subtree.children(subtree.root()) {
        tree.graft(parent, subtree, child);
    }
    Ok(())
}

fn apply_change(tree: &mut XmlTree, change: &nauto_model::EditChange) -> Result<(), DatastoreError> {
    let id = tree
        .resolve_path(&change.path)
        .ok_or_else(|| DatastoreError::PathNotFound(nauto_model::path_to_string(&change.path)))?;
    match &change.value {
        nauto_model::ChangeValue::Scalar { value } => tree.set_text(id, Some(value.clone())),
        nauto_model::ChangeValue::Structural => {
            if let Some(subtree) = &change.subtree {
                let parent = tree
                    .parent(id)
                    .ok_or_else(|| DatastoreError::PathNotFound(nauto_model::path_to_string(&change.path)))?;
                tree.remove_subtree(id);
                for child in subtree.children(subtree.root()) {
                    tree.graft(parent, subtree, child);
                }
            }
        }
    }
    Ok(())
}
