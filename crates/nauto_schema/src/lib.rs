//! Narrow interface onto the schema-language parser and schema-mount
//! extension (spec.md §1: "the core consumes a 'parse these
//! module@revision pairs into a schema set; attach this set at this
//! mount point' service"). The parser itself is out of scope; this crate
//! only defines the seam and a stub good enough to drive the controller
//! core end to end in tests.

use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("YANG parse error: {0}")]
    Parse(String),
    #[error("mount point '{0}' already occupied")]
    MountConflict(String),
}

/// Opaque handle to a parsed, bound schema set. The real contents (a
/// parsed YANG module tree) live entirely in the schema-language parser,
/// which is out of scope here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSetHandle(Arc<str>);

impl SchemaSetHandle {
    pub fn label(&self) -> &str {
        &self.0
    }
}

#[async_trait]
pub trait SchemaService: Send + Sync {
    /// Parses `modules` (name, optional revision) into a bound schema
    /// set. `cache_dir` is where `<name>[@<revision>].yang` files already
    /// live (spec.md §4.3/§6).
    async fn parse(
        &self,
        modules: &[(String, Option<String>)],
        cache_dir: &Path,
    ) -> Result<SchemaSetHandle, SchemaError>;

    /// Attaches a parsed schema set at `mount_point` in the global
    /// datastore tree (spec.md §3 glossary: "mount point").
    fn mount(&self, set: &SchemaSetHandle, mount_point: &str) -> Result<(), SchemaError>;

    /// Detaches whatever schema set is mounted at `mount_point`, freeing
    /// it for a later `mount` call (a `connection-change{reconnect}`
    /// remounts at the same point, spec.md §6). Idempotent: unmounting a
    /// point with nothing mounted is not an error.
    fn unmount(&self, mount_point: &str);
}

/// A schema service good enough for tests and the CLI demo: "parsing"
/// always succeeds unless a module name contains the literal substring
/// `"bad"`, and every requested `(name, revision)` pair is recorded so
/// tests can assert against the fetch sequence (spec.md §8 scenario S2).
#[derive(Default)]
pub struct InMemorySchemaService {
    requested: Mutex<Vec<(String, Option<String>)>>,
    mounted: Mutex<Vec<String>>,
}

impl InMemorySchemaService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requested_modules(&self) -> Vec<(String, Option<String>)> {
        self.requested.lock().expect("lock poisoned").clone()
    }

    pub fn mounted_points(&self) -> Vec<String> {
        self.mounted.lock().expect("lock poisoned").clone()
    }
}

#[async_trait]
impl SchemaService for InMemorySchemaService {
    async fn parse(
        &self,
        modules: &[(String, Option<String>)],
        _cache_dir: &Path,
    ) -> Result<SchemaSetHandle, SchemaError> {
        self.requested
            .lock()
            .expect("lock poisoned")
            .extend(modules.iter().cloned());

        if let Some((bad, _)) = modules.iter().find(|(name, _)| name.contains("bad")) {
            return Err(SchemaError::Parse(format!("module '{bad}' rejected by parser")));
        }

        let label = modules
            .iter()
            .map(|(name, rev)| match rev {
                Some(rev) => format!("{name}@{rev}"),
                None => name.clone(),
            })
            .collect::<Vec<_>>()
            .join(",");
        Ok(SchemaSetHandle(Arc::from(label.as_str())))
    }

    fn mount(&self, set: &SchemaSetHandle, mount_point: &str) -> Result<(), SchemaError> {
        let mut mounted = self.mounted.lock().expect("lock poisoned");
        if mounted.iter().any(|m| m == mount_point) {
            return Err(SchemaError::MountConflict(mount_point.to_string()));
        }
        mounted.push(mount_point.to_string());
        let _ = set;
        Ok(())
    }

    fn unmount(&self, mount_point: &str) {
        self.mounted.lock().expect("lock poisoned").retain(|m| m != mount_point);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_schema_catalog_yields_empty_set() {
        let svc = InMemorySchemaService::new();
        let set = svc.parse(&[], Path::new("/tmp")).await.unwrap();
        assert_eq!(set.label(), "");
    }

    #[tokio::test]
    async fn bad_module_is_a_parse_error() {
        let svc = InMemorySchemaService::new();
        let modules = vec![("acme-bad-module".to_string(), None)];
        let err = svc.parse(&modules, Path::new("/tmp")).await.unwrap_err();
        assert!(matches!(err, SchemaError::Parse(_)));
    }

    #[tokio::test]
    async fn mount_point_conflict_is_rejected() {
        let svc = InMemorySchemaService::new();
        let set = svc.parse(&[], Path::new("/tmp")).await.unwrap();
        svc.mount(&set, "/devices/r1").unwrap();
        assert!(svc.mount(&set, "/devices/r1").is_err());
    }

    #[tokio::test]
    async fn unmount_then_remount_at_the_same_point_succeeds() {
        let svc = InMemorySchemaService::new();
        let set = svc.parse(&[], Path::new("/tmp")).await.unwrap();
        svc.mount(&set, "/devices/r1").unwrap();

        svc.unmount("/devices/r1");
        assert!(svc.mount(&set, "/devices/r1").is_ok());
    }

    #[tokio::test]
    async fn unmount_of_an_unmounted_point_is_not_an_error() {
        let svc = InMemorySchemaService::new();
        svc.unmount("/devices/never-mounted");
    }
}
