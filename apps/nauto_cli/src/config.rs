use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_DEVICE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_PARALLELISM: usize = 4;

static DEVICE_TIMEOUT: Lazy<Duration> = Lazy::new(|| {
    env_duration("NAUTO_DEVICE_TIMEOUT_SECS", Duration::from_secs(DEFAULT_DEVICE_TIMEOUT_SECS))
});

static SCHEMA_MOUNT_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("YANG_SCHEMA_MOUNT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("nauto-schema-cache"))
});

static PARALLELISM: Lazy<usize> = Lazy::new(|| {
    std::env::var("NAUTO_PARALLELISM")
        .ok()
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_PARALLELISM)
});

/// Per-transient-state timeout (spec.md §4.3/§5, `device-timeout`).
pub fn device_timeout() -> Duration {
    *DEVICE_TIMEOUT
}

/// Directory holding `<name>[@<revision>].yang` schema cache files
/// (spec.md §6 "Local persisted state").
pub fn schema_mount_dir() -> PathBuf {
    SCHEMA_MOUNT_DIR.clone()
}

/// Default bound on concurrent in-flight device operations within one
/// transaction fan-out (spec.md §5: "bounded ... by a worker limit").
pub fn default_parallelism() -> usize {
    *PARALLELISM
}

fn env_duration(var: &str, default: Duration) -> Duration {
    std::env::var(var)
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
