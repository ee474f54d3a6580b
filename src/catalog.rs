//! Resolver over the directory of installed test programs.
//!
//! A test name is valid when the tests directory holds either a regular file
//! `<name>.sh` (not dot-prefixed) or a subdirectory `<name>/` containing
//! `main.sh`. Scan results are cached and lazily refreshed once the refresh
//! period elapses, so the hot `contains` path rarely touches the filesystem.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// How long a scan result stays fresh.
pub const REFRESH_PERIOD: Duration = Duration::from_secs(60);

const SCRIPT_EXT: &str = ".sh";
const PACKAGE_MAIN: &str = "main.sh";

/// Read-mostly catalog of available tests, shared between the HTTP layer
/// and the wardens.
#[derive(Debug)]
pub struct TestCatalog {
    path: PathBuf,
    refresh_period: Duration,
    cache: Mutex<Option<Cache>>,
}

#[derive(Debug)]
struct Cache {
    names: Vec<String>,
    refreshed: Instant,
}

impl TestCatalog {
    pub fn new(path: impl Into<PathBuf>) -> TestCatalog {
        TestCatalog::with_refresh_period(path, REFRESH_PERIOD)
    }

    pub fn with_refresh_period(path: impl Into<PathBuf>, refresh_period: Duration) -> TestCatalog {
        TestCatalog {
            path: path.into(),
            refresh_period,
            cache: Mutex::new(None),
        }
    }

    /// Base directory of the installed tests; exported to children as the
    /// module-resolution hint.
    pub fn root(&self) -> &Path {
        &self.path
    }

    /// Names of the loadable tests. Re-scans the directory when the cached
    /// result is older than the refresh period.
    pub fn available(&self) -> Vec<String> {
        let mut cache = match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = Instant::now();
        if let Some(cache) = cache.as_ref()
            && now.duration_since(cache.refreshed) < self.refresh_period
        {
            return cache.names.clone();
        }
        debug!(path = %self.path.display(), "test catalog outdated, rescanning");
        let names = self.scan();
        *cache = Some(Cache {
            names: names.clone(),
            refreshed: now,
        });
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.available().iter().any(|n| n == name)
    }

    /// Map a valid test name to the script the warden should execute. Reads
    /// the filesystem directly so a test installed after the last scan still
    /// resolves.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        let script = self.path.join(format!("{name}{SCRIPT_EXT}"));
        if script.is_file() {
            return Some(script);
        }
        let package = self.path.join(name).join(PACKAGE_MAIN);
        if package.is_file() {
            return Some(package);
        }
        None
    }

    fn scan(&self) -> Vec<String> {
        if !self.path.is_dir() {
            warn!(path = %self.path.display(), "no such tests directory");
            return Vec::new();
        }
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "tests directory unreadable");
                return Vec::new();
            }
        };
        let mut names = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            let path = entry.path();
            if path.is_file() {
                if !name.starts_with('.')
                    && let Some(stem) = name.strip_suffix(SCRIPT_EXT)
                {
                    debug!(name = %stem, "found test script");
                    names.push(stem.to_string());
                }
            } else if path.is_dir() && path.join(PACKAGE_MAIN).is_file() {
                debug!(name = %name, "found test package");
                names.push(name.to_string());
            }
        }
        names
    }
}
