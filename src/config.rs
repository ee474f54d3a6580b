//! Service configuration.
//!
//! The defaults match a system-wide install; the `poted` CLI overrides any
//! of them per invocation.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

pub const DEF_BINDADDR: &str = "127.0.0.1";
pub const DEF_BINDPORT: u16 = 8901;
pub const DEF_ENVOS_COUNT: usize = 3;
pub const DEF_ENVOS_PATH: &str = "/var/lib/pote/envos";
pub const DEF_TESTS_PATH: &str = "/usr/share/pote/tests";
pub const DEF_QUEUE_PATH: &str = "/var/lib/pote/queue";
pub const DEF_ARCHIVE_PATH: &str = "/var/lib/pote/archive";

#[derive(Debug, Clone)]
pub struct Config {
    /// Interface the HTTP server listens on.
    pub bindaddr: IpAddr,
    /// TCP port the HTTP server listens on.
    pub bindport: u16,
    /// Number of environment slots (and wardens).
    pub envos_count: usize,
    /// Base path for the per-slot working directories.
    pub envos_path: PathBuf,
    /// Directory with the installed test programs.
    pub tests_path: PathBuf,
    /// Base path for the per-slot persistent job queues.
    pub queue_path: PathBuf,
    /// Root of the finished-jobs archive.
    pub archive_path: PathBuf,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bindaddr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            bindport: DEF_BINDPORT,
            envos_count: DEF_ENVOS_COUNT,
            envos_path: PathBuf::from(DEF_ENVOS_PATH),
            tests_path: PathBuf::from(DEF_TESTS_PATH),
            queue_path: PathBuf::from(DEF_QUEUE_PATH),
            archive_path: PathBuf::from(DEF_ARCHIVE_PATH),
        }
    }
}
