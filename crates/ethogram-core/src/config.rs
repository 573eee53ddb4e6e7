use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{EthogramError, Result};

pub const DEFAULT_PORT: u16 = 8585;
pub const DEFAULT_DATA_PATH: &str = "/var/lib/ethogram";
pub const DEFAULT_PID_PATH: &str = "/var/run/ethogramd.pid";
pub const DEFAULT_MAX_DBS: u32 = 4096;
pub const DEFAULT_MAX_READERS: u32 = 126; // lmdb's default

/// Daemon-level configuration.
///
/// `decode` overlays a TOML document onto the current values, so any option
/// missing from the file keeps whatever value it had before the decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub data_path: PathBuf,
    pub pid_path: PathBuf,
    pub nosync: bool,
    pub max_dbs: u32,
    pub max_readers: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            data_path: PathBuf::from(DEFAULT_DATA_PATH),
            pid_path: PathBuf::from(DEFAULT_PID_PATH),
            nosync: false,
            max_dbs: DEFAULT_MAX_DBS,
            max_readers: DEFAULT_MAX_READERS,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ConfigOverlay {
    port: Option<u16>,
    data_path: Option<PathBuf>,
    pid_path: Option<PathBuf>,
    nosync: Option<bool>,
    max_dbs: Option<u32>,
    max_readers: Option<u32>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML configuration file and apply the options it sets.
    pub fn decode<R: Read>(&mut self, mut reader: R) -> Result<()> {
        let mut raw = String::new();
        reader.read_to_string(&mut raw)?;
        let overlay: ConfigOverlay =
            toml::from_str(&raw).map_err(|e| EthogramError::Config(e.to_string()))?;

        if let Some(port) = overlay.port {
            self.port = port;
        }
        if let Some(data_path) = overlay.data_path {
            self.data_path = data_path;
        }
        if let Some(pid_path) = overlay.pid_path {
            self.pid_path = pid_path;
        }
        if let Some(nosync) = overlay.nosync {
            self.nosync = nosync;
        }
        if let Some(max_dbs) = overlay.max_dbs {
            self.max_dbs = max_dbs;
        }
        if let Some(max_readers) = overlay.max_readers {
            self.max_readers = max_readers;
        }
        Ok(())
    }
}
