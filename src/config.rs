//! Configuration for gonzbee.
//!
//! The config lives at `$HOME/.gonzbee/config` as JSON and is created with
//! empty defaults on first run, so a new user gets a file to fill in
//! instead of an error. Field names are capitalised in the file
//! (`Address`, `Port`, ...) for compatibility with existing configs.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::nntp::ServerConfig;

/// Default NNTP port when the config leaves `Port` unset.
const DEFAULT_PORT: u16 = 119;

/// User configuration, one NNTP server.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    /// Server hostname
    pub address: String,
    /// Server port; 0 means the NNTP default of 119
    pub port: u16,
    /// Username for authentication; empty disables AUTHINFO
    pub username: String,
    /// Password for authentication
    pub password: String,
    /// Connect over TLS
    #[serde(rename = "TLS")]
    pub tls: bool,
}

impl Config {
    /// Load the config from `$HOME/.gonzbee/config`, creating the
    /// directory and a default config file on first run.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when `$HOME` is unset or the file cannot be
    /// created, read, or parsed. These are boot-fatal.
    pub fn load_or_create() -> Result<Config> {
        let home = std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Config("cannot locate config: HOME is not set".into()))?;
        Self::load_or_create_in(&PathBuf::from(home).join(".gonzbee"))
    }

    /// Load or create the config file inside `config_dir`.
    pub fn load_or_create_in(config_dir: &Path) -> Result<Config> {
        fs::create_dir_all(config_dir).map_err(|e| {
            Error::Config(format!(
                "cannot create {}: {e}",
                config_dir.display()
            ))
        })?;
        let path = config_dir.join("config");

        // create_new keeps the first-run write from clobbering a config
        // another invocation is creating concurrently
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let config = Config::default();
                let body = serde_json::to_string_pretty(&config)
                    .map_err(|e| Error::Config(format!("cannot serialise defaults: {e}")))?;
                file.write_all(body.as_bytes())
                    .map_err(|e| Error::Config(format!("cannot write {}: {e}", path.display())))?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let body = fs::read(&path)
                    .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
                serde_json::from_slice(&body)
                    .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))
            }
            Err(e) => Err(Error::Config(format!(
                "cannot create {}: {e}",
                path.display()
            ))),
        }
    }

    /// Connection settings for the pool.
    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            host: self.address.clone(),
            port: if self.port == 0 {
                DEFAULT_PORT
            } else {
                self.port
            },
            tls: self.tls,
            username: (!self.username.is_empty()).then(|| self.username.clone()),
            password: (!self.password.is_empty()).then(|| self.password.clone()),
        }
    }
}
