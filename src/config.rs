use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

/// Agent configuration, read once at startup and immutable for the run.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Subject CN for the CSR and path component for CA requests.
    pub certname: String,
    /// Base URL of the CA server, e.g. `https://ca.example.com:8140`.
    pub ca_server: String,
    /// Comma-separated subject alternative names for the CSR.
    #[serde(default)]
    pub dns_alt_names: Option<String>,
    /// Path to a TOML document with `custom_attributes` and
    /// `extension_requests` tables (OID -> value).
    #[serde(default)]
    pub csr_attributes: Option<PathBuf>,
    /// When false, CRLs are neither loaded nor fetched.
    #[serde(default = "default_certificate_revocation")]
    pub certificate_revocation: bool,
    /// Seconds to sleep between issuance polls; 0 disables polling.
    #[serde(default = "default_waitforcert")]
    pub waitforcert: u64,
    /// When true, exit instead of sleeping when the certificate is not ready.
    #[serde(default)]
    pub onetime: bool,
    #[serde(default = "default_localcacert")]
    pub localcacert: PathBuf,
    #[serde(default = "default_hostcrl")]
    pub hostcrl: PathBuf,
    #[serde(default = "default_hostprivkey")]
    pub hostprivkey: PathBuf,
    #[serde(default = "default_hostcert")]
    pub hostcert: PathBuf,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_certificate_revocation() -> bool {
    true
}

fn default_waitforcert() -> u64 {
    120
}

fn default_localcacert() -> PathBuf {
    PathBuf::from("ssl/certs/ca.pem")
}

fn default_hostcrl() -> PathBuf {
    PathBuf::from("ssl/crl.pem")
}

fn default_hostprivkey() -> PathBuf {
    PathBuf::from("ssl/private_keys/agent.pem")
}

fn default_hostcert() -> PathBuf {
    PathBuf::from("ssl/certs/agent.pem")
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    60
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        let config: Config =
            toml::from_str(&config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (agent.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("agent.toml")
    }
}
