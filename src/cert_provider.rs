//! On-disk credential artifact store.
//!
//! Loads and saves the four bootstrap artifacts (CA bundle, CRL bundle,
//! private key, client certificate) as PEM files at configured paths.
//!
//! Loader policy: an absent file is `Ok(None)`, never an error; a present
//! but malformed file surfaces a parse error and is left untouched on disk.
//! Saver policy: content is written to a temp file in the destination
//! directory and renamed over the target, so a partially written PEM is
//! never observable. The private key is written with owner-only permissions.

use crate::config::Config;
use anyhow::{anyhow, bail, Context, Result};
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Crl, X509};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub struct CertProvider {
    localcacert: PathBuf,
    hostcrl: PathBuf,
    hostprivkey: PathBuf,
    hostcert: PathBuf,
}

impl CertProvider {
    pub fn new(config: &Config) -> Self {
        Self {
            localcacert: config.localcacert.clone(),
            hostcrl: config.hostcrl.clone(),
            hostprivkey: config.hostprivkey.clone(),
            hostcert: config.hostcert.clone(),
        }
    }

    /// Load the CA bundle, or `None` if no bundle exists on disk.
    pub fn load_cacerts(&self) -> Result<Option<Vec<X509>>> {
        let pem = match read_if_exists(&self.localcacert)? {
            Some(pem) => pem,
            None => return Ok(None),
        };
        let certs = parse_cacerts(&pem)
            .with_context(|| format!("Failed to parse CA bundle at {}", self.localcacert.display()))?;
        Ok(Some(certs))
    }

    /// Atomically write the CA bundle. Must not be called with an empty
    /// chain (caller's contract).
    pub fn save_cacerts(&self, certs: &[X509]) -> Result<()> {
        if certs.is_empty() {
            bail!("Refusing to write an empty CA bundle");
        }
        let mut pem = Vec::new();
        for cert in certs {
            let block = cert
                .to_pem()
                .map_err(|e| anyhow!("Failed to encode CA certificate: {}", e))?;
            pem.extend_from_slice(&block);
        }
        atomic_write(&self.localcacert, &pem, false)
    }

    /// Load the CRL bundle, or `None` if no bundle exists on disk.
    pub fn load_crls(&self) -> Result<Option<Vec<X509Crl>>> {
        let pem = match read_if_exists(&self.hostcrl)? {
            Some(pem) => pem,
            None => return Ok(None),
        };
        let crls = parse_crls(&pem)
            .with_context(|| format!("Failed to parse CRL bundle at {}", self.hostcrl.display()))?;
        Ok(Some(crls))
    }

    pub fn save_crls(&self, crls: &[X509Crl]) -> Result<()> {
        if crls.is_empty() {
            bail!("Refusing to write an empty CRL bundle");
        }
        let mut pem = Vec::new();
        for crl in crls {
            let block = crl
                .to_pem()
                .map_err(|e| anyhow!("Failed to encode CRL: {}", e))?;
            pem.extend_from_slice(&block);
        }
        atomic_write(&self.hostcrl, &pem, false)
    }

    /// Load the private key, or `None` if no key exists on disk.
    pub fn load_private_key(&self) -> Result<Option<PKey<Private>>> {
        let pem = match read_if_exists(&self.hostprivkey)? {
            Some(pem) => pem,
            None => return Ok(None),
        };
        let key = PKey::private_key_from_pem(&pem).map_err(|e| {
            anyhow!(
                "Failed to parse private key at {}: {}",
                self.hostprivkey.display(),
                e
            )
        })?;
        Ok(Some(key))
    }

    /// Atomically write the private key as PKCS#8 PEM with mode 0600.
    pub fn save_private_key(&self, key: &PKey<Private>) -> Result<()> {
        let pem = key
            .private_key_to_pem_pkcs8()
            .map_err(|e| anyhow!("Failed to encode private key to PEM: {}", e))?;
        atomic_write(&self.hostprivkey, &pem, true)
    }

    /// Load the client certificate, or `None` if no certificate exists on
    /// disk.
    pub fn load_client_cert(&self) -> Result<Option<X509>> {
        let pem = match read_if_exists(&self.hostcert)? {
            Some(pem) => pem,
            None => return Ok(None),
        };
        let cert = X509::from_pem(&pem).map_err(|e| {
            anyhow!(
                "Failed to parse client certificate at {}: {}",
                self.hostcert.display(),
                e
            )
        })?;
        Ok(Some(cert))
    }

    pub fn save_client_cert(&self, cert: &X509) -> Result<()> {
        let pem = cert
            .to_pem()
            .map_err(|e| anyhow!("Failed to encode client certificate: {}", e))?;
        atomic_write(&self.hostcert, &pem, false)
    }
}

/// Parse a PEM bundle of certificates. An empty bundle is an error.
pub(crate) fn parse_cacerts(pem: &[u8]) -> Result<Vec<X509>> {
    let certs = X509::stack_from_pem(pem)
        .map_err(|e| anyhow!("Failed to parse certificate PEM: {}", e))?;
    if certs.is_empty() {
        bail!("PEM data contained no certificates");
    }
    Ok(certs)
}

/// Parse a PEM bundle of CRLs. An empty bundle is an error.
///
/// OpenSSL has no stack reader for CRLs, so the bundle is split on PEM
/// block markers and each block parsed individually.
pub(crate) fn parse_crls(pem: &[u8]) -> Result<Vec<X509Crl>> {
    const BEGIN: &str = "-----BEGIN X509 CRL-----";
    const END: &str = "-----END X509 CRL-----";

    let text = std::str::from_utf8(pem).map_err(|_| anyhow!("CRL PEM is not valid UTF-8"))?;
    let mut crls = Vec::new();
    let mut cursor = 0;
    while let Some(start) = text[cursor..].find(BEGIN) {
        let start = cursor + start;
        let end = text[start..]
            .find(END)
            .ok_or_else(|| anyhow!("Unterminated CRL PEM block"))?
            + start
            + END.len();
        let crl = X509Crl::from_pem(text[start..end].as_bytes())
            .map_err(|e| anyhow!("Failed to parse CRL PEM: {}", e))?;
        crls.push(crl);
        cursor = end;
    }
    if crls.is_empty() {
        bail!("PEM data contained no CRLs");
    }
    Ok(crls)
}

fn read_if_exists(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write `bytes` to `path` via a temp file in the same directory followed by
/// a rename. When `private` is set the file is created with mode 0600.
fn atomic_write(path: &Path, bytes: &[u8], private: bool) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
    tmp.write_all(bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    #[cfg(unix)]
    if private {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    tmp.persist(path)
        .map_err(|e| anyhow!("Failed to move temp file into place at {}: {}", path.display(), e))?;
    Ok(())
}
