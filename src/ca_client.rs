//! Typed HTTP client for the CA's certificate endpoints.
//!
//! Uses blocking `ureq` — the bootstrap path has no async runtime. Every
//! method takes `verify_peer` and the CA bundle to trust so the single
//! unverified request a bootstrap is allowed (the very first CA fetch on an
//! empty host) is visible at the call site. When verifying, TLS trust is
//! built from exactly the supplied bundle; built-in roots are not consulted.

use crate::config::Config;
use anyhow::{anyhow, bail, Result};
use openssl::x509::X509;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Responses larger than this are truncated; certificate artifacts are far
/// smaller.
const MAX_RESPONSE_BYTES: u64 = 10 * 1024 * 1024;

/// Substrings in a 400 body that mark a CSR submission as a no-op rather
/// than a failure.
const ALREADY_EXISTS_MARKERS: [&str; 3] = [
    "already has a requested certificate",
    "already has a signed certificate",
    "already has a revoked certificate",
];

/// Result of submitting a certificate signing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOutcome {
    /// The server accepted and stored the request.
    Accepted,
    /// The server already holds a request or certificate for this name.
    AlreadyExists,
}

/// Result of asking for the signed client certificate.
#[derive(Debug)]
pub enum CertFetch {
    /// The CA returned a certificate body.
    Issued(Vec<u8>),
    /// The CA has not issued the certificate yet.
    NotReady { status: u16 },
}

/// The four CA endpoints the bootstrap machine drives.
///
/// The state machine is generic over this trait so the transition graph can
/// be exercised without sockets; [`CaClient`] is the production
/// implementation.
pub trait CaService {
    fn fetch_cacerts(&self, verify_peer: bool, cacerts: &[X509]) -> Result<Vec<u8>>;
    fn fetch_crls(&self, verify_peer: bool, cacerts: &[X509]) -> Result<Vec<u8>>;
    fn submit_csr(
        &self,
        certname: &str,
        csr_pem: &[u8],
        verify_peer: bool,
        cacerts: &[X509],
    ) -> Result<CsrOutcome>;
    fn fetch_client_cert(
        &self,
        certname: &str,
        verify_peer: bool,
        cacerts: &[X509],
    ) -> Result<CertFetch>;
}

struct CaResponse {
    status: u16,
    reason: String,
    body: Vec<u8>,
}

impl CaResponse {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct CaClient {
    base_url: String,
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl CaClient {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.ca_server.trim_end_matches('/').to_string(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
            read_timeout: Duration::from_secs(config.read_timeout_secs),
        }
    }

    /// Build an agent for a single request under the given verification
    /// policy.
    fn agent(&self, verify_peer: bool, cacerts: &[X509]) -> Result<ureq::Agent> {
        let mut tls = native_tls::TlsConnector::builder();
        if verify_peer {
            tls.disable_built_in_roots(true);
            for cert in cacerts {
                let der = cert
                    .to_der()
                    .map_err(|e| anyhow!("Failed to encode CA certificate: {}", e))?;
                let root = native_tls::Certificate::from_der(&der)
                    .map_err(|e| anyhow!("Failed to convert CA certificate for TLS trust: {}", e))?;
                tls.add_root_certificate(root);
            }
        } else {
            // Permitted only for the first CA fetch on an empty host.
            tls.danger_accept_invalid_certs(true);
            tls.danger_accept_invalid_hostnames(true);
        }
        let connector = tls
            .build()
            .map_err(|e| anyhow!("Failed to build TLS connector: {}", e))?;
        Ok(ureq::AgentBuilder::new()
            .timeout_connect(self.connect_timeout)
            .timeout_read(self.read_timeout)
            .tls_connector(Arc::new(connector))
            .build())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/puppet-ca/v1{}", self.base_url, path)
    }

    fn get(&self, path: &str, verify_peer: bool, cacerts: &[X509]) -> Result<CaResponse> {
        let url = self.url(path);
        debug!(%url, verify_peer, "GET");
        let agent = self.agent(verify_peer, cacerts)?;
        into_response(&url, agent.get(&url).call())
    }

    fn put(
        &self,
        path: &str,
        body: &[u8],
        verify_peer: bool,
        cacerts: &[X509],
    ) -> Result<CaResponse> {
        let url = self.url(path);
        debug!(%url, verify_peer, "PUT");
        let agent = self.agent(verify_peer, cacerts)?;
        into_response(
            &url,
            agent
                .put(&url)
                .set("Content-Type", "text/plain")
                .send_bytes(body),
        )
    }
}

impl CaService for CaClient {
    fn fetch_cacerts(&self, verify_peer: bool, cacerts: &[X509]) -> Result<Vec<u8>> {
        let response = self.get("/certificate/ca", verify_peer, cacerts)?;
        interpret_cacerts_response(&response)
    }

    fn fetch_crls(&self, verify_peer: bool, cacerts: &[X509]) -> Result<Vec<u8>> {
        let response = self.get("/certificate_revocation_list/ca", verify_peer, cacerts)?;
        interpret_crls_response(&response)
    }

    fn submit_csr(
        &self,
        certname: &str,
        csr_pem: &[u8],
        verify_peer: bool,
        cacerts: &[X509],
    ) -> Result<CsrOutcome> {
        let path = format!("/certificate_request/{}", certname);
        let response = self.put(&path, csr_pem, verify_peer, cacerts)?;
        interpret_csr_response(&response)
    }

    fn fetch_client_cert(
        &self,
        certname: &str,
        verify_peer: bool,
        cacerts: &[X509],
    ) -> Result<CertFetch> {
        let path = format!("/certificate/{}", certname);
        let response = self.get(&path, verify_peer, cacerts)?;
        Ok(interpret_cert_response(response))
    }
}

/// Collapse a ureq result into a status/reason/body triple. HTTP error
/// statuses are data here; only transport failures are errors.
fn into_response(
    url: &str,
    result: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<CaResponse> {
    let response = match result {
        Ok(response) => response,
        Err(ureq::Error::Status(_, response)) => response,
        Err(ureq::Error::Transport(t)) => bail!("Request to {} failed: {}", url, t),
    };
    let status = response.status();
    let reason = response.status_text().to_string();
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_RESPONSE_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| anyhow!("Failed to read response from {}: {}", url, e))?;
    Ok(CaResponse {
        status,
        reason,
        body,
    })
}

fn interpret_cacerts_response(response: &CaResponse) -> Result<Vec<u8>> {
    if response.is_success() {
        return Ok(response.body.clone());
    }
    match response.status {
        404 => bail!("CA certificate is missing from the server"),
        _ => bail!("Could not download CA certificate: {}", response.reason),
    }
}

fn interpret_crls_response(response: &CaResponse) -> Result<Vec<u8>> {
    if response.is_success() {
        return Ok(response.body.clone());
    }
    match response.status {
        404 => bail!("CRL is missing from the server"),
        _ => bail!("Could not download CRLs: {}", response.reason),
    }
}

fn interpret_csr_response(response: &CaResponse) -> Result<CsrOutcome> {
    if response.is_success() {
        return Ok(CsrOutcome::Accepted);
    }
    if response.status == 400 {
        let body = response.body_text();
        if ALREADY_EXISTS_MARKERS
            .iter()
            .any(|marker| body.contains(marker))
        {
            return Ok(CsrOutcome::AlreadyExists);
        }
    }
    bail!("Failed to submit the CSR, HTTP response was {}", response.status)
}

fn interpret_cert_response(response: CaResponse) -> CertFetch {
    if response.is_success() {
        CertFetch::Issued(response.body)
    } else {
        CertFetch::NotReady {
            status: response.status,
        }
    }
}
