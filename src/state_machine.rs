//! The bootstrap transition graph.
//!
//! Drives a node from empty on-disk state to a full credential set:
//!
//! ```text
//! NeedCaCerts -> NeedCrls -> NeedKey -> NeedSubmitCsr -> NeedCert -> Done
//!                                                              \
//!                                                               \-> Wait -> NeedCaCerts
//! ```
//!
//! Each state prefers the on-disk artifact, falls back to the CA server,
//! and persists a fetched artifact only after it parses. Parse errors and
//! unexpected server responses are fatal; a certificate that is simply not
//! issued yet routes through `Wait`, which either polls again or ends the
//! run with an explicit exit outcome.

use crate::ca_client::{CaService, CertFetch, CsrOutcome};
use crate::cert_provider::{self, CertProvider};
use crate::config::Config;
use crate::csr::{CsrAttributes, CsrBuilder};
use crate::ssl_context::SslContext;
use anyhow::{anyhow, bail, Context, Result};
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::x509::{X509Crl, X509};
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

const RSA_KEY_SIZE: u32 = 4096;

/// Terminal result of a bootstrap run.
///
/// `Exit` models "terminate the process" as a value so callers map it to an
/// exit code and tests observe it directly.
#[derive(Debug)]
pub enum Outcome {
    /// Credentials are complete and consistent.
    Done(SslContext),
    /// The run stops without credentials.
    Exit { code: i32, message: String },
}

impl Outcome {
    /// The SSL context, if the run completed.
    pub fn ssl_context(&self) -> Option<&SslContext> {
        match self {
            Outcome::Done(context) => Some(context),
            Outcome::Exit { .. } => None,
        }
    }
}

/// One state of the bootstrap machine; each variant carries exactly the
/// data its successor needs.
enum State {
    NeedCaCerts,
    NeedCrls {
        cacerts: Vec<X509>,
    },
    NeedKey {
        cacerts: Vec<X509>,
        crls: Vec<X509Crl>,
    },
    NeedSubmitCsr {
        cacerts: Vec<X509>,
        crls: Vec<X509Crl>,
        key: PKey<Private>,
    },
    NeedCert {
        cacerts: Vec<X509>,
        crls: Vec<X509Crl>,
        key: PKey<Private>,
    },
    Wait,
    Done(SslContext),
}

pub struct StateMachine<'a, C: CaService> {
    config: &'a Config,
    provider: CertProvider,
    ca: C,
}

impl<'a, C: CaService> StateMachine<'a, C> {
    pub fn new(config: &'a Config, provider: CertProvider, ca: C) -> Self {
        Self {
            config,
            provider,
            ca,
        }
    }

    /// Run the machine to a terminal outcome.
    ///
    /// # Errors
    ///
    /// Fatal conditions (malformed artifacts, unexpected server responses,
    /// an on-disk certificate that does not match its key) surface as
    /// errors; "certificate not issued yet" never does.
    pub fn run(&self) -> Result<Outcome> {
        let mut state = State::NeedCaCerts;
        loop {
            state = match state {
                State::NeedCaCerts => self.need_cacerts()?,
                State::NeedCrls { cacerts } => self.need_crls(cacerts)?,
                State::NeedKey { cacerts, crls } => self.need_key(cacerts, crls)?,
                State::NeedSubmitCsr {
                    cacerts,
                    crls,
                    key,
                } => self.need_submit_csr(cacerts, crls, key)?,
                State::NeedCert {
                    cacerts,
                    crls,
                    key,
                } => self.need_cert(cacerts, crls, key)?,
                State::Wait => {
                    if self.config.onetime || self.config.waitforcert == 0 {
                        return Ok(Outcome::Exit {
                            code: 1,
                            message: "Exiting; no certificate found and waitforcert is disabled"
                                .to_string(),
                        });
                    }
                    info!(
                        seconds = self.config.waitforcert,
                        "Certificate not yet issued, waiting before retrying"
                    );
                    thread::sleep(Duration::from_secs(self.config.waitforcert));
                    State::NeedCaCerts
                }
                State::Done(context) => return Ok(Outcome::Done(context)),
            };
        }
    }

    /// Prefer the on-disk CA bundle; otherwise fetch it. The fetch is the
    /// only request of a run permitted to skip peer verification, and only
    /// a bundle that parses is persisted.
    fn need_cacerts(&self) -> Result<State> {
        if let Some(cacerts) = self.provider.load_cacerts()? {
            info!(count = cacerts.len(), "Loaded CA bundle from disk");
            return Ok(State::NeedCrls { cacerts });
        }

        info!("No local CA bundle, downloading it from the CA server");
        let pem = self.ca.fetch_cacerts(false, &[])?;
        let cacerts =
            cert_provider::parse_cacerts(&pem).context("Failed to parse downloaded CA bundle")?;
        self.provider.save_cacerts(&cacerts)?;
        info!(count = cacerts.len(), "Downloaded and saved the CA bundle");
        Ok(State::NeedCrls { cacerts })
    }

    /// Mirror of [`Self::need_cacerts`] for the CRL bundle, skipped
    /// entirely when revocation checking is disabled.
    fn need_crls(&self, cacerts: Vec<X509>) -> Result<State> {
        if !self.config.certificate_revocation {
            info!("Certificate revocation checking is disabled, skipping CRLs");
            return Ok(State::NeedKey {
                cacerts,
                crls: Vec::new(),
            });
        }

        if let Some(crls) = self.provider.load_crls()? {
            info!(count = crls.len(), "Loaded CRLs from disk");
            return Ok(State::NeedKey { cacerts, crls });
        }

        info!("No local CRLs, downloading them from the CA server");
        let pem = self.ca.fetch_crls(true, &cacerts)?;
        let crls = cert_provider::parse_crls(&pem).context("Failed to parse downloaded CRLs")?;
        self.provider.save_crls(&crls)?;
        info!(count = crls.len(), "Downloaded and saved the CRLs");
        Ok(State::NeedKey { cacerts, crls })
    }

    /// Load or create the private key. A key with a matching on-disk
    /// certificate short-circuits the run; a mismatched on-disk pair is
    /// fatal. A present-but-corrupt key propagates its parse error and is
    /// never overwritten.
    fn need_key(&self, cacerts: Vec<X509>, crls: Vec<X509Crl>) -> Result<State> {
        if let Some(key) = self.provider.load_private_key()? {
            if let Some(cert) = self.provider.load_client_cert()? {
                if cert_matches_key(&cert, &key) {
                    info!("Using existing private key and client certificate");
                    return Ok(State::Done(SslContext::new(
                        cacerts,
                        crls,
                        true,
                        Some(key),
                        Some(cert),
                    )));
                }
                bail!(
                    "The certificate for '{}' does not match its private key",
                    subject_cn(&cert)
                );
            }
            info!("Using existing private key");
            return Ok(State::NeedSubmitCsr {
                cacerts,
                crls,
                key,
            });
        }

        info!(bits = RSA_KEY_SIZE, "Generating a new RSA private key");
        let rsa = openssl::rsa::Rsa::generate(RSA_KEY_SIZE)
            .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;
        let key =
            PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))?;
        self.provider.save_private_key(&key)?;
        Ok(State::NeedSubmitCsr {
            cacerts,
            crls,
            key,
        })
    }

    /// Build and submit the CSR. An "already exists" response is success;
    /// everything else non-2xx is fatal.
    fn need_submit_csr(
        &self,
        cacerts: Vec<X509>,
        crls: Vec<X509Crl>,
        key: PKey<Private>,
    ) -> Result<State> {
        let mut builder = CsrBuilder::new(&self.config.certname, key.clone());
        if let Some(alt_names) = &self.config.dns_alt_names {
            builder = builder.dns_alt_names(alt_names);
        }
        if let Some(path) = &self.config.csr_attributes {
            builder = builder.attributes(CsrAttributes::from_file(path)?);
        }
        let csr = builder.build()?;
        let csr_pem = csr
            .to_pem()
            .map_err(|e| anyhow!("Failed to encode CSR to PEM: {}", e))?;

        match self
            .ca
            .submit_csr(&self.config.certname, &csr_pem, true, &cacerts)?
        {
            CsrOutcome::Accepted => info!("Submitted certificate request"),
            CsrOutcome::AlreadyExists => {
                info!("Certificate request already submitted, checking for a signed certificate")
            }
        }
        Ok(State::NeedCert {
            cacerts,
            crls,
            key,
        })
    }

    /// Ask for the signed certificate. Anything short of a parseable
    /// certificate matching our key routes to `Wait`; a match is persisted
    /// and completes the run.
    fn need_cert(
        &self,
        cacerts: Vec<X509>,
        crls: Vec<X509Crl>,
        key: PKey<Private>,
    ) -> Result<State> {
        let fetch = match self
            .ca
            .fetch_client_cert(&self.config.certname, true, &cacerts)
        {
            Ok(fetch) => fetch,
            Err(e) => {
                warn!("Failed to fetch the client certificate: {:#}", e);
                return Ok(State::Wait);
            }
        };

        let pem = match fetch {
            CertFetch::Issued(pem) => pem,
            CertFetch::NotReady { status } => {
                info!(status, "Certificate not yet issued by the CA");
                return Ok(State::Wait);
            }
        };

        let cert = match X509::from_pem(&pem) {
            Ok(cert) => cert,
            Err(e) => {
                warn!("Downloaded certificate could not be parsed: {}", e);
                return Ok(State::Wait);
            }
        };

        if !cert_matches_key(&cert, &key) {
            warn!(
                subject = %subject_cn(&cert),
                "Downloaded certificate does not match the private key"
            );
            return Ok(State::Wait);
        }

        self.provider.save_client_cert(&cert)?;
        info!(subject = %subject_cn(&cert), "Downloaded and saved the client certificate");
        Ok(State::Done(SslContext::new(
            cacerts,
            crls,
            true,
            Some(key),
            Some(cert),
        )))
    }
}

/// Whether the certificate's public key equals the private key's public
/// half.
fn cert_matches_key<T: HasPublic>(cert: &X509, key: &PKeyRef<T>) -> bool {
    match cert.public_key() {
        Ok(cert_key) => cert_key.public_eq(key),
        Err(_) => false,
    }
}

/// The certificate's subject CN, for diagnostics.
fn subject_cn(cert: &X509) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
        .unwrap_or_else(|| "<unknown subject>".to_string())
}
