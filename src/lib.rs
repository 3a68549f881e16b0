//! Agent-side SSL bootstrap.
//!
//! Drives a node from an empty on-disk state to a complete, self-consistent
//! credential set for talking to a central CA server: the CA certificate
//! bundle, the certificate revocation lists, an RSA key pair, a submitted
//! PKCS#10 signing request, and finally a client certificate that matches
//! the private key. A successful run hands back an immutable [`SslContext`]
//! ready for use by higher layers.
//!
//! # Overview
//!
//! ```text
//! NeedCaCerts -> NeedCrls -> NeedKey -> NeedSubmitCsr -> NeedCert -> Done
//!                                                              \
//!                                                               \-> Wait
//! ```
//!
//! Every state prefers the artifact already on disk, falls back to the CA's
//! HTTP API, and persists fetched material only after it parses. The single
//! request allowed to skip TLS peer verification is the very first CA
//! bundle download on an empty host; every request after that verifies the
//! server against the bundle accepted in that run.
//!
//! The polling loop is bounded by configuration: `waitforcert` seconds
//! between issuance polls, or an immediate exit when polling is disabled
//! (`onetime` or `waitforcert = 0`).
//!
//! # Quick Start
//!
//! ```no_run
//! use cert_agent::{CaClient, CertProvider, Config, Outcome, StateMachine};
//!
//! # fn example() -> anyhow::Result<()> {
//! let config = Config::load()?;
//! let provider = CertProvider::new(&config);
//! let client = CaClient::new(&config);
//! match StateMachine::new(&config, provider, client).run()? {
//!     Outcome::Done(context) => { /* open TLS connections with context */ }
//!     Outcome::Exit { code, message } => {
//!         println!("{}", message);
//!         std::process::exit(code);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod ca_client;
pub mod cert_provider;
pub mod config;
pub mod csr;
pub mod ssl_context;
pub mod state_machine;

pub use ca_client::{CaClient, CaService, CertFetch, CsrOutcome};
pub use cert_provider::CertProvider;
pub use config::Config;
pub use csr::{CsrAttributes, CsrBuilder};
pub use ssl_context::SslContext;
pub use state_machine::{Outcome, StateMachine};

#[cfg(test)]
pub(crate) mod testutil;
