//! Immutable trust material produced by the bootstrap state machine.

use anyhow::{anyhow, Result};
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Crl, X509StoreContext, X509};

/// Immutable collection of trust material used to open TLS connections.
///
/// Built incrementally by the state machine and handed to the caller from
/// its terminal state. A context returned from a successful bootstrap always
/// verifies peers; the builder-side `verify_peer` flag exists so the one
/// unverified request a cold bootstrap performs is represented explicitly.
pub struct SslContext {
    cacerts: Vec<X509>,
    crls: Vec<X509Crl>,
    verify_peer: bool,
    private_key: Option<PKey<Private>>,
    client_cert: Option<X509>,
}

impl SslContext {
    pub(crate) fn new(
        cacerts: Vec<X509>,
        crls: Vec<X509Crl>,
        verify_peer: bool,
        private_key: Option<PKey<Private>>,
        client_cert: Option<X509>,
    ) -> Self {
        Self {
            cacerts,
            crls,
            verify_peer,
            private_key,
            client_cert,
        }
    }

    /// The trusted CA chain, root last.
    pub fn cacerts(&self) -> &[X509] {
        &self.cacerts
    }

    /// Revocation lists aligned with the CA chain; empty when revocation
    /// checking is disabled.
    pub fn crls(&self) -> &[X509Crl] {
        &self.crls
    }

    pub fn verify_peer(&self) -> bool {
        self.verify_peer
    }

    pub fn private_key(&self) -> Option<&PKey<Private>> {
        self.private_key.as_ref()
    }

    pub fn client_cert(&self) -> Option<&X509> {
        self.client_cert.as_ref()
    }

    /// Verify that the client certificate chains to the trusted CA bundle.
    ///
    /// # Errors
    ///
    /// Returns an error if no client certificate is loaded, if the trust
    /// store cannot be built, or if chain verification fails.
    pub fn verify_client_cert(&self) -> Result<()> {
        let cert = self
            .client_cert
            .as_ref()
            .ok_or_else(|| anyhow!("No client certificate loaded"))?;

        let mut store_builder = X509StoreBuilder::new()
            .map_err(|e| anyhow!("Failed to create certificate store: {}", e))?;
        for ca in &self.cacerts {
            store_builder
                .add_cert(ca.clone())
                .map_err(|e| anyhow!("Failed to add CA certificate to store: {}", e))?;
        }
        let store = store_builder.build();

        let chain = Stack::new().map_err(|e| anyhow!("Failed to create chain stack: {}", e))?;
        let mut store_ctx = X509StoreContext::new()
            .map_err(|e| anyhow!("Failed to create store context: {}", e))?;
        let valid = store_ctx
            .init(&store, cert, &chain, |ctx| ctx.verify_cert())
            .map_err(|e| anyhow!("Certificate verification could not run: {}", e))?;

        if valid {
            Ok(())
        } else {
            Err(anyhow!(
                "Certificate does not chain to the trusted CA bundle"
            ))
        }
    }
}

// Key material is deliberately absent from the debug output.
impl std::fmt::Debug for SslContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SslContext")
            .field("cacerts", &self.cacerts.len())
            .field("crls", &self.crls.len())
            .field("verify_peer", &self.verify_peer)
            .field("has_private_key", &self.private_key.is_some())
            .field("has_client_cert", &self.client_cert.is_some())
            .finish()
    }
}
