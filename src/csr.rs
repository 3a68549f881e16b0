//! PKCS#10 certificate request construction.
//!
//! Builds the CSR the agent submits to the CA: subject CN is the certname,
//! the key is the agent's RSA private key, and the request optionally
//! carries a subject-alternative-name extension and extension requests
//! inside the `extensionRequest` attribute, plus custom attributes as
//! standalone PKCS#9 attributes, read from a TOML attributes document.

use anyhow::{anyhow, bail, Context, Result};
use openssl::asn1::{Asn1Object, Asn1OctetString};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::sign::Signer;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509Extension, X509Name, X509Req};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// PKCS#10 requests are version 1, encoded as 0
const PKCS10_VERSION: i32 = 0;

/// One parsed `dns_alt_names` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AltName {
    Dns(String),
    Ip(String),
}

/// Contents of the CSR attributes document: two tables mapping dotted OIDs
/// to string values.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct CsrAttributes {
    #[serde(default)]
    pub custom_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub extension_requests: BTreeMap<String, String>,
}

impl CsrAttributes {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSR attributes file: {}", path.display()))?;
        let attributes: CsrAttributes = toml::from_str(&text)
            .with_context(|| format!("Failed to parse CSR attributes file: {}", path.display()))?;
        Ok(attributes)
    }
}

/// Parse a comma-separated `dns_alt_names` value.
///
/// Each token is `DNS:<name>`, `IP:<address>`, or a bare name which defaults
/// to DNS. Whenever any alt names are configured the certname itself is
/// included as a DNS entry.
pub fn parse_alt_names(certname: &str, value: &str) -> Vec<AltName> {
    let mut names = Vec::new();
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if let Some(rest) = token.strip_prefix("IP:") {
            names.push(AltName::Ip(rest.trim().to_string()));
        } else if let Some(rest) = token.strip_prefix("DNS:") {
            names.push(AltName::Dns(rest.trim().to_string()));
        } else {
            names.push(AltName::Dns(token.to_string()));
        }
    }
    if !names.is_empty() {
        let certname_entry = AltName::Dns(certname.to_string());
        if !names.contains(&certname_entry) {
            names.push(certname_entry);
        }
    }
    names
}

// ================= CSR Builder =================

/// Builder for the agent's PKCS#10 certificate signing request.
///
/// # Example
/// ```no_run
/// # use cert_agent::csr::CsrBuilder;
/// # fn example(key: openssl::pkey::PKey<openssl::pkey::Private>) -> anyhow::Result<()> {
/// let csr = CsrBuilder::new("agent.example.com", key)
///     .dns_alt_names("DNS:agent,IP:10.0.0.5")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct CsrBuilder {
    certname: String,
    key: PKey<Private>,
    alt_names: Vec<AltName>,
    attributes: CsrAttributes,
}

impl CsrBuilder {
    pub fn new(certname: &str, key: PKey<Private>) -> Self {
        Self {
            certname: certname.to_string(),
            key,
            alt_names: Vec::new(),
            attributes: CsrAttributes::default(),
        }
    }

    /// Set subject alternative names from a comma-separated list.
    pub fn dns_alt_names(mut self, value: &str) -> Self {
        self.alt_names = parse_alt_names(&self.certname, value);
        self
    }

    /// Attach custom attributes and extension requests.
    pub fn attributes(mut self, attributes: CsrAttributes) -> Self {
        self.attributes = attributes;
        self
    }

    /// Build the request: subject CN = certname, signed with the private
    /// key using SHA-256.
    ///
    /// The SAN extension and `extension_requests` travel in the request's
    /// `extensionRequest` attribute; each `custom_attributes` entry becomes
    /// its own top-level attribute.
    pub fn build(self) -> Result<X509Req> {
        let mut builder =
            X509Req::builder().map_err(|e| anyhow!("Failed to create CSR builder: {}", e))?;

        builder
            .set_version(PKCS10_VERSION)
            .map_err(|e| anyhow!("Failed to set CSR version: {}", e))?;

        let mut name_builder =
            X509Name::builder().map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, &self.certname)
            .map_err(|e| anyhow!("Failed to set CN: {}", e))?;
        let subject = name_builder.build();

        builder
            .set_subject_name(&subject)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;

        builder
            .set_pubkey(&self.key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let mut extensions =
            Stack::new().map_err(|e| anyhow!("Failed to create extension stack: {}", e))?;

        if !self.alt_names.is_empty() {
            let mut san = SubjectAlternativeName::new();
            for alt_name in &self.alt_names {
                match alt_name {
                    AltName::Dns(name) => {
                        san.dns(name);
                    }
                    AltName::Ip(address) => {
                        san.ip(address);
                    }
                }
            }
            let extension = {
                let context = builder.x509v3_context(None);
                san.build(&context)
                    .map_err(|e| anyhow!("Failed to build SubjectAlternativeName: {}", e))?
            };
            extensions
                .push(extension)
                .map_err(|e| anyhow!("Failed to add SubjectAlternativeName: {}", e))?;
        }

        for (oid, value) in &self.attributes.extension_requests {
            let extension = custom_extension(oid, value)?;
            extensions
                .push(extension)
                .map_err(|e| anyhow!("Failed to add extension {}: {}", oid, e))?;
        }

        if !self.alt_names.is_empty() || !self.attributes.extension_requests.is_empty() {
            builder
                .add_extensions(&extensions)
                .map_err(|e| anyhow!("Failed to attach extension request: {}", e))?;
        }

        builder
            .sign(&self.key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign CSR: {}", e))?;

        let request = builder.build();
        if self.attributes.custom_attributes.is_empty() {
            return Ok(request);
        }
        attach_custom_attributes(&request, &self.attributes.custom_attributes, &self.key)
    }
}

/// Build a non-critical extension carrying `value` as a DER UTF8String
/// under the given dotted OID.
fn custom_extension(oid: &str, value: &str) -> Result<X509Extension> {
    let object =
        Asn1Object::from_str(oid).map_err(|e| anyhow!("Invalid OID '{}': {}", oid, e))?;
    let contents = Asn1OctetString::new_from_bytes(&der_utf8_string(value))
        .map_err(|e| anyhow!("Failed to wrap extension value for {}: {}", oid, e))?;
    X509Extension::new_from_der(&object, false, &contents)
        .map_err(|e| anyhow!("Failed to build extension {}: {}", oid, e))
}

/// Splice each custom attribute into the signed request's
/// `CertificationRequestInfo` attribute set as its own PKCS#9 attribute
/// (`SEQUENCE { type OID, values SET OF UTF8String }`), then re-sign.
///
/// The request builder only exposes the `extensionRequest` attribute, so
/// standalone attributes are added at the DER level: the request info is
/// split into its elements, the attribute set is extended, and the rebuilt
/// info is signed again with the same key and digest.
fn attach_custom_attributes(
    request: &X509Req,
    custom_attributes: &BTreeMap<String, String>,
    key: &PKey<Private>,
) -> Result<X509Req> {
    let request_der = request
        .to_der()
        .map_err(|e| anyhow!("Failed to encode CSR: {}", e))?;

    // CertificationRequest ::= SEQUENCE { info, signatureAlgorithm, signature }
    let (outer_tlv, outer_content, _) = take_tlv(&request_der)?;
    if outer_tlv[0] != 0x30 {
        bail!("Malformed CSR: expected CertificationRequest");
    }
    let (info_tlv, info_content, rest) = take_tlv(outer_content)?;
    if info_tlv[0] != 0x30 {
        bail!("Malformed CSR: expected CertificationRequestInfo");
    }
    let (algorithm_tlv, _, _) = take_tlv(rest)?;

    // info ::= SEQUENCE { version, subject, subjectPKInfo, [0] attributes }
    let (version_tlv, _, r) = take_tlv(info_content)?;
    let (subject_tlv, _, r) = take_tlv(r)?;
    let (spki_tlv, _, r) = take_tlv(r)?;
    let mut attributes = if r.is_empty() {
        Vec::new()
    } else {
        let (attributes_tlv, attributes_content, _) = take_tlv(r)?;
        if attributes_tlv[0] != 0xa0 {
            bail!("Malformed CSR: expected attribute set");
        }
        attributes_content.to_vec()
    };

    for (oid, value) in custom_attributes {
        let attribute = der(
            0x30,
            &[der_oid(oid)?, der(0x31, &der_utf8_string(value))].concat(),
        );
        attributes.extend_from_slice(&attribute);
    }

    let info = der(
        0x30,
        &[
            version_tlv,
            subject_tlv,
            spki_tlv,
            &der(0xa0, &attributes)[..],
        ]
        .concat(),
    );

    let mut signer = Signer::new(MessageDigest::sha256(), key)
        .map_err(|e| anyhow!("Failed to create CSR signer: {}", e))?;
    signer
        .update(&info)
        .map_err(|e| anyhow!("Failed to sign CSR: {}", e))?;
    let signature = signer
        .sign_to_vec()
        .map_err(|e| anyhow!("Failed to sign CSR: {}", e))?;
    let mut signature_bits = vec![0x00];
    signature_bits.extend_from_slice(&signature);

    let rebuilt = der(
        0x30,
        &[&info[..], algorithm_tlv, &der(0x03, &signature_bits)[..]].concat(),
    );
    X509Req::from_der(&rebuilt).map_err(|e| anyhow!("Failed to rebuild CSR: {}", e))
}

/// DER-encode a string as an ASN.1 UTF8String (tag 0x0c).
fn der_utf8_string(value: &str) -> Vec<u8> {
    der(0x0c, value.as_bytes())
}

/// DER-encode a dotted OID string (tag 0x06).
fn der_oid(oid: &str) -> Result<Vec<u8>> {
    let arcs = oid
        .split('.')
        .map(|arc| arc.parse::<u64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| anyhow!("Invalid OID '{}'", oid))?;
    if arcs.len() < 2 || arcs[0] > 2 || (arcs[0] < 2 && arcs[1] >= 40) {
        bail!("Invalid OID '{}'", oid);
    }
    let mut content = base128(arcs[0] * 40 + arcs[1]);
    for arc in &arcs[2..] {
        content.extend_from_slice(&base128(*arc));
    }
    Ok(der(0x06, &content))
}

/// Base-128 encoding with the continuation bit set on all but the last
/// octet.
fn base128(mut value: u64) -> Vec<u8> {
    let mut out = vec![(value & 0x7f) as u8];
    value >>= 7;
    while value > 0 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.reverse();
    out
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&der_length(content.len()));
    out.extend_from_slice(content);
    out
}

fn der_length(len: usize) -> Vec<u8> {
    if len < 128 {
        return vec![len as u8];
    }
    let mut octets = Vec::new();
    let mut remaining = len;
    while remaining > 0 {
        octets.push((remaining & 0xff) as u8);
        remaining >>= 8;
    }
    octets.reverse();
    let mut encoded = vec![0x80 | octets.len() as u8];
    encoded.extend_from_slice(&octets);
    encoded
}

/// Split the leading TLV element off `input`: (whole element, content,
/// remainder).
fn take_tlv(input: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    if input.len() < 2 {
        bail!("Truncated DER element");
    }
    let (len, len_octets) = if input[1] < 0x80 {
        (input[1] as usize, 1)
    } else {
        let count = (input[1] & 0x7f) as usize;
        if count == 0 || count > 4 || input.len() < 2 + count {
            bail!("Unsupported DER length");
        }
        let mut len = 0usize;
        for &octet in &input[2..2 + count] {
            len = (len << 8) | octet as usize;
        }
        (len, 1 + count)
    };
    let header = 1 + len_octets;
    let end = header + len;
    if input.len() < end {
        bail!("Truncated DER element");
    }
    Ok((&input[..end], &input[header..end], &input[end..]))
}
