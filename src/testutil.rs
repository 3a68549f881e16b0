//! Throwaway PKI fixtures for tests: a self-signed CA, end-entity
//! certificates, and a structurally valid CRL.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage};
use openssl::x509::{X509Crl, X509Name, X509};

// 2048-bit keys keep the test suite fast; production uses 4096.
const TEST_RSA_BITS: u32 = 2048;
const X509_VERSION_3: i32 = 2;

pub(crate) fn test_key() -> PKey<Private> {
    let rsa = openssl::rsa::Rsa::generate(TEST_RSA_BITS).unwrap();
    PKey::from_rsa(rsa).unwrap()
}

/// Generate a self-signed CA certificate and its key.
pub(crate) fn test_ca(cn: &str) -> (PKey<Private>, X509) {
    let key = test_key();
    let name = cn_name(cn);

    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.set_pubkey(&key).unwrap();

    let mut bc = BasicConstraints::new();
    bc.critical().ca();
    builder.append_extension(bc.build().unwrap()).unwrap();
    let mut ku = KeyUsage::new();
    ku.critical().key_cert_sign().crl_sign().digital_signature();
    builder.append_extension(ku.build().unwrap()).unwrap();

    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (key, builder.build())
}

/// Issue an end-entity certificate for a fresh key.
pub(crate) fn issue_cert(
    ca_key: &PKey<Private>,
    ca_cert: &X509,
    cn: &str,
) -> (PKey<Private>, X509) {
    let key = test_key();
    let cert = issue_cert_for_key(ca_key, ca_cert, &key, cn);
    (key, cert)
}

/// Issue an end-entity certificate bound to an existing key.
pub(crate) fn issue_cert_for_key(
    ca_key: &PKey<Private>,
    ca_cert: &X509,
    subject_key: &PKey<Private>,
    cn: &str,
) -> X509 {
    let mut builder = X509::builder().unwrap();
    builder.set_version(X509_VERSION_3).unwrap();
    builder.set_serial_number(&random_serial()).unwrap();
    builder.set_subject_name(&cn_name(cn)).unwrap();
    builder.set_issuer_name(ca_cert.subject_name()).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.set_pubkey(subject_key).unwrap();

    let mut bc = BasicConstraints::new();
    bc.critical();
    builder.append_extension(bc.build().unwrap()).unwrap();
    let mut ku = KeyUsage::new();
    ku.critical().digital_signature().key_encipherment();
    builder.append_extension(ku.build().unwrap()).unwrap();

    builder.sign(ca_key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// A structurally valid CRL for the given issuer CN.
///
/// rust-openssl has no CRL builder, so the DER is assembled directly; the
/// signature bits are filler, which is fine because nothing in the crate
/// verifies CRL signatures.
pub(crate) fn test_crl(issuer_cn: &str) -> X509Crl {
    // sha256WithRSAEncryption
    const SIG_ALG_OID: [u8; 9] = [0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b];
    // id-at-commonName
    const CN_OID: [u8; 3] = [0x55, 0x04, 0x03];

    let alg_id = der(
        0x30,
        &[der(0x06, &SIG_ALG_OID), der(0x05, &[])].concat(),
    );
    let attribute = der(
        0x30,
        &[der(0x06, &CN_OID), der(0x0c, issuer_cn.as_bytes())].concat(),
    );
    let issuer = der(0x30, &der(0x31, &attribute));
    let this_update = der(0x17, b"250101000000Z");
    let next_update = der(0x17, b"260101000000Z");

    let tbs = der(
        0x30,
        &[alg_id.clone(), issuer, this_update, next_update].concat(),
    );
    let signature = der(0x03, &[0x00, 0xde, 0xad, 0xbe, 0xef]);
    let crl_der = der(0x30, &[tbs, alg_id, signature].concat());

    X509Crl::from_der(&crl_der).expect("hand-built CRL must parse")
}

fn cn_name(cn: &str) -> X509Name {
    let mut name_builder = X509Name::builder().unwrap();
    name_builder
        .append_entry_by_nid(Nid::COMMONNAME, cn)
        .unwrap();
    name_builder.build()
}

fn random_serial() -> openssl::asn1::Asn1Integer {
    let mut serial = BigNum::new().unwrap();
    serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
    serial.to_asn1_integer().unwrap()
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    if content.len() < 128 {
        out.push(content.len() as u8);
    } else {
        let mut octets = Vec::new();
        let mut remaining = content.len();
        while remaining > 0 {
            octets.push((remaining & 0xff) as u8);
            remaining >>= 8;
        }
        octets.reverse();
        out.push(0x80 | octets.len() as u8);
        out.extend_from_slice(&octets);
    }
    out.extend_from_slice(content);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_cert_matches_its_key() {
        let (ca_key, ca_cert) = test_ca("Fixture CA");
        let (key, cert) = issue_cert(&ca_key, &ca_cert, "node.example.com");
        assert!(cert.public_key().unwrap().public_eq(&key));
    }

    #[test]
    fn crl_fixture_roundtrips_through_pem() {
        let crl = test_crl("Fixture CA");
        let pem = crl.to_pem().unwrap();
        let reparsed = X509Crl::from_pem(&pem).unwrap();
        assert_eq!(reparsed.to_der().unwrap(), crl.to_der().unwrap());
    }
}
