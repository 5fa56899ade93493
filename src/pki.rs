//! Self-signed client certificates for data planes.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),

    #[error("Secret is missing the {0} key")]
    MissingKey(&'static str),

    #[error("Secret key {0} does not contain a PEM block")]
    NotPem(&'static str),
}

/// PEM-encoded certificate and private key.
#[derive(Clone, Debug)]
pub struct KeyPairPem {
    pub cert: String,
    pub key: String,
}

impl KeyPairPem {
    /// Secret data in the `kubernetes.io/tls` layout
    pub fn secret_data(&self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (
                TLS_CERT_KEY.to_string(),
                ByteString(self.cert.as_bytes().to_vec()),
            ),
            (
                TLS_PRIVATE_KEY_KEY.to_string(),
                ByteString(self.key.as_bytes().to_vec()),
            ),
        ])
    }

    /// Read a key pair back out of `kubernetes.io/tls` Secret data.
    pub fn from_secret_data(data: Option<&BTreeMap<String, ByteString>>) -> Result<Self, PkiError> {
        let read = |key: &'static str| -> Result<String, PkiError> {
            let bytes = data
                .and_then(|d| d.get(key))
                .ok_or(PkiError::MissingKey(key))?;
            let text = String::from_utf8(bytes.0.clone()).map_err(|_| PkiError::NotPem(key))?;
            if !text.contains("-----BEGIN") {
                return Err(PkiError::NotPem(key));
            }
            Ok(text)
        };

        Ok(Self {
            cert: read(TLS_CERT_KEY)?,
            key: read(TLS_PRIVATE_KEY_KEY)?,
        })
    }

    /// Stable digest of the certificate, used to roll pods when it changes.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.cert.as_bytes());
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Generate a self-signed client certificate with the given common name.
pub fn generate_client_certificate(common_name: &str) -> Result<KeyPairPem, PkiError> {
    let key_pair = KeyPair::generate()?;

    let mut params = CertificateParams::new(Vec::<String>::new())?;
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

    let cert = params.self_signed(&key_pair)?;

    Ok(KeyPairPem {
        cert: cert.pem(),
        key: key_pair.serialize_pem(),
    })
}
