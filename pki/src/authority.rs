use std::sync::atomic::{AtomicU64, Ordering};

use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use tracing::debug;

use crate::{
    error::IssuanceError,
    subject::{LeafRequest, Subject},
};

/// Trust anchors outlive every cluster they sign for.
pub const CA_VALIDITY_DAYS: i64 = 10_000;

pub const LEAF_VALIDITY_DAYS: i64 = 365;

fn compute_validity(days: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(days))
}

/// Leaf certificate plus the key it was issued for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub subject: Subject,
    /// Common name of the signing authority.
    pub issuer: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Self-signed CA. Leaf serials come from a per-authority counter, so one
/// authority can be shared between threads issuing in parallel.
#[derive(Debug)]
pub struct CertificateAuthority {
    name: String,
    key_pem: String,
    cert_pem: String,
    next_serial: AtomicU64,
}

impl CertificateAuthority {
    pub fn issue(name: &str) -> Result<Self, IssuanceError> {
        let subject = Subject::Authority {
            name: name.to_owned(),
        };
        let mut params = CertificateParams::default();
        params.distinguished_name = subject.distinguished_name();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|source| IssuanceError::KeyGeneration {
            identity: subject.to_string(),
            source,
        })?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|source| IssuanceError::Signing {
                identity: subject.to_string(),
                source,
            })?;

        debug!(authority = name, "issued certificate authority");
        Ok(Self {
            name: name.to_owned(),
            key_pem: key_pair.serialize_pem(),
            cert_pem: cert.pem(),
            next_serial: AtomicU64::new(1),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Generates a fresh key pair and signs a certificate for it.
    pub fn issue_leaf(&self, request: &LeafRequest) -> Result<Certificate, IssuanceError> {
        let identity = request.subject.to_string();
        let signing = |source| IssuanceError::Signing {
            identity: identity.clone(),
            source,
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = request.subject.distinguished_name();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.subject_alt_names = request.san_types()?;

        let (not_before, not_after) = compute_validity(LEAF_VALIDITY_DAYS);
        params.not_before = not_before;
        params.not_after = not_after;

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        params.serial_number = Some(SerialNumber::from(serial));

        let key_pair = KeyPair::generate().map_err(|source| IssuanceError::KeyGeneration {
            identity: identity.clone(),
            source,
        })?;

        let ca_key = KeyPair::from_pem(&self.key_pem).map_err(signing)?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key).map_err(signing)?;
        let cert = params.signed_by(&key_pair, &issuer).map_err(signing)?;

        debug!(authority = %self.name, subject = %identity, serial, "issued leaf certificate");
        Ok(Certificate {
            subject: request.subject.clone(),
            issuer: self.name.clone(),
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}
