use std::{fs, net::Ipv4Addr, path::Path};

use x509_parser::prelude::*;

use crate::{error::VerifyError, CLUSTER_CA_FILE, ETCD_CA_FILE};

/// The parts of a certificate operators and tests care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub common_name: String,
    pub organization: Option<String>,
    pub serial: String,
    pub not_before: ::time::OffsetDateTime,
    pub not_after: ::time::OffsetDateTime,
    pub alt_names: Vec<String>,
    pub public_key: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct VerifiedCertificate {
    pub file: String,
    pub authority: String,
    pub info: CertificateInfo,
}

pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>, VerifyError> {
    let pem_obj = ::pem::parse(pem_data.as_bytes()).map_err(|e| VerifyError::Pem(e.to_string()))?;
    Ok(pem_obj.contents().to_vec())
}

fn info_of(cert: &X509Certificate<'_>) -> Result<CertificateInfo, VerifyError> {
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();
    let organization = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
        .map(str::to_owned);

    let alt_names = match cert
        .subject_alternative_name()
        .map_err(|e| VerifyError::Parse(e.to_string()))?
    {
        Some(ext) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                GeneralName::IPAddress(raw) if raw.len() == 4 => {
                    Some(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]).to_string())
                }
                _ => None,
            })
            .collect(),
        None => Vec::new(),
    };

    Ok(CertificateInfo {
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        common_name,
        organization,
        serial: cert.raw_serial_as_string(),
        not_before: cert.validity().not_before.to_datetime(),
        not_after: cert.validity().not_after.to_datetime(),
        alt_names,
        public_key: cert.public_key().raw.to_vec(),
    })
}

pub fn inspect(cert_pem: &str) -> Result<CertificateInfo, VerifyError> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| VerifyError::Parse(e.to_string()))?;
    info_of(&cert)
}

/// Checks that `cert_pem` names `ca_pem` as its issuer and carries its signature.
pub fn verify_issued_by(cert_pem: &str, ca_pem: &str) -> Result<CertificateInfo, VerifyError> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) =
        X509Certificate::from_der(&der).map_err(|e| VerifyError::Parse(e.to_string()))?;

    let ca_der = parse_pem(ca_pem)?;
    let (_, ca) =
        X509Certificate::from_der(&ca_der).map_err(|e| VerifyError::Parse(e.to_string()))?;

    let info = info_of(&cert)?;
    let expected = ca.subject().to_string();
    if info.issuer != expected {
        return Err(VerifyError::IssuerMismatch {
            subject: info.subject,
            expected,
            found: info.issuer,
        });
    }

    cert.verify_signature(Some(ca.public_key()))
        .map_err(|_| VerifyError::Signature {
            subject: info.subject.clone(),
            authority: expected,
        })?;

    Ok(info)
}

/// Verifies every leaf certificate persisted in `dir` against the two cluster
/// authorities stored next to them.
pub fn verify_dir(dir: &Path) -> Result<Vec<VerifiedCertificate>, VerifyError> {
    let mut authorities = Vec::new();
    for file in [CLUSTER_CA_FILE, ETCD_CA_FILE] {
        let pem = fs::read_to_string(dir.join(file))?;
        let info = verify_issued_by(&pem, &pem)?;
        authorities.push((info.common_name, pem));
    }

    let mut files: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            name.ends_with(".pem")
                && !name.ends_with("-key.pem")
                && name != CLUSTER_CA_FILE
                && name != ETCD_CA_FILE
        })
        .collect();
    files.sort();

    let mut verified = Vec::with_capacity(files.len());
    for file in files {
        let pem = fs::read_to_string(dir.join(&file))?;
        let found = authorities
            .iter()
            .find_map(|(name, ca)| verify_issued_by(&pem, ca).ok().map(|info| (name, info)));
        match found {
            Some((authority, info)) => verified.push(VerifiedCertificate {
                file,
                authority: authority.clone(),
                info,
            }),
            None => return Err(VerifyError::UnknownAuthority(file)),
        }
    }
    Ok(verified)
}
