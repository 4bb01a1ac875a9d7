use thiserror::Error;

/// Failure while creating key material. Any of these aborts the whole run.
#[derive(Debug, Error)]
pub enum IssuanceError {
    #[error("key generation failed for {identity}: {source}")]
    KeyGeneration {
        identity: String,
        #[source]
        source: rcgen::Error,
    },

    #[error("signing failed for {identity}: {source}")]
    Signing {
        identity: String,
        #[source]
        source: rcgen::Error,
    },

    #[error("invalid subject alternative name {name} for {identity}")]
    InvalidName { identity: String, name: String },
}

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("failed to parse PEM {0}")]
    Pem(String),

    #[error("failed to parse certificate {0}")]
    Parse(String),

    #[error("{subject} is not signed by {authority}")]
    Signature { subject: String, authority: String },

    #[error("{subject} names issuer {found}, expected {expected}")]
    IssuerMismatch {
        subject: String,
        expected: String,
        found: String,
    },

    #[error("{0} is not signed by any known authority")]
    UnknownAuthority(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
