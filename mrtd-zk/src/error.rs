//! Errors reported by a scan as a whole.


use std::error::Error;
use std::fmt;

use crate::encoder::EncodingOverflowError;
use crate::passive_auth;
use crate::reader;
use crate::session;
use crate::signature::SignatureError;
use crate::trust_store::{ChainError, MasterListError};


#[derive(Debug)]
pub enum ScanError {
    /// Neither PACE nor BAC produced a secure channel, or the chip went away while trying.
    ChannelEstablishment(Box<dyn Error + Send + Sync>),

    /// A file could not be read or decoded. `dg` is 0 for EF.SOD and EF.COM.
    DataGroupRead { dg: u8, source: reader::Error },

    DigestMismatch { dg: u8 },
    CertificateChain(ChainError),
    SignatureVerification(SignatureError),
    MasterListParse(MasterListError),
    EncodingOverflow { field: &'static str },

    /// Another scan is running on the same scanner.
    ScanInProgress,
}
impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelEstablishment(e)
                => write!(f, "failed to establish a secure channel: {}", e),
            Self::DataGroupRead { source, .. }
                => write!(f, "failed to read document: {}", source),
            Self::DigestMismatch { dg }
                => write!(f, "DG{} does not match its signed digest", dg),
            Self::CertificateChain(e)
                => write!(f, "certificate chain validation failed: {}", e),
            Self::SignatureVerification(e)
                => write!(f, "security object signature verification failed: {}", e),
            Self::MasterListParse(e)
                => write!(f, "failed to load master list: {}", e),
            Self::EncodingOverflow { field }
                => write!(f, "{} does not fit into the prover inputs", field),
            Self::ScanInProgress
                => write!(f, "a scan is already in progress"),
        }
    }
}
impl Error for ScanError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::ChannelEstablishment(e) => Some(e.as_ref()),
            Self::DataGroupRead { source, .. } => Some(source),
            Self::DigestMismatch { .. } => None,
            Self::CertificateChain(e) => Some(e),
            Self::SignatureVerification(e) => Some(e),
            Self::MasterListParse(e) => Some(e),
            Self::EncodingOverflow { .. } => None,
            Self::ScanInProgress => None,
        }
    }
}
impl From<session::Error> for ScanError {
    fn from(value: session::Error) -> Self { Self::ChannelEstablishment(Box::new(value)) }
}
impl From<reader::Error> for ScanError {
    fn from(value: reader::Error) -> Self {
        Self::DataGroupRead { dg: value.file().report_number(), source: value }
    }
}
impl From<passive_auth::Error> for ScanError {
    fn from(value: passive_auth::Error) -> Self {
        match value {
            passive_auth::Error::DigestMismatch { dg } => Self::DigestMismatch { dg },
            passive_auth::Error::CertificateChain(e) => Self::CertificateChain(e),
            passive_auth::Error::SignatureVerification(e) => Self::SignatureVerification(e),
        }
    }
}
impl From<MasterListError> for ScanError {
    fn from(value: MasterListError) -> Self { Self::MasterListParse(value) }
}
impl From<EncodingOverflowError> for ScanError {
    fn from(value: EncodingOverflowError) -> Self { Self::EncodingOverflow { field: value.field } }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::iso7816::file::ReadError;
    use crate::lds::FileId;

    #[test]
    fn read_errors_carry_the_data_group() {
        let error = ScanError::from(reader::Error::Read { file: FileId::Dg2, error: ReadError::FileNotFound });
        assert!(matches!(error, ScanError::DataGroupRead { dg: 2, .. }));
        assert!(error.source().is_some());

        let error = ScanError::from(reader::Error::Read { file: FileId::Sod, error: ReadError::FileNotFound });
        assert!(matches!(error, ScanError::DataGroupRead { dg: 0, .. }));
    }

    #[test]
    fn passive_auth_errors_are_flattened() {
        let error = ScanError::from(passive_auth::Error::DigestMismatch { dg: 14 });
        assert!(matches!(error, ScanError::DigestMismatch { dg: 14 }));
        assert_eq!(error.to_string(), "DG14 does not match its signed digest");
    }
}
