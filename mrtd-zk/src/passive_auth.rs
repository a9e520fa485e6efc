//! Passive Authentication (Doc 9303 Part 11 § 5.1).
//!
//! Checks that the data groups hash to the values in EF.SOD, that the document signer certificate
//! chains to a trusted CSCA and that the document signer signed EF.SOD.


use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use crate::lds::sod::SecurityObjectDocument;
use crate::reader::DocumentData;
use crate::signature::{HashAlgorithm, SignatureAlgorithm, SignatureError};
use crate::trust_store::{ChainError, TrustedCertificateSet};
use crate::x509::Certificate;


#[derive(Debug)]
pub enum Error {
    /// The data group hashes differently or is not listed in EF.SOD.
    DigestMismatch { dg: u8 },
    CertificateChain(ChainError),
    SignatureVerification(SignatureError),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DigestMismatch { dg }
                => write!(f, "digest of DG{} does not match EF.SOD", dg),
            Self::CertificateChain(e)
                => write!(f, "document signer certificate is not trusted: {}", e),
            Self::SignatureVerification(e)
                => write!(f, "EF.SOD signature is invalid: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DigestMismatch { .. } => None,
            Self::CertificateChain(e) => Some(e),
            Self::SignatureVerification(e) => Some(e),
        }
    }
}
impl From<ChainError> for Error {
    fn from(value: ChainError) -> Self { Self::CertificateChain(value) }
}
impl From<SignatureError> for Error {
    fn from(value: SignatureError) -> Self { Self::SignatureVerification(value) }
}


/// A successfully authenticated security object.
#[derive(Clone, Debug)]
pub struct PassiveAuthResult {
    pub sod: SecurityObjectDocument,
    pub signer: Certificate,
    pub signature_algorithm: SignatureAlgorithm,
}


/// Checks a data group against its hash in EF.SOD.
pub fn check_data_group(sod: &SecurityObjectDocument, dg: u8, raw: &[u8]) -> Result<(), Error> {
    let expected = sod.data_group_hash(dg)
        .ok_or(Error::DigestMismatch { dg })?;
    let actual = sod.digest_algorithm().digest(raw);
    if expected == actual.as_slice() {
        debug!("DG{} digest matches", dg);
        Ok(())
    } else {
        Err(Error::DigestMismatch { dg })
    }
}


/// Picks the algorithm with which to verify EF.SOD.
///
/// The algorithm the document signer certificate was signed with is preferred if it can be used
/// with the document signer's key. PSS is always taken as SHA-256 with MGF1-SHA-256 and a 32-byte
/// salt. Otherwise, the SignerInfo's own declaration is used.
pub fn select_signature_algorithm(sod: &SecurityObjectDocument, signer: &Certificate) -> Result<SignatureAlgorithm, SignatureError> {
    let from_certificate = SignatureAlgorithm::from_algorithm_identifier(signer.signature_algorithm(), None)
        .ok()
        .filter(|algorithm| algorithm.fits_key(signer.public_key()));
    match from_certificate {
        Some(SignatureAlgorithm::RsaPss { .. }) => Ok(SignatureAlgorithm::RsaPss {
            hash: HashAlgorithm::Sha256,
            salt_length: 32,
        }),
        Some(algorithm) => Ok(algorithm),
        None => SignatureAlgorithm::from_algorithm_identifier(
            sod.signature_algorithm(),
            sod.signer_digest_algorithm(),
        ),
    }
}


/// Verifies the signature of EF.SOD including, if present, the messageDigest signed attribute.
pub fn verify_sod_signature(sod: &SecurityObjectDocument, signer: &Certificate, algorithm: SignatureAlgorithm) -> Result<(), SignatureError> {
    if sod.signed_attributes().is_some() {
        let digest_algorithm = sod.signer_digest_algorithm()
            .unwrap_or_else(|| sod.digest_algorithm());
        let expected = digest_algorithm.digest(sod.lds_security_object());
        if sod.message_digest() != Some(expected.as_slice()) {
            return Err(SignatureError::MessageDigestMismatch);
        }
    }
    algorithm.verify(signer.public_key(), sod.signed_content(), sod.signature())
}


/// Authenticates documents against a shared trust store.
#[derive(Clone, Debug)]
pub struct PassiveAuthenticator {
    trust_store: Arc<TrustedCertificateSet>,
}
impl PassiveAuthenticator {
    pub fn new(trust_store: Arc<TrustedCertificateSet>) -> Self {
        Self { trust_store }
    }

    pub fn trust_store(&self) -> &Arc<TrustedCertificateSet> {
        &self.trust_store
    }

    /// Authenticates the document at the current time.
    pub fn verify(&self, document: &DocumentData, chip_auth_succeeded: bool) -> Result<PassiveAuthResult, Error> {
        self.verify_at(document, chip_auth_succeeded, Utc::now())
    }

    /// Authenticates the document, checking certificate validity at `now`.
    ///
    /// DG14 is only checked if Chip Authentication succeeded, since it is otherwise unused.
    #[instrument(skip_all)]
    pub fn verify_at(&self, document: &DocumentData, chip_auth_succeeded: bool, now: DateTime<Utc>) -> Result<PassiveAuthResult, Error> {
        let sod = &document.sod;

        check_data_group(sod, 1, document.dg1.raw())?;
        check_data_group(sod, 2, document.dg2.raw())?;
        if chip_auth_succeeded {
            if let Some(dg14) = &document.dg14 {
                check_data_group(sod, 14, dg14.raw())?;
            }
        }

        let signer = sod.signer_certificate()
            .ok_or(ChainError::Empty)?;
        let mut chain = vec![signer.clone()];
        chain.extend(
            sod.signer_certificates().iter()
                .filter(|c| c.raw() != signer.raw())
                .cloned()
        );
        let anchor = self.trust_store.validate_chain(&chain, now)?;

        let signature_algorithm = select_signature_algorithm(sod, signer)?;
        verify_sod_signature(sod, signer, signature_algorithm)?;

        info!(
            "EF.SOD signed by {:?} under {:?} with {}",
            signer.subject_common_name(), anchor.subject_common_name(), signature_algorithm,
        );
        Ok(PassiveAuthResult {
            sod: sod.clone(),
            signer: signer.clone(),
            signature_algorithm,
        })
    }
}
