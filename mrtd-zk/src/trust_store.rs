//! Trusted country signing CA certificates, loaded from an ICAO master list.


use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rasn::{AsnType, Decode, Encode};
use rasn::ber::de::{Decoder, DecoderOptions};
use rasn::error::DecodeError;
use rasn::types::{Any, Integer, Oid, SequenceOf, SetOf};
use rasn_cms::ContentInfo;
use rasn_pkix::Name;
use tracing::{debug, instrument};

use crate::der_util::{format_oid, oid_matches};
use crate::lds::LdsError;
use crate::lds::sod::{SignedData, OID_SIGNED_DATA};
use crate::signature::{SignatureAlgorithm, SignatureError};
use crate::x509::{self, common_name, name_key, Certificate};


pub const OID_CSCA_MASTER_LIST: &Oid = Oid::const_new(&[2, 23, 136, 1, 1, 2]);

/// The longest certificate path accepted, counting the leaf but not the anchor.
pub const MAX_CHAIN_DEPTH: usize = 8;


/// `CscaMasterList ::= SEQUENCE { version INTEGER, certList SET OF Certificate }`
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, PartialEq)]
struct CscaMasterList {
    version: Integer,
    cert_list: SetOf<Any>,
}


#[derive(Debug)]
pub enum MasterListError {
    Empty,
    Decode(DecodeError),
    Cms { index: usize, error: LdsError },
    UnexpectedContentType { index: usize, content_type: String },
    NotAMasterList { index: usize },
    Certificate { index: usize, certificate: usize, error: x509::Error },
}
impl fmt::Display for MasterListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty
                => write!(f, "master list is empty"),
            Self::Decode(e)
                => write!(f, "failed to decode master list: {}", e),
            Self::Cms { index, error }
                => write!(f, "failed to unwrap signed master list {}: {}", index, error),
            Self::UnexpectedContentType { index, content_type }
                => write!(f, "signed object {} contains {} instead of a master list", index, content_type),
            Self::NotAMasterList { index }
                => write!(f, "object {} is not a SEQUENCE {{ version, SET OF Certificate }}", index),
            Self::Certificate { index, certificate, error }
                => write!(f, "certificate {} of master list {} is invalid: {}", certificate, index, error),
        }
    }
}
impl std::error::Error for MasterListError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cms { error, .. } => Some(error),
            Self::Certificate { error, .. } => Some(error),
            _ => None,
        }
    }
}
impl From<DecodeError> for MasterListError {
    fn from(value: DecodeError) -> Self { Self::Decode(value) }
}


#[derive(Debug)]
pub enum ChainError {
    Empty,
    NotValidAt { subject: Option<String>, now: DateTime<Utc> },
    UntrustedIssuer { issuer: Option<String> },
    InvalidSignature { subject: Option<String>, error: SignatureError },
    /// An intermediate certificate lacks the CA flag or the keyCertSign usage.
    NotACertificateAuthority { subject: Option<String> },
    TooDeep,
}
impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |n: &Option<String>| n.clone().unwrap_or_else(|| "(unnamed)".to_owned());
        match self {
            Self::Empty
                => write!(f, "no certificate to validate"),
            Self::NotValidAt { subject, now }
                => write!(f, "certificate {} is not valid at {}", name(subject), now),
            Self::UntrustedIssuer { issuer }
                => write!(f, "no trusted path to issuer {}", name(issuer)),
            Self::InvalidSignature { subject, error }
                => write!(f, "signature on certificate {} does not verify: {}", name(subject), error),
            Self::NotACertificateAuthority { subject }
                => write!(f, "certificate {} may not issue certificates", name(subject)),
            Self::TooDeep
                => write!(f, "certificate path is longer than {}", MAX_CHAIN_DEPTH),
        }
    }
}
impl std::error::Error for ChainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidSignature { error, .. } => Some(error),
            _ => None,
        }
    }
}


/// Verifies that `issuer` signed `child`.
pub fn verify_issued_by(child: &Certificate, issuer: &Certificate) -> Result<(), SignatureError> {
    let algorithm = SignatureAlgorithm::from_algorithm_identifier(child.signature_algorithm(), None)?;
    algorithm.verify(issuer.public_key(), child.tbs_certificate(), child.signature())
}


/// The set of trust anchors. Immutable once built.
#[derive(Clone, Debug, Default)]
pub struct TrustedCertificateSet {
    certificates: Vec<Certificate>,
    /// Keyed by the DER encoding of the subject.
    by_subject: HashMap<Vec<u8>, Vec<usize>>,
}
impl TrustedCertificateSet {
    pub fn from_certificates(certificates: Vec<Certificate>) -> Self {
        let mut by_subject: HashMap<Vec<u8>, Vec<usize>> = HashMap::new();
        for (i, certificate) in certificates.iter().enumerate() {
            by_subject.entry(name_key(certificate.subject()))
                .or_default()
                .push(i);
        }
        Self { certificates, by_subject }
    }

    /// Loads one or more concatenated master lists, each either bare
    /// (`SEQUENCE { version, SET OF Certificate }`) or wrapped in CMS SignedData.
    ///
    /// Any malformed object or certificate fails the whole load.
    #[instrument(skip_all)]
    pub fn from_master_list(bytes: &[u8]) -> Result<Self, MasterListError> {
        let objects = split_objects(bytes)?;
        if objects.is_empty() {
            return Err(MasterListError::Empty);
        }

        let mut certificates = Vec::new();
        for (index, object) in objects.into_iter().enumerate() {
            if is_signed_data(&object) {
                let signed_data = SignedData::from_content_info(object.as_bytes())
                    .map_err(|error| MasterListError::Cms { index, error })?;
                if !oid_matches(signed_data.content_type(), OID_CSCA_MASTER_LIST) {
                    return Err(MasterListError::UnexpectedContentType {
                        index,
                        content_type: format_oid(signed_data.content_type()),
                    });
                }
                let content = signed_data.content()
                    .map_err(|error| MasterListError::Cms { index, error })?;
                collect_master_list(index, content, &mut certificates)?;
            } else {
                collect_master_list(index, object.as_bytes(), &mut certificates)?;
            }
        }
        debug!("loaded {} trusted certificates", certificates.len());
        Ok(Self::from_certificates(certificates))
    }

    pub fn len(&self) -> usize { self.certificates.len() }
    pub fn is_empty(&self) -> bool { self.certificates.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &Certificate> { self.certificates.iter() }

    /// Finds the trusted certificates with the given subject.
    pub fn find_by_subject<'s>(&'s self, subject: &Name) -> impl Iterator<Item = &'s Certificate> + 's {
        self.by_subject.get(&name_key(subject))
            .into_iter()
            .flatten()
            .map(|&i| &self.certificates[i])
    }

    /// Builds a path from `chain[0]` (the leaf) through any further certificates of `chain` to a
    /// trust anchor and returns the anchor.
    ///
    /// Every certificate on the path except the anchor must be valid at `now`, and every one but
    /// the leaf and the anchor must be a CA allowed to sign certificates. Revocation is not
    /// checked.
    #[instrument(skip_all)]
    pub fn validate_chain<'s>(&'s self, chain: &[Certificate], now: DateTime<Utc>) -> Result<&'s Certificate, ChainError> {
        let mut current = chain.first().ok_or(ChainError::Empty)?;
        let mut used = vec![false; chain.len()];
        used[0] = true;

        for _ in 0..MAX_CHAIN_DEPTH {
            if !current.is_valid_at(now) {
                return Err(ChainError::NotValidAt { subject: current.subject_common_name(), now });
            }

            let mut last_signature_error = None;
            for anchor in self.find_by_subject(current.issuer()) {
                match verify_issued_by(current, anchor) {
                    Ok(()) => {
                        debug!("{:?} is anchored at {:?}", current.subject_common_name(), anchor.subject_common_name());
                        return Ok(anchor);
                    },
                    Err(e) => last_signature_error = Some(e),
                }
            }

            let mut non_authority = None;
            let next = chain.iter().enumerate()
                .filter(|(i, c)| !used[*i] && c.subject() == current.issuer())
                .find_map(|(i, c)| match verify_issued_by(current, c) {
                    Ok(()) if c.can_sign_certificates() => Some(i),
                    Ok(()) => {
                        debug!("{:?} signed {:?} but is not a CA", c.subject_common_name(), current.subject_common_name());
                        non_authority = Some(c);
                        None
                    },
                    Err(e) => {
                        last_signature_error = Some(e);
                        None
                    },
                });
            match next {
                Some(i) => {
                    used[i] = true;
                    current = &chain[i];
                },
                None => {
                    if let Some(issuer) = non_authority {
                        return Err(ChainError::NotACertificateAuthority { subject: issuer.subject_common_name() });
                    }
                    return Err(match last_signature_error {
                        Some(error) => ChainError::InvalidSignature { subject: current.subject_common_name(), error },
                        None => ChainError::UntrustedIssuer { issuer: common_name(current.issuer()) },
                    });
                },
            }
        }
        Err(ChainError::TooDeep)
    }
}


/// Splits concatenated BER objects.
fn split_objects(mut bytes: &[u8]) -> Result<Vec<Any>, DecodeError> {
    let mut objects = Vec::new();
    while !bytes.is_empty() {
        let mut decoder = Decoder::new(bytes, DecoderOptions::ber());
        let object = Any::decode(&mut decoder)?;
        bytes = &bytes[decoder.decoded_len()..];
        objects.push(object);
    }
    Ok(objects)
}


fn is_signed_data(object: &Any) -> bool {
    rasn::ber::decode::<ContentInfo>(object.as_bytes())
        .map(|ci| oid_matches(&ci.content_type, OID_SIGNED_DATA))
        .unwrap_or(false)
}


fn collect_master_list(index: usize, bytes: &[u8], certificates: &mut Vec<Certificate>) -> Result<(), MasterListError> {
    let fields: SequenceOf<Any> = rasn::ber::decode(bytes)
        .map_err(|_| MasterListError::NotAMasterList { index })?;
    if fields.len() != 2 {
        return Err(MasterListError::NotAMasterList { index });
    }
    let master_list: CscaMasterList = rasn::ber::decode(bytes)
        .map_err(|_| MasterListError::NotAMasterList { index })?;

    // SET OF has no meaningful order; sort for a stable load order
    let mut encoded = master_list.cert_list.to_vec();
    encoded.sort();
    for (certificate, element) in encoded.into_iter().enumerate() {
        let parsed = Certificate::from_der(element.as_bytes())
            .map_err(|error| MasterListError::Certificate { index, certificate, error })?;
        certificates.push(parsed);
    }
    Ok(())
}
