//! SecurityInfos as stored in EF.CardAccess and DG14 (Doc 9303 Part 11 § 9.2).


use std::fmt;

use rasn::types::{Any, Integer, ObjectIdentifier, Oid, SetOf};
use tracing::debug;

use crate::der_util::{format_oid, oid_matches};
use crate::kdf::KdfAlgorithm;
use crate::pace::oids::{KeyAgreement, PaceProtocol};
use crate::x509::{self, PublicKey};


const OID_CA_PREFIX: &Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 3]);
const OID_PK_PREFIX: &Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 1]);
const OID_TA: &Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 2]);
const OID_AA: &Oid = Oid::const_new(&[2, 23, 136, 1, 1, 5]);


/// The encoded forms of the SecurityInfo variants (Doc 9303 Part 11 § 9.2).
mod asn1 {
    use rasn::{AsnType, Decode, Encode};
    use rasn::types::{Any, Integer, ObjectIdentifier};
    use rasn_pkix::SubjectPublicKeyInfo;

    #[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
    pub(super) struct PaceInfo {
        pub protocol: ObjectIdentifier,
        pub version: Integer,
        pub parameter_id: Option<Integer>,
    }

    #[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
    pub(super) struct ChipAuthenticationInfo {
        pub protocol: ObjectIdentifier,
        pub version: Integer,
        pub key_id: Option<Integer>,
    }

    #[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
    pub(super) struct ChipAuthenticationPublicKeyInfo {
        pub protocol: ObjectIdentifier,
        pub chip_authentication_public_key: SubjectPublicKeyInfo,
        pub key_id: Option<Integer>,
    }

    #[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
    pub(super) struct TerminalAuthenticationInfo {
        pub protocol: ObjectIdentifier,
        pub version: Integer,
        pub ef_cvca: Option<Any>,
    }

    #[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
    pub(super) struct ActiveAuthenticationInfo {
        pub protocol: ObjectIdentifier,
        pub version: Integer,
        pub signature_algorithm: Option<ObjectIdentifier>,
    }
}


#[derive(Debug)]
pub enum Error {
    Decode(rasn::error::DecodeError),
    Entry { index: usize, error: rasn::error::DecodeError },
    IntegerOutOfRange { index: usize },
    PublicKey { index: usize, error: x509::Error },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e)
                => write!(f, "failed to decode SecurityInfos: {}", e),
            Self::Entry { index, error }
                => write!(f, "failed to decode SecurityInfo {}: {}", index, error),
            Self::IntegerOutOfRange { index }
                => write!(f, "integer in SecurityInfo {} is out of range", index),
            Self::PublicKey { index, error }
                => write!(f, "failed to decode public key of SecurityInfo {}: {}", index, error),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PublicKey { error, .. } => Some(error),
            _ => None,
        }
    }
}


/// A chip authentication protocol OID (`id-CA-*`) taken apart.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ChipAuthProtocol {
    pub key_agreement: KeyAgreement,
    pub cipher: KdfAlgorithm,
}
impl ChipAuthProtocol {
    pub fn from_oid(oid: &Oid) -> Option<Self> {
        let arcs = arcs_after(oid, OID_CA_PREFIX)?;
        let &[agreement, cipher] = arcs else { return None };
        let key_agreement = match agreement {
            1 => KeyAgreement::DiffieHellman,
            2 => KeyAgreement::EllipticCurveDiffieHellman,
            _ => return None,
        };
        let cipher = match cipher {
            1 => KdfAlgorithm::DesEde3Cbc,
            2 => KdfAlgorithm::Aes128Cbc,
            3 => KdfAlgorithm::Aes192Cbc,
            4 => KdfAlgorithm::Aes256Cbc,
            _ => return None,
        };
        Some(Self { key_agreement, cipher })
    }
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PaceInfo {
    pub protocol: ObjectIdentifier,
    pub version: u64,
    pub parameter_id: Option<u64>,
}
impl PaceInfo {
    /// The decoded protocol, or `None` if the OID names no PACE variant we know.
    pub fn pace_protocol(&self) -> Option<PaceProtocol> {
        PaceProtocol::from_oid(&self.protocol)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChipAuthenticationInfo {
    pub protocol: ObjectIdentifier,
    pub version: u64,
    pub key_id: Option<u64>,
}
impl ChipAuthenticationInfo {
    pub fn chip_auth_protocol(&self) -> Option<ChipAuthProtocol> {
        ChipAuthProtocol::from_oid(&self.protocol)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChipAuthenticationPublicKeyInfo {
    pub protocol: ObjectIdentifier,
    pub public_key: PublicKey,
    pub key_id: Option<u64>,
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SecurityInfo {
    Pace(PaceInfo),
    ChipAuthentication(ChipAuthenticationInfo),
    ChipAuthenticationPublicKey(ChipAuthenticationPublicKeyInfo),
    TerminalAuthentication { version: u64 },
    ActiveAuthentication { version: u64, signature_algorithm: Option<ObjectIdentifier> },
    Other { protocol: ObjectIdentifier, raw: Vec<u8> },
}


/// Decodes a DER `SET OF SecurityInfo`.
///
/// Entries that are not `SEQUENCE { OBJECT IDENTIFIER, ... }` are skipped; entries with a
/// recognized protocol but a malformed body fail the whole decode. The result is in DER order,
/// which is the order of a well-formed file.
pub fn parse_security_infos(bytes: &[u8]) -> Result<Vec<SecurityInfo>, Error> {
    let set: SetOf<Any> = rasn::der::decode(bytes)
        .map_err(Error::Decode)?;
    let mut entries = set.to_vec();
    entries.sort();

    let mut ret = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let Ok(fields) = rasn::der::decode::<Vec<Any>>(entry.as_bytes()) else {
            debug!("skipping SecurityInfo {} that is not a SEQUENCE", index);
            continue;
        };
        let Some(Ok(protocol)) = fields.first().map(|f| rasn::der::decode::<ObjectIdentifier>(f.as_bytes())) else {
            debug!("skipping SecurityInfo {} without protocol", index);
            continue;
        };
        ret.push(decode_entry(index, protocol, entry)?);
    }
    Ok(ret)
}


fn decode_entry(index: usize, protocol: ObjectIdentifier, entry: &Any) -> Result<SecurityInfo, Error> {
    let bytes = entry.as_bytes();
    let small = |value: &Integer| u64::try_from(value)
        .map_err(|_| Error::IntegerOutOfRange { index });
    let entry_error = |error| Error::Entry { index, error };

    if PaceProtocol::from_oid(&protocol).is_some() {
        let info: asn1::PaceInfo = rasn::der::decode(bytes).map_err(entry_error)?;
        return Ok(SecurityInfo::Pace(PaceInfo {
            protocol,
            version: small(&info.version)?,
            parameter_id: info.parameter_id.as_ref().map(small).transpose()?,
        }));
    }
    if ChipAuthProtocol::from_oid(&protocol).is_some() {
        let info: asn1::ChipAuthenticationInfo = rasn::der::decode(bytes).map_err(entry_error)?;
        return Ok(SecurityInfo::ChipAuthentication(ChipAuthenticationInfo {
            protocol,
            version: small(&info.version)?,
            key_id: info.key_id.as_ref().map(small).transpose()?,
        }));
    }
    if matches!(arcs_after(&protocol, OID_PK_PREFIX), Some([1])|Some([2])) {
        let info: asn1::ChipAuthenticationPublicKeyInfo = rasn::der::decode(bytes).map_err(entry_error)?;
        let public_key = PublicKey::from_subject_public_key_info(&info.chip_authentication_public_key)
            .map_err(|error| Error::PublicKey { index, error })?;
        return Ok(SecurityInfo::ChipAuthenticationPublicKey(ChipAuthenticationPublicKeyInfo {
            protocol,
            public_key,
            key_id: info.key_id.as_ref().map(small).transpose()?,
        }));
    }
    if oid_matches(&protocol, OID_TA) {
        let info: asn1::TerminalAuthenticationInfo = rasn::der::decode(bytes).map_err(entry_error)?;
        return Ok(SecurityInfo::TerminalAuthentication { version: small(&info.version)? });
    }
    if oid_matches(&protocol, OID_AA) {
        let info: asn1::ActiveAuthenticationInfo = rasn::der::decode(bytes).map_err(entry_error)?;
        return Ok(SecurityInfo::ActiveAuthentication {
            version: small(&info.version)?,
            signature_algorithm: info.signature_algorithm,
        });
    }

    debug!("unrecognized SecurityInfo {}", format_oid(&protocol));
    Ok(SecurityInfo::Other { protocol, raw: bytes.to_vec() })
}


/// Returns the arcs following `prefix`, or `None` if `oid` does not start with it.
fn arcs_after<'a>(oid: &'a Oid, prefix: &Oid) -> Option<&'a [u32]> {
    if oid.len() < prefix.len() || oid[..prefix.len()] != prefix[..] {
        return None;
    }
    Some(&oid[prefix.len()..])
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const DG14: &[u8] = include_bytes!("../tests/data/dg14.bin");

    #[test]
    fn card_access_part11_appendix_g1() {
        let card_access = hex!("31 14 30 12 06 0A 04007F00070202040202 02 01 02 02 01 0D");
        let infos = parse_security_infos(&card_access).unwrap();
        assert_eq!(infos.len(), 1);
        match &infos[0] {
            SecurityInfo::Pace(pace) => {
                assert_eq!(pace.version, 2);
                assert_eq!(pace.parameter_id, Some(13));
                let protocol = pace.pace_protocol().unwrap();
                assert_eq!(protocol.key_agreement, KeyAgreement::EllipticCurveDiffieHellman);
                assert_eq!(protocol.cipher, KdfAlgorithm::Aes128Cbc);
            },
            other => panic!("unexpected info {:?}", other),
        }
    }

    #[test]
    fn dg14_contents() {
        // strip the application tag 6E
        let set = crate::asn1::Element::parse_exact(DG14).unwrap().content;
        let infos = parse_security_infos(set).unwrap();
        assert_eq!(infos.len(), 2);

        let ca_info = infos.iter()
            .find_map(|i| match i { SecurityInfo::ChipAuthentication(ca) => Some(ca), _ => None })
            .unwrap();
        assert_eq!(ca_info.version, 1);
        assert_eq!(ca_info.key_id, None);
        assert_eq!(
            ca_info.chip_auth_protocol(),
            Some(ChipAuthProtocol { key_agreement: KeyAgreement::EllipticCurveDiffieHellman, cipher: KdfAlgorithm::Aes128Cbc }),
        );

        let pk_info = infos.iter()
            .find_map(|i| match i { SecurityInfo::ChipAuthenticationPublicKey(pk) => Some(pk), _ => None })
            .unwrap();
        assert_eq!(pk_info.key_id, None);
        assert!(matches!(pk_info.public_key, PublicKey::Ec { .. }));
    }

    #[test]
    fn skips_and_keeps_unknown() {
        // a bare INTEGER, then active authentication, then an unknown protocol
        let data = hex!("
            31 1A
                02 01 05
                30 0B 06 06 678108010105 02 01 01
                30 08 06 03 2A0304 02 01 07
        ");
        let infos = parse_security_infos(&data).unwrap();
        assert_eq!(infos.len(), 2);
        assert!(matches!(&infos[0], SecurityInfo::Other { raw, .. } if raw.len() == 10));
        assert_eq!(infos[1], SecurityInfo::ActiveAuthentication { version: 1, signature_algorithm: None });
    }

    #[test]
    fn terminal_authentication() {
        let data = hex!("31 11 30 0F 06 08 04007F0007020202 02 01 01 30 00");
        let infos = parse_security_infos(&data).unwrap();
        assert_eq!(infos, vec![SecurityInfo::TerminalAuthentication { version: 1 }]);
    }

    #[test]
    fn integer_out_of_range() {
        // PaceInfo whose version needs 81 bits
        let data = hex!("31 1B 30 19 06 0A 04007F00070202040202 02 0B 0100000000000000000000");
        assert!(matches!(parse_security_infos(&data), Err(Error::IntegerOutOfRange { index: 0 })));
    }

    #[test]
    fn malformed_pace_info() {
        let data = hex!("31 0E 30 0C 06 0A 04007F00070202040202");
        assert!(matches!(parse_security_infos(&data), Err(Error::Entry { index: 0, .. })));
    }
}
