//! X.509 certificates and public keys, as far as passive and chip authentication need them.


use std::fmt;

use chrono::{DateTime, Datelike, Months, Utc};
use num_bigint::{BigInt, BigUint};
use rasn::{AsnType, Decode, Encode};
use rasn::types::{Any, BitString, Integer, ObjectIdentifier, OctetString, Oid};
use rasn_pkix::{BasicConstraints, DirectoryString, KeyUsage, Name, SubjectPublicKeyInfo, TbsCertificate, Time};

use crate::crypt;
use crate::crypt::dh::DiffieHellmanParams;
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};
use crate::crypt::elliptic::curves::curve_from_oid;
use crate::der_util::{format_oid, oid_matches};


pub const OID_RSA_ENCRYPTION: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 1]);
pub const OID_RSASSA_PSS: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 10]);
pub const OID_EC_PUBLIC_KEY: &Oid = Oid::const_new(&[1, 2, 840, 10045, 2, 1]);
pub const OID_PRIME_FIELD: &Oid = Oid::const_new(&[1, 2, 840, 10045, 1, 1]);
pub const OID_DH_PUBLIC_NUMBER: &Oid = Oid::const_new(&[1, 2, 840, 10046, 2, 1]);
pub const OID_PK_DH: &Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 1, 1]);
pub const OID_PK_ECDH: &Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 1, 2]);
const OID_COMMON_NAME: &Oid = Oid::const_new(&[2, 5, 4, 3]);
const OID_KEY_USAGE: &Oid = Oid::const_new(&[2, 5, 29, 15]);
const OID_BASIC_CONSTRAINTS: &Oid = Oid::const_new(&[2, 5, 29, 19]);

/// Bit position of keyCertSign in the KeyUsage BIT STRING.
const KEY_USAGE_KEY_CERT_SIGN: usize = 5;


#[derive(Debug)]
pub enum Error {
    Decode(rasn::error::DecodeError),
    UnsupportedCurve,
    InvalidPublicKey,
    Crypto(crypt::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decoding failed: {}", e),
            Self::UnsupportedCurve => write!(f, "unsupported elliptic curve"),
            Self::InvalidPublicKey => write!(f, "invalid public key"),
            Self::Crypto(e) => write!(f, "invalid key parameters: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Crypto(e) => Some(e),
            _ => None,
        }
    }
}
impl From<rasn::error::DecodeError> for Error {
    fn from(value: rasn::error::DecodeError) -> Self { Self::Decode(value) }
}
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}


/// `Certificate` with the TBSCertificate kept in its encoded form, since the issuer's signature
/// covers exactly those bytes.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct SignedCertificate {
    tbs_certificate: Any,
    signature_algorithm: rasn_pkix::AlgorithmIdentifier,
    signature_value: BitString,
}

/// `RSAPublicKey` (RFC 8017 § A.1.1).
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct RsaPublicKey {
    modulus: Integer,
    public_exponent: Integer,
}

/// `ECParameters` (RFC 3279 § 2.3.5).
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
#[rasn(choice)]
enum EcParameters {
    NamedCurve(ObjectIdentifier),
    Specified(SpecifiedEcDomain),
    ImplicitlyCa(()),
}

#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct SpecifiedEcDomain {
    version: Integer,
    field_id: FieldId,
    curve: CurveCoefficients,
    base: OctetString,
    order: Integer,
    cofactor: Option<Integer>,
    hash: Option<rasn_pkix::AlgorithmIdentifier>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct FieldId {
    field_type: ObjectIdentifier,
    parameters: Any,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct CurveCoefficients {
    a: OctetString,
    b: OctetString,
    seed: Option<BitString>,
}

/// X9.42 `DomainParameters`.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct DhDomainParameters {
    prime: Integer,
    generator: Integer,
    subgroup_order: Option<Integer>,
    factor: Option<Integer>,
    validation: Option<DhValidationParameters>,
}

#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct DhValidationParameters {
    seed: BitString,
    pgen_counter: Integer,
}


/// Converts a non-negative INTEGER; negative values are rejected as an invalid key.
pub(crate) fn unsigned_integer(value: &Integer) -> Result<BigUint, Error> {
    BigInt::from(value.clone())
        .to_biguint()
        .ok_or(Error::InvalidPublicKey)
}


/// An algorithm OID with its optional parameters.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct AlgorithmIdentifier {
    pub algorithm: ObjectIdentifier,

    /// The complete DER encoding of the parameters; `None` if absent or NULL.
    pub parameters: Option<Vec<u8>>,
}
impl From<&rasn_pkix::AlgorithmIdentifier> for AlgorithmIdentifier {
    fn from(value: &rasn_pkix::AlgorithmIdentifier) -> Self {
        let parameters = value.parameters.as_ref()
            .map(|p| p.as_bytes())
            .filter(|p| *p != [0x05, 0x00])
            .map(|p| p.to_vec());
        Self {
            algorithm: value.algorithm.clone(),
            parameters,
        }
    }
}
impl fmt::Display for AlgorithmIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_oid(&self.algorithm))
    }
}


/// A public key as found in a SubjectPublicKeyInfo.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PublicKey {
    Rsa { modulus: BigUint, public_exponent: BigUint },
    Ec { curve: PrimeWeierstrassCurve, point: AffinePoint },
    Dh { params: DiffieHellmanParams, public_value: BigUint },
    Unsupported { algorithm: ObjectIdentifier },
}
impl PublicKey {
    /// Decodes a SubjectPublicKeyInfo.
    ///
    /// Unknown key algorithms decode to [`PublicKey::Unsupported`] so that certificates carrying
    /// them can still be stored; operations on them fail later.
    pub fn from_subject_public_key_info(info: &SubjectPublicKeyInfo) -> Result<Self, Error> {
        let algorithm = &info.algorithm.algorithm;
        let key_bits = info.subject_public_key.as_raw_slice();
        let parameters = info.algorithm.parameters.as_ref();

        if oid_matches(algorithm, OID_RSA_ENCRYPTION) || oid_matches(algorithm, OID_RSASSA_PSS) {
            let rsa_key: RsaPublicKey = rasn::der::decode(key_bits)?;
            Ok(Self::Rsa {
                modulus: unsigned_integer(&rsa_key.modulus)?,
                public_exponent: unsigned_integer(&rsa_key.public_exponent)?,
            })
        } else if oid_matches(algorithm, OID_EC_PUBLIC_KEY) || oid_matches(algorithm, OID_PK_ECDH) {
            let parameters = parameters.ok_or(Error::UnsupportedCurve)?;
            let curve = curve_from_parameters(parameters.as_bytes())?;
            let point = AffinePoint::try_from_be_bytes(key_bits)
                .ok_or(Error::InvalidPublicKey)?;
            if !curve.is_on_curve(&point) {
                return Err(Error::InvalidPublicKey);
            }
            Ok(Self::Ec { curve, point })
        } else if oid_matches(algorithm, OID_DH_PUBLIC_NUMBER) || oid_matches(algorithm, OID_PK_DH) {
            let parameters = parameters.ok_or(Error::InvalidPublicKey)?;
            let domain: DhDomainParameters = rasn::der::decode(parameters.as_bytes())?;
            let subgroup_order = domain.subgroup_order.as_ref()
                .map(unsigned_integer)
                .transpose()?;
            let params = DiffieHellmanParams::new(
                unsigned_integer(&domain.prime)?,
                unsigned_integer(&domain.generator)?,
                subgroup_order,
            )?;
            let public_value: Integer = rasn::der::decode(key_bits)?;
            Ok(Self::Dh { params, public_value: unsigned_integer(&public_value)? })
        } else {
            Ok(Self::Unsupported { algorithm: algorithm.clone() })
        }
    }

    /// The public key's numeric payload as big-endian bytes: the modulus for RSA, `x || y` for
    /// elliptic curves and the public value for Diffie-Hellman.
    pub fn key_bytes(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Rsa { modulus, .. } => Ok(modulus.to_bytes_be()),
            Self::Ec { curve, point } => {
                let encoded = point.to_be_bytes(curve.coordinate_len_bytes())?;
                // drop the uncompressed-point marker
                Ok(encoded[1..].to_vec())
            },
            Self::Dh { public_value, .. } => Ok(public_value.to_bytes_be()),
            Self::Unsupported { .. } => Err(Error::InvalidPublicKey),
        }
    }
}


/// Decodes DER ECParameters: either a named curve OID or explicit prime-field parameters.
pub fn curve_from_parameters(der: &[u8]) -> Result<PrimeWeierstrassCurve, Error> {
    let domain = match rasn::der::decode::<EcParameters>(der)? {
        EcParameters::NamedCurve(oid) => {
            return curve_from_oid(&oid)
                .ok_or(Error::UnsupportedCurve);
        },
        EcParameters::Specified(domain) => domain,
        EcParameters::ImplicitlyCa(()) => return Err(Error::UnsupportedCurve),
    };

    if !oid_matches(&domain.field_id.field_type, OID_PRIME_FIELD) {
        return Err(Error::UnsupportedCurve);
    }
    let prime: Integer = rasn::der::decode(domain.field_id.parameters.as_bytes())?;
    let generator = AffinePoint::try_from_be_bytes(&domain.base)
        .ok_or(Error::UnsupportedCurve)?;
    let cofactor = match &domain.cofactor {
        Some(c) => u8::try_from(c).map_err(|_| Error::UnsupportedCurve)?,
        None => 1,
    };
    Ok(PrimeWeierstrassCurve::new(
        unsigned_integer(&prime)?,
        BigUint::from_bytes_be(&domain.curve.a),
        BigUint::from_bytes_be(&domain.curve.b),
        generator,
        unsigned_integer(&domain.order)?,
        cofactor,
    )?)
}


/// Converts a certificate time to UTC.
///
/// UTCTime years 50 to 99 denote 1950 to 1999 (RFC 5280 § 4.1.2.5.1).
pub fn time_to_utc(time: &Time) -> DateTime<Utc> {
    match time {
        Time::Utc(t) if t.year() >= 2050 => t.checked_sub_months(Months::new(1200)).unwrap_or(*t),
        Time::Utc(t) => *t,
        Time::General(t) => t.with_timezone(&Utc),
    }
}


/// An X.509 certificate.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Certificate {
    raw: Vec<u8>,
    tbs_certificate: Vec<u8>,
    serial_number: Integer,
    issuer: Name,
    subject: Name,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    public_key: PublicKey,
    signature_algorithm: AlgorithmIdentifier,
    signature: Vec<u8>,
    is_ca: bool,
    key_usage: Option<KeyUsage>,
}
impl Certificate {
    pub fn from_der(bytes: &[u8]) -> Result<Self, Error> {
        let signed: SignedCertificate = rasn::der::decode(bytes)?;
        let tbs: TbsCertificate = rasn::der::decode(signed.tbs_certificate.as_bytes())?;
        let public_key = PublicKey::from_subject_public_key_info(&tbs.subject_public_key_info)?;

        let mut is_ca = false;
        let mut key_usage = None;
        for extension in tbs.extensions.iter().flat_map(|e| e.iter()) {
            if oid_matches(&extension.extn_id, OID_BASIC_CONSTRAINTS) {
                let constraints: BasicConstraints = rasn::der::decode(&extension.extn_value)?;
                is_ca = constraints.ca;
            } else if oid_matches(&extension.extn_id, OID_KEY_USAGE) {
                key_usage = Some(rasn::der::decode::<KeyUsage>(&extension.extn_value)?);
            }
        }

        Ok(Self {
            raw: bytes.to_vec(),
            tbs_certificate: signed.tbs_certificate.into_bytes(),
            serial_number: tbs.serial_number,
            issuer: tbs.issuer,
            subject: tbs.subject,
            not_before: time_to_utc(&tbs.validity.not_before),
            not_after: time_to_utc(&tbs.validity.not_after),
            public_key,
            signature_algorithm: AlgorithmIdentifier::from(&signed.signature_algorithm),
            signature: signed.signature_value.as_raw_slice().to_vec(),
            is_ca,
            key_usage,
        })
    }

    /// The complete DER encoding.
    pub fn raw(&self) -> &[u8] { &self.raw }

    /// The DER encoding of the TBSCertificate, over which the issuer's signature is computed.
    pub fn tbs_certificate(&self) -> &[u8] { &self.tbs_certificate }

    pub fn serial_number(&self) -> &Integer { &self.serial_number }
    pub fn issuer(&self) -> &Name { &self.issuer }
    pub fn subject(&self) -> &Name { &self.subject }
    pub fn not_before(&self) -> DateTime<Utc> { self.not_before }
    pub fn not_after(&self) -> DateTime<Utc> { self.not_after }
    pub fn public_key(&self) -> &PublicKey { &self.public_key }
    pub fn signature_algorithm(&self) -> &AlgorithmIdentifier { &self.signature_algorithm }
    pub fn signature(&self) -> &[u8] { &self.signature }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    pub fn is_self_issued(&self) -> bool {
        self.issuer == self.subject
    }

    /// Whether basicConstraints marks the subject as a CA and, if keyUsage is present, it includes
    /// keyCertSign.
    pub fn can_sign_certificates(&self) -> bool {
        let key_cert_sign = self.key_usage.as_ref()
            .map(|usage| usage.get(KEY_USAGE_KEY_CERT_SIGN).map(|bit| *bit).unwrap_or(false))
            .unwrap_or(true);
        self.is_ca && key_cert_sign
    }

    /// The first common name in the subject, for log output.
    pub fn subject_common_name(&self) -> Option<String> {
        common_name(&self.subject)
    }
}


/// Finds the first commonName attribute in a Name.
pub fn common_name(name: &Name) -> Option<String> {
    let Name::RdnSequence(rdns) = name;
    rdns.iter()
        .flat_map(|rdn| rdn.to_vec())
        .filter(|attribute| oid_matches(&attribute.r#type, OID_COMMON_NAME))
        .find_map(|attribute| match rasn::der::decode::<DirectoryString>(attribute.value.as_bytes()).ok()? {
            DirectoryString::Printable(s) => Some(String::from_utf8_lossy(s.as_bytes()).into_owned()),
            DirectoryString::Utf8(s) => Some(s),
            DirectoryString::Teletex(s) => Some(String::from_utf8_lossy(&s.to_bytes()).into_owned()),
            _ => None,
        })
}


/// The DER encoding of a Name, usable as a map key.
pub(crate) fn name_key(name: &Name) -> Vec<u8> {
    rasn::der::encode(name).unwrap_or_default()
}
