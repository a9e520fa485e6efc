//! Digest and signature algorithms used by document signers.


use std::fmt;

use digest::{Digest, FixedOutputReset};
use num_bigint::BigUint;
use num_traits::Zero;
use rasn::{AsnType, Decode, Encode};
use rasn::ber::de::{Decoder, DecoderOptions};
use rasn::error::DecodeError;
use rasn::types::{Integer, Oid};
use rsa::{BoxedUint, Pkcs1v15Sign, Pss, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve};
use crate::der_util::{format_oid, oid_matches};
use crate::x509::{unsigned_integer, AlgorithmIdentifier, PublicKey, OID_RSA_ENCRYPTION, OID_RSASSA_PSS};


const OID_SHA1: &Oid = Oid::const_new(&[1, 3, 14, 3, 2, 26]);
const OID_SHA224: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 4]);
const OID_SHA256: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 1]);
const OID_SHA384: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 2]);
const OID_SHA512: &Oid = Oid::const_new(&[2, 16, 840, 1, 101, 3, 4, 2, 3]);

const OID_SHA1_WITH_RSA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 5]);
const OID_SHA256_WITH_RSA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 11]);
const OID_SHA384_WITH_RSA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 12]);
const OID_SHA512_WITH_RSA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 13]);
const OID_SHA224_WITH_RSA: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 14]);
const OID_MGF1: &Oid = Oid::const_new(&[1, 2, 840, 113549, 1, 1, 8]);

const OID_ECDSA_WITH_SHA1: &Oid = Oid::const_new(&[1, 2, 840, 10045, 4, 1]);
const OID_ECDSA_WITH_SHA224: &Oid = Oid::const_new(&[1, 2, 840, 10045, 4, 3, 1]);
const OID_ECDSA_WITH_SHA256: &Oid = Oid::const_new(&[1, 2, 840, 10045, 4, 3, 2]);
const OID_ECDSA_WITH_SHA384: &Oid = Oid::const_new(&[1, 2, 840, 10045, 4, 3, 3]);
const OID_ECDSA_WITH_SHA512: &Oid = Oid::const_new(&[1, 2, 840, 10045, 4, 3, 4]);

/// Upper bound on accepted RSA moduli.
const MAX_RSA_MODULUS_BITS: usize = 8192;


/// `RSASSA-PSS-params` (RFC 4055 § 3.1); absent fields take the defaults.
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct PssParameters {
    #[rasn(tag(explicit(0)))]
    hash_algorithm: Option<rasn_pkix::AlgorithmIdentifier>,
    #[rasn(tag(explicit(1)))]
    mask_gen_algorithm: Option<rasn_pkix::AlgorithmIdentifier>,
    #[rasn(tag(explicit(2)))]
    salt_length: Option<Integer>,
    #[rasn(tag(explicit(3)))]
    trailer_field: Option<Integer>,
}

/// `ECDSA-Sig-Value` (RFC 3279 § 2.2.3).
#[derive(AsnType, Clone, Debug, Decode, Encode, Eq, Hash, PartialEq)]
struct EcdsaSigValue {
    r: Integer,
    s: Integer,
}


#[derive(Debug)]
pub enum SignatureError {
    UnsupportedAlgorithm { algorithm: String },
    UnsupportedKey,
    KeyMismatch,
    MalformedParameters(DecodeError),
    MalformedSignature,
    InvalidSignature,
    MessageDigestMismatch,
}
impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedAlgorithm { algorithm }
                => write!(f, "unsupported signature algorithm {}", algorithm),
            Self::UnsupportedKey
                => write!(f, "unsupported public key"),
            Self::KeyMismatch
                => write!(f, "public key does not match signature algorithm"),
            Self::MalformedParameters(e)
                => write!(f, "malformed algorithm parameters: {}", e),
            Self::MalformedSignature
                => write!(f, "malformed signature value"),
            Self::InvalidSignature
                => write!(f, "signature does not verify"),
            Self::MessageDigestMismatch
                => write!(f, "messageDigest attribute does not match the signed content"),
        }
    }
}
impl std::error::Error for SignatureError {}
impl From<DecodeError> for SignatureError {
    fn from(value: DecodeError) -> Self { Self::MalformedParameters(value) }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum HashAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}
impl HashAlgorithm {
    pub fn from_oid(oid: &Oid) -> Option<Self> {
        [
            (OID_SHA1, Self::Sha1),
            (OID_SHA224, Self::Sha224),
            (OID_SHA256, Self::Sha256),
            (OID_SHA384, Self::Sha384),
            (OID_SHA512, Self::Sha512),
        ]
            .into_iter()
            .find(|(candidate, _)| oid_matches(oid, candidate))
            .map(|(_, hash)| hash)
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha224 => Sha224::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha224 => 28,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// The size of the compression function's input block in bytes.
    pub fn block_len(&self) -> usize {
        match self {
            Self::Sha1|Self::Sha224|Self::Sha256 => 64,
            Self::Sha384|Self::Sha512 => 128,
        }
    }

    /// The size of the message length field appended by Merkle-Damgård padding, in bytes.
    pub fn length_field_len(&self) -> usize {
        match self {
            Self::Sha1|Self::Sha224|Self::Sha256 => 8,
            Self::Sha384|Self::Sha512 => 16,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sha1 => "SHA-1",
            Self::Sha224 => "SHA-224",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }
}
impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum SignatureAlgorithm {
    RsaPkcs1v15 { hash: HashAlgorithm },
    RsaPss { hash: HashAlgorithm, salt_length: usize },
    Ecdsa { hash: HashAlgorithm },
}
impl SignatureAlgorithm {
    /// Decodes a signature algorithm identifier.
    ///
    /// `digest_hint` supplies the hash when the identifier names only the key type, as some
    /// SignerInfos declare plain `rsaEncryption`.
    pub fn from_algorithm_identifier(
        algorithm: &AlgorithmIdentifier,
        digest_hint: Option<HashAlgorithm>,
    ) -> Result<Self, SignatureError> {
        let oid = &algorithm.algorithm;
        let rsa_pkcs1 = [
            (OID_SHA1_WITH_RSA, HashAlgorithm::Sha1),
            (OID_SHA224_WITH_RSA, HashAlgorithm::Sha224),
            (OID_SHA256_WITH_RSA, HashAlgorithm::Sha256),
            (OID_SHA384_WITH_RSA, HashAlgorithm::Sha384),
            (OID_SHA512_WITH_RSA, HashAlgorithm::Sha512),
        ];
        let ecdsa = [
            (OID_ECDSA_WITH_SHA1, HashAlgorithm::Sha1),
            (OID_ECDSA_WITH_SHA224, HashAlgorithm::Sha224),
            (OID_ECDSA_WITH_SHA256, HashAlgorithm::Sha256),
            (OID_ECDSA_WITH_SHA384, HashAlgorithm::Sha384),
            (OID_ECDSA_WITH_SHA512, HashAlgorithm::Sha512),
        ];

        if let Some((_, hash)) = rsa_pkcs1.iter().find(|(o, _)| oid_matches(oid, o)) {
            return Ok(Self::RsaPkcs1v15 { hash: *hash });
        }
        if let Some((_, hash)) = ecdsa.iter().find(|(o, _)| oid_matches(oid, o)) {
            return Ok(Self::Ecdsa { hash: *hash });
        }
        if oid_matches(oid, OID_RSASSA_PSS) {
            return match &algorithm.parameters {
                Some(params) => pss_from_parameters(params),
                None => Ok(Self::RsaPss { hash: HashAlgorithm::Sha256, salt_length: 32 }),
            };
        }
        if oid_matches(oid, OID_RSA_ENCRYPTION) {
            if let Some(hash) = digest_hint {
                return Ok(Self::RsaPkcs1v15 { hash });
            }
        }
        Err(SignatureError::UnsupportedAlgorithm { algorithm: format_oid(oid) })
    }

    pub fn hash(&self) -> HashAlgorithm {
        match self {
            Self::RsaPkcs1v15 { hash } => *hash,
            Self::RsaPss { hash, .. } => *hash,
            Self::Ecdsa { hash } => *hash,
        }
    }

    /// Whether this algorithm can be used with the given kind of key.
    pub fn fits_key(&self, key: &PublicKey) -> bool {
        matches!(
            (self, key),
            (Self::RsaPkcs1v15 { .. } | Self::RsaPss { .. }, PublicKey::Rsa { .. })
                | (Self::Ecdsa { .. }, PublicKey::Ec { .. })
        )
    }

    /// Verifies `signature` over `message` with `key`.
    pub fn verify(&self, key: &PublicKey, message: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let hashed = self.hash().digest(message);
        match (self, key) {
            (Self::RsaPkcs1v15 { hash }, PublicKey::Rsa { modulus, public_exponent }) => {
                let rsa_key = rsa_public_key(modulus, public_exponent)?;
                let scheme = match hash {
                    HashAlgorithm::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
                    HashAlgorithm::Sha224 => Pkcs1v15Sign::new::<Sha224>(),
                    HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                    HashAlgorithm::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
                    HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
                };
                rsa_key.verify(scheme, &hashed, signature)
                    .map_err(|_| SignatureError::InvalidSignature)
            },
            (Self::RsaPss { hash, salt_length }, PublicKey::Rsa { modulus, public_exponent }) => {
                let rsa_key = rsa_public_key(modulus, public_exponent)?;
                match hash {
                    HashAlgorithm::Sha1 => verify_pss::<Sha1>(&rsa_key, *salt_length, &hashed, signature),
                    HashAlgorithm::Sha224 => verify_pss::<Sha224>(&rsa_key, *salt_length, &hashed, signature),
                    HashAlgorithm::Sha256 => verify_pss::<Sha256>(&rsa_key, *salt_length, &hashed, signature),
                    HashAlgorithm::Sha384 => verify_pss::<Sha384>(&rsa_key, *salt_length, &hashed, signature),
                    HashAlgorithm::Sha512 => verify_pss::<Sha512>(&rsa_key, *salt_length, &hashed, signature),
                }
            },
            (Self::Ecdsa { .. }, PublicKey::Ec { curve, point }) => {
                let (r, s) = decode_ecdsa_signature(signature, curve)?;
                if verify_ecdsa(curve, point, &hashed, &r, &s) {
                    Ok(())
                } else {
                    Err(SignatureError::InvalidSignature)
                }
            },
            (_, PublicKey::Unsupported { .. }) => Err(SignatureError::UnsupportedKey),
            _ => Err(SignatureError::KeyMismatch),
        }
    }
}
impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RsaPkcs1v15 { hash } => write!(f, "RSA PKCS#1 v1.5 with {}", hash),
            Self::RsaPss { hash, salt_length } => write!(f, "RSASSA-PSS with {} (salt {})", hash, salt_length),
            Self::Ecdsa { hash } => write!(f, "ECDSA with {}", hash),
        }
    }
}


fn pss_from_parameters(params: &[u8]) -> Result<SignatureAlgorithm, SignatureError> {
    let params: PssParameters = decode_exact(params)?;
    let hash_of = |algorithm: &rasn_pkix::AlgorithmIdentifier| HashAlgorithm::from_oid(&algorithm.algorithm)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm { algorithm: format_oid(&algorithm.algorithm) });

    let hash = match &params.hash_algorithm {
        Some(algorithm) => hash_of(algorithm)?,
        None => HashAlgorithm::Sha1,
    };
    let mgf_hash = match &params.mask_gen_algorithm {
        Some(mgf) => {
            if !oid_matches(&mgf.algorithm, OID_MGF1) {
                return Err(SignatureError::UnsupportedAlgorithm { algorithm: format_oid(&mgf.algorithm) });
            }
            let mgf_params = mgf.parameters.as_ref()
                .ok_or(SignatureError::UnsupportedAlgorithm { algorithm: "MGF1 without a hash".into() })?;
            let mgf_algorithm: rasn_pkix::AlgorithmIdentifier = decode_exact(mgf_params.as_bytes())?;
            hash_of(&mgf_algorithm)?
        },
        None => HashAlgorithm::Sha1,
    };
    let salt_length = match &params.salt_length {
        Some(value) => usize::try_from(value)
            .map_err(|_| SignatureError::UnsupportedAlgorithm { algorithm: "RSASSA-PSS with out-of-range salt".into() })?,
        None => 20,
    };
    if let Some(trailer) = &params.trailer_field {
        if *trailer != Integer::from(1) {
            return Err(SignatureError::UnsupportedAlgorithm { algorithm: "RSASSA-PSS with non-default trailer".into() });
        }
    }

    if mgf_hash != hash {
        return Err(SignatureError::UnsupportedAlgorithm {
            algorithm: format!("RSASSA-PSS with {} and MGF1 with {}", hash, mgf_hash),
        });
    }
    Ok(SignatureAlgorithm::RsaPss { hash, salt_length })
}


/// Decodes a DER value that must span all of `bytes`.
fn decode_exact<T: Decode>(bytes: &[u8]) -> Result<T, SignatureError> {
    let mut decoder = Decoder::new(bytes, DecoderOptions::der());
    let value = T::decode(&mut decoder)?;
    if decoder.decoded_len() != bytes.len() {
        return Err(SignatureError::MalformedSignature);
    }
    Ok(value)
}


fn rsa_public_key(modulus: &BigUint, public_exponent: &BigUint) -> Result<RsaPublicKey, SignatureError> {
    RsaPublicKey::new_with_max_size(
        BoxedUint::from_be_slice_vartime(&modulus.to_bytes_be()),
        BoxedUint::from_be_slice_vartime(&public_exponent.to_bytes_be()),
        MAX_RSA_MODULUS_BITS,
    )
        .map_err(|_| SignatureError::UnsupportedKey)
}


fn verify_pss<D: Digest + FixedOutputReset>(key: &RsaPublicKey, salt_length: usize, hashed: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
    key.verify(Pss::<D>::new_with_salt(salt_length), hashed, signature)
        .map_err(|_| SignatureError::InvalidSignature)
}


/// Decodes an ECDSA signature, either `ECDSA-Sig-Value` or plain `r || s`.
pub(crate) fn decode_ecdsa_signature(signature: &[u8], curve: &PrimeWeierstrassCurve) -> Result<(BigUint, BigUint), SignatureError> {
    if signature.first() == Some(&0x30) {
        if let Ok(value) = decode_exact::<EcdsaSigValue>(signature) {
            let r = unsigned_integer(&value.r).map_err(|_| SignatureError::MalformedSignature)?;
            let s = unsigned_integer(&value.s).map_err(|_| SignatureError::MalformedSignature)?;
            return Ok((r, s));
        }
    }

    let order_len = curve.private_key_len_bytes();
    if signature.len() != 2*order_len {
        return Err(SignatureError::MalformedSignature);
    }
    let (r, s) = signature.split_at(order_len);
    Ok((BigUint::from_bytes_be(r), BigUint::from_bytes_be(s)))
}


/// The ECDSA verification primitive (SEC 1 § 4.1.4).
fn verify_ecdsa(curve: &PrimeWeierstrassCurve, public_key: &AffinePoint, hashed: &[u8], r: &BigUint, s: &BigUint) -> bool {
    let n = curve.order();
    if r.is_zero() || s.is_zero() || r >= n || s >= n {
        return false;
    }
    if !curve.is_on_curve(public_key) {
        return false;
    }

    // leftmost bits of the hash, as many as the order has
    let mut e = BigUint::from_bytes_be(hashed);
    let hash_bits = 8 * u64::try_from(hashed.len()).unwrap_or(u64::MAX);
    if hash_bits > n.bits() {
        e >>= hash_bits - n.bits();
    }

    // n is prime, so s^(n-2) is the inverse
    let two = BigUint::from(2u8);
    let w = s.modpow(&(n - &two), n);
    let u1 = (&e * &w) % n;
    let u2 = (r * &w) % n;

    let lhs = curve.multiply(&u1, curve.generator());
    let rhs = curve.multiply(&u2, public_key);
    let sum = match (lhs, rhs) {
        (Some(l), Some(r)) => curve.add(&l, &r),
        (Some(p), None)|(None, Some(p)) => Some(p),
        (None, None) => None,
    };
    match sum {
        Some(point) => (point.x() % n) == *r,
        None => false,
    }
}


/// Whether the public exponent is the given small value; used to classify RSA keys.
pub fn has_public_exponent(key: &PublicKey, exponent: u32) -> bool {
    match key {
        PublicKey::Rsa { public_exponent, .. } => *public_exponent == BigUint::from(exponent),
        _ => false,
    }
}
