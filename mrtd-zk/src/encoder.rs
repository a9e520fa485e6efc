//! Canonical encoding of an authenticated passport into the fixed-shape inputs of a proving circuit.
//!
//! Every value ends up as a list of decimal strings. Byte strings are encoded byte by byte; large
//! integers (signature, public key, address) are split into big-endian words.


use std::collections::BTreeMap;
use std::fmt;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::crypt::elliptic::pad_be_bytes;
use crate::der_util::encode_tlv;
use crate::mrz::MrzAttribute;
use crate::passive_auth::PassiveAuthResult;
use crate::signature::{decode_ecdsa_signature, has_public_exponent, HashAlgorithm, SignatureAlgorithm};
use crate::x509::PublicKey;


/// Tag of DG1 and of the MRZ within it.
const TAG_DG1: [u8; 1] = [0x61];
const TAG_MRZ: [u8; 2] = [0x5F, 0x1F];


/// A value does not fit into the slot the circuit reserves for it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct EncodingOverflowError {
    pub field: &'static str,
}
impl fmt::Display for EncodingOverflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "value of {} exceeds its fixed capacity", self.field)
    }
}
impl std::error::Error for EncodingOverflowError {
}


/// The shape of the circuit's inputs.
///
/// Missing fields take their default values when deserialized.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Number of MRZ characters; shorter MRZs are padded with zeros.
    pub mrz_length: usize,

    /// Whether the MRZ is preceded by the DG1 and MRZ tags and lengths (`61 5B 5F 1F 58` for 88
    /// characters), as in the hashed DG1.
    pub include_dg1_header: bool,

    /// Size of the padded LDSSecurityObject in bytes.
    pub data_hashes_capacity: usize,

    pub word_bits: usize,
    pub signature_words: usize,
    pub pubkey_words: usize,
    pub address_words: usize,

    /// Word size of the address, which is usually passed as a single field element.
    pub address_word_bits: usize,
}
impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            mrz_length: 88,
            include_dg1_header: true,
            data_hashes_capacity: 320,
            word_bits: 64,
            signature_words: 32,
            pubkey_words: 32,
            address_words: 1,
            address_word_bits: 256,
        }
    }
}


/// Membership proof of the prover in a registry, passed through to the circuit.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct MerkleProof {
    pub path_indices: Vec<u64>,
    pub siblings: Vec<BigUint>,
    pub root: BigUint,
}


/// The circuit inputs derived from one document.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CanonicalPassportRecord {
    /// The DG1 header, if configured; empty otherwise.
    pub mrz_prefix: Vec<u8>,

    /// The MRZ characters, zero-padded to the configured length.
    pub mrz_bytes: Vec<u8>,

    pub reveal_bitmap: Vec<u8>,

    /// The padded LDSSecurityObject, zero-filled to capacity.
    pub data_hashes_padded: Vec<u8>,
    pub data_hashes_padded_length: usize,

    pub signed_content_bytes: Vec<u8>,
    pub signature_words: Vec<BigUint>,
    pub signature_algorithm: u32,
    pub public_key_words: Vec<BigUint>,
    pub address_words: Vec<BigUint>,
    pub merkle_proof: Option<MerkleProof>,
}
impl CanonicalPassportRecord {
    /// Reads back an attribute from the encoded MRZ.
    pub fn mrz_attribute(&self, attribute: MrzAttribute) -> Option<String> {
        decode_mrz_attribute(&self.mrz_bytes, attribute)
    }

    /// Renders the record as the named decimal-string vectors the prover consumes.
    pub fn to_prover_inputs(&self) -> BTreeMap<String, Vec<String>> {
        fn bytes(values: &[u8]) -> Vec<String> {
            values.iter().map(|b| b.to_string()).collect()
        }
        fn words(values: &[BigUint]) -> Vec<String> {
            values.iter().map(|w| w.to_string()).collect()
        }

        let mut mrz = self.mrz_prefix.clone();
        mrz.extend(&self.mrz_bytes);

        let mut inputs = BTreeMap::new();
        inputs.insert("mrz".to_owned(), bytes(&mrz));
        inputs.insert("reveal_bitmap".to_owned(), bytes(&self.reveal_bitmap));
        inputs.insert("dataHashes".to_owned(), bytes(&self.data_hashes_padded));
        inputs.insert("datahashes_padded_length".to_owned(), vec![self.data_hashes_padded_length.to_string()]);
        inputs.insert("eContentBytes".to_owned(), bytes(&self.signed_content_bytes));
        inputs.insert("signature".to_owned(), words(&self.signature_words));
        inputs.insert("signatureAlgorithm".to_owned(), vec![self.signature_algorithm.to_string()]);
        inputs.insert("pubkey".to_owned(), words(&self.public_key_words));
        inputs.insert("address".to_owned(), words(&self.address_words));
        if let Some(proof) = &self.merkle_proof {
            inputs.insert("pathIndices".to_owned(), proof.path_indices.iter().map(|i| i.to_string()).collect());
            inputs.insert("siblings".to_owned(), words(&proof.siblings));
            inputs.insert("root".to_owned(), vec![proof.root.to_string()]);
        }
        inputs
    }
}


/// Extracts an attribute's characters from an unprefixed TD3 MRZ.
pub fn decode_mrz_attribute(mrz: &[u8], attribute: MrzAttribute) -> Option<String> {
    let slice = mrz.get(attribute.range())?;
    String::from_utf8(slice.to_vec()).ok()
}


/// Marks with 1 each MRZ position covered by one of the revealed attributes.
pub fn reveal_bitmap(revealed: &[MrzAttribute], mrz_length: usize) -> Vec<u8> {
    let mut bitmap = vec![0u8; mrz_length];
    for attribute in revealed {
        for position in attribute.range() {
            if let Some(bit) = bitmap.get_mut(position) {
                *bit = 1;
            }
        }
    }
    bitmap
}


/// Appends Merkle-Damgård padding for the given hash: `0x80`, zeros, and the message length in
/// bits, so that the result is a whole number of blocks.
pub fn md_pad(message: &[u8], hash: HashAlgorithm) -> Vec<u8> {
    let block_len = hash.block_len();
    let length_len = hash.length_field_len();
    let bit_length = (message.len() as u128) * 8;

    let mut padded = message.to_vec();
    padded.push(0x80);
    while (padded.len() + length_len) % block_len != 0 {
        padded.push(0x00);
    }
    let length_bytes = bit_length.to_be_bytes();
    padded.extend(&length_bytes[length_bytes.len() - length_len..]);
    padded
}


/// Splits a number into `count` words of `word_bits` bits, most significant word first.
pub fn split_words(value: &BigUint, word_bits: usize, count: usize, field: &'static str) -> Result<Vec<BigUint>, EncodingOverflowError> {
    if word_bits == 0 {
        return Err(EncodingOverflowError { field });
    }
    let mask = (BigUint::one() << word_bits) - BigUint::one();

    let mut words = Vec::new();
    let mut rest = value.clone();
    while !rest.is_zero() {
        words.push(&rest & &mask);
        rest >>= word_bits;
    }
    if words.len() > count {
        return Err(EncodingOverflowError { field });
    }
    words.resize(count, BigUint::zero());
    words.reverse();
    Ok(words)
}


/// The circuit's identifier for a signature scheme.
pub fn signature_algorithm_code(algorithm: SignatureAlgorithm, key: &PublicKey) -> Result<u32, EncodingOverflowError> {
    let e65537 = has_public_exponent(key, 65537);
    let e3 = has_public_exponent(key, 3);
    let code = match algorithm {
        SignatureAlgorithm::RsaPkcs1v15 { hash: HashAlgorithm::Sha256 } if e65537 => 1,
        SignatureAlgorithm::RsaPkcs1v15 { hash: HashAlgorithm::Sha256 } if e3 => 2,
        SignatureAlgorithm::RsaPkcs1v15 { hash: HashAlgorithm::Sha1 } if e65537 => 3,
        SignatureAlgorithm::RsaPss { .. } if e65537 => 4,
        SignatureAlgorithm::RsaPss { .. } if e3 => 5,
        SignatureAlgorithm::Ecdsa { hash: HashAlgorithm::Sha384 } => 6,
        SignatureAlgorithm::Ecdsa { hash: HashAlgorithm::Sha1 } => 7,
        SignatureAlgorithm::Ecdsa { hash: HashAlgorithm::Sha256 } => 8,
        SignatureAlgorithm::Ecdsa { hash: HashAlgorithm::Sha512 } => 9,
        SignatureAlgorithm::RsaPkcs1v15 { hash: HashAlgorithm::Sha512 } if e65537 => 10,
        _ => return Err(EncodingOverflowError { field: "signatureAlgorithm" }),
    };
    Ok(code)
}


/// The signature as one number: the RSA signature value, or `r || s` for ECDSA.
fn signature_value(algorithm: SignatureAlgorithm, key: &PublicKey, signature: &[u8]) -> Result<BigUint, EncodingOverflowError> {
    const FIELD: &str = "signature";
    match (algorithm, key) {
        (SignatureAlgorithm::Ecdsa { .. }, PublicKey::Ec { curve, .. }) => {
            let (r, s) = decode_ecdsa_signature(signature, curve)
                .map_err(|_| EncodingOverflowError { field: FIELD })?;
            let length = curve.coordinate_len_bytes();
            let mut bytes = pad_be_bytes(&r, length)
                .map_err(|_| EncodingOverflowError { field: FIELD })?
                .to_vec();
            bytes.extend(pad_be_bytes(&s, length).map_err(|_| EncodingOverflowError { field: FIELD })?.iter());
            Ok(BigUint::from_bytes_be(&bytes))
        },
        _ => Ok(BigUint::from_bytes_be(signature)),
    }
}


/// The public key as one number: the RSA modulus, or `x || y` for elliptic curves.
fn public_key_value(key: &PublicKey) -> Result<BigUint, EncodingOverflowError> {
    match key {
        PublicKey::Rsa { .. } | PublicKey::Ec { .. } => key.key_bytes()
            .map(|bytes| BigUint::from_bytes_be(&bytes))
            .map_err(|_| EncodingOverflowError { field: "pubkey" }),
        _ => Err(EncodingOverflowError { field: "pubkey" }),
    }
}


/// Turns authenticated documents into circuit inputs of a fixed shape.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct CanonicalEncoder {
    config: EncoderConfig,
}
impl CanonicalEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig { &self.config }

    /// Encodes the MRZ, zero-padded and optionally prefixed with the DG1 header.
    pub fn encode_mrz(&self, mrz: &[u8]) -> Result<(Vec<u8>, Vec<u8>), EncodingOverflowError> {
        if mrz.len() > self.config.mrz_length {
            return Err(EncodingOverflowError { field: "mrz" });
        }
        let mut padded = mrz.to_vec();
        padded.resize(self.config.mrz_length, 0x00);

        let mut prefix = Vec::new();
        if self.config.include_dg1_header {
            let mut dg1 = Vec::new();
            let mut mrz_object = Vec::new();
            encode_tlv(&mut mrz_object, &TAG_MRZ, &padded);
            encode_tlv(&mut dg1, &TAG_DG1, &mrz_object);
            prefix = dg1[..dg1.len() - padded.len()].to_vec();
        }
        Ok((prefix, padded))
    }

    /// Pads the signed LDSSecurityObject as its hash function would and fills it up with zeros.
    ///
    /// Returns the filled buffer and the length of the padded message.
    pub fn encode_data_hashes(&self, lds_security_object: &[u8], hash: HashAlgorithm) -> Result<(Vec<u8>, usize), EncodingOverflowError> {
        let mut padded = md_pad(lds_security_object, hash);
        let padded_length = padded.len();
        if padded_length > self.config.data_hashes_capacity {
            return Err(EncodingOverflowError { field: "dataHashes" });
        }
        padded.resize(self.config.data_hashes_capacity, 0x00);
        Ok((padded, padded_length))
    }

    #[instrument(skip_all)]
    pub fn encode(
        &self,
        mrz: &[u8],
        auth: &PassiveAuthResult,
        address: &BigUint,
        revealed: &[MrzAttribute],
        merkle_proof: Option<&MerkleProof>,
    ) -> Result<CanonicalPassportRecord, EncodingOverflowError> {
        let config = &self.config;
        let key = auth.signer.public_key();

        let (mrz_prefix, mrz_bytes) = self.encode_mrz(mrz)?;
        let reveal_bitmap = reveal_bitmap(revealed, config.mrz_length);
        let (data_hashes_padded, data_hashes_padded_length) = self.encode_data_hashes(
            auth.sod.lds_security_object(),
            auth.sod.digest_algorithm(),
        )?;
        let signature_algorithm = signature_algorithm_code(auth.signature_algorithm, key)?;

        let signature = signature_value(auth.signature_algorithm, key, auth.sod.signature())?;
        let signature_words = split_words(&signature, config.word_bits, config.signature_words, "signature")?;
        let public_key_words = split_words(&public_key_value(key)?, config.word_bits, config.pubkey_words, "pubkey")?;
        let address_words = split_words(address, config.address_word_bits, config.address_words, "address")?;

        debug!(
            "encoded record: algorithm {}, {} of {} data hash bytes used",
            signature_algorithm, data_hashes_padded_length, config.data_hashes_capacity,
        );
        Ok(CanonicalPassportRecord {
            mrz_prefix,
            mrz_bytes,
            reveal_bitmap,
            data_hashes_padded,
            data_hashes_padded_length,
            signed_content_bytes: auth.sod.signed_content().to_vec(),
            signature_words,
            signature_algorithm,
            public_key_words,
            address_words,
            merkle_proof: merkle_proof.cloned(),
        })
    }
}
