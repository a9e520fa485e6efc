//! Implementation of Password Authenticated Connection Establishment.
//!
//! Only generic mapping is implemented, with either classic or elliptic-curve Diffie-Hellman.


pub mod oids;


use std::fmt;

use num_bigint::BigUint;
use rasn::types::{ObjectIdentifier, Oid};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::asn1::{DecodeError, Element};
use crate::crypt::{self, KeyExchange};
use crate::crypt::cipher_mac::{self, CipherAndMac};
use crate::crypt::dh::get_1024_modp_160_po;
use crate::crypt::elliptic::curves::curve_from_parameter_id;
use crate::der_util::{encode_primitive_length, encode_tlv, format_oid, oid_to_der_bytes};
use crate::iso7816::apdu::{Apdu, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::pace::oids::{KeyAgreement, Mapping, PaceProtocol};
use crate::secure_messaging::{self, SecureChannel};
use crate::security_info::PaceInfo;


const TAG_DYNAMIC_AUTHENTICATION_DATA: u8 = 0x7C;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetAuthenticationTemplate,
    ObtainNonce,
    ExchangeMappingPublicKeys,
    ExchangeEphemeralPublicKeys,
    MutualAuthentication,
}


#[derive(Debug)]
pub enum Error {
    NotSupported { protocol: ObjectIdentifier },
    MappingNotSupported { protocol: ObjectIdentifier },
    CustomParameters,
    IncompatibleProtocolParameter { protocol: ObjectIdentifier, parameter: u64 },
    Communication(CommunicationError),
    OperationFailed { operation: Operation, response: Response },
    MalformedResponse { operation: Operation, error: DecodeError },
    UnexpectedType { operation: Operation, type_tag: u32 },
    MissingObject { operation: Operation, tag: u32 },
    DiffieHellmanKeysEqual,
    MutualAuthentication,
    Crypto(crypt::Error),
    SecureMessaging(secure_messaging::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotSupported { protocol }
                => write!(f, "{} is not a PACE protocol", format_oid(protocol)),
            Self::MappingNotSupported { protocol }
                => write!(f, "the mapping of protocol {} is currently not supported", format_oid(protocol)),
            Self::CustomParameters
                => write!(f, "custom parameters are not currently supported"),
            Self::IncompatibleProtocolParameter { protocol, parameter }
                => write!(f, "protocol {} is incompatible with parameter {}", format_oid(protocol), parameter),
            Self::Communication(e)
                => write!(f, "communication failed: {}", e),
            Self::OperationFailed { operation, response }
                => write!(f, "operation {:?} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::MalformedResponse { operation, error }
                => write!(f, "operation {:?} received a malformed response: {}", operation, error),
            Self::UnexpectedType { operation, type_tag }
                => write!(f, "operation {:?} received response of unexpected type 0x{:02X}", operation, type_tag),
            Self::MissingObject { operation, tag }
                => write!(f, "response to operation {:?} lacks object 0x{:02X}", operation, tag),
            Self::DiffieHellmanKeysEqual
                => write!(f, "terminal and chip Diffie-Hellman keys are equal"),
            Self::MutualAuthentication
                => write!(f, "mutual authentication failed"),
            Self::Crypto(e)
                => write!(f, "cryptographic failure: {}", e),
            Self::SecureMessaging(e)
                => write!(f, "failed to set up Secure Messaging: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NotSupported { .. } => None,
            Self::MappingNotSupported { .. } => None,
            Self::CustomParameters => None,
            Self::IncompatibleProtocolParameter { .. } => None,
            Self::Communication(e) => Some(e),
            Self::OperationFailed { .. } => None,
            Self::MalformedResponse { error, .. } => Some(error),
            Self::UnexpectedType { .. } => None,
            Self::MissingObject { .. } => None,
            Self::DiffieHellmanKeysEqual => None,
            Self::MutualAuthentication => None,
            Self::Crypto(e) => Some(e),
            Self::SecureMessaging(e) => Some(e),
        }
    }
}
impl From<CommunicationError> for Error {
    fn from(value: CommunicationError) -> Self { Self::Communication(value) }
}
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}
impl From<secure_messaging::Error> for Error {
    fn from(value: secure_messaging::Error) -> Self { Self::SecureMessaging(value) }
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum PasswordSource {
    Mrz,
    Can,
}


/// Picks the key exchange for a PACE protocol and standardized domain parameter ID
/// (Doc 9303 Part 11 § 9.5.1).
pub fn key_exchange_for(protocol: &ObjectIdentifier, parameter_id: u64) -> Result<KeyExchange, Error> {
    let pace_protocol = PaceProtocol::from_oid(protocol)
        .ok_or_else(|| Error::NotSupported { protocol: protocol.clone() })?;
    if pace_protocol.mapping != Mapping::Generic {
        return Err(Error::MappingNotSupported { protocol: protocol.clone() });
    }
    let incompatible = || Error::IncompatibleProtocolParameter {
        protocol: protocol.clone(),
        parameter: parameter_id,
    };
    match pace_protocol.key_agreement {
        KeyAgreement::DiffieHellman => match parameter_id {
            0 => Ok(KeyExchange::DiffieHellman(get_1024_modp_160_po())),
            _ => Err(incompatible()),
        },
        KeyAgreement::EllipticCurveDiffieHellman => {
            if !(8..=18).contains(&parameter_id) {
                return Err(incompatible());
            }
            curve_from_parameter_id(parameter_id)
                .map(KeyExchange::PrimeWeierstrassEllipticDiffieHellman)
                .ok_or_else(incompatible)
        },
    }
}


/// Sends GENERAL AUTHENTICATE with the given dynamic authentication data object and returns the
/// contents of the expected object in the chip's response.
fn general_authenticate<SC: SmartCard + ?Sized>(
    card: &mut SC,
    operation: Operation,
    last_in_chain: bool,
    request_object: Option<(u8, &[u8])>,
    response_tag: u32,
) -> Result<Zeroizing<Vec<u8>>, Error> {
    let mut inner = Zeroizing::new(Vec::new());
    if let Some((tag, value)) = request_object {
        encode_tlv(&mut inner, &[tag], value);
    }
    let mut request_data = vec![TAG_DYNAMIC_AUTHENTICATION_DATA];
    encode_primitive_length(&mut request_data, inner.len());
    request_data.extend(inner.iter());

    let request = Apdu::new(
        if last_in_chain { 0b000_0_00_00 } else { 0b000_1_00_00 }, // command chaining bit
        0x86, // GENERAL AUTHENTICATE
        0x00, // algorithm is known (from "set authentication template")
        0x00, // key index is known (from "set authentication template")
        Data::BothDataShort {
            request_data,
            response_data_length: 0,
        },
    );
    let response = card.communicate(&request)?;
    if !response.is_success() {
        return Err(Error::OperationFailed { operation, response });
    }
    extract_dynamic_authentication_object(operation, &response, response_tag)
}


fn extract_dynamic_authentication_object(operation: Operation, response: &Response, tag: u32) -> Result<Zeroizing<Vec<u8>>, Error> {
    let malformed = |error| Error::MalformedResponse { operation, error };
    let outer = Element::parse_exact(&response.data).map_err(malformed)?;
    if outer.tag != u32::from(TAG_DYNAMIC_AUTHENTICATION_DATA) {
        return Err(Error::UnexpectedType { operation, type_tag: outer.tag });
    }
    let inner = outer.find_child(tag)
        .map_err(malformed)?
        .ok_or(Error::MissingObject { operation, tag })?;
    Ok(Zeroizing::new(inner.content.to_vec()))
}


/// Selects the PACE protocol and password using MSE:Set AT.
#[instrument(skip(card, mechanism))]
pub fn set_authentication_template<SC: SmartCard + ?Sized>(
    card: &mut SC,
    mechanism: &Oid,
    password_source: PasswordSource,
) -> Result<(), Error> {
    let mut request_data = Vec::new();
    encode_tlv(&mut request_data, &[0x80], &oid_to_der_bytes(mechanism));
    let password_reference = match password_source {
        PasswordSource::Mrz => 0x01,
        PasswordSource::Can => 0x02,
    };
    encode_tlv(&mut request_data, &[0x83], &[password_reference]);

    let request = Apdu::new(
        0x00,
        0x22, // MANAGE SECURITY ENVIRONMENT
        0b1100_0001, // verify/encrypt/extauth, compute/decrypt/intauth, set
        0xA4, // control reference template for authentication
        Data::RequestDataShort { request_data },
    );
    let response = card.communicate(&request)?;
    if response.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed { operation: Operation::SetAuthenticationTemplate, response })
    }
}


/// Asks the chip for its encrypted nonce.
#[instrument(skip(card))]
pub fn obtain_encrypted_nonce<SC: SmartCard + ?Sized>(card: &mut SC) -> Result<Zeroizing<Vec<u8>>, Error> {
    general_authenticate(card, Operation::ObtainNonce, false, None, 0x80)
}


/// Calculates the token used for mutual authentication.
fn calculate_mutual_token(
    cipher_mac: &dyn CipherAndMac,
    protocol: &Oid,
    public_key_tag: u8,
    public_key: &[u8],
    k_session_mac: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    // 7F49 { 06 protocol, 84|86 public key }
    let mut inner_data = Zeroizing::new(Vec::new());
    encode_tlv(&mut inner_data, &[0x06], &oid_to_der_bytes(protocol));
    encode_tlv(&mut inner_data, &[public_key_tag], public_key);

    let mut outer_data = Zeroizing::new(Vec::new());
    encode_tlv(&mut outer_data, &[0x7F, 0x49], &inner_data);

    let padded = if cipher_mac.mac_block_size() > 1 {
        cipher_mac::pad(&outer_data, cipher_mac.mac_block_size())
    } else {
        outer_data
    };
    Ok(cipher_mac.mac_padded_data(&padded, k_session_mac)?)
}


/// Performs a generic mapping key exchange using specific values.
///
/// `mrz_key` is the document number, date of birth and date of expiry, each followed by its check
/// digit. `encrypted_nonce` is the result of [`obtain_encrypted_nonce`].
#[instrument(skip_all)]
pub fn perform_gm_kex_with_values<SC: SmartCard + ?Sized>(
    card: &mut SC,
    protocol: &Oid,
    key_exchange: KeyExchange,
    cipher_mac: &'static dyn CipherAndMac,
    mrz_key: &[u8],
    encrypted_nonce: &[u8],
    derivation_private_key: &BigUint,
    session_private_key: &BigUint,
) -> Result<SecureChannel, Error> {
    // K_pi = KDF_pi(SHA-1(MRZ key))
    let mrz_hash = Zeroizing::new(Sha1::digest(mrz_key).to_vec());
    let nonce_key = cipher_mac.derive_key_from_password(&mrz_hash);

    let nonce_iv = vec![0u8; cipher_mac.cipher_block_size()];
    let mut nonce_bytes = Zeroizing::new(encrypted_nonce.to_vec());
    cipher_mac.decrypt_padded_data(&mut nonce_bytes, &nonce_key, &nonce_iv)?;
    let nonce = Zeroizing::new(BigUint::from_bytes_be(&nonce_bytes));

    // mapping: derive the session generator from the nonce and a first shared secret
    let session_key_exchange = {
        let public_key_bytes = key_exchange.calculate_public_key(derivation_private_key)?;
        let card_public_key_bytes = general_authenticate(
            card, Operation::ExchangeMappingPublicKeys, false,
            Some((0x81, &public_key_bytes)), 0x82,
        )?;
        key_exchange.derive_generic_mapping(&nonce, derivation_private_key, &card_public_key_bytes)?
    };

    // second round of key agreement with the mapped parameters
    let public_key_bytes = session_key_exchange.calculate_public_key(session_private_key)?;
    let card_public_key_bytes = general_authenticate(
        card, Operation::ExchangeEphemeralPublicKeys, false,
        Some((0x83, &public_key_bytes)), 0x84,
    )?;
    if bool::from(public_key_bytes.ct_eq(card_public_key_bytes.as_slice())) {
        return Err(Error::DiffieHellmanKeysEqual);
    }
    let shared_secret = session_key_exchange.exchange_keys(session_private_key, &card_public_key_bytes)?;

    let k_session_mac = cipher_mac.derive_mac_key(&shared_secret);

    // the terminal authenticates the chip's key and vice versa
    let outgoing_token = calculate_mutual_token(
        cipher_mac, protocol, key_exchange.public_key_tag(),
        &card_public_key_bytes, &k_session_mac,
    )?;
    let expected_token = calculate_mutual_token(
        cipher_mac, protocol, key_exchange.public_key_tag(),
        &public_key_bytes, &k_session_mac,
    )?;
    let incoming_token = general_authenticate(
        card, Operation::MutualAuthentication, true,
        Some((0x85, &outgoing_token)), 0x86,
    )?;
    if !bool::from(incoming_token.ct_eq(&expected_token)) {
        return Err(Error::MutualAuthentication);
    }

    debug!("PACE established using {}", cipher_mac.name());
    Ok(SecureChannel::from_shared_secret_zero_counter(cipher_mac, &shared_secret)?)
}


/// Authenticates with the card using PACE and the MRZ password.
///
/// `pace_info` is taken from EF.CardAccess.
#[instrument(skip(card, mrz_key))]
pub fn establish<SC: SmartCard + ?Sized>(
    card: &mut SC,
    pace_info: &PaceInfo,
    mrz_key: &[u8],
) -> Result<SecureChannel, Error> {
    let protocol = pace_info.pace_protocol()
        .ok_or_else(|| Error::NotSupported { protocol: pace_info.protocol.clone() })?;
    if protocol.mapping != Mapping::Generic {
        return Err(Error::MappingNotSupported { protocol: pace_info.protocol.clone() });
    }
    let parameter_id = pace_info.parameter_id
        .ok_or(Error::CustomParameters)?;
    let key_exchange = key_exchange_for(&pace_info.protocol, parameter_id)?;
    let cipher_mac = cipher_mac::for_kdf_algorithm(protocol.cipher);

    set_authentication_template(card, &pace_info.protocol, PasswordSource::Mrz)?;
    let encrypted_nonce = obtain_encrypted_nonce(card)?;

    let derivation_private_key = key_exchange.generate_private_key();
    let session_private_key = key_exchange.generate_private_key();
    perform_gm_kex_with_values(
        card,
        &pace_info.protocol,
        key_exchange,
        cipher_mac,
        mrz_key,
        &encrypted_nonce,
        &derivation_private_key,
        &session_private_key,
    )
}
