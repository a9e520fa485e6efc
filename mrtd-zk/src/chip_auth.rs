//! Chip Authentication (Doc 9303 Part 11 § 6.2).
//!
//! The terminal agrees on a key with the static key pair stored in DG14 and restarts Secure
//! Messaging with the derived keys. This proves the chip was not cloned.


use std::fmt;

use num_bigint::BigUint;
use tracing::{info, instrument, warn};
use zeroize::Zeroizing;

use crate::crypt::{self, KeyExchange};
use crate::crypt::cipher_mac;
use crate::crypt::elliptic::pad_be_bytes;
use crate::der_util::{encode_tlv, oid_to_der_bytes};
use crate::iso7816::apdu::{Apdu, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::kdf::KdfAlgorithm;
use crate::lds::dg14::Dg14;
use crate::pace::oids::KeyAgreement;
use crate::secure_messaging::{self, SecureChannel};
use crate::security_info::{ChipAuthProtocol, ChipAuthenticationInfo, ChipAuthenticationPublicKeyInfo};
use crate::session::ChipSession;
use crate::x509::PublicKey;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    SetKeyAgreementTemplate,
    SetAuthenticationTemplate,
    GeneralAuthenticate,
}


#[derive(Debug)]
pub enum Error {
    NoSupportedProtocol,
    NoMatchingPublicKey,
    KeyTypeMismatch,
    Communication(CommunicationError),
    OperationFailed { operation: Operation, response: Response },
    Crypto(crypt::Error),
    SecureMessaging(secure_messaging::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSupportedProtocol
                => write!(f, "DG14 offers no supported Chip Authentication protocol"),
            Self::NoMatchingPublicKey
                => write!(f, "DG14 has no public key matching the Chip Authentication protocol"),
            Self::KeyTypeMismatch
                => write!(f, "the Chip Authentication public key does not fit the protocol"),
            Self::Communication(e)
                => write!(f, "communication failed: {}", e),
            Self::OperationFailed { operation, response }
                => write!(f, "operation {:?} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::Crypto(e)
                => write!(f, "cryptographic failure: {}", e),
            Self::SecureMessaging(e)
                => write!(f, "failed to restart Secure Messaging: {}", e),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Communication(e) => Some(e),
            Self::Crypto(e) => Some(e),
            Self::SecureMessaging(e) => Some(e),
            _ => None,
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


/// The result of attempting Chip Authentication.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ChipAuthOutcome {
    pub succeeded: bool,
    pub protocol: Option<ChipAuthProtocol>,
}


/// Picks the first supported Chip Authentication protocol from DG14 along with its public key.
///
/// A public key belongs to a protocol if both lack a key ID or both have the same one.
pub fn select_key(dg14: &Dg14) -> Result<(&ChipAuthenticationInfo, ChipAuthProtocol, &ChipAuthenticationPublicKeyInfo), Error> {
    let mut found_protocol = false;
    for info in dg14.chip_authentication_infos() {
        let Some(protocol) = info.chip_auth_protocol() else { continue };
        found_protocol = true;
        let public_key = dg14.chip_authentication_public_keys()
            .find(|pk| pk.key_id == info.key_id && key_fits(protocol.key_agreement, &pk.public_key));
        if let Some(pk) = public_key {
            return Ok((info, protocol, pk));
        }
    }
    if found_protocol {
        Err(Error::NoMatchingPublicKey)
    } else {
        Err(Error::NoSupportedProtocol)
    }
}

fn key_fits(key_agreement: KeyAgreement, public_key: &PublicKey) -> bool {
    matches!(
        (key_agreement, public_key),
        (KeyAgreement::DiffieHellman, PublicKey::Dh { .. })
            | (KeyAgreement::EllipticCurveDiffieHellman, PublicKey::Ec { .. })
    )
}


/// Returns the key exchange described by the chip's static public key and the key itself in the
/// same encoding as [`KeyExchange::calculate_public_key`] uses.
fn chip_key_exchange(public_key: &PublicKey) -> Result<(KeyExchange, Zeroizing<Vec<u8>>), Error> {
    match public_key {
        PublicKey::Ec { curve, point } => {
            let bytes = point.to_be_bytes(curve.coordinate_len_bytes())?;
            Ok((KeyExchange::PrimeWeierstrassEllipticDiffieHellman(curve.clone()), bytes))
        },
        PublicKey::Dh { params, public_value } => {
            let bytes = pad_be_bytes(public_value, params.prime_len_bytes())?;
            Ok((KeyExchange::DiffieHellman(params.clone()), bytes))
        },
        _ => Err(Error::KeyTypeMismatch),
    }
}


fn key_reference(key_id: u64) -> Vec<u8> {
    let bytes = key_id.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len() - 1);
    bytes[first..].to_vec()
}


fn expect_success(operation: Operation, response: Response) -> Result<(), Error> {
    if response.is_success() {
        Ok(())
    } else {
        Err(Error::OperationFailed { operation, response })
    }
}


/// Runs Chip Authentication with a given ephemeral private key.
///
/// `card` must already be protected by Secure Messaging. Returns the channel keyed with the
/// result; the caller decides whether to switch to it.
#[instrument(skip_all)]
pub fn perform_with_values<SC: SmartCard + ?Sized>(
    card: &mut SC,
    info: &ChipAuthenticationInfo,
    protocol: ChipAuthProtocol,
    public_key_info: &ChipAuthenticationPublicKeyInfo,
    ephemeral_private_key: &BigUint,
) -> Result<SecureChannel, Error> {
    let (key_exchange, chip_public_key) = chip_key_exchange(&public_key_info.public_key)?;
    let ephemeral_public_key = key_exchange.calculate_public_key(ephemeral_private_key)?;

    if protocol.cipher == KdfAlgorithm::DesEde3Cbc {
        // MSE:Set KAT { 91 ephemeral public key, [84 key reference] }
        let mut request_data = Vec::new();
        encode_tlv(&mut request_data, &[0x91], &ephemeral_public_key);
        if let Some(key_id) = info.key_id {
            encode_tlv(&mut request_data, &[0x84], &key_reference(key_id));
        }
        let request = Apdu::new(
            0x00,
            0x22, // MANAGE SECURITY ENVIRONMENT
            0x41, // set for computation
            0xA6, // key agreement template
            Data::RequestDataShort { request_data },
        );
        expect_success(Operation::SetKeyAgreementTemplate, card.communicate(&request)?)?;
    } else {
        // MSE:Set AT { 80 protocol, [84 key reference] }
        let mut request_data = Vec::new();
        encode_tlv(&mut request_data, &[0x80], &oid_to_der_bytes(&info.protocol));
        if let Some(key_id) = info.key_id {
            encode_tlv(&mut request_data, &[0x84], &key_reference(key_id));
        }
        let request = Apdu::new(
            0x00,
            0x22, // MANAGE SECURITY ENVIRONMENT
            0x41, // set for computation
            0xA4, // authentication template
            Data::RequestDataShort { request_data },
        );
        expect_success(Operation::SetAuthenticationTemplate, card.communicate(&request)?)?;

        // GENERAL AUTHENTICATE { 7C { 80 ephemeral public key } }
        let mut inner = Vec::new();
        encode_tlv(&mut inner, &[0x80], &ephemeral_public_key);
        let mut request_data = Vec::new();
        encode_tlv(&mut request_data, &[0x7C], &inner);
        let request = Apdu::new(
            0x00,
            0x86, // GENERAL AUTHENTICATE
            0x00, 0x00,
            Data::BothDataShort { request_data, response_data_length: 0 },
        );
        expect_success(Operation::GeneralAuthenticate, card.communicate(&request)?)?;
    }

    let shared_secret = key_exchange.exchange_keys(ephemeral_private_key, &chip_public_key)?;
    let cipher_mac = cipher_mac::for_kdf_algorithm(protocol.cipher);
    Ok(SecureChannel::from_shared_secret_zero_counter(cipher_mac, &shared_secret)?)
}


/// Runs Chip Authentication with a fresh ephemeral key.
pub fn perform<SC: SmartCard + ?Sized>(card: &mut SC, dg14: &Dg14) -> Result<(SecureChannel, ChipAuthProtocol), Error> {
    let (info, protocol, public_key_info) = select_key(dg14)?;
    let (key_exchange, _) = chip_key_exchange(&public_key_info.public_key)?;
    let ephemeral_private_key = key_exchange.generate_private_key();
    let channel = perform_with_values(card, info, protocol, public_key_info, &ephemeral_private_key)?;
    Ok((channel, protocol))
}


/// Attempts Chip Authentication within an established session.
///
/// On success, the session switches to the new keys. Failure is not fatal: the session keeps its
/// keys and the outcome reports `succeeded: false`.
pub fn authenticate<SC: SmartCard>(session: &mut ChipSession<SC>, dg14: &Dg14) -> ChipAuthOutcome {
    match perform(session, dg14) {
        Ok((channel, protocol)) => {
            info!("Chip Authentication succeeded with {:?}", protocol);
            session.rekey(channel);
            ChipAuthOutcome { succeeded: true, protocol: Some(protocol) }
        },
        Err(e) => {
            warn!("Chip Authentication failed: {}", e);
            ChipAuthOutcome { succeeded: false, protocol: None }
        },
    }
}
