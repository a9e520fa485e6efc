//! Basic Access Control.


use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use crate::crypt;
use crate::crypt::cipher_mac::{pad, Cam3Des, CipherAndMac};
use crate::iso7816::apdu::{Apdu, Data, Response};
use crate::iso7816::card::{CommunicationError, SmartCard};
use crate::kdf::bac_key_seed;
use crate::secure_messaging::{self, SecureChannel};


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Operation {
    GetChallenge,
    ExternalAuthenticate,
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MismatchedValue {
    RndIc,
    RndIfd,
}


#[derive(Debug)]
pub enum Error {
    Communication(CommunicationError),
    OperationFailed { operation: Operation, response: Response },
    LengthMismatch { operation: Operation, expected: usize, obtained: usize },
    ResponseMac,
    ValueMismatch { value: MismatchedValue },
    Crypto(crypt::Error),
    SecureMessaging(secure_messaging::Error),
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Communication(e)
                => write!(f, "communication failed: {}", e),
            Self::OperationFailed { operation, response }
                => write!(f, "operation {:?} failed with response code 0x{:04X}", operation, response.trailer.to_word()),
            Self::LengthMismatch { operation, expected, obtained }
                => write!(f, "operation {:?} returned {} bytes, expected {}", operation, obtained, expected),
            Self::ResponseMac
                => write!(f, "MAC of EXTERNAL AUTHENTICATE response is invalid"),
            Self::ValueMismatch { value }
                => write!(f, "chip returned a different {:?}", value),
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


#[instrument(skip(card))]
fn get_challenge<SC: SmartCard + ?Sized>(card: &mut SC) -> Result<[u8; 8], Error> {
    let get_challenge_apdu = Apdu::new(
        0x00,
        0x84, // GET CHALLENGE
        0x00, 0x00,
        Data::ResponseDataShort { response_data_length: 8 },
    );
    let response = card.communicate(&get_challenge_apdu)?;
    if !response.is_success() {
        return Err(Error::OperationFailed { operation: Operation::GetChallenge, response });
    }
    let challenge: [u8; 8] = response.data.as_slice().try_into()
        .map_err(|_| Error::LengthMismatch {
            operation: Operation::GetChallenge,
            expected: 8,
            obtained: response.data.len(),
        })?;
    Ok(challenge)
}


/// Runs the BAC handshake with fixed random values, once the challenge has been obtained.
///
/// `k_seed` is the 16-byte key seed derived from the MRZ key.
#[instrument(skip_all)]
pub fn establish_from_values<SC: SmartCard + ?Sized>(
    card: &mut SC,
    k_seed: &[u8],
    rnd_ic: &[u8; 8],
    rnd_ifd: &[u8; 8],
    k_ifd: &[u8; 16],
) -> Result<SecureChannel, Error> {
    let cipher_mac = &Cam3Des;
    let k_enc = cipher_mac.derive_encryption_key(k_seed);
    let k_mac = cipher_mac.derive_mac_key(k_seed);

    // S = RND.IFD || RND.IC || K.IFD
    let mut ext_auth_data = Zeroizing::new(Vec::with_capacity(32 + 8));
    ext_auth_data.extend(rnd_ifd);
    ext_auth_data.extend(rnd_ic);
    ext_auth_data.extend(k_ifd);
    cipher_mac.encrypt_padded_data(&mut ext_auth_data, &k_enc, &[0u8; 8])?;

    let mac = cipher_mac.mac_padded_data(&pad(&ext_auth_data, cipher_mac.mac_block_size()), &k_mac)?;
    ext_auth_data.extend(mac.iter());

    let ext_auth_request = Apdu::new(
        0x00,
        0x82, // EXTERNAL AUTHENTICATE
        0x00, 0x00,
        Data::BothDataShort {
            request_data: ext_auth_data.to_vec(),
            response_data_length: 40,
        },
    );
    let ext_auth_response = card.communicate(&ext_auth_request)?;
    if !ext_auth_response.is_success() {
        return Err(Error::OperationFailed {
            operation: Operation::ExternalAuthenticate,
            response: ext_auth_response,
        });
    }
    if ext_auth_response.data.len() != 40 {
        return Err(Error::LengthMismatch {
            operation: Operation::ExternalAuthenticate,
            expected: 40,
            obtained: ext_auth_response.data.len(),
        });
    }

    let (cryptogram, response_mac) = ext_auth_response.data.split_at(32);
    let mac_ok = cipher_mac.verify_mac_padded_data(
        &pad(cryptogram, cipher_mac.mac_block_size()),
        &k_mac,
        response_mac,
    )?;
    if !mac_ok {
        return Err(Error::ResponseMac);
    }

    // R = RND.IC || RND.IFD || K.IC
    let mut decrypted = Zeroizing::new(cryptogram.to_vec());
    cipher_mac.decrypt_padded_data(&mut decrypted, &k_enc, &[0u8; 8])?;
    if !bool::from(decrypted[0..8].ct_eq(rnd_ic)) {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIc });
    }
    if !bool::from(decrypted[8..16].ct_eq(rnd_ifd)) {
        return Err(Error::ValueMismatch { value: MismatchedValue::RndIfd });
    }
    let k_ic = &decrypted[16..32];

    let k_session_seed: Zeroizing<Vec<u8>> = Zeroizing::new(
        k_ifd.iter()
            .zip(k_ic.iter())
            .map(|(kifd, kic)| kifd ^ kic)
            .collect()
    );

    let mut send_sequence_counter = [0u8; 8];
    send_sequence_counter[0..4].copy_from_slice(&rnd_ic[4..8]);
    send_sequence_counter[4..8].copy_from_slice(&rnd_ifd[4..8]);

    debug!("BAC established");
    Ok(SecureChannel::from_shared_secret(&Cam3Des, &k_session_seed, &send_sequence_counter)?)
}


/// Establishes a BAC channel with the card using the MRZ key (document number, date of birth
/// and date of expiry, each followed by its check digit).
#[instrument(skip_all)]
pub fn establish<SC: SmartCard + ?Sized>(card: &mut SC, mrz_key: &[u8]) -> Result<SecureChannel, Error> {
    let k_seed = bac_key_seed(mrz_key);

    let rnd_ic = get_challenge(card)?;

    let mut rnd_ifd = [0u8; 8];
    let mut k_ifd = Zeroizing::new([0u8; 16]);
    OsRng.fill_bytes(&mut rnd_ifd);
    OsRng.fill_bytes(k_ifd.as_mut_slice());

    establish_from_values(card, &k_seed, &rnd_ic, &rnd_ifd, &k_ifd)
}
