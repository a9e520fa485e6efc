//! Secure Messaging (ICAO Doc 9303 Part 11 § 9.8).
//!
//! A [`SecureChannel`] holds the session keys and the send sequence counter and converts plain
//! command APDUs into protected ones and protected responses back into plain ones.


use std::fmt;

use subtle::ConstantTimeEq;
use tracing::debug;
use zeroize::Zeroizing;
use zeroize_derive::ZeroizeOnDrop;

use crate::crypt;
use crate::crypt::cipher_mac::{CipherAndMac, pad, unpad};
use crate::der_util::{encode_primitive_length, try_decode_primitive_length};
use crate::iso7816::apdu::{Apdu, Data, Response, ResponseTrailer};
use crate::iso7816::card::{CommunicationError, SmartCard};


#[derive(Debug)]
pub enum Error {
    Crypto(crypt::Error),
    ResponseTlvFormat,
    ResponseMac,
    MissingResponseMac,
    MissingResponseStatus,
    StatusLength { obtained: Vec<u8> },
    UnknownPadding { padding_mode: u8 },
    InvalidPadding,
    CommandTooLong { length: usize },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Crypto(e)
                => write!(f, "cryptographic operation failed: {}", e),
            Self::ResponseTlvFormat
                => write!(f, "response has an invalid TLV format"),
            Self::ResponseMac
                => write!(f, "response MAC incorrect"),
            Self::MissingResponseMac
                => write!(f, "response does not contain a MAC"),
            Self::MissingResponseStatus
                => write!(f, "response does not contain status"),
            Self::StatusLength { obtained }
                => write!(f, "status has unexpected length {}", obtained.len()),
            Self::UnknownPadding { padding_mode }
                => write!(f, "response payload has unknown padding mode {}", padding_mode),
            Self::InvalidPadding
                => write!(f, "response payload has invalid padding"),
            Self::CommandTooLong { length }
                => write!(f, "protected command body of {} bytes does not fit into an APDU", length),
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
impl From<crypt::Error> for Error {
    fn from(value: crypt::Error) -> Self { Self::Crypto(value) }
}


/// A data object found in a protected response.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
struct BorrowedTlv<'d> {
    tag_and_length: &'d [u8],
    data: &'d [u8],
}
impl<'d> BorrowedTlv<'d> {
    fn tag(&self) -> u8 { self.tag_and_length[0] }
}

fn split_response_objects(mut response_slice: &[u8]) -> Result<Vec<BorrowedTlv<'_>>, Error> {
    let mut fields = Vec::new();
    while !response_slice.is_empty() {
        if response_slice.len() < 2 {
            return Err(Error::ResponseTlvFormat);
        }
        let (data_length, rest_slice) = try_decode_primitive_length(&response_slice[1..])
            .ok_or(Error::ResponseTlvFormat)?;
        if data_length > rest_slice.len() {
            return Err(Error::ResponseTlvFormat);
        }
        let tag_and_length = &response_slice[0..response_slice.len()-rest_slice.len()];
        fields.push(BorrowedTlv {
            tag_and_length,
            data: &rest_slice[0..data_length],
        });
        response_slice = &rest_slice[data_length..];
    }
    Ok(fields)
}


/// An established secure channel: session keys, send sequence counter and cipher suite.
///
/// Key material is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct SecureChannel {
    #[zeroize(skip)] cipher_mac: &'static dyn CipherAndMac,
    k_session_enc: Vec<u8>,
    k_session_mac: Vec<u8>,
    send_sequence_counter: Vec<u8>,
}
impl SecureChannel {
    /// Creates a channel from session keys and an initial send sequence counter.
    ///
    /// The counter is as long as a cipher block.
    pub fn new(
        cipher_mac: &'static dyn CipherAndMac,
        k_session_enc: &[u8],
        k_session_mac: &[u8],
        send_sequence_counter: &[u8],
    ) -> Result<Self, Error> {
        let key_size = cipher_mac.cipher_key_size();
        for key in [k_session_enc, k_session_mac] {
            if key.len() != key_size {
                return Err(crypt::Error::InvalidKeyLength { expected: key_size, obtained: key.len() }.into());
            }
        }
        if send_sequence_counter.len() != cipher_mac.cipher_block_size() {
            return Err(crypt::Error::InvalidIvLength {
                expected: cipher_mac.cipher_block_size(),
                obtained: send_sequence_counter.len(),
            }.into());
        }
        Ok(Self {
            cipher_mac,
            k_session_enc: k_session_enc.to_vec(),
            k_session_mac: k_session_mac.to_vec(),
            send_sequence_counter: send_sequence_counter.to_vec(),
        })
    }

    /// Derives both session keys from a shared secret (or key seed) using the suite's KDF.
    pub fn from_shared_secret(
        cipher_mac: &'static dyn CipherAndMac,
        shared_secret: &[u8],
        send_sequence_counter: &[u8],
    ) -> Result<Self, Error> {
        let k_session_enc = cipher_mac.derive_encryption_key(shared_secret);
        let k_session_mac = cipher_mac.derive_mac_key(shared_secret);
        Self::new(cipher_mac, &k_session_enc, &k_session_mac, send_sequence_counter)
    }

    /// Derives both session keys from a shared secret and starts with an all-zero counter, as
    /// PACE and Chip Authentication do.
    pub fn from_shared_secret_zero_counter(cipher_mac: &'static dyn CipherAndMac, shared_secret: &[u8]) -> Result<Self, Error> {
        let zero_counter = vec![0u8; cipher_mac.cipher_block_size()];
        Self::from_shared_secret(cipher_mac, shared_secret, &zero_counter)
    }

    pub fn cipher_mac(&self) -> &'static dyn CipherAndMac { self.cipher_mac }
    pub fn send_sequence_counter(&self) -> &[u8] { &self.send_sequence_counter }

    /// Increments the send sequence counter as a big-endian integer.
    fn increment_send_sequence_counter(&mut self) {
        for b in self.send_sequence_counter.iter_mut().rev() {
            if *b == 0xFF {
                // carry
                *b = 0x00;
            } else {
                *b += 1;
                break;
            }
        }
    }

    fn iv(&self) -> Result<Zeroizing<Vec<u8>>, Error> {
        Ok(self.cipher_mac.send_sequence_counter_iv(&self.k_session_enc, &self.send_sequence_counter)?)
    }

    /// MAC over `SSC || data`, padded to the cipher block size.
    fn mac_with_counter(&self, data: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        let mut mac_input = Zeroizing::new(Vec::with_capacity(self.send_sequence_counter.len() + data.len()));
        mac_input.extend_from_slice(&self.send_sequence_counter);
        mac_input.extend_from_slice(data);
        let padded = pad(&mac_input, self.cipher_mac.cipher_block_size());
        Ok(self.cipher_mac.mac_padded_data(&padded, &self.k_session_mac)?)
    }

    /// Converts a plain command APDU into a protected one, incrementing the counter.
    pub fn wrap(&mut self, request: &Apdu) -> Result<Apdu, Error> {
        let block_size = self.cipher_mac.cipher_block_size();
        let mut header = request.header;

        // secure messaging indication; the header is covered by the MAC
        header.cla |= 0b000_0_11_00;
        let padded_header = pad(&header.to_bytes(), block_size);

        self.increment_send_sequence_counter();

        let mut body_data = Vec::new();
        if let Some(request_data) = request.data.request_data() {
            let mut padded_data = pad(request_data, block_size);
            let iv = self.iv()?;
            self.cipher_mac.encrypt_padded_data(&mut padded_data, &self.k_session_enc, &iv)?;

            if header.ins & 0x01 == 0 {
                // DO87: padding-content indicator 0x01 then the cryptogram
                body_data.push(0x87);
                encode_primitive_length(&mut body_data, 1 + padded_data.len());
                body_data.push(0x01);
            } else {
                // odd INS: data is BER-TLV encoded; DO85 carries no indicator byte
                body_data.push(0x85);
                encode_primitive_length(&mut body_data, padded_data.len());
            }
            body_data.extend(padded_data.iter());
        }

        match &request.data {
            Data::NoData|Data::RequestDataShort { .. }|Data::RequestDataExtended { .. } => {},
            Data::ResponseDataShort { response_data_length }|Data::BothDataShort { response_data_length, .. } => {
                body_data.extend(&[0x97, 0x01, *response_data_length]);
            },
            Data::ResponseDataExtended { response_data_length }|Data::BothDataExtended { response_data_length, .. } => {
                body_data.extend(&[0x97, 0x02]);
                body_data.extend(&response_data_length.to_be_bytes());
            },
        }

        let mut mac_data = Zeroizing::new(padded_header.to_vec());
        mac_data.extend(&body_data);
        let mac = self.mac_with_counter(&mac_data)?;

        body_data.push(0x8E);
        encode_primitive_length(&mut body_data, mac.len());
        body_data.extend(mac.iter());

        let extended = request.data.is_extended() || body_data.len() > 0xFF;
        let data = if extended {
            if body_data.len() > 0xFFFF {
                return Err(Error::CommandTooLong { length: body_data.len() });
            }
            Data::BothDataExtended { request_data: body_data, response_data_length: 0 }
        } else {
            Data::BothDataShort { request_data: body_data, response_data_length: 0 }
        };
        Ok(Apdu { header, data })
    }

    /// Verifies and decrypts a protected response, incrementing the counter.
    ///
    /// A response consisting of a bare error status without data objects is passed through; chips
    /// answer that way when they reject the protected command itself.
    pub fn unwrap(&mut self, response: &Response) -> Result<Response, Error> {
        self.increment_send_sequence_counter();

        if response.data.is_empty() && !response.is_success() {
            return Ok(response.clone());
        }

        let fields = split_response_objects(&response.data)?;
        let mut mac_covered = Vec::new();
        let mut received_mac = None;
        for field in &fields {
            if field.tag() == 0x8E {
                received_mac = Some(field.data);
            } else if field.tag() & 0b1 != 0 {
                // odd tags are covered by the MAC
                mac_covered.extend(field.tag_and_length);
                mac_covered.extend(field.data);
            }
        }
        let received_mac = received_mac.ok_or(Error::MissingResponseMac)?;
        let computed_mac = self.mac_with_counter(&mac_covered)?;
        if !bool::from(computed_mac.as_slice().ct_eq(received_mac)) {
            return Err(Error::ResponseMac);
        }

        let mut data = Vec::new();
        if let Some(cryptogram) = fields.iter().find(|f| f.tag() == 0x87 || f.tag() == 0x85) {
            let encrypted = if cryptogram.tag() == 0x87 {
                let (&padding_mode, rest) = cryptogram.data.split_first()
                    .ok_or(Error::ResponseTlvFormat)?;
                if padding_mode != 0x01 {
                    return Err(Error::UnknownPadding { padding_mode });
                }
                rest
            } else {
                cryptogram.data
            };
            let mut decrypted = Zeroizing::new(encrypted.to_vec());
            let iv = self.iv()?;
            self.cipher_mac.decrypt_padded_data(&mut decrypted, &self.k_session_enc, &iv)?;
            let unpadded = unpad(&decrypted)
                .ok_or(Error::InvalidPadding)?;
            data.extend_from_slice(unpadded);
        }

        let status = fields.iter()
            .find(|f| f.tag() == 0x99)
            .ok_or(Error::MissingResponseStatus)?;
        if status.data.len() != 2 {
            return Err(Error::StatusLength { obtained: status.data.to_vec() });
        }

        Ok(Response {
            data,
            trailer: ResponseTrailer::new(status.data[0], status.data[1]),
        })
    }

    /// Sends a command through the channel over the given card.
    pub fn communicate<SC: SmartCard + ?Sized>(&mut self, card: &mut SC, request: &Apdu) -> Result<Response, CommunicationError> {
        let protected_request = self.wrap(request)?;
        let protected_response = card.communicate(&protected_request)?;
        let response = self.unwrap(&protected_response)?;
        debug!("unprotected response status 0x{:04X}, {} bytes", response.trailer.to_word(), response.data.len());
        Ok(response)
    }
}
impl fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureChannel")
            .field("cipher_mac", &self.cipher_mac.name())
            .finish_non_exhaustive()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use crate::crypt::cipher_mac::{Cam3Des, CamAes128};

    fn appendix_d_channel() -> SecureChannel {
        SecureChannel::new(
            &Cam3Des,
            &hex!("979EC13B1CBFE9DCD01AB0FED307EAE5"),
            &hex!("F1CB1F1FB5ADF208806B89DC579DC1F8"),
            &hex!("887022120C06C226"),
        ).unwrap()
    }

    #[test]
    fn protects_select_part11_appendix_d4() {
        let mut channel = appendix_d_channel();
        let select = Apdu::new(0x00, 0xA4, 0x02, 0x0C, Data::RequestDataShort { request_data: vec![0x01, 0x1E] });
        let protected = channel.wrap(&select).unwrap();
        assert_eq!(
            protected.to_bytes().unwrap(),
            hex!("0CA4020C15 8709016375432908C044F6 8E08BF8B92D635FF24F8 00"),
        );
        assert_eq!(channel.send_sequence_counter(), &hex!("887022120C06C227"));

        let response = channel.unwrap(&Response::new(
            hex!("990290008E08FA855A5D4C50A8ED").to_vec(),
            ResponseTrailer::SUCCESS,
        )).unwrap();
        assert!(response.is_success());
        assert!(response.data.is_empty());
        assert_eq!(channel.send_sequence_counter(), &hex!("887022120C06C228"));
    }

    #[test]
    fn protects_read_binary_part11_appendix_d4() {
        let mut channel = appendix_d_channel();
        let select = Apdu::new(0x00, 0xA4, 0x02, 0x0C, Data::RequestDataShort { request_data: vec![0x01, 0x1E] });
        channel.wrap(&select).unwrap();
        channel.unwrap(&Response::new(hex!("990290008E08FA855A5D4C50A8ED").to_vec(), ResponseTrailer::SUCCESS)).unwrap();

        let read = Apdu::new(0x00, 0xB0, 0x00, 0x00, Data::ResponseDataShort { response_data_length: 4 });
        let protected = channel.wrap(&read).unwrap();
        assert_eq!(protected.data.request_data(), Some(&hex!("9701048E08ED6705417E96BA55")[..]));

        let response = channel.unwrap(&Response::new(
            hex!("8709019FF0EC34F9922651990290008E08AD55CC17140B2DED").to_vec(),
            ResponseTrailer::SUCCESS,
        )).unwrap();
        assert_eq!(response.data, hex!("60145F01"));
    }

    #[test]
    fn rejects_tampered_response() {
        let mut channel = appendix_d_channel();
        let select = Apdu::new(0x00, 0xA4, 0x02, 0x0C, Data::RequestDataShort { request_data: vec![0x01, 0x1E] });
        channel.wrap(&select).unwrap();
        let result = channel.unwrap(&Response::new(
            hex!("990262828E08FA855A5D4C50A8ED").to_vec(),
            ResponseTrailer::SUCCESS,
        ));
        assert!(matches!(result, Err(Error::ResponseMac)));
    }

    #[test]
    fn passes_bare_error_status() {
        let mut channel = appendix_d_channel();
        let read = Apdu::new(0x00, 0xB0, 0x00, 0x00, Data::ResponseDataShort { response_data_length: 4 });
        channel.wrap(&read).unwrap();
        let response = channel.unwrap(&Response::from_status(0x6988)).unwrap();
        assert_eq!(response.trailer.to_word(), 0x6988);
    }

    #[test]
    fn counter_carries() {
        let mut channel = SecureChannel::new(&Cam3Des, &[0x01; 16], &[0x02; 16], &hex!("00000000000000FF")).unwrap();
        channel.increment_send_sequence_counter();
        assert_eq!(channel.send_sequence_counter(), &hex!("0000000000000100"));
    }

    #[test]
    fn aes_round_trip_through_both_sides() {
        // the chip side mirrors the terminal side with an identical channel
        let mut terminal = SecureChannel::from_shared_secret_zero_counter(&CamAes128, b"secret").unwrap();
        let mut chip = SecureChannel::from_shared_secret_zero_counter(&CamAes128, b"secret").unwrap();
        let read = Apdu::new(0x00, 0xB0, 0x00, 0x00, Data::ResponseDataShort { response_data_length: 0 });
        let protected = terminal.wrap(&read).unwrap();
        assert_eq!(protected.header.cla, 0x0C);

        chip.increment_send_sequence_counter();
        chip.increment_send_sequence_counter();
        let mut plain = pad(b"hello", 16);
        let iv = chip.iv().unwrap();
        CamAes128.encrypt_padded_data(&mut plain, &chip.k_session_enc, &iv).unwrap();
        let mut objects = vec![0x87, 0x11, 0x01];
        objects.extend(plain.iter());
        objects.extend(&hex!("99029000"));
        let mac = chip.mac_with_counter(&objects).unwrap();
        objects.extend(&[0x8E, 0x08]);
        objects.extend(mac.iter());

        let response = terminal.unwrap(&Response::new(objects, ResponseTrailer::SUCCESS)).unwrap();
        assert_eq!(response.data, b"hello");
    }

    #[test]
    fn rejects_wrong_key_size() {
        assert!(SecureChannel::new(&CamAes128, &[0u8; 24], &[0u8; 16], &[0u8; 16]).is_err());
        assert!(SecureChannel::new(&Cam3Des, &[0u8; 16], &[0u8; 16], &[0u8; 16]).is_err());
    }
}
