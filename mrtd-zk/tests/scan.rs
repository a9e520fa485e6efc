//! End-to-end scans against a simulated chip speaking PACE, BAC, Secure Messaging and Chip
//! Authentication.

use std::collections::BTreeMap;
use std::sync::Arc;

use mrtd_zk::asn1::Element;
use mrtd_zk::crypt::KeyExchange;
use mrtd_zk::crypt::cipher_mac::{pad, unpad, Cam3Des, CamAes128, CipherAndMac};
use mrtd_zk::crypt::elliptic::curves::get_brainpool_p256r1;
use mrtd_zk::der_util::{encode_tlv, oid_to_der_bytes};
use mrtd_zk::error::ScanError;
use mrtd_zk::iso7816::apdu::{Apdu, CommandHeader, Data, Response, ResponseTrailer};
use mrtd_zk::iso7816::card::{CommunicationError, SmartCard};
use mrtd_zk::kdf::bac_key_seed;
use mrtd_zk::mrz::{DocumentCredentials, MrzAttribute};
use mrtd_zk::pace::{self, oids::PACE_ECDH_GM_AES_CBC_CMAC_128};
use mrtd_zk::scan::{ScanConfig, Scanner};
use mrtd_zk::session::{self, ChannelProtocol, PacePolicy, EMRTD_APPLICATION_ID};
use mrtd_zk::signature::HashAlgorithm;
use mrtd_zk::trust_store::TrustedCertificateSet;
use num_bigint::BigUint;
use zeroize::Zeroizing;


const MASTER_LIST: &[u8] = include_bytes!("data/master_list.der");
const DG1: &[u8] = include_bytes!("data/dg1.bin");
const DG2: &[u8] = include_bytes!("data/dg2.bin");
const DG14: &[u8] = include_bytes!("data/dg14.bin");
const SOD_RSA: &[u8] = include_bytes!("data/sod_rsa.bin");
const SOD_ROGUE: &[u8] = include_bytes!("data/sod_rogue.bin");
const CHIP_AUTH_PRIVATE_KEY: &str = include_str!("data/chip_auth_private.hex");

/// PACEInfo: ECDH generic mapping, AES-128, brainpoolP256r1.
const CARD_ACCESS: &[u8] = &[
    0x31, 0x14, 0x30, 0x12,
    0x06, 0x0A, 0x04, 0x00, 0x7F, 0x00, 0x07, 0x02, 0x02, 0x04, 0x02, 0x02,
    0x02, 0x01, 0x02,
    0x02, 0x01, 0x0D,
];
const PACE_NONCE: [u8; 16] = [
    0x3F, 0x00, 0xC4, 0xD3, 0x9D, 0x15, 0x3F, 0x2B,
    0x2A, 0x21, 0x4A, 0x07, 0x8D, 0x89, 0x9B, 0x22,
];
const PACE_MAPPING_KEY: [u8; 32] = [
    0x49, 0x8F, 0xF4, 0x97, 0x56, 0xF2, 0xDC, 0x15, 0x87, 0x84, 0x0D, 0xB4, 0x8E, 0xF8, 0xC9, 0x24,
    0x90, 0x56, 0x05, 0x87, 0xE5, 0x02, 0x84, 0x58, 0x01, 0x97, 0x3F, 0xA1, 0xE7, 0xA3, 0x6E, 0x55,
];
const PACE_AGREEMENT_KEY: [u8; 32] = [
    0x10, 0x7C, 0xF5, 0x86, 0x96, 0xEF, 0x62, 0x55, 0xF4, 0xC1, 0x6F, 0x1E, 0x76, 0xE1, 0xD5, 0x58,
    0x79, 0xD1, 0xC8, 0x32, 0x04, 0x3D, 0xDA, 0xAB, 0xD3, 0x2C, 0x39, 0x05, 0xA8, 0x7B, 0x74, 0xF6,
];

const FID_CARD_ACCESS: u16 = 0x011C;
const FID_DG1: u16 = 0x0101;
const FID_DG2: u16 = 0x0102;
const FID_DG14: u16 = 0x010E;
const FID_SOD: u16 = 0x011D;

const SW_SUCCESS: u16 = 0x9000;
const SW_FILE_NOT_FOUND: u16 = 0x6A82;
const SW_SECURITY_STATUS: u16 = 0x6982;
const SW_SM_OBJECTS_INCORRECT: u16 = 0x6988;
const SW_AUTHENTICATION_FAILED: u16 = 0x6300;
const SW_WRONG_DATA: u16 = 0x6A80;
const SW_WRONG_OFFSET: u16 = 0x6B00;
const SW_INS_NOT_SUPPORTED: u16 = 0x6D00;


/// The chip's half of a Secure Messaging channel.
struct ChipChannel {
    cipher_mac: &'static dyn CipherAndMac,
    k_enc: Zeroizing<Vec<u8>>,
    k_mac: Zeroizing<Vec<u8>>,
    ssc: Vec<u8>,
}
impl ChipChannel {
    fn from_seed(cipher_mac: &'static dyn CipherAndMac, seed: &[u8], ssc: Vec<u8>) -> Self {
        Self {
            cipher_mac,
            k_enc: cipher_mac.derive_encryption_key(seed),
            k_mac: cipher_mac.derive_mac_key(seed),
            ssc,
        }
    }

    fn increment(&mut self) {
        for b in self.ssc.iter_mut().rev() {
            let (next, carry) = b.overflowing_add(1);
            *b = next;
            if !carry {
                break;
            }
        }
    }

    fn mac(&self, data: &[u8]) -> Vec<u8> {
        let mut input = self.ssc.clone();
        input.extend(data);
        let padded = pad(&input, self.cipher_mac.cipher_block_size());
        self.cipher_mac.mac_padded_data(&padded, &self.k_mac).unwrap().to_vec()
    }

    fn iv(&self) -> Vec<u8> {
        self.cipher_mac.send_sequence_counter_iv(&self.k_enc, &self.ssc).unwrap().to_vec()
    }

    /// Checks and decrypts a protected command. `None` if it does not verify.
    fn unprotect(&mut self, request: &Apdu) -> Option<Apdu> {
        self.increment();
        let data = request.data.request_data()?;

        let mut rest = data;
        let mut covered = 0;
        let mut cryptogram = None;
        let mut le = None;
        let mut mac = None;
        while !rest.is_empty() {
            let (element, next) = Element::parse(rest).ok()?;
            match element.tag {
                0x87 => cryptogram = Some(element.content.split_first()?.1),
                0x85 => cryptogram = Some(element.content),
                0x97 => le = Some(*element.content.first()?),
                0x8E => mac = Some(element.content),
                _ => return None,
            }
            if element.tag != 0x8E {
                covered += element.raw.len();
            }
            rest = next;
        }

        let mut mac_input = pad(&request.header.to_bytes(), self.cipher_mac.cipher_block_size()).to_vec();
        mac_input.extend(&data[..covered]);
        if self.mac(&mac_input).as_slice() != mac? {
            return None;
        }

        let plain = match cryptogram {
            Some(encrypted) => {
                let mut buf = encrypted.to_vec();
                self.cipher_mac.decrypt_padded_data(&mut buf, &self.k_enc, &self.iv()).ok()?;
                Some(unpad(&buf)?.to_vec())
            },
            None => None,
        };
        let data = match (plain, le) {
            (None, None) => Data::NoData,
            (Some(request_data), None) => Data::RequestDataShort { request_data },
            (None, Some(response_data_length)) => Data::ResponseDataShort { response_data_length },
            (Some(request_data), Some(response_data_length)) => Data::BothDataShort { request_data, response_data_length },
        };
        let header = CommandHeader { cla: request.header.cla & !0x0C, ..request.header };
        Some(Apdu { header, data })
    }

    fn protect(&mut self, response: Response) -> Response {
        self.increment();
        let mut body = Vec::new();
        if !response.data.is_empty() {
            let mut encrypted = pad(&response.data, self.cipher_mac.cipher_block_size()).to_vec();
            self.cipher_mac.encrypt_padded_data(&mut encrypted, &self.k_enc, &self.iv()).unwrap();
            let mut value = vec![0x01];
            value.extend(encrypted);
            encode_tlv(&mut body, &[0x87], &value);
        }
        encode_tlv(&mut body, &[0x99], &response.trailer.to_bytes());
        let mac = self.mac(&body);
        encode_tlv(&mut body, &[0x8E], &mac);
        Response::new(body, ResponseTrailer::SUCCESS)
    }
}


/// The chip's progress through a PACE handshake.
#[derive(Default)]
struct ChipPace {
    started: bool,
    mapped: Option<KeyExchange>,
    /// Shared secret, chip's and terminal's ephemeral public keys.
    agreement: Option<(Zeroizing<Vec<u8>>, Zeroizing<Vec<u8>>, Vec<u8>)>,
    established: bool,
}


/// The PACE authentication token over `public_key` (Doc 9303 Part 11 § 4.4.3.4).
fn pace_token(k_mac: &[u8], public_key: &[u8]) -> Vec<u8> {
    let mut inner = Vec::new();
    encode_tlv(&mut inner, &[0x06], &oid_to_der_bytes(PACE_ECDH_GM_AES_CBC_CMAC_128));
    encode_tlv(&mut inner, &[0x86], public_key);
    let mut outer = Vec::new();
    encode_tlv(&mut outer, &[0x7F, 0x49], &inner);
    CamAes128.mac_padded_data(&outer, k_mac).unwrap().to_vec()
}


/// A passport chip with BAC, Chip Authentication (ECDH, AES-128) and, if given a PACE password,
/// PACE (ECDH generic mapping, AES-128).
struct SimulatedChip {
    files: BTreeMap<u16, Vec<u8>>,
    k_seed: Zeroizing<Vec<u8>>,
    rnd_ic: [u8; 8],
    k_ic: [u8; 16],
    chip_auth_key: BigUint,
    refuse_chip_auth: bool,
    pace_password: Option<Vec<u8>>,

    channel: Option<ChipChannel>,
    pace: ChipPace,
    selected: Option<u16>,
    chip_auth_prepared: bool,
    chip_authenticated: bool,
}
impl SimulatedChip {
    fn new(sod: &[u8]) -> Self {
        let mut files = BTreeMap::new();
        files.insert(FID_DG1, DG1.to_vec());
        files.insert(FID_DG2, DG2.to_vec());
        files.insert(FID_DG14, DG14.to_vec());
        files.insert(FID_SOD, sod.to_vec());

        let mrz_key = credentials().mrz_key();
        let chip_auth_key = BigUint::parse_bytes(CHIP_AUTH_PRIVATE_KEY.trim().as_bytes(), 16).unwrap();
        Self {
            files,
            k_seed: bac_key_seed(mrz_key.as_bytes()),
            rnd_ic: [0x46, 0x08, 0xF9, 0x19, 0x88, 0x70, 0x22, 0x12],
            k_ic: [
                0x0B, 0x4F, 0x80, 0x32, 0x3E, 0xB3, 0x19, 0x1C,
                0xB0, 0x49, 0x70, 0xCB, 0x40, 0x52, 0x79, 0x0B,
            ],
            chip_auth_key,
            refuse_chip_auth: false,
            pace_password: None,
            channel: None,
            pace: ChipPace::default(),
            selected: None,
            chip_auth_prepared: false,
            chip_authenticated: false,
        }
    }

    /// Offers PACE in EF.CardAccess, taking `password` as the MRZ key.
    fn with_pace(sod: &[u8], password: &str) -> Self {
        let mut chip = Self::new(sod);
        chip.files.insert(FID_CARD_ACCESS, CARD_ACCESS.to_vec());
        chip.pace_password = Some(password.as_bytes().to_vec());
        chip
    }

    fn status(word: u16) -> Response {
        Response::from_status(word)
    }

    fn dynamic_authentication_data(tag: u8, value: &[u8]) -> Response {
        let mut inner = Vec::new();
        encode_tlv(&mut inner, &[tag], value);
        let mut body = Vec::new();
        encode_tlv(&mut body, &[0x7C], &inner);
        Response::new(body, ResponseTrailer::SUCCESS)
    }

    /// One GENERAL AUTHENTICATE step of PACE.
    fn pace_step(&mut self, data: &[u8]) -> Response {
        let Some(password) = self.pace_password.clone() else {
            return Self::status(SW_SECURITY_STATUS);
        };
        let Some(outer) = Element::parse_exact(data).ok().filter(|outer| outer.tag == 0x7C) else {
            return Self::status(SW_WRONG_DATA);
        };
        if outer.content.is_empty() {
            // encrypted nonce
            let password_hash = HashAlgorithm::Sha1.digest(&password);
            let nonce_key = CamAes128.derive_key_from_password(&password_hash);
            let mut encrypted = PACE_NONCE.to_vec();
            CamAes128.encrypt_padded_data(&mut encrypted, &nonce_key, &[0u8; 16]).unwrap();
            return Self::dynamic_authentication_data(0x80, &encrypted);
        }
        let Ok(inner) = Element::parse_exact(outer.content) else {
            return Self::status(SW_WRONG_DATA);
        };

        let key_exchange = KeyExchange::PrimeWeierstrassEllipticDiffieHellman(get_brainpool_p256r1());
        match inner.tag {
            0x81 => {
                let private_key = BigUint::from_bytes_be(&PACE_MAPPING_KEY);
                let nonce = BigUint::from_bytes_be(&PACE_NONCE);
                let Ok(mapped) = key_exchange.derive_generic_mapping(&nonce, &private_key, inner.content) else {
                    return Self::status(SW_WRONG_DATA);
                };
                self.pace.mapped = Some(mapped);
                let public_key = key_exchange.calculate_public_key(&private_key).unwrap();
                Self::dynamic_authentication_data(0x82, &public_key)
            },
            0x83 => {
                let Some(mapped) = self.pace.mapped.as_ref() else {
                    return Self::status(SW_SECURITY_STATUS);
                };
                let private_key = BigUint::from_bytes_be(&PACE_AGREEMENT_KEY);
                let Ok(shared_secret) = mapped.exchange_keys(&private_key, inner.content) else {
                    return Self::status(SW_WRONG_DATA);
                };
                let public_key = mapped.calculate_public_key(&private_key).unwrap();
                let response = Self::dynamic_authentication_data(0x84, &public_key);
                self.pace.agreement = Some((shared_secret, public_key, inner.content.to_vec()));
                response
            },
            0x85 => {
                let Some((shared_secret, chip_key, terminal_key)) = self.pace.agreement.take() else {
                    return Self::status(SW_SECURITY_STATUS);
                };
                let k_mac = CamAes128.derive_mac_key(&shared_secret);
                if pace_token(&k_mac, &chip_key) != inner.content {
                    return Self::status(SW_AUTHENTICATION_FAILED);
                }
                self.pace.established = true;
                self.channel = Some(ChipChannel::from_seed(&CamAes128, &shared_secret, vec![0u8; 16]));
                Self::dynamic_authentication_data(0x86, &pace_token(&k_mac, &terminal_key))
            },
            _ => Self::status(SW_WRONG_DATA),
        }
    }

    fn external_authenticate(&mut self, data: &[u8]) -> Response {
        if data.len() != 40 {
            return Self::status(SW_WRONG_DATA);
        }
        let k_enc = Cam3Des.derive_encryption_key(&self.k_seed);
        let k_mac = Cam3Des.derive_mac_key(&self.k_seed);

        let (cryptogram, mac) = data.split_at(32);
        let expected_mac = Cam3Des.mac_padded_data(&pad(cryptogram, 8), &k_mac).unwrap();
        if expected_mac.as_slice() != mac {
            return Self::status(SW_AUTHENTICATION_FAILED);
        }
        let mut s = cryptogram.to_vec();
        Cam3Des.decrypt_padded_data(&mut s, &k_enc, &[0u8; 8]).unwrap();
        if s[8..16] != self.rnd_ic {
            return Self::status(SW_AUTHENTICATION_FAILED);
        }
        let rnd_ifd = &s[0..8];
        let k_ifd = &s[16..32];

        let mut r = Vec::with_capacity(40);
        r.extend(&self.rnd_ic);
        r.extend(rnd_ifd);
        r.extend(&self.k_ic);
        Cam3Des.encrypt_padded_data(&mut r, &k_enc, &[0u8; 8]).unwrap();
        let response_mac = Cam3Des.mac_padded_data(&pad(&r, 8), &k_mac).unwrap();
        r.extend(response_mac.iter());

        let seed: Vec<u8> = k_ifd.iter().zip(self.k_ic.iter()).map(|(a, b)| a ^ b).collect();
        let mut ssc = self.rnd_ic[4..8].to_vec();
        ssc.extend(&rnd_ifd[4..8]);
        self.channel = Some(ChipChannel::from_seed(&Cam3Des, &seed, ssc));

        Response::new(r, ResponseTrailer::SUCCESS)
    }

    /// Commands accepted without Secure Messaging.
    fn execute_plain(&mut self, request: &Apdu) -> Response {
        let data = request.data.request_data().unwrap_or(&[]);
        match (request.header.ins, request.header.p1) {
            (0xA4, 0x04) if data == EMRTD_APPLICATION_ID => Self::status(SW_SUCCESS),
            (0xA4, 0x02) if data == FID_CARD_ACCESS.to_be_bytes() => {
                if self.files.contains_key(&FID_CARD_ACCESS) {
                    self.selected = Some(FID_CARD_ACCESS);
                    Self::status(SW_SUCCESS)
                } else {
                    Self::status(SW_FILE_NOT_FOUND)
                }
            },
            (0xB0, _) if self.selected == Some(FID_CARD_ACCESS) => self.read_binary(request),
            (0x22, 0xC1) if self.pace_password.is_some() => {
                self.pace = ChipPace { started: true, ..ChipPace::default() };
                Self::status(SW_SUCCESS)
            },
            (0x86, _) if self.pace.started => self.pace_step(data),
            (0x84, _) => Response::new(self.rnd_ic.to_vec(), ResponseTrailer::SUCCESS),
            (0x82, _) => self.external_authenticate(data),
            _ => Self::status(SW_SECURITY_STATUS),
        }
    }

    fn read_binary(&self, request: &Apdu) -> Response {
        let Some(file) = self.selected.and_then(|fid| self.files.get(&fid)) else {
            return Self::status(SW_SECURITY_STATUS);
        };
        let offset = usize::from(request.header.p1) << 8 | usize::from(request.header.p2);
        let length = request.data.response_data_length().unwrap_or(256);
        if offset >= file.len() {
            return Self::status(SW_WRONG_OFFSET);
        }
        let end = (offset + length).min(file.len());
        Response::new(file[offset..end].to_vec(), ResponseTrailer::SUCCESS)
    }

    /// Performs the chip side of the key agreement. Returns the response and the new channel.
    fn general_authenticate(&mut self, data: &[u8]) -> (Response, Option<ChipChannel>) {
        if !self.chip_auth_prepared {
            return (Self::status(SW_SECURITY_STATUS), None);
        }
        let terminal_key = Element::parse_exact(data).ok()
            .filter(|outer| outer.tag == 0x7C)
            .and_then(|outer| Element::parse_exact(outer.content).ok())
            .filter(|inner| inner.tag == 0x80)
            .map(|inner| inner.content);
        let Some(terminal_key) = terminal_key else {
            return (Self::status(SW_WRONG_DATA), None);
        };
        let key_exchange = KeyExchange::PrimeWeierstrassEllipticDiffieHellman(get_brainpool_p256r1());
        let Ok(shared_secret) = key_exchange.exchange_keys(&self.chip_auth_key, terminal_key) else {
            return (Self::status(SW_WRONG_DATA), None);
        };
        self.chip_authenticated = true;
        let channel = ChipChannel::from_seed(&CamAes128, &shared_secret, vec![0u8; 16]);
        (Response::new(vec![0x7C, 0x00], ResponseTrailer::SUCCESS), Some(channel))
    }

    /// Commands within Secure Messaging.
    fn execute(&mut self, request: &Apdu) -> (Response, Option<ChipChannel>) {
        let data = request.data.request_data().unwrap_or(&[]);
        let response = match (request.header.ins, request.header.p1, request.header.p2) {
            (0xA4, 0x04, _) => Self::status(SW_SUCCESS),
            (0xA4, 0x02, _) => {
                let fid = data.try_into().ok().map(u16::from_be_bytes);
                match fid.filter(|fid| self.files.contains_key(fid)) {
                    Some(fid) => {
                        self.selected = Some(fid);
                        Self::status(SW_SUCCESS)
                    },
                    None => Self::status(SW_FILE_NOT_FOUND),
                }
            },
            (0xB0, _, _) => self.read_binary(request),
            (0x22, 0x41, 0xA4) => {
                if self.refuse_chip_auth {
                    Self::status(SW_WRONG_DATA)
                } else {
                    self.chip_auth_prepared = true;
                    Self::status(SW_SUCCESS)
                }
            },
            (0x86, 0x00, 0x00) => return self.general_authenticate(data),
            _ => Self::status(SW_INS_NOT_SUPPORTED),
        };
        (response, None)
    }
}
impl SmartCard for SimulatedChip {
    fn communicate(&mut self, request: &Apdu) -> Result<Response, CommunicationError> {
        if request.header.cla & 0x0C != 0x0C {
            // a plain command ends any secure channel
            self.channel = None;
            return Ok(self.execute_plain(request));
        }

        let Some(inner) = self.channel.as_mut().and_then(|channel| channel.unprotect(request)) else {
            self.channel = None;
            return Ok(Self::status(SW_SM_OBJECTS_INCORRECT));
        };
        let (response, new_channel) = self.execute(&inner);
        let protected = match self.channel.as_mut() {
            Some(channel) => channel.protect(response),
            None => Self::status(SW_SM_OBJECTS_INCORRECT),
        };
        if let Some(channel) = new_channel {
            self.channel = Some(channel);
        }
        Ok(protected)
    }
}


fn credentials() -> DocumentCredentials {
    DocumentCredentials::new("L898902C3", "740812", "120415").unwrap()
}

fn scanner(config: ScanConfig) -> Scanner {
    let store = TrustedCertificateSet::from_master_list(MASTER_LIST).unwrap();
    Scanner::with_trust_store(config, Arc::new(store))
}


#[test]
fn full_scan_with_chip_authentication() {
    let config = ScanConfig {
        revealed_attributes: vec![MrzAttribute::Nationality, MrzAttribute::DateOfBirth],
        ..ScanConfig::default()
    };
    let scanner = scanner(config);
    let mut chip = SimulatedChip::new(SOD_RSA);
    let address = BigUint::from(0xABCDEFu32);

    let outcome = scanner.negotiate_and_read(&mut chip, &credentials(), &address).unwrap();
    assert!(!scanner.is_scanning());

    assert_eq!(outcome.channel_protocol, ChannelProtocol::Bac);
    assert!(outcome.chip_auth.succeeded);
    assert!(outcome.chip_auth.protocol.is_some());
    assert!(chip.chip_authenticated);

    assert_eq!((outcome.face.width, outcome.face.height), (240, 320));
    assert_eq!(&outcome.face.image_data[..2], &[0xFF, 0xD8]);

    let record = &outcome.record;
    assert_eq!(record.mrz_prefix, vec![0x61, 0x5B, 0x5F, 0x1F, 0x58]);
    assert_eq!(record.mrz_bytes.as_slice(), &DG1[5..]);
    assert_eq!(record.mrz_attribute(MrzAttribute::Nationality).as_deref(), Some("UTO"));
    assert_eq!(record.mrz_attribute(MrzAttribute::DateOfBirth).as_deref(), Some("740812"));
    assert_eq!(record.reveal_bitmap.len(), 88);
    assert_eq!(record.reveal_bitmap.iter().filter(|b| **b == 1).count(), 3 + 6);
    assert_eq!(record.signature_algorithm, 1);
    assert_eq!(record.data_hashes_padded.len(), 320);
    assert_eq!(record.data_hashes_padded_length % 64, 0);
    assert_eq!(record.signature_words.len(), 32);
    assert_eq!(record.public_key_words.len(), 32);
    assert_eq!(record.address_words, vec![address]);
    assert!(record.merkle_proof.is_none());

    let inputs = record.to_prover_inputs();
    assert_eq!(inputs["mrz"].len(), 93);
    assert_eq!(inputs["signatureAlgorithm"], vec!["1".to_owned()]);
    assert!(!inputs.contains_key("root"));
}

#[test]
fn small_reads_give_the_same_record() {
    let mut chip = SimulatedChip::new(SOD_RSA);
    let default = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(1u8))
        .unwrap();

    let mut chip = SimulatedChip::new(SOD_RSA);
    let small = scanner(ScanConfig { chunk_size: 0x20, ..ScanConfig::default() })
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(1u8))
        .unwrap();

    assert_eq!(default.record, small.record);
}

#[test]
fn chip_without_dg14() {
    let mut chip = SimulatedChip::new(SOD_RSA);
    chip.files.remove(&FID_DG14);
    let outcome = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8))
        .unwrap();
    assert!(!outcome.chip_auth.succeeded);
    assert!(!chip.chip_authenticated);
}

#[test]
fn refused_chip_authentication_keeps_the_channel() {
    let mut chip = SimulatedChip::new(SOD_RSA);
    chip.refuse_chip_auth = true;
    let outcome = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8))
        .unwrap();
    assert!(!outcome.chip_auth.succeeded);
    assert_eq!(outcome.chip_auth.protocol, None);
    assert_eq!(outcome.record.mrz_bytes.as_slice(), &DG1[5..]);
}

#[test]
fn wrong_credentials() {
    let mut chip = SimulatedChip::new(SOD_RSA);
    let wrong = DocumentCredentials::new("L898902C4", "740812", "120415").unwrap();
    let result = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &wrong, &BigUint::from(0u8));
    assert!(matches!(result, Err(ScanError::ChannelEstablishment(_))));
}

#[test]
fn tampered_face_image() {
    let mut chip = SimulatedChip::new(SOD_RSA);
    let dg2 = chip.files.get_mut(&FID_DG2).unwrap();
    let last = dg2.len() - 1;
    dg2[last] ^= 0x01;
    let result = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8));
    assert!(matches!(result, Err(ScanError::DigestMismatch { dg: 2 })));
}

#[test]
fn untrusted_document_signer() {
    let mut chip = SimulatedChip::new(SOD_ROGUE);
    let result = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8));
    assert!(matches!(result, Err(ScanError::CertificateChain(_))));
}

#[test]
fn missing_security_object() {
    let mut chip = SimulatedChip::new(SOD_RSA);
    chip.files.remove(&FID_SOD);
    let result = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8));
    assert!(matches!(result, Err(ScanError::DataGroupRead { dg: 0, .. })));
}

#[test]
fn empty_trust_store_rejects_everything() {
    let mut chip = SimulatedChip::new(SOD_RSA);
    let result = Scanner::new(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8));
    assert!(matches!(result, Err(ScanError::CertificateChain(_))));
}

#[test]
fn scan_over_pace() {
    let password = credentials().mrz_key();
    let mut chip = SimulatedChip::with_pace(SOD_RSA, password.as_str());
    let outcome = scanner(ScanConfig::default())
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(7u8))
        .unwrap();

    assert_eq!(outcome.channel_protocol, ChannelProtocol::Pace);
    assert!(chip.pace.established);
    // the files were read through the PACE channel, then Chip Authentication replaced it
    assert!(outcome.chip_auth.succeeded);
    assert!(chip.chip_authenticated);
    assert_eq!(outcome.record.mrz_bytes.as_slice(), &DG1[5..]);
}

#[test]
fn failed_pace_falls_back_to_bac() {
    // the chip encrypts its nonce under a different password, so mutual authentication fails
    let mut chip = SimulatedChip::with_pace(SOD_RSA, "L898902C4674081221204159");
    let config = ScanConfig { pace_policy: PacePolicy::FallBackToBac, ..ScanConfig::default() };
    let outcome = scanner(config)
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8))
        .unwrap();

    assert_eq!(outcome.channel_protocol, ChannelProtocol::Bac);
    assert!(chip.pace.started);
    assert!(!chip.pace.established);
    assert_eq!(outcome.record.mrz_bytes.as_slice(), &DG1[5..]);
}

#[test]
fn failed_pace_is_reported_when_fallback_is_off() {
    let mut chip = SimulatedChip::with_pace(SOD_RSA, "L898902C4674081221204159");
    let config = ScanConfig { pace_policy: PacePolicy::Fail, ..ScanConfig::default() };
    let result = scanner(config)
        .negotiate_and_read(&mut chip, &credentials(), &BigUint::from(0u8));

    let Err(ScanError::ChannelEstablishment(error)) = result else {
        panic!("expected a channel establishment error");
    };
    assert!(matches!(
        error.downcast_ref::<session::Error>(),
        Some(session::Error::Pace(pace::Error::OperationFailed { operation: pace::Operation::MutualAuthentication, .. })),
    ));
    // no secure channel was set up
    assert!(chip.channel.is_none());
    assert!(!chip.pace.established);
}
