//! Cipher and MAC (message authentication code) combinations.


use aes::{Aes128, Aes192, Aes256};
use block_padding::NoPadding;
use cipher::{BlockModeDecrypt, BlockModeEncrypt, KeyIvInit};
use cmac::Cmac;
use des::{Des, TdesEde2};
use digest::{KeyInit, Mac};
use retail_mac::RetailMac;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::crypt::Error;
use crate::kdf::{self, KdfAlgorithm};


/// A combination of cipher, MAC and KDF (key derivation function) usable during authentication and
/// Secure Messaging.
pub trait CipherAndMac: Send + Sync {
    /// Human-readable name for log output.
    fn name(&self) -> &'static str;

    /// The cipher for which the KDF derives keys.
    fn kdf_algorithm(&self) -> KdfAlgorithm;

    /// Size of the cipher key in bytes.
    fn cipher_key_size(&self) -> usize {
        self.kdf_algorithm().key_length()
    }

    /// Block size of the cipher in bytes.
    fn cipher_block_size(&self) -> usize;

    /// Block size of the MAC in bytes.
    ///
    /// Only used for the authentication tokens of PACE. Secure Messaging always pads to
    /// [`CipherAndMac::cipher_block_size`].
    fn mac_block_size(&self) -> usize;

    /// The key derivation function.
    fn derive_key(&self, shared_secret: &[u8], nonce: Option<&[u8]>, counter: u32) -> Zeroizing<Vec<u8>> {
        kdf::derive_key(self.kdf_algorithm(), shared_secret, nonce, counter)
    }

    /// The key derivation function for encryption purposes.
    fn derive_encryption_key(&self, shared_secret: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(shared_secret, None, kdf::COUNTER_ENC)
    }

    /// The key derivation function for message authentication purposes.
    fn derive_mac_key(&self, shared_secret: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(shared_secret, None, kdf::COUNTER_MAC)
    }

    /// The password-to-key derivation function.
    fn derive_key_from_password(&self, password: &[u8]) -> Zeroizing<Vec<u8>> {
        self.derive_key(password, None, kdf::COUNTER_PASSWORD)
    }

    /// Decrypts data in-place using the given key and CBC IV.
    ///
    /// Does not strip padding.
    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Encrypts pre-padded data in-place using the given key and CBC IV.
    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error>;

    /// Generates a MAC (message authentication code) for the given pre-padded data and key.
    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;

    /// Verifies in constant time whether the given data fits the given MAC.
    fn verify_mac_padded_data(&self, data: &[u8], key: &[u8], expected_mac: &[u8]) -> Result<bool, Error> {
        let computed_mac = self.mac_padded_data(data, key)?;
        Ok(computed_mac.ct_eq(expected_mac).into())
    }

    /// The IV used for Secure Messaging encryption given the current send sequence counter.
    fn send_sequence_counter_iv(&self, k_session_enc: &[u8], send_sequence_counter: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error>;
}


/// Appends ISO/IEC 9797-1 padding method 2: the byte 0x80, then zero bytes up to a multiple of
/// the block size.
pub fn pad(data: &[u8], block_size: usize) -> Zeroizing<Vec<u8>> {
    let mut padded = Zeroizing::new(Vec::with_capacity(data.len() + block_size));
    padded.extend_from_slice(data);
    padded.push(0x80);
    while padded.len() % block_size != 0 {
        padded.push(0x00);
    }
    padded
}

/// Strips ISO/IEC 9797-1 padding method 2. Returns `None` if the padding is malformed.
pub fn unpad(data: &[u8]) -> Option<&[u8]> {
    let marker = data.iter().rposition(|b| *b != 0x00)?;
    if data[marker] == 0x80 {
        Some(&data[..marker])
    } else {
        None
    }
}


fn check_lengths(data_len: usize, block_size: usize, key: &[u8], key_size: usize, iv: &[u8]) -> Result<(), Error> {
    if key.len() != key_size {
        return Err(Error::InvalidKeyLength { expected: key_size, obtained: key.len() });
    }
    if iv.len() != block_size {
        return Err(Error::InvalidIvLength { expected: block_size, obtained: iv.len() });
    }
    if data_len % block_size != 0 {
        return Err(Error::UnalignedData { length: data_len, block_size });
    }
    Ok(())
}


/// 3DES-based cipher and MAC.
///
/// 3DES is used in EDE two-key mode:
/// ```plain
/// encrypt((K1, K2), D) = encrypt(K1, decrypt(K2, encrypt(K1, D)))
/// ```
/// The block mode of operation is Cipher Block Chaining (CBC) with a zero IV.
///
/// The KDF is equivalent to:
/// ```plain
/// keydata = adjust_parity(sha1(key || counter)[0..16])
/// ```
/// whereupon `K1 = keydata[0..8]` and `K2 = keydata[8..16]`.
///
/// The MAC is Retail MAC (ISO/IEC 9797-1 MAC algorithm 3) with single DES and a zero IV.
pub struct Cam3Des;
impl CipherAndMac for Cam3Des {
    fn name(&self) -> &'static str { "3DES" }
    fn kdf_algorithm(&self) -> KdfAlgorithm { KdfAlgorithm::DesEde3Cbc }
    fn cipher_block_size(&self) -> usize { 8 }
    fn mac_block_size(&self) -> usize { 8 }

    fn derive_key(&self, shared_secret: &[u8], nonce: Option<&[u8]>, counter: u32) -> Zeroizing<Vec<u8>> {
        let raw = kdf::derive_key(self.kdf_algorithm(), shared_secret, nonce, counter);
        kdf::adjust_parity(&raw)
    }

    fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        check_lengths(data.len(), 8, key, 16, iv)?;
        let decryptor = cbc::Decryptor::<TdesEde2>::new_from_slices(key, iv)
            .map_err(|_| Error::InvalidKeyLength { expected: 16, obtained: key.len() })?;
        let length = data.len();
        decryptor.decrypt_padded::<NoPadding>(data)
            .map_err(|_| Error::UnalignedData { length, block_size: 8 })?;
        Ok(())
    }

    fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
        check_lengths(data.len(), 8, key, 16, iv)?;
        let length = data.len();
        let encryptor = cbc::Encryptor::<TdesEde2>::new_from_slices(key, iv)
            .map_err(|_| Error::InvalidKeyLength { expected: 16, obtained: key.len() })?;
        encryptor.encrypt_padded::<NoPadding>(data, length)
            .map_err(|_| Error::UnalignedData { length, block_size: 8 })?;
        Ok(())
    }

    fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        if data.is_empty() || data.len() % 8 != 0 {
            return Err(Error::UnalignedData { length: data.len(), block_size: 8 });
        }
        let mut mac = RetailMac::<Des>::new_from_slice(key)
            .map_err(|_| Error::InvalidKeyLength { expected: 16, obtained: key.len() })?;
        Mac::update(&mut mac, data);
        Ok(Zeroizing::new(mac.finalize().into_bytes().to_vec()))
    }

    fn send_sequence_counter_iv(&self, _k_session_enc: &[u8], _send_sequence_counter: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        Ok(Zeroizing::new(vec![0u8; 8]))
    }
}


macro_rules! aes_cipher_and_mac {
    ($(#[$meta:meta])* $name:ident, $cipher:ty, $display_name:expr, $kdf:expr, $key_size:expr) => {
        $(#[$meta])*
        pub struct $name;
        impl CipherAndMac for $name {
            fn name(&self) -> &'static str { $display_name }
            fn kdf_algorithm(&self) -> KdfAlgorithm { $kdf }
            fn cipher_block_size(&self) -> usize { 16 }
            fn mac_block_size(&self) -> usize { 1 }

            fn decrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
                check_lengths(data.len(), 16, key, $key_size, iv)?;
                let decryptor = cbc::Decryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|_| Error::InvalidKeyLength { expected: $key_size, obtained: key.len() })?;
                let length = data.len();
                decryptor.decrypt_padded::<NoPadding>(data)
                    .map_err(|_| Error::UnalignedData { length, block_size: 16 })?;
                Ok(())
            }

            fn encrypt_padded_data(&self, data: &mut [u8], key: &[u8], iv: &[u8]) -> Result<(), Error> {
                check_lengths(data.len(), 16, key, $key_size, iv)?;
                let length = data.len();
                let encryptor = cbc::Encryptor::<$cipher>::new_from_slices(key, iv)
                    .map_err(|_| Error::InvalidKeyLength { expected: $key_size, obtained: key.len() })?;
                encryptor.encrypt_padded::<NoPadding>(data, length)
                    .map_err(|_| Error::UnalignedData { length, block_size: 16 })?;
                Ok(())
            }

            fn mac_padded_data(&self, data: &[u8], key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
                let mut mac = <Cmac<$cipher> as KeyInit>::new_from_slice(key)
                    .map_err(|_| Error::InvalidKeyLength { expected: $key_size, obtained: key.len() })?;
                Mac::update(&mut mac, data);
                let full_mac = mac.finalize().into_bytes();
                // truncated to 8 bytes
                Ok(Zeroizing::new(full_mac[0..8].to_vec()))
            }

            fn send_sequence_counter_iv(&self, k_session_enc: &[u8], send_sequence_counter: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
                // IV = E(K_enc, SSC); one CBC block with a zero IV is the same thing
                let mut iv = Zeroizing::new(send_sequence_counter.to_vec());
                self.encrypt_padded_data(&mut iv, k_session_enc, &[0u8; 16])?;
                Ok(iv)
            }
        }
    };
}

aes_cipher_and_mac!(
    /// AES-128-based cipher and MAC.
    ///
    /// CBC mode, SHA-1 KDF and CMAC truncated to 8 bytes.
    CamAes128, Aes128, "AES-128", KdfAlgorithm::Aes128Cbc, 16
);
aes_cipher_and_mac!(
    /// AES-192-based cipher and MAC.
    ///
    /// CBC mode, SHA-256 KDF and CMAC truncated to 8 bytes.
    CamAes192, Aes192, "AES-192", KdfAlgorithm::Aes192Cbc, 24
);
aes_cipher_and_mac!(
    /// AES-256-based cipher and MAC.
    ///
    /// CBC mode, SHA-256 KDF and CMAC truncated to 8 bytes.
    CamAes256, Aes256, "AES-256", KdfAlgorithm::Aes256Cbc, 32
);


/// Returns the cipher and MAC combination matching the given KDF algorithm.
pub fn for_kdf_algorithm(algorithm: KdfAlgorithm) -> &'static dyn CipherAndMac {
    match algorithm {
        KdfAlgorithm::DesEde3Cbc => &Cam3Des,
        KdfAlgorithm::Aes128Cbc => &CamAes128,
        KdfAlgorithm::Aes192Cbc => &CamAes192,
        KdfAlgorithm::Aes256Cbc => &CamAes256,
    }
}
