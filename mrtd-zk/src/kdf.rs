//! Key Derivation Functions.
//!
//! Specified in ICAO Doc 9303 Part 11 § 9.7.1 and BSI TR-03110-3 Annex A.2.3. The KDF is
//! equivalent to:
//! ```plain
//! keydata = H(shared_secret || nonce || counter)[0..key_length]
//! ```
//! where `H` and `key_length` depend on the cipher the key is meant for, `nonce` is optional and
//! `counter` is a big-endian 32-bit integer.


use digest::Digest;
use sha1::Sha1;
use sha2::Sha256;
use zeroize::Zeroizing;


/// Counter value for deriving an encryption key.
pub const COUNTER_ENC: u32 = 1;

/// Counter value for deriving a message authentication key.
pub const COUNTER_MAC: u32 = 2;

/// Counter value for deriving a key from a password (PACE).
pub const COUNTER_PASSWORD: u32 = 3;


/// The cipher for which a key is derived.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KdfAlgorithm {
    DesEde3Cbc,
    Aes128Cbc,
    Aes192Cbc,
    Aes256Cbc,
}
impl KdfAlgorithm {
    /// Number of key bytes produced for this cipher.
    pub const fn key_length(&self) -> usize {
        match self {
            Self::DesEde3Cbc => 16,
            Self::Aes128Cbc => 16,
            Self::Aes192Cbc => 24,
            Self::Aes256Cbc => 32,
        }
    }

    fn hash(&self, parts: &[&[u8]]) -> Zeroizing<Vec<u8>> {
        match self {
            Self::DesEde3Cbc|Self::Aes128Cbc => {
                let mut hasher = Sha1::new();
                for part in parts {
                    hasher.update(part);
                }
                Zeroizing::new(hasher.finalize().to_vec())
            },
            Self::Aes192Cbc|Self::Aes256Cbc => {
                let mut hasher = Sha256::new();
                for part in parts {
                    hasher.update(part);
                }
                Zeroizing::new(hasher.finalize().to_vec())
            },
        }
    }
}


/// The key derivation function itself.
pub fn derive_key(algorithm: KdfAlgorithm, shared_secret: &[u8], nonce: Option<&[u8]>, counter: u32) -> Zeroizing<Vec<u8>> {
    let counter_bytes = counter.to_be_bytes();
    let digest = match nonce {
        Some(n) => algorithm.hash(&[shared_secret, n, &counter_bytes]),
        None => algorithm.hash(&[shared_secret, &counter_bytes]),
    };
    Zeroizing::new(digest[0..algorithm.key_length()].to_vec())
}

/// The key derivation function for encryption purposes.
pub fn derive_enc_key(algorithm: KdfAlgorithm, shared_secret: &[u8], nonce: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
    derive_key(algorithm, shared_secret, nonce, COUNTER_ENC)
}

/// The key derivation function for message authentication purposes.
pub fn derive_mac_key(algorithm: KdfAlgorithm, shared_secret: &[u8], nonce: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
    derive_key(algorithm, shared_secret, nonce, COUNTER_MAC)
}

/// The password-to-key derivation function used by PACE.
pub fn derive_password_key(algorithm: KdfAlgorithm, password: &[u8]) -> Zeroizing<Vec<u8>> {
    derive_key(algorithm, password, None, COUNTER_PASSWORD)
}


/// Adjusts each byte to odd parity by overwriting its least significant bit.
///
/// DES ignores the least significant bit of each key byte, but ICAO Doc 9303 Part 11 Appendix D
/// lists keys with adjusted parity.
pub fn adjust_parity(key: &[u8]) -> Zeroizing<Vec<u8>> {
    let adjusted = key.iter()
        .map(|&x| {
            let y = x & 0xFE;
            if y.count_ones() % 2 == 0 {
                y | 0x01
            } else {
                y
            }
        })
        .collect();
    Zeroizing::new(adjusted)
}


/// Derives the BAC key seed (`K_seed`) from the MRZ key.
///
/// The MRZ key is the document number, date of birth and date of expiry, each followed by its
/// check digit.
pub fn bac_key_seed(mrz_key: &[u8]) -> Zeroizing<Vec<u8>> {
    let digest = Sha1::digest(mrz_key);
    Zeroizing::new(digest[0..16].to_vec())
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn key_lengths_follow_table() {
        let secret = b"shared secret";
        let nonce = hex!("00112233");
        for (algorithm, length) in [
            (KdfAlgorithm::DesEde3Cbc, 16),
            (KdfAlgorithm::Aes128Cbc, 16),
            (KdfAlgorithm::Aes192Cbc, 24),
            (KdfAlgorithm::Aes256Cbc, 32),
        ] {
            for counter in [COUNTER_ENC, COUNTER_MAC, COUNTER_PASSWORD] {
                let first = derive_key(algorithm, secret, Some(&nonce), counter);
                let second = derive_key(algorithm, secret, Some(&nonce), counter);
                assert_eq!(first.len(), length);
                assert_eq!(first, second);
            }
        }
    }

    #[test]
    fn nonce_and_counter_change_output() {
        let secret = b"shared secret";
        let plain = derive_enc_key(KdfAlgorithm::Aes256Cbc, secret, None);
        let with_nonce = derive_enc_key(KdfAlgorithm::Aes256Cbc, secret, Some(b"r"));
        let mac = derive_mac_key(KdfAlgorithm::Aes256Cbc, secret, None);
        assert_ne!(plain, with_nonce);
        assert_ne!(plain, mac);
    }

    #[test]
    fn parity_is_odd_for_every_byte() {
        let all_bytes: Vec<u8> = (0..=255u8).collect();
        let adjusted = adjust_parity(&all_bytes);
        for (original, adjusted) in all_bytes.iter().zip(adjusted.iter()) {
            assert_eq!(adjusted.count_ones() % 2, 1, "byte 0x{:02X}", original);
            assert_eq!(original & 0xFE, adjusted & 0xFE);
        }
    }

    #[test]
    fn bac_keys_icao_sample_mrz() {
        // document number L898902C3, born 1974-08-12, expiring 2012-04-15
        let k_seed = bac_key_seed(b"L898902C3674081221204159");
        assert_eq!(k_seed.as_slice(), &hex!("3F181D701DD9F12E525EF9B5EBEF8909"));

        let k_enc = derive_enc_key(KdfAlgorithm::DesEde3Cbc, &k_seed, None);
        let k_mac = derive_mac_key(KdfAlgorithm::DesEde3Cbc, &k_seed, None);
        assert_eq!(k_enc.as_slice(), &hex!("3D6FA688F8963C023A435A114FA8D56B"));
        assert_eq!(k_mac.as_slice(), &hex!("DFD73F001B57F54C16A53A226EAB446A"));

        assert_eq!(adjust_parity(&k_enc).as_slice(), &hex!("3D6EA789F8973D023B435B104FA8D56B"));
        assert_eq!(adjust_parity(&k_mac).as_slice(), &hex!("DFD63E011A57F44C16A43B236EAB456B"));
    }

    #[test]
    fn bac_keys_part11_appendix_d1() {
        let k_seed = hex!("239AB9CB282DAF66231DC5A4DF6BFBAE");
        let k_enc = adjust_parity(&derive_enc_key(KdfAlgorithm::DesEde3Cbc, &k_seed, None));
        let k_mac = adjust_parity(&derive_mac_key(KdfAlgorithm::DesEde3Cbc, &k_seed, None));
        assert_eq!(k_enc.as_slice(), &hex!("AB94FDECF2674FDFB9B391F85D7F76F2"));
        assert_eq!(k_mac.as_slice(), &hex!("7962D9ECE03D1ACD4C76089DCE131543"));
    }

    #[test]
    fn pace_password_key_part11_appendix_g1() {
        // K = SHA-1("T22000129364081251010318")
        let password = Sha1::digest(b"T22000129364081251010318");
        let k_pi = derive_password_key(KdfAlgorithm::Aes128Cbc, &password);
        assert_eq!(k_pi.as_slice(), &hex!("89DED1B26624EC1E634C1989302849DD"));
    }
}
