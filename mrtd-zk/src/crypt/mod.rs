//! Cryptographic functionality.


pub mod cipher_mac;
pub mod dh;
pub mod elliptic;


use std::fmt;

use num_bigint::BigUint;
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::crypt::dh::DiffieHellmanParams;
use crate::crypt::elliptic::{AffinePoint, PrimeWeierstrassCurve, pad_be_bytes};


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Error {
    InvalidKeyLength { expected: usize, obtained: usize },
    InvalidIvLength { expected: usize, obtained: usize },
    UnalignedData { length: usize, block_size: usize },
    InvalidDomainParameters,
    NotOnCurve,
    PointAtInfinity,
    InvalidPublicKey,
    ValueTooLong { maximum: usize, obtained: usize },
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidKeyLength { expected, obtained }
                => write!(f, "invalid key length (expected {}, obtained {})", expected, obtained),
            Self::InvalidIvLength { expected, obtained }
                => write!(f, "invalid IV length (expected {}, obtained {})", expected, obtained),
            Self::UnalignedData { length, block_size }
                => write!(f, "data length {} is not a multiple of the block size {}", length, block_size),
            Self::InvalidDomainParameters
                => write!(f, "invalid domain parameters"),
            Self::NotOnCurve
                => write!(f, "point is not on the curve"),
            Self::PointAtInfinity
                => write!(f, "operation resulted in the point at infinity"),
            Self::InvalidPublicKey
                => write!(f, "invalid public key"),
            Self::ValueTooLong { maximum, obtained }
                => write!(f, "value is {} bytes long, at most {} fit", obtained, maximum),
        }
    }
}
impl std::error::Error for Error {
}


/// A key exchange method.
///
/// Private keys are unsigned integers.
///
/// For classic Diffie-Hellman, public keys and shared secrets are unsigned big-endian integers
/// left-padded to the length of the prime.
///
/// For elliptic-curve Diffie-Hellman, public keys are serialized as `0x04 || x || y` with both
/// coordinates padded to the length of the field prime, and the shared secret is the padded x
/// coordinate of the shared point.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum KeyExchange {
    DiffieHellman(DiffieHellmanParams),
    PrimeWeierstrassEllipticDiffieHellman(PrimeWeierstrassCurve),
}
impl KeyExchange {
    /// Returns the recommended number of bytes for a private key using this key exchange method.
    pub fn private_key_len_bytes(&self) -> usize {
        match self {
            Self::DiffieHellman(dhp) => dhp.private_key_len_bytes(),
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => curve.private_key_len_bytes(),
        }
    }

    /// Generates a random private key of the recommended length.
    pub fn generate_private_key(&self) -> Zeroizing<BigUint> {
        let mut bytes = Zeroizing::new(vec![0u8; self.private_key_len_bytes()]);
        loop {
            OsRng.fill_bytes(&mut bytes);
            let candidate = Zeroizing::new(BigUint::from_bytes_be(&bytes));
            let in_range = match self {
                Self::DiffieHellman(dhp) => match dhp.subgroup_order() {
                    Some(q) => &*candidate < q,
                    None => &*candidate < dhp.prime(),
                },
                Self::PrimeWeierstrassEllipticDiffieHellman(curve) => &*candidate < curve.order(),
            };
            if in_range && candidate.bits() > 1 {
                return candidate;
            }
        }
    }

    /// Calculates the public key for the given private key, returning it serialized to bytes.
    pub fn calculate_public_key(&self, private_key: &BigUint) -> Result<Zeroizing<Vec<u8>>, Error> {
        match self {
            Self::DiffieHellman(dhp) => {
                let public_key = dhp.calculate_public_key(private_key);
                pad_be_bytes(&public_key, dhp.prime_len_bytes())
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let public_key = curve.calculate_public_key(private_key)?;
                public_key.to_be_bytes(curve.coordinate_len_bytes())
            },
        }
    }

    /// Performs the key exchange using our private key and the other party's serialized public
    /// key, returning the serialized shared secret.
    pub fn exchange_keys(&self, private_key: &BigUint, other_public_key: &[u8]) -> Result<Zeroizing<Vec<u8>>, Error> {
        match self {
            Self::DiffieHellman(dhp) => {
                let other = BigUint::from_bytes_be(other_public_key);
                let shared_secret = Zeroizing::new(dhp.diffie_hellman(private_key, &other)?);
                pad_be_bytes(&shared_secret, dhp.prime_len_bytes())
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                let shared_point = curve.diffie_hellman(private_key, &other)?;
                pad_be_bytes(shared_point.x(), curve.coordinate_len_bytes())
            },
        }
    }

    /// Derives a new key exchange method using generic mapping.
    ///
    /// The parameters stay the same except for the generator, which is derived from the nonce and
    /// from the shared secret of our private key and the other party's public key.
    pub fn derive_generic_mapping(&self, nonce: &BigUint, private_key: &BigUint, other_public_key: &[u8]) -> Result<Self, Error> {
        match self {
            Self::DiffieHellman(dhp) => {
                let other = BigUint::from_bytes_be(other_public_key);
                let shared_secret = Zeroizing::new(dhp.diffie_hellman(private_key, &other)?);
                Ok(Self::DiffieHellman(dhp.derive_generic_mapping(nonce, &shared_secret)?))
            },
            Self::PrimeWeierstrassEllipticDiffieHellman(curve) => {
                let other = AffinePoint::try_from_be_bytes(other_public_key)
                    .ok_or(Error::InvalidPublicKey)?;
                let shared_point = curve.diffie_hellman(private_key, &other)?;
                Ok(Self::PrimeWeierstrassEllipticDiffieHellman(
                    curve.derive_generic_mapping_session_curve(nonce, &shared_point)?
                ))
            },
        }
    }

    /// The tag of a public key of this type within a public key data object.
    pub fn public_key_tag(&self) -> u8 {
        match self {
            Self::DiffieHellman(_) => 0x84, // Diffie-Hellman public value
            Self::PrimeWeierstrassEllipticDiffieHellman(_) => 0x86, // elliptic curve point
        }
    }
}
