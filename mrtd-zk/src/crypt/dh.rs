//! Finite-field Diffie-Hellman.


use hex_literal::hex;
use num_bigint::BigUint;
use num_traits::One;

use crate::crypt::Error;


/// Diffie-Hellman domain parameters.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct DiffieHellmanParams {
    /// The prime or modulus.
    prime: BigUint,

    /// The generator or base.
    generator: BigUint,

    /// The order of the subgroup generated by the generator.
    subgroup_order: Option<BigUint>,
}
impl DiffieHellmanParams {
    pub fn new(prime: BigUint, generator: BigUint, subgroup_order: Option<BigUint>) -> Result<Self, Error> {
        let two = BigUint::from(2u8);
        if !prime.bit(0) || prime <= two || generator < two || generator >= prime {
            return Err(Error::InvalidDomainParameters);
        }
        Ok(Self {
            prime,
            generator,
            subgroup_order,
        })
    }

    pub fn prime(&self) -> &BigUint { &self.prime }
    pub fn generator(&self) -> &BigUint { &self.generator }
    pub fn subgroup_order(&self) -> Option<&BigUint> { self.subgroup_order.as_ref() }

    /// The length of the prime, public keys and shared secrets in bytes.
    pub fn prime_len_bytes(&self) -> usize {
        usize::try_from((self.prime.bits() + 7) / 8).unwrap_or(usize::MAX)
    }

    /// The recommended length of a private key in bytes.
    pub fn private_key_len_bytes(&self) -> usize {
        let bits = match &self.subgroup_order {
            Some(q) => q.bits(),
            None => self.prime.bits(),
        };
        usize::try_from((bits + 7) / 8).unwrap_or(usize::MAX)
    }

    /// Calculates the public key belonging to a private key.
    pub fn calculate_public_key(&self, private_key: &BigUint) -> BigUint {
        // pubkey = generator ** private_key mod prime
        self.generator.modpow(private_key, &self.prime)
    }

    /// Calculates the shared secret from our private key and the other party's public key.
    pub fn diffie_hellman(&self, private_key: &BigUint, other_public_key: &BigUint) -> Result<BigUint, Error> {
        self.check_public_key(other_public_key)?;
        // secret = other_public_key ** private_key mod prime
        Ok(other_public_key.modpow(private_key, &self.prime))
    }

    /// Rejects public keys outside `]1, p-1[` or outside the subgroup.
    fn check_public_key(&self, public_key: &BigUint) -> Result<(), Error> {
        let p_minus_one = &self.prime - 1u32;
        if public_key <= &BigUint::one() || public_key >= &p_minus_one {
            return Err(Error::InvalidPublicKey);
        }
        if let Some(q) = &self.subgroup_order {
            if !public_key.modpow(q, &self.prime).is_one() {
                return Err(Error::InvalidPublicKey);
            }
        }
        Ok(())
    }

    /// Returns the parameters with the generator `generator ** nonce * shared_secret mod prime`,
    /// as required by generic mapping.
    pub fn derive_generic_mapping(&self, nonce: &BigUint, shared_secret: &BigUint) -> Result<Self, Error> {
        let powered = self.generator.modpow(nonce, &self.prime);
        let new_generator = (powered * shared_secret) % &self.prime;
        if new_generator <= BigUint::one() {
            return Err(Error::InvalidPublicKey);
        }
        Ok(Self {
            generator: new_generator,
            ..self.clone()
        })
    }
}


/// The 1024-bit MODP group with a 160-bit prime order subgroup from RFC 5114 § 2.1.
///
/// This is PACE standardized domain parameter 0.
pub fn get_1024_modp_160_po() -> DiffieHellmanParams {
    DiffieHellmanParams {
        prime: BigUint::from_bytes_be(&hex!("
            B10B8F96 A080E01D DE92DE5E AE5D54EC
            52C99FBC FB06A3C6 9A6A9DCA 52D23B61
            6073E286 75A23D18 9838EF1E 2EE652C0
            13ECB4AE A9061123 24975C3C D49B83BF
            ACCBDD7D 90C4BD70 98488E9C 219A7372
            4EFFD6FA E5644738 FAA31A4F F55BCCC0
            A151AF5F 0DC8B4BD 45BF37DF 365C1A65
            E68CFDA7 6D4DA708 DF1FB2BC 2E4A4371
        ")),
        generator: BigUint::from_bytes_be(&hex!("
            A4D1CBD5 C3FD3412 6765A442 EFB99905
            F8104DD2 58AC507F D6406CFF 14266D31
            266FEA1E 5C41564B 777E690F 5504F213
            160217B4 B01B886A 5E91547F 9E2749F4
            D7FBD7D3 B9A92EE1 909D0D22 63F80A76
            A6A24C08 7A091F53 1DBF0A01 69B6A28A
            D662A4D1 8E73AFA3 2D779D59 18D08BC8
            858F4DCE F97C2A24 855E6EEB 22B3B2E5
        ")),
        subgroup_order: Some(BigUint::from_bytes_be(&hex!("
            F518AA87 81A8DF27 8ABA4E7D 64B7CB9D 49462353
        "))),
    }
}
