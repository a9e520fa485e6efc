//! Object identifiers relevant to PACE.


use rasn::types::Oid;

use crate::kdf::KdfAlgorithm;


macro_rules! pace_oid {
    ($name:ident $(, $number:expr)* $(,)?) => {
        pub const $name: &'static Oid = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4 $(, $number)*]);
    };
}

pace_oid!(PACE_OID_PREFIX);

pace_oid!(PACE_DH_GM_3DES_CBC_CBC,      1, 1);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_128,  1, 2);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_192,  1, 3);
pace_oid!(PACE_DH_GM_AES_CBC_CMAC_256,  1, 4);

pace_oid!(PACE_ECDH_GM_3DES_CBC_CBC,        2, 1);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_128,    2, 2);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_192,    2, 3);
pace_oid!(PACE_ECDH_GM_AES_CBC_CMAC_256,    2, 4);


/// The key agreement family of a PACE protocol.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum KeyAgreement {
    DiffieHellman,
    EllipticCurveDiffieHellman,
}

/// How the ephemeral generator is derived from the nonce.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Mapping {
    Generic,
    Integrated,
    ChipAuthentication,
}


/// A PACE protocol OID taken apart.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PaceProtocol {
    pub key_agreement: KeyAgreement,
    pub mapping: Mapping,
    pub cipher: KdfAlgorithm,
}
impl PaceProtocol {
    /// Decodes a PACE protocol OID. Returns `None` for anything that is not one.
    pub fn from_oid(oid: &Oid) -> Option<Self> {
        if oid.len() != PACE_OID_PREFIX.len() + 2 || oid[..PACE_OID_PREFIX.len()] != PACE_OID_PREFIX[..] {
            return None;
        }
        let (key_agreement, mapping) = match oid[PACE_OID_PREFIX.len()] {
            1 => (KeyAgreement::DiffieHellman, Mapping::Generic),
            2 => (KeyAgreement::EllipticCurveDiffieHellman, Mapping::Generic),
            3 => (KeyAgreement::DiffieHellman, Mapping::Integrated),
            4 => (KeyAgreement::EllipticCurveDiffieHellman, Mapping::Integrated),
            6 => (KeyAgreement::EllipticCurveDiffieHellman, Mapping::ChipAuthentication),
            _ => return None,
        };
        let cipher = match oid[PACE_OID_PREFIX.len() + 1] {
            1 => KdfAlgorithm::DesEde3Cbc,
            2 => KdfAlgorithm::Aes128Cbc,
            3 => KdfAlgorithm::Aes192Cbc,
            4 => KdfAlgorithm::Aes256Cbc,
            _ => return None,
        };
        if mapping == Mapping::ChipAuthentication && cipher == KdfAlgorithm::DesEde3Cbc {
            return None;
        }
        Some(Self { key_agreement, mapping, cipher })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_protocols() {
        assert_eq!(
            PaceProtocol::from_oid(PACE_ECDH_GM_AES_CBC_CMAC_128),
            Some(PaceProtocol {
                key_agreement: KeyAgreement::EllipticCurveDiffieHellman,
                mapping: Mapping::Generic,
                cipher: KdfAlgorithm::Aes128Cbc,
            }),
        );
        assert_eq!(
            PaceProtocol::from_oid(PACE_DH_GM_3DES_CBC_CBC).map(|p| p.key_agreement),
            Some(KeyAgreement::DiffieHellman),
        );
        let integrated = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 4, 3]);
        assert_eq!(PaceProtocol::from_oid(integrated).map(|p| p.mapping), Some(Mapping::Integrated));
        let cam_3des = Oid::const_new(&[0, 4, 0, 127, 0, 7, 2, 2, 4, 6, 1]);
        assert_eq!(PaceProtocol::from_oid(cam_3des), None);
        assert_eq!(PaceProtocol::from_oid(PACE_OID_PREFIX), None);
    }
}
