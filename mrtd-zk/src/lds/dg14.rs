//! DG14: security infos for chip authentication.


use crate::lds::{outer_element, FileId, LdsError};
use crate::security_info::{parse_security_infos, ChipAuthenticationInfo, ChipAuthenticationPublicKeyInfo, SecurityInfo};


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dg14 {
    raw: Vec<u8>,
    security_infos: Vec<SecurityInfo>,
}
impl Dg14 {
    pub fn parse(raw: Vec<u8>) -> Result<Self, LdsError> {
        let element = outer_element(FileId::Dg14, &raw)?;
        let security_infos = parse_security_infos(element.content)?;
        Ok(Self { raw, security_infos })
    }

    /// The complete encoded file, as hashed into the SOD.
    pub fn raw(&self) -> &[u8] { &self.raw }

    pub fn security_infos(&self) -> &[SecurityInfo] { &self.security_infos }

    pub fn chip_authentication_infos(&self) -> impl Iterator<Item = &ChipAuthenticationInfo> {
        self.security_infos.iter()
            .filter_map(|info| match info {
                SecurityInfo::ChipAuthentication(ca) => Some(ca),
                _ => None,
            })
    }

    pub fn chip_authentication_public_keys(&self) -> impl Iterator<Item = &ChipAuthenticationPublicKeyInfo> {
        self.security_infos.iter()
            .filter_map(|info| match info {
                SecurityInfo::ChipAuthenticationPublicKey(pk) => Some(pk),
                _ => None,
            })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const DG14: &[u8] = include_bytes!("../../tests/data/dg14.bin");

    #[test]
    fn decodes_chip_auth_infos() {
        let dg14 = Dg14::parse(DG14.to_vec()).unwrap();
        assert_eq!(dg14.raw(), DG14);
        assert_eq!(dg14.chip_authentication_infos().count(), 1);
        assert_eq!(dg14.chip_authentication_public_keys().count(), 1);
    }
}
