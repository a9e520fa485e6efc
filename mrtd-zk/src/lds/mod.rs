//! The Logical Data Structure: elementary files of the eMRTD application and their contents.


pub mod dg1;
pub mod dg14;
pub mod dg2;
pub mod sod;


use std::fmt;

use crate::asn1::{DecodeError, Element};
use crate::mrz::MrzError;
use crate::security_info;
use crate::x509;


/// The elementary files read during a scan.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum FileId {
    CardAccess,
    Com,
    Dg1,
    Dg2,
    Dg14,
    Sod,
}
impl FileId {
    /// The file identifier used with SELECT.
    pub const fn fid(&self) -> u16 {
        match self {
            Self::CardAccess => 0x011C,
            Self::Com => 0x011E,
            Self::Dg1 => 0x0101,
            Self::Dg2 => 0x0102,
            Self::Dg14 => 0x010E,
            Self::Sod => 0x011D,
        }
    }

    /// The tag of the object the file holds.
    pub const fn tag(&self) -> u32 {
        match self {
            Self::CardAccess => 0x31,
            Self::Com => 0x60,
            Self::Dg1 => 0x61,
            Self::Dg2 => 0x75,
            Self::Dg14 => 0x6E,
            Self::Sod => 0x77,
        }
    }

    /// The number used in error reports: the data group number, or 0 for files that are not
    /// data groups.
    pub const fn report_number(&self) -> u8 {
        match self {
            Self::Dg1 => 1,
            Self::Dg2 => 2,
            Self::Dg14 => 14,
            Self::CardAccess|Self::Com|Self::Sod => 0,
        }
    }

    /// Looks up the data group with the given number, if it is one we read.
    pub const fn from_data_group_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::Dg1),
            2 => Some(Self::Dg2),
            14 => Some(Self::Dg14),
            _ => None,
        }
    }
}
impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CardAccess => write!(f, "EF.CardAccess"),
            Self::Com => write!(f, "EF.COM"),
            Self::Dg1 => write!(f, "DG1"),
            Self::Dg2 => write!(f, "DG2"),
            Self::Dg14 => write!(f, "DG14"),
            Self::Sod => write!(f, "SOD"),
        }
    }
}


#[derive(Debug)]
pub enum LdsError {
    Decode(DecodeError),
    Asn1(rasn::error::DecodeError),
    WrongFileTag { file: FileId, obtained: u32 },
    Mrz(MrzError),
    FacialRecord { reason: &'static str },
    SecurityInfo(security_info::Error),
    Certificate(x509::Error),
    UnsupportedDigest { algorithm: String },
    UnexpectedContentType { content_type: String },
    MissingSignerInfo,
    MissingContent,
    DataGroupNumber,
    SignedAttributes(rasn::error::EncodeError),
}
impl fmt::Display for LdsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e)
                => write!(f, "decoding failed: {}", e),
            Self::Asn1(e)
                => write!(f, "ASN.1 decoding failed: {}", e),
            Self::WrongFileTag { file, obtained }
                => write!(f, "{} starts with tag 0x{:02X} instead of 0x{:02X}", file, obtained, file.tag()),
            Self::Mrz(e)
                => write!(f, "invalid MRZ: {}", e),
            Self::FacialRecord { reason }
                => write!(f, "invalid facial record: {}", reason),
            Self::SecurityInfo(e)
                => write!(f, "invalid SecurityInfos: {}", e),
            Self::Certificate(e)
                => write!(f, "invalid certificate: {}", e),
            Self::UnsupportedDigest { algorithm }
                => write!(f, "unsupported digest algorithm {}", algorithm),
            Self::UnexpectedContentType { content_type }
                => write!(f, "unexpected content type {}", content_type),
            Self::MissingSignerInfo
                => write!(f, "no SignerInfo"),
            Self::MissingContent
                => write!(f, "encapsulated content or attribute value missing"),
            Self::DataGroupNumber
                => write!(f, "data group number out of range"),
            Self::SignedAttributes(e)
                => write!(f, "failed to re-encode signed attributes: {}", e),
        }
    }
}
impl std::error::Error for LdsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(e) => Some(e),
            Self::Mrz(e) => Some(e),
            Self::SecurityInfo(e) => Some(e),
            Self::Certificate(e) => Some(e),
            _ => None,
        }
    }
}
impl From<DecodeError> for LdsError {
    fn from(value: DecodeError) -> Self { Self::Decode(value) }
}
impl From<rasn::error::DecodeError> for LdsError {
    fn from(value: rasn::error::DecodeError) -> Self { Self::Asn1(value) }
}
impl From<MrzError> for LdsError {
    fn from(value: MrzError) -> Self { Self::Mrz(value) }
}
impl From<security_info::Error> for LdsError {
    fn from(value: security_info::Error) -> Self { Self::SecurityInfo(value) }
}
impl From<x509::Error> for LdsError {
    fn from(value: x509::Error) -> Self { Self::Certificate(value) }
}


/// Decodes the outer object of a file, checking its tag.
pub(crate) fn outer_element(file: FileId, raw: &[u8]) -> Result<Element<'_>, LdsError> {
    let element = Element::parse_exact(raw)?;
    if element.tag != file.tag() {
        return Err(LdsError::WrongFileTag { file, obtained: element.tag });
    }
    Ok(element)
}


/// EF.COM: LDS version and the list of data groups present.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Com {
    pub lds_version: String,
    pub unicode_version: String,
    pub data_group_tags: Vec<u8>,
}
impl Com {
    pub fn parse(raw: &[u8]) -> Result<Self, LdsError> {
        let element = outer_element(FileId::Com, raw)?;
        let mut lds_version = String::new();
        let mut unicode_version = String::new();
        let mut data_group_tags = Vec::new();
        for child in element.children()? {
            match child.tag {
                0x5F01 => lds_version = String::from_utf8_lossy(child.content).into_owned(),
                0x5F36 => unicode_version = String::from_utf8_lossy(child.content).into_owned(),
                0x5C => data_group_tags = child.content.to_vec(),
                _ => {},
            }
        }
        Ok(Self { lds_version, unicode_version, data_group_tags })
    }

    /// Whether the tag list announces the file.
    pub fn lists(&self, file: FileId) -> bool {
        u8::try_from(file.tag())
            .map(|tag| self.data_group_tags.contains(&tag))
            .unwrap_or(false)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn com_part11_appendix_d4() {
        let com = Com::parse(&hex!("60145F0104303130365F36063034303030305C026175")).unwrap();
        assert_eq!(com.lds_version, "0106");
        assert_eq!(com.unicode_version, "040000");
        assert!(com.lists(FileId::Dg1));
        assert!(com.lists(FileId::Dg2));
        assert!(!com.lists(FileId::Dg14));
    }

    #[test]
    fn file_numbers() {
        assert_eq!(FileId::Sod.report_number(), 0);
        assert_eq!(FileId::Dg14.report_number(), 14);
        assert_eq!(FileId::from_data_group_number(2), Some(FileId::Dg2));
        assert_eq!(FileId::from_data_group_number(13), None);
        assert_eq!(FileId::Sod.to_string(), "SOD");
        assert_eq!(FileId::CardAccess.fid(), 0x011C);
    }

    #[test]
    fn wrong_tag() {
        assert!(matches!(
            Com::parse(&hex!("61 00")),
            Err(LdsError::WrongFileTag { file: FileId::Com, obtained: 0x61 }),
        ));
    }
}
