//! Machine-readable zone handling.
//!
//! Only the passport form factor (TD3, two lines of 44 characters) is decoded:
//! ```plain
//! TTSSSIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIIII
//! NNNNNNNNNCAAABBBBBBDXEEEEEEFOOOOOOOOOOOOOOQG
//! ```
//! with
//! * `TT`: type of document (right-padded with `<`)
//! * `SSS`: issuing state or organization
//! * `IIII…`: name (primary identifier, `<<`, secondary identifier, padding with `<`)
//! * `NNNNNNNNN`: passport number (right-padded with `<`)
//! * `C`: check digit of the passport number
//! * `AAA`: nationality
//! * `BBBBBB`: date of birth as YYMMDD, `D` its check digit
//! * `X`: sex (`F`, `M`, or `<` for unspecified)
//! * `EEEEEE`: date of expiry as YYMMDD, `F` its check digit
//! * `OOOOOOOOOOOOOO`: optional data, `Q` its check digit
//! * `G`: composite check digit of `NNNNNNNNNCBBBBBBDEEEEEEFOOOOOOOOOOOOOOQ`


use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use smallstr::SmallString;
use zeroize::Zeroizing;
use zeroize_derive::{Zeroize, ZeroizeOnDrop};


/// Length of a TD3 machine-readable zone without line breaks.
pub const TD3_LENGTH: usize = 88;


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MrzError {
    WrongLength { expected: usize, obtained: usize },
    InvalidCharacter { position: usize },
    InvalidSex(u8),
    InvalidCredential { field: &'static str },
}
impl fmt::Display for MrzError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongLength { expected, obtained }
                => write!(f, "MRZ has {} characters, expected {}", obtained, expected),
            Self::InvalidCharacter { position }
                => write!(f, "invalid character at MRZ position {}", position),
            Self::InvalidSex(b)
                => write!(f, "invalid sex marker 0x{:02X}", b),
            Self::InvalidCredential { field }
                => write!(f, "invalid {}", field),
        }
    }
}
impl std::error::Error for MrzError {
}


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Sex {
    Female,
    Male,
    Unspecified,
}


/// The values printed on the data page that unlock the chip.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct DocumentCredentials {
    pub document_number: String,

    /// Date of birth as YYMMDD.
    pub date_of_birth: String,

    /// Date of expiry as YYMMDD.
    pub date_of_expiry: String,
}
impl DocumentCredentials {
    pub fn new(document_number: &str, date_of_birth: &str, date_of_expiry: &str) -> Result<Self, MrzError> {
        let document_number = document_number.trim().to_ascii_uppercase();
        if document_number.is_empty() || !document_number.bytes().all(is_mrz_char) {
            return Err(MrzError::InvalidCredential { field: "document number" });
        }
        for (field, value) in [("date of birth", date_of_birth), ("date of expiry", date_of_expiry)] {
            if value.len() != 6 || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(MrzError::InvalidCredential { field });
            }
        }
        Ok(Self {
            document_number,
            date_of_birth: date_of_birth.to_owned(),
            date_of_expiry: date_of_expiry.to_owned(),
        })
    }

    /// The MRZ key used to derive BAC and PACE keys.
    ///
    /// The document number is padded with `<` to at least 9 characters; every field is followed
    /// by its check digit.
    pub fn mrz_key(&self) -> Zeroizing<String> {
        let mut ret = Zeroizing::new(String::with_capacity(9 + 1 + 6 + 1 + 6 + 1));
        ret.push_str(&self.document_number);
        while ret.len() < 9 {
            ret.push('<');
        }
        let number_check = check_digit(ret.as_bytes());
        ret.push(char::from(b'0' + number_check));
        ret.push_str(&self.date_of_birth);
        ret.push(char::from(b'0' + check_digit(self.date_of_birth.as_bytes())));
        ret.push_str(&self.date_of_expiry);
        ret.push(char::from(b'0' + check_digit(self.date_of_expiry.as_bytes())));
        ret
    }
}
impl fmt::Debug for DocumentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentCredentials")
            .field("document_number", &"<redacted>")
            .field("date_of_birth", &"<redacted>")
            .field("date_of_expiry", &"<redacted>")
            .finish()
    }
}


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Td3Data {
    /// Document type.
    pub document_type: SmallString<[u8; 2]>,

    /// Issuing state or organization of the document.
    pub issuer: SmallString<[u8; 3]>,

    /// Name of holder.
    pub name: SmallString<[u8; 39]>,

    /// Number of the passport.
    ///
    /// Can be alphanumeric.
    pub document_number: SmallString<[u8; 9]>,
    pub document_number_check: u8,

    /// Nationality of holder.
    pub nationality: SmallString<[u8; 3]>,

    pub date_of_birth: SmallString<[u8; 6]>,
    pub date_of_birth_check: u8,

    pub sex: Sex,

    pub date_of_expiry: SmallString<[u8; 6]>,
    pub date_of_expiry_check: u8,

    pub optional_data: SmallString<[u8; 14]>,
    pub optional_data_check: u8,

    /// Composite check digit.
    pub composite_check: u8,
}
impl Td3Data {
    /// Decodes a TD3 MRZ given as 88 characters without line breaks.
    pub fn parse(mrz: &[u8]) -> Result<Self, MrzError> {
        if mrz.len() != TD3_LENGTH {
            return Err(MrzError::WrongLength { expected: TD3_LENGTH, obtained: mrz.len() });
        }
        if let Some(position) = mrz.iter().position(|b| !is_mrz_char(*b)) {
            return Err(MrzError::InvalidCharacter { position });
        }

        // every byte is ASCII at this point
        fn field(mrz: &[u8], range: Range<usize>) -> &str {
            std::str::from_utf8(&mrz[range]).unwrap_or("")
        }
        fn digit(mrz: &[u8], index: usize) -> u8 {
            match mrz[index] {
                b @ b'0'..=b'9' => b - b'0',
                _ => 0,
            }
        }

        let sex = match mrz[64] {
            b'F' => Sex::Female,
            b'M' => Sex::Male,
            b'<' => Sex::Unspecified,
            other => return Err(MrzError::InvalidSex(other)),
        };

        Ok(Self {
            document_type: SmallString::from_str(field(mrz, 0..2).trim_end_matches('<')),
            issuer: SmallString::from_str(field(mrz, 2..5)),
            name: SmallString::from_str(field(mrz, 5..44)),
            document_number: SmallString::from_str(field(mrz, 44..53).trim_end_matches('<')),
            document_number_check: digit(mrz, 53),
            nationality: SmallString::from_str(field(mrz, 54..57)),
            date_of_birth: SmallString::from_str(field(mrz, 57..63)),
            date_of_birth_check: digit(mrz, 63),
            sex,
            date_of_expiry: SmallString::from_str(field(mrz, 65..71)),
            date_of_expiry_check: digit(mrz, 71),
            optional_data: SmallString::from_str(field(mrz, 72..86)),
            optional_data_check: digit(mrz, 86),
            composite_check: digit(mrz, 87),
        })
    }

    /// Splits the name into primary and secondary identifiers with `<` replaced by spaces.
    pub fn primary_and_secondary_identifier(&self) -> (String, String) {
        let (primary, secondary) = self.name
            .split_once("<<")
            .unwrap_or((self.name.as_str(), ""));
        let clean = |s: &str| s.split('<')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        (clean(primary), clean(secondary))
    }

    pub fn is_document_number_valid(&self) -> bool {
        let mut padded = String::from(self.document_number.as_str());
        while padded.len() < 9 {
            padded.push('<');
        }
        check_digit(padded.as_bytes()) == self.document_number_check
    }

    pub fn is_date_of_birth_valid(&self) -> bool {
        check_digit(self.date_of_birth.as_bytes()) == self.date_of_birth_check
    }

    pub fn is_date_of_expiry_valid(&self) -> bool {
        check_digit(self.date_of_expiry.as_bytes()) == self.date_of_expiry_check
    }
}


/// An attribute of the MRZ that can be selectively revealed.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MrzAttribute {
    IssuingState,
    Name,
    PassportNumber,
    Nationality,
    DateOfBirth,
    Gender,
    ExpiryDate,
}
impl MrzAttribute {
    pub const ALL: [MrzAttribute; 7] = [
        Self::IssuingState,
        Self::Name,
        Self::PassportNumber,
        Self::Nationality,
        Self::DateOfBirth,
        Self::Gender,
        Self::ExpiryDate,
    ];

    /// Position of the attribute within the 88-character MRZ.
    pub const fn range(&self) -> Range<usize> {
        match self {
            Self::IssuingState => 2..5,
            Self::Name => 5..44,
            Self::PassportNumber => 44..52,
            Self::Nationality => 54..57,
            Self::DateOfBirth => 57..63,
            Self::Gender => 64..65,
            Self::ExpiryDate => 65..71,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::IssuingState => "issuing_state",
            Self::Name => "name",
            Self::PassportNumber => "passport_number",
            Self::Nationality => "nationality",
            Self::DateOfBirth => "date_of_birth",
            Self::Gender => "gender",
            Self::ExpiryDate => "expiry_date",
        }
    }
}
impl fmt::Display for MrzAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
impl FromStr for MrzAttribute {
    type Err = MrzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter()
            .find(|a| a.name() == s)
            .ok_or(MrzError::InvalidCredential { field: "attribute name" })
    }
}


/// Computes the check digit over the given MRZ characters.
///
/// Digits count as their value, `A` to `Z` as 10 to 35 and `<` as 0.
pub fn check_digit(data: &[u8]) -> u8 {
    const WEIGHTS: [u8; 3] = [7, 3, 1];

    let mut check_digit: u8 = 0;
    for (b, weight) in data.iter().copied().zip(WEIGHTS.iter().copied().cycle()) {
        let value = match b {
            b'0'..=b'9' => b - b'0',
            b'A'..=b'Z' => b + 10 - b'A',
            _ => continue,
        };

        // at most 35 * 7 + 9 = 254, which fits into u8
        check_digit = (check_digit + value * weight) % 10;
    }
    check_digit
}


fn is_mrz_char(b: u8) -> bool {
    b.is_ascii_digit() || b.is_ascii_uppercase() || b == b'<'
}


#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"P<UTOERIKSSON<<ANNA<MARIA<<<<<<<<<<<<<<<<<<<L898902C36UTO7408122F1204159ZE184226B<<<<<10";

    #[test]
    fn check_digits() {
        assert_eq!(check_digit(b"L898902C3"), 6);
        assert_eq!(check_digit(b"740812"), 2);
        assert_eq!(check_digit(b"120415"), 9);
        assert_eq!(check_digit(b"ZE184226B<<<<<"), 1);
        assert_eq!(check_digit(b"<<<<<<"), 0);
    }

    #[test]
    fn mrz_key_from_credentials() {
        let credentials = DocumentCredentials::new("L898902C3", "740812", "120415").unwrap();
        assert_eq!(credentials.mrz_key().as_str(), "L898902C3674081221204159");
    }

    #[test]
    fn short_document_number_is_padded() {
        let credentials = DocumentCredentials::new("D23145890", "340712", "950712").unwrap();
        assert_eq!(credentials.mrz_key().as_str(), "D23145890734071279507122");

        let short = DocumentCredentials::new("AB123", "340712", "950712").unwrap();
        assert!(short.mrz_key().starts_with("AB123<<<<"));
        assert_eq!(short.mrz_key().len(), 24);
    }

    #[test]
    fn invalid_credentials() {
        assert!(DocumentCredentials::new("", "740812", "120415").is_err());
        assert!(DocumentCredentials::new("L898902C3", "7408", "120415").is_err());
        assert!(DocumentCredentials::new("L8989-2C3", "740812", "120415").is_err());
    }

    #[test]
    fn parse_sample_td3() {
        let data = Td3Data::parse(SAMPLE).unwrap();
        assert_eq!(data.document_type.as_str(), "P");
        assert_eq!(data.issuer.as_str(), "UTO");
        assert_eq!(data.document_number.as_str(), "L898902C3");
        assert_eq!(data.nationality.as_str(), "UTO");
        assert_eq!(data.date_of_birth.as_str(), "740812");
        assert_eq!(data.sex, Sex::Female);
        assert_eq!(data.date_of_expiry.as_str(), "120415");
        assert_eq!(data.optional_data.as_str(), "ZE184226B<<<<<");
        assert_eq!(data.composite_check, 0);
        assert!(data.is_document_number_valid());
        assert!(data.is_date_of_birth_valid());
        assert!(data.is_date_of_expiry_valid());

        let (primary, secondary) = data.primary_and_secondary_identifier();
        assert_eq!(primary, "ERIKSSON");
        assert_eq!(secondary, "ANNA MARIA");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(Td3Data::parse(&SAMPLE[..87]), Err(MrzError::WrongLength { expected: 88, obtained: 87 }));
        let mut lower = SAMPLE.to_vec();
        lower[10] = b'a';
        assert_eq!(Td3Data::parse(&lower), Err(MrzError::InvalidCharacter { position: 10 }));
    }

    #[test]
    fn attribute_ranges() {
        assert_eq!(&SAMPLE[MrzAttribute::IssuingState.range()], b"UTO");
        assert_eq!(&SAMPLE[MrzAttribute::PassportNumber.range()], b"L898902C");
        assert_eq!(&SAMPLE[MrzAttribute::Gender.range()], b"F");
        assert_eq!(&SAMPLE[MrzAttribute::ExpiryDate.range()], b"120415");
        assert_eq!("date_of_birth".parse::<MrzAttribute>().unwrap(), MrzAttribute::DateOfBirth);
        assert!("birthday".parse::<MrzAttribute>().is_err());
    }
}
