//! DG1: the machine-readable zone.


use crate::lds::{outer_element, FileId, LdsError};
use crate::mrz::{Td3Data, TD3_LENGTH};


/// Tag of the MRZ data element within DG1.
const TAG_MRZ: u32 = 0x5F1F;


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dg1 {
    raw: Vec<u8>,
    mrz: Vec<u8>,
    td3: Option<Td3Data>,
}
impl Dg1 {
    /// Decodes DG1. The MRZ is parsed as TD3 if it has the length of one; other form factors are
    /// kept as raw characters only.
    pub fn parse(raw: Vec<u8>) -> Result<Self, LdsError> {
        let element = outer_element(FileId::Dg1, &raw)?;
        let mrz = element.child(0)?.expect_tag(TAG_MRZ)?.content.to_vec();
        let td3 = if mrz.len() == TD3_LENGTH {
            Some(Td3Data::parse(&mrz)?)
        } else {
            None
        };
        Ok(Self { raw, mrz, td3 })
    }

    /// The complete encoded file, as hashed into the SOD.
    pub fn raw(&self) -> &[u8] { &self.raw }

    /// The MRZ characters without line breaks.
    pub fn mrz(&self) -> &[u8] { &self.mrz }

    pub fn td3(&self) -> Option<&Td3Data> { self.td3.as_ref() }
}
