//! DG2: the encoded face, stored as ISO/IEC 19794-5 facial records.


use tracing::debug;

use crate::lds::{outer_element, FileId, LdsError};


const TAG_BIOMETRIC_GROUP: u32 = 0x7F61;
const TAG_BIOMETRIC_TEMPLATE: u32 = 0x7F60;
const TAG_BIOMETRIC_DATA: u32 = 0x5F2E;
const TAG_BIOMETRIC_DATA_ENCIPHERED: u32 = 0x7F2E;

const GENERAL_HEADER_LEN: usize = 14;
const FACIAL_RECORD_HEADER_LEN: usize = 20;
const FEATURE_POINT_LEN: usize = 8;
const IMAGE_INFO_LEN: usize = 12;


#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ImageFormat {
    Jpeg,
    Jpeg2000,
    Other(u8),
}
impl ImageFormat {
    fn from_data_type(data_type: u8) -> Self {
        match data_type {
            0x00 => Self::Jpeg,
            0x01 => Self::Jpeg2000,
            other => Self::Other(other),
        }
    }

    pub fn mime_type(&self) -> Option<&'static str> {
        match self {
            Self::Jpeg => Some("image/jpeg"),
            Self::Jpeg2000 => Some("image/jp2"),
            Self::Other(_) => None,
        }
    }
}


/// One face image with the metadata of its facial record.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FaceImage {
    pub face_image_type: u8,
    pub format: ImageFormat,
    pub width: u16,
    pub height: u16,
    pub image_data: Vec<u8>,
}


#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Dg2 {
    raw: Vec<u8>,
    faces: Vec<FaceImage>,
}
impl Dg2 {
    pub fn parse(raw: Vec<u8>) -> Result<Self, LdsError> {
        let element = outer_element(FileId::Dg2, &raw)?;
        let group = element.find_child(TAG_BIOMETRIC_GROUP)?
            .ok_or(LdsError::FacialRecord { reason: "no biometric information group template" })?;

        let mut faces = Vec::new();
        for template in group.children()? {
            if template.tag != TAG_BIOMETRIC_TEMPLATE {
                continue;
            }
            let children = template.children()?;
            let Some(data) = children.iter().find(|c| c.tag == TAG_BIOMETRIC_DATA || c.tag == TAG_BIOMETRIC_DATA_ENCIPHERED) else {
                continue;
            };
            if data.tag == TAG_BIOMETRIC_DATA_ENCIPHERED {
                debug!("skipping enciphered biometric data");
                continue;
            }
            faces.extend(parse_facial_records(data.content)?);
        }

        if faces.is_empty() {
            return Err(LdsError::FacialRecord { reason: "no face image" });
        }
        Ok(Self { raw, faces })
    }

    /// The complete encoded file, as hashed into the SOD.
    pub fn raw(&self) -> &[u8] { &self.raw }

    pub fn faces(&self) -> &[FaceImage] { &self.faces }

    /// The first face image. Every decoded DG2 has at least one.
    pub fn face(&self) -> &FaceImage { &self.faces[0] }
}


fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
}


/// Decodes the facial records following an ISO/IEC 19794-5 general header.
fn parse_facial_records(record: &[u8]) -> Result<Vec<FaceImage>, LdsError> {
    if record.len() < GENERAL_HEADER_LEN {
        return Err(LdsError::FacialRecord { reason: "general header truncated" });
    }
    if &record[0..4] != b"FAC\0" {
        return Err(LdsError::FacialRecord { reason: "format identifier is not FAC" });
    }
    let face_count = be_u16(record, 12);

    let mut faces = Vec::with_capacity(usize::from(face_count));
    let mut rest = &record[GENERAL_HEADER_LEN..];
    for _ in 0..face_count {
        if rest.len() < FACIAL_RECORD_HEADER_LEN + IMAGE_INFO_LEN {
            return Err(LdsError::FacialRecord { reason: "facial record truncated" });
        }
        let record_len = usize::try_from(be_u32(rest, 0))
            .map_err(|_| LdsError::FacialRecord { reason: "facial record too long" })?;
        let feature_points = usize::from(be_u16(rest, 4));
        let info_offset = FACIAL_RECORD_HEADER_LEN + feature_points * FEATURE_POINT_LEN;
        let image_offset = info_offset + IMAGE_INFO_LEN;
        if record_len < image_offset || record_len > rest.len() {
            return Err(LdsError::FacialRecord { reason: "facial record length out of range" });
        }

        let info = &rest[info_offset..image_offset];
        faces.push(FaceImage {
            face_image_type: info[0],
            format: ImageFormat::from_data_type(info[1]),
            width: be_u16(info, 2),
            height: be_u16(info, 4),
            image_data: rest[image_offset..record_len].to_vec(),
        });
        rest = &rest[record_len..];
    }
    Ok(faces)
}
