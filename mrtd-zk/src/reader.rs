//! Reading the data groups and the security object of a document.


use std::fmt;

use tracing::{debug, instrument, warn};

use crate::iso7816::card::SmartCard;
use crate::iso7816::file::{read_file, ReadError, DEFAULT_CHUNK_SIZE};
use crate::lds::{Com, FileId, LdsError};
use crate::lds::dg1::Dg1;
use crate::lds::dg14::Dg14;
use crate::lds::dg2::Dg2;
use crate::lds::sod::SecurityObjectDocument;


#[derive(Debug)]
pub enum Error {
    Read { file: FileId, error: ReadError },
    Decode { file: FileId, error: LdsError },
}
impl Error {
    pub fn file(&self) -> FileId {
        match self {
            Self::Read { file, .. } => *file,
            Self::Decode { file, .. } => *file,
        }
    }
}
impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read { file, error }
                => write!(f, "failed to read {}: {}", file, error),
            Self::Decode { file, error }
                => write!(f, "failed to decode {}: {}", file, error),
        }
    }
}
impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Read { error, .. } => Some(error),
            Self::Decode { error, .. } => Some(error),
        }
    }
}


/// Everything read from the chip, decoded.
#[derive(Clone, Debug)]
pub struct DocumentData {
    pub com: Option<Com>,
    pub dg1: Dg1,
    pub dg2: Dg2,
    pub dg14: Option<Dg14>,
    pub sod: SecurityObjectDocument,
}


/// Reads the files of the eMRTD application, usually through a
/// [`ChipSession`](crate::session::ChipSession).
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DocumentReader {
    chunk_size: u8,
}
impl Default for DocumentReader {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}
impl DocumentReader {
    pub fn new(chunk_size: u8) -> Self {
        Self { chunk_size }
    }

    /// Reads the raw bytes of a file.
    pub fn read_raw<SC: SmartCard>(&self, card: &mut SC, file: FileId) -> Result<Vec<u8>, Error> {
        read_file(card, file, self.chunk_size)
            .map_err(|error| Error::Read { file, error })
    }

    /// Reads a file that the chip may lack. Only "file not found" counts as absence.
    fn read_optional<SC: SmartCard>(&self, card: &mut SC, file: FileId) -> Result<Option<Vec<u8>>, Error> {
        match read_file(card, file, self.chunk_size) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(ReadError::FileNotFound) => {
                debug!("{} is not present", file);
                Ok(None)
            },
            Err(error) => Err(Error::Read { file, error }),
        }
    }

    pub fn read_com<SC: SmartCard>(&self, card: &mut SC) -> Result<Option<Com>, Error> {
        let Some(bytes) = self.read_optional(card, FileId::Com)? else { return Ok(None) };
        match Com::parse(&bytes) {
            Ok(com) => Ok(Some(com)),
            Err(e) => {
                debug!("ignoring undecodable EF.COM: {}", e);
                Ok(None)
            },
        }
    }

    pub fn read_dg1<SC: SmartCard>(&self, card: &mut SC) -> Result<Dg1, Error> {
        let bytes = self.read_raw(card, FileId::Dg1)?;
        Dg1::parse(bytes)
            .map_err(|error| Error::Decode { file: FileId::Dg1, error })
    }

    pub fn read_dg2<SC: SmartCard>(&self, card: &mut SC) -> Result<Dg2, Error> {
        let bytes = self.read_raw(card, FileId::Dg2)?;
        Dg2::parse(bytes)
            .map_err(|error| Error::Decode { file: FileId::Dg2, error })
    }

    /// Reads DG14 if the chip has one that decodes.
    pub fn read_dg14<SC: SmartCard>(&self, card: &mut SC) -> Result<Option<Dg14>, Error> {
        let Some(bytes) = self.read_optional(card, FileId::Dg14)? else { return Ok(None) };
        match Dg14::parse(bytes) {
            Ok(dg14) => Ok(Some(dg14)),
            Err(e) => {
                warn!("ignoring undecodable DG14: {}", e);
                Ok(None)
            },
        }
    }

    pub fn read_sod<SC: SmartCard>(&self, card: &mut SC) -> Result<SecurityObjectDocument, Error> {
        let bytes = self.read_raw(card, FileId::Sod)?;
        SecurityObjectDocument::parse(bytes)
            .map_err(|error| Error::Decode { file: FileId::Sod, error })
    }

    /// Reads EF.COM, DG1, DG2 and EF.SOD.
    ///
    /// DG14 is read separately with [`read_dg14`](Self::read_dg14) since Chip Authentication needs
    /// it before the rest; pass in what it returned.
    #[instrument(skip_all)]
    pub fn read_document<SC: SmartCard>(&self, card: &mut SC, dg14: Option<Dg14>) -> Result<DocumentData, Error> {
        let com = self.read_com(card)?;
        let dg1 = self.read_dg1(card)?;
        let dg2 = self.read_dg2(card)?;
        let sod = self.read_sod(card)?;
        Ok(DocumentData { com, dg1, dg2, dg14, sod })
    }
}
