// Calibration (PRODINFO) header parsing
//
// Only two fields are inspected: the magic at offset 0, which tells a
// decrypted image from an encrypted or damaged one, and the product model
// code used to pick the boot-material flavour.

use crate::{CalibrationOrigin, RecoveryError, RecoveryResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

pub const CALIBRATION_MAGIC: [u8; 4] = *b"CAL0";

/// Byte offset of the little-endian product model field
pub const PRODUCT_MODEL_OFFSET: u64 = 0x3740;

/// Console hardware revision derived from the product model code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareRevision {
    /// Original launch unit (code 1)
    Erista,
    /// Mariko refresh (code 3)
    MarikoV2,
    /// Switch Lite (code 4)
    Lite,
    /// OLED model (code 6)
    Oled,
    /// Any other code; assumed to be a Mariko-family unit
    UnknownMariko,
}

/// Revision family; selects the generator's mutually exclusive flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RevisionFamily {
    Erista,
    Mariko,
}

impl HardwareRevision {
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => HardwareRevision::Erista,
            3 => HardwareRevision::MarikoV2,
            4 => HardwareRevision::Lite,
            6 => HardwareRevision::Oled,
            _ => HardwareRevision::UnknownMariko,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HardwareRevision::Erista => "Erista",
            HardwareRevision::MarikoV2 => "V2",
            HardwareRevision::Lite => "Lite",
            HardwareRevision::Oled => "OLED",
            HardwareRevision::UnknownMariko => "Unknown Mariko",
        }
    }

    pub fn family(&self) -> RevisionFamily {
        match self {
            HardwareRevision::Erista => RevisionFamily::Erista,
            _ => RevisionFamily::Mariko,
        }
    }
}

impl fmt::Display for HardwareRevision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

impl RevisionFamily {
    pub fn generator_flag(&self) -> &'static str {
        match self {
            RevisionFamily::Erista => "--no-autorcm",
            RevisionFamily::Mariko => "--mariko",
        }
    }
}

/// The parsed, immutable header of a calibration image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationHeader {
    pub magic: [u8; 4],
    pub revision_code: u32,
    pub revision: HardwareRevision,
}

pub struct CalibrationReader;

impl CalibrationReader {
    /// Read and validate the header of the calibration file at `path`
    pub fn read_header(path: &Path, origin: CalibrationOrigin) -> RecoveryResult<CalibrationHeader> {
        let mut file = File::open(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                RecoveryError::InvalidCalibrationMagic { origin }
            } else {
                RecoveryError::Io(e)
            }
        })?;

        let header = Self::read_from(&mut file, origin)?;
        tracing::info!(
            path = %path.display(),
            %origin,
            code = header.revision_code,
            model = %header.revision,
            "Detected console model from PRODINFO"
        );
        Ok(header)
    }

    /// Parse a header from any seekable reader
    pub fn read_from<R: Read + Seek>(
        reader: &mut R,
        origin: CalibrationOrigin,
    ) -> RecoveryResult<CalibrationHeader> {
        let mut magic = [0u8; 4];
        reader.seek(SeekFrom::Start(0))?;
        match reader.read_exact(&mut magic) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                return Err(RecoveryError::InvalidCalibrationMagic { origin })
            }
            Err(e) => return Err(e.into()),
        }

        if magic != CALIBRATION_MAGIC {
            return Err(RecoveryError::InvalidCalibrationMagic { origin });
        }

        let mut field = [0u8; 4];
        reader.seek(SeekFrom::Start(PRODUCT_MODEL_OFFSET))?;
        match reader.read_exact(&mut field) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                let len = reader.seek(SeekFrom::End(0))?;
                return Err(RecoveryError::CalibrationTruncated { origin, len });
            }
            Err(e) => return Err(e.into()),
        }

        let revision_code = u32::from_le_bytes(field);
        Ok(CalibrationHeader {
            magic,
            revision_code,
            revision: HardwareRevision::from_code(revision_code),
        })
    }
}
