pub(crate) mod kdbx3;
pub(crate) mod kdbx4;

use std::io::Write;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::{DatabaseIntegrityError, Warning, Warnings};

pub(crate) const KDBX_IDENTIFIER: [u8; 4] = [0x03, 0xd9, 0xa2, 0x9a];

/// Signature of the KeePass 1 (KDB) format, which this library does not read
pub const KEEPASS_1_ID: u32 = 0xb54bfb65;
/// Signature of the KeePass 2 pre-release format, read with KDBX3 semantics
pub const KEEPASS_2_PRERELEASE_ID: u32 = 0xb54bfb66;
/// Signature of the released KeePass 2 formats
pub const KEEPASS_LATEST_ID: u32 = 0xb54bfb67;

pub const KDBX3_MAJOR_VERSION: u16 = 3;
pub const KDBX4_MAJOR_VERSION: u16 = 4;

pub const KDBX3_CURRENT_MINOR_VERSION: u16 = 1;
pub const KDBX4_CURRENT_MINOR_VERSION: u16 = 0;

/// Supported KDBX database versions with their associated minor version.
///
/// The derived ordering makes "minimum file version" comparisons direct:
/// any `KDB3(_)` sorts below any `KDB4(_)`, and minor versions sort within
/// the major.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DatabaseVersion {
    KDB3(u16),
    KDB4(u16),
}

impl DatabaseVersion {
    pub(crate) fn parse(
        data: &[u8],
        warnings: &mut Warnings,
    ) -> Result<DatabaseVersion, DatabaseIntegrityError> {
        if data.len() < DatabaseVersion::get_version_header_size() {
            return Err(DatabaseIntegrityError::InvalidKdbxIdentifier);
        }

        if data[0..4] != KDBX_IDENTIFIER {
            return Err(DatabaseIntegrityError::InvalidKdbxIdentifier);
        }

        let version = LittleEndian::read_u32(&data[4..8]);
        let file_minor_version = LittleEndian::read_u16(&data[8..10]);
        let file_major_version = LittleEndian::read_u16(&data[10..12]);

        let response = match version {
            KEEPASS_2_PRERELEASE_ID => {
                warnings.push(Warning::Kdbx2MappedToKdbx3);
                DatabaseVersion::KDB3(file_minor_version)
            }
            KEEPASS_LATEST_ID if file_major_version == KDBX3_MAJOR_VERSION => {
                DatabaseVersion::KDB3(file_minor_version)
            }
            KEEPASS_LATEST_ID if file_major_version == KDBX4_MAJOR_VERSION => {
                DatabaseVersion::KDB4(file_minor_version)
            }
            _ => {
                return Err(DatabaseIntegrityError::InvalidKdbxVersion {
                    version,
                    file_major_version: u32::from(file_major_version),
                    file_minor_version: u32::from(file_minor_version),
                })
            }
        };

        Ok(response)
    }

    pub(crate) fn dump(&self, writer: &mut dyn Write) -> Result<(), std::io::Error> {
        writer.write_all(&KDBX_IDENTIFIER)?;
        writer.write_u32::<LittleEndian>(KEEPASS_LATEST_ID)?;

        match self {
            DatabaseVersion::KDB3(minor_version) => {
                writer.write_u16::<LittleEndian>(*minor_version)?;
                writer.write_u16::<LittleEndian>(KDBX3_MAJOR_VERSION)?;
            }
            DatabaseVersion::KDB4(minor_version) => {
                writer.write_u16::<LittleEndian>(*minor_version)?;
                writer.write_u16::<LittleEndian>(KDBX4_MAJOR_VERSION)?;
            }
        }

        Ok(())
    }

    pub(crate) fn get_version_header_size() -> usize {
        12
    }

    pub fn major(&self) -> u16 {
        match self {
            DatabaseVersion::KDB3(_) => KDBX3_MAJOR_VERSION,
            DatabaseVersion::KDB4(_) => KDBX4_MAJOR_VERSION,
        }
    }

    pub fn minor(&self) -> u16 {
        match self {
            DatabaseVersion::KDB3(minor) => *minor,
            DatabaseVersion::KDB4(minor) => *minor,
        }
    }
}

impl std::fmt::Display for DatabaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KDBX{}.{}", self.major(), self.minor())
    }
}
