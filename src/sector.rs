//! CD-ROM XA Mode 2 sector formatter.
//!
//! Every sector of the generated image is a raw 2352 byte sector:
//! 12 byte sync pattern, 4 byte header (BCD MSF address + mode), 8 byte
//! XA subheader (duplicated 4 byte quadruplet), user data and the error
//! detection code. Form 1 sectors carry 2048 bytes of user data
//! followed by the EDC and 276 bytes of error correction; form 2
//! sectors carry 2324 bytes of user data and a trailing EDC.
//!
//! The formatter leaves the ECC bytes of form 1 sectors zeroed: the
//! sink (or the burning program) is expected to regenerate them if the
//! target medium requires it.

use arrayref::array_ref;
use bitflags::bitflags;

use crate::edc;
use crate::msf::Msf;
use crate::{VcdError, VcdResult};

/// Size of a Mode 2 Form 1 payload in bytes
pub const M2F1_SIZE: usize = 2048;
/// Size of a Mode 2 Form 2 payload in bytes
pub const M2F2_SIZE: usize = 2324;
/// Size of a "headerless" Mode 2 sector (subheader + payload + EDC)
pub const M2RAW_SIZE: usize = 2336;
/// Size of a raw sector
pub const SECTOR_SIZE: usize = 2352;

/// CD-ROM sync pattern found at the start of every data sector
pub const SYNC_PATTERN: [u8; 12] = [
    0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00,
];

bitflags! {
    /// The Submode byte of a Mode 2 XA subheader
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubMode: u8 {
        /// End Of Record
        const EOR = 0x01;
        /// The sector carries video data
        const VIDEO = 0x02;
        /// The sector carries audio data
        const AUDIO = 0x04;
        /// The sector carries plain data
        const DATA = 0x08;
        /// Trigger: fires an application event (pause points)
        const TRIG = 0x10;
        /// Form 2 sector (2324 byte payload)
        const FORM2 = 0x20;
        /// Real-time sector: must be streamed without retries
        const REALT = 0x40;
        /// End Of File
        const EOF = 0x80;
    }
}

/// Coding information byte for VCD video sectors
pub const CI_VIDEO: u8 = 0x0f;
/// Coding information byte for VCD still picture sectors
pub const CI_STILL: u8 = 0x1f;
/// Coding information byte for VCD audio sectors
pub const CI_AUDIO: u8 = 0x7f;
/// Coding information byte used by SVCD for all audio/video sectors
pub const CI_MPEG2: u8 = 0x80;

/// Fill in the sync pattern and the 4 byte header for `lsn`. Panics if
/// `lsn` is not addressable (past MSF 99:59:74).
fn put_sync_header(sector: &mut [u8; SECTOR_SIZE], lsn: u32) {
    sector[0..12].copy_from_slice(&SYNC_PATTERN);

    let msf = Msf::from_lsn(lsn).expect("sector address out of range");

    sector[12..15].copy_from_slice(&msf.pack());
    sector[15] = 2;
}

/// Format a Mode 2 sector around `payload`.
///
/// The sector form is taken from `sm`: without [`SubMode::FORM2`] the
/// payload must be 2048 bytes and the ECC area is left zeroed, with it
/// the payload must be 2324 bytes. The subheader quadruplet
/// `(fnum, cnum, sm, ci)` is duplicated per the XA specification and
/// the EDC is computed over subheader and payload.
pub fn encode_mode2_sector(
    payload: &[u8],
    lsn: u32,
    fnum: u8,
    cnum: u8,
    sm: SubMode,
    ci: u8,
) -> [u8; SECTOR_SIZE] {
    let form2 = sm.contains(SubMode::FORM2);

    let expected = if form2 { M2F2_SIZE } else { M2F1_SIZE };
    assert_eq!(payload.len(), expected, "payload size vs submode form");

    let mut sector = [0u8; SECTOR_SIZE];

    put_sync_header(&mut sector, lsn);

    let subheader = [fnum, cnum, sm.bits(), ci];
    sector[16..20].copy_from_slice(&subheader);
    sector[20..24].copy_from_slice(&subheader);

    sector[24..24 + payload.len()].copy_from_slice(payload);

    if form2 {
        let crc = edc::compute(&sector[16..2348]);
        sector[2348..2352].copy_from_slice(&crc.to_le_bytes());
    } else {
        let crc = edc::compute(&sector[16..2072]);
        sector[2072..2076].copy_from_slice(&crc.to_le_bytes());
        // ECC bytes 2076..2352 stay zero
    }

    sector
}

/// Format a sector from a "headerless" 2336 byte Mode 2 sector that
/// already carries its own subheader, payload and EDC. Used for
/// user-supplied raw files.
pub fn encode_mode2_raw_sector(raw: &[u8; M2RAW_SIZE], lsn: u32) -> [u8; SECTOR_SIZE] {
    let mut sector = [0u8; SECTOR_SIZE];

    put_sync_header(&mut sector, lsn);
    sector[16..16 + M2RAW_SIZE].copy_from_slice(raw);

    sector
}

/// Decoded view of a raw Mode 2 sector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSector {
    /// Logical sector number recovered from the header MSF
    pub lsn: u32,
    /// File number from the subheader
    pub fnum: u8,
    /// Channel number from the subheader
    pub cnum: u8,
    /// Submode byte
    pub submode: SubMode,
    /// Coding information byte
    pub coding_info: u8,
}

impl ParsedSector {
    /// Returns true if this is a form 2 sector
    pub fn is_form2(&self) -> bool {
        self.submode.contains(SubMode::FORM2)
    }
}

/// Parse and validate a raw Mode 2 sector: checks the sync pattern, the
/// header mode and BCD address, the duplicated subheader and the EDC.
pub fn parse_mode2_sector(sector: &[u8; SECTOR_SIZE]) -> VcdResult<ParsedSector> {
    if sector[0..12] != SYNC_PATTERN {
        return Err(VcdError::BadSyncPattern);
    }

    if sector[15] != 2 {
        return Err(VcdError::BadFormat);
    }

    let msf = Msf::from_bcd(sector[12], sector[13], sector[14]).ok_or(VcdError::BadBcd)?;

    let lba = msf.sector_index();
    if lba < crate::msf::PREGAP_SECTORS {
        return Err(VcdError::BadFormat);
    }
    let lsn = lba - crate::msf::PREGAP_SECTORS;

    if array_ref![sector, 16, 4] != array_ref![sector, 20, 4] {
        return Err(VcdError::BadFormat);
    }

    let submode = SubMode::from_bits_retain(sector[18]);

    let parsed = ParsedSector {
        lsn,
        fnum: sector[16],
        cnum: sector[17],
        submode,
        coding_info: sector[19],
    };

    let (span, stored) = if parsed.is_form2() {
        (&sector[16..2348], *array_ref![sector, 2348, 4])
    } else {
        (&sector[16..2072], *array_ref![sector, 2072, 4])
    };

    // A zero stored EDC on form 2 sectors means "unprotected" per the
    // Green Book recommendation, accept it as-is
    let stored = u32::from_le_bytes(stored);

    if stored != 0 && edc::compute(span) != stored {
        return Err(VcdError::BadFormat);
    }

    Ok(parsed)
}
