//! VCD/SVCD information file writers.
//!
//! Each writer fills a pre-allocated sector buffer with one of the
//! structures a player reads before touching any MPEG data: INFO
//! (album/volume identity and PBC parameters), ENTRIES (track entry
//! points), TRACKS.SVD (per-track content table), SEARCH.DAT (time to
//! access-point mapping) and SCANDATA.DAT (dense scan offsets). All of
//! them are pure functions of the disc object's post-layout state.

use byteorder::{BigEndian, ByteOrder};

use crate::bcd::Bcd;
use crate::mpeg::{AudioLayout, Norm};
use crate::msf::Msf;
use crate::DiscType;

/// Maximum number of records in ENTRIES
pub const MAX_ENTRIES: usize = 500;
/// Maximum number of segment content slots in INFO
pub const MAX_SEGMENTS: usize = 1980;

fn put_str_pad(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());

    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..].fill(b' ');
}

fn system_id(disc_type: DiscType) -> &'static [u8; 8] {
    match disc_type {
        DiscType::Vcd11 | DiscType::Vcd20 => b"VIDEO_CD",
        DiscType::Svcd => b"SUPERVCD",
    }
}

fn version_tag(disc_type: DiscType) -> (u8, u8) {
    match disc_type {
        DiscType::Vcd11 => (0x01, 0x01),
        DiscType::Vcd20 => (0x02, 0x00),
        DiscType::Svcd => (0x01, 0x00),
    }
}

/// Per-segment content description for the INFO item table
#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentContent {
    /// Audio layout of the segment
    pub audio: u8,
    /// Video/still content code
    pub video: u8,
    /// This segment continues in the following one
    pub continuation: bool,
}

/// Everything the INFO writer needs from the disc
pub struct InfoParams<'a> {
    /// Disc flavour
    pub disc_type: DiscType,
    /// Album identification, up to 16 characters
    pub album_id: &'a str,
    /// Number of volumes in the set
    pub volume_count: u16,
    /// Number of this volume
    pub volume_number: u16,
    /// Parental restriction class, 0..3
    pub restriction: u8,
    /// Start playback of the next volume at list id 2
    pub use_lid2: bool,
    /// Start playback of the next volume at sequence 2
    pub use_sequence2: bool,
    /// The extended PSD/LOT pair is present in EXT/
    pub extended_pbc: bool,
    /// SVCD streams carry patched scan offsets
    pub update_scan_offsets: bool,
    /// Byte size of the base PSD (0 without PBC)
    pub psd_size: u32,
    /// LSN of the first segment item, if any
    pub first_segment_lsn: Option<u32>,
    /// Highest list id in the PSD
    pub max_lid: u16,
    /// One flag per sequence: stream is PAL
    pub pal_tracks: &'a [bool],
    /// One content slot per 150 sector segment unit
    pub segments: &'a [SegmentContent],
}

/// Fill the INFO.VCD / INFO.SVD sector
pub fn set_info(buf: &mut [u8], params: &InfoParams) {
    assert!(params.segments.len() <= MAX_SEGMENTS);

    buf[0..8].copy_from_slice(system_id(params.disc_type));

    let (version, tag) = version_tag(params.disc_type);
    buf[8] = version;
    buf[9] = tag;

    put_str_pad(&mut buf[10..26], params.album_id);
    BigEndian::write_u16(&mut buf[26..28], params.volume_count);
    BigEndian::write_u16(&mut buf[28..30], params.volume_number);

    for (n, &pal) in params.pal_tracks.iter().enumerate().take(98) {
        if pal {
            buf[30 + n / 8] |= 1 << (n % 8);
        }
    }

    let mut flags = (params.restriction & 0x3) << 1;
    if params.update_scan_offsets && params.disc_type.is_svcd() {
        flags |= 1 << 3;
    }
    if params.use_lid2 {
        flags |= 1 << 5;
    }
    if params.use_sequence2 {
        flags |= 1 << 6;
    }
    if params.extended_pbc {
        flags |= 1 << 7;
    }
    buf[43] = flags;

    BigEndian::write_u32(&mut buf[44..48], params.psd_size);

    let first_segment = params
        .first_segment_lsn
        .and_then(Msf::from_lsn)
        .unwrap_or_else(Msf::zero);
    buf[48..51].copy_from_slice(&first_segment.pack());

    buf[51] = 8; // offset multiplier

    BigEndian::write_u16(&mut buf[52..54], params.max_lid);
    BigEndian::write_u16(&mut buf[54..56], params.segments.len() as u16);

    for (n, segment) in params.segments.iter().enumerate() {
        let mut b = (segment.video & 0x7) | (segment.audio & 0x3) << 3;
        if segment.continuation {
            b |= 1 << 5;
        }
        buf[56 + n] = b;
    }
}

/// One ENTRIES record: a track number and the disc address where
/// playback may start
#[derive(Clone, Copy, Debug)]
pub struct EntryRecord {
    /// Track carrying the entry
    pub track: Bcd,
    /// Absolute disc address of the entry sector
    pub address: Msf,
}

/// Fill the ENTRIES.VCD / ENTRIES.SVD sector. `legacy_svd_id` selects
/// the pre-1.0 "ENTRYSVD" signature some players want.
pub fn set_entries(buf: &mut [u8], disc_type: DiscType, legacy_svd_id: bool, entries: &[EntryRecord]) {
    assert!(entries.len() <= MAX_ENTRIES);

    if disc_type.is_svcd() && legacy_svd_id {
        buf[0..8].copy_from_slice(b"ENTRYSVD");
    } else {
        buf[0..8].copy_from_slice(b"ENTRYVCD");
    }

    let (version, tag) = version_tag(disc_type);
    buf[8] = version;
    buf[9] = tag;

    BigEndian::write_u16(&mut buf[10..12], entries.len() as u16);

    for (n, entry) in entries.iter().enumerate() {
        let ofs = 12 + n * 4;

        buf[ofs] = entry.track.bcd();
        buf[ofs + 1..ofs + 4].copy_from_slice(&entry.address.pack());
    }
}

/// Per-track record of TRACKS.SVD
#[derive(Clone, Copy, Debug)]
pub struct TrackSvdEntry {
    /// Playing time of the track
    pub playtime: Msf,
    /// Audio stream layout
    pub audio: AudioLayout,
    /// Video norm
    pub norm: Norm,
}

/// Fill the TRACKS.SVD sector (SVCD only)
pub fn set_tracks_svd(buf: &mut [u8], tracks: &[TrackSvdEntry]) {
    buf[0..8].copy_from_slice(b"TRACKSVD");
    buf[8] = 0x01;
    // byte 9 reserved
    buf[10] = tracks.len() as u8;

    for (n, track) in tracks.iter().enumerate() {
        let ofs = 11 + n * 4;

        buf[ofs..ofs + 3].copy_from_slice(&track.playtime.pack());

        let audio = match track.audio {
            AudioLayout::NoAudio => 0,
            AudioLayout::Single => 1,
            AudioLayout::Dual => 2,
            AudioLayout::MultiChannel => 3,
        };

        let video = match track.norm {
            Norm::Ntsc | Norm::NtscS | Norm::Film => 1,
            Norm::Pal | Norm::PalS => 2,
            Norm::Other => 0,
        };

        buf[ofs + 3] = audio | video << 2;
    }
}

const SEARCH_HEADER: usize = 13;
const SCANDATA_HEADER: usize = 12;

/// Byte size of a SEARCH.DAT table over `points` scan points
pub fn search_dat_size(points: usize) -> u32 {
    (SEARCH_HEADER + points * 3) as u32
}

/// Fill SEARCH.DAT: one scan point per half second of playing time,
/// each holding the disc address of the closest access point
pub fn set_search_dat(buf: &mut [u8], points: &[Msf]) {
    buf[0..8].copy_from_slice(b"SEARCHSV");
    buf[8] = 0x01;
    // byte 9 reserved
    BigEndian::write_u16(&mut buf[10..12], points.len() as u16);
    buf[12] = 1; // time interval in half second units

    for (n, point) in points.iter().enumerate() {
        let ofs = SEARCH_HEADER + n * 3;
        buf[ofs..ofs + 3].copy_from_slice(&point.pack());
    }
}

/// Byte size of a SCANDATA.DAT table over `points` scan points
pub fn scandata_dat_size(points: usize) -> u32 {
    (SCANDATA_HEADER + points * 3) as u32
}

/// Fill SCANDATA.DAT: the dense per-frame scan offset table of SVCDs
pub fn set_scandata_dat(buf: &mut [u8], points: &[Msf]) {
    buf[0..8].copy_from_slice(b"SCAN_VCD");
    buf[8] = 0x02;
    // byte 9 reserved
    BigEndian::write_u16(&mut buf[10..12], points.len() as u16);

    for (n, point) in points.iter().enumerate() {
        let ofs = SCANDATA_HEADER + n * 3;
        buf[ofs..ofs + 3].copy_from_slice(&point.pack());
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sector::M2F1_SIZE;

    #[test]
    fn info_vcd20() {
        let mut buf = vec![0u8; M2F1_SIZE];

        let params = InfoParams {
            disc_type: DiscType::Vcd20,
            album_id: "MYALBUM",
            volume_count: 2,
            volume_number: 1,
            restriction: 3,
            use_lid2: true,
            use_sequence2: false,
            extended_pbc: true,
            update_scan_offsets: false,
            psd_size: 88,
            first_segment_lsn: Some(300),
            max_lid: 4,
            pal_tracks: &[true, false, true],
            segments: &[SegmentContent {
                audio: 1,
                video: 3,
                continuation: false,
            }],
        };

        set_info(&mut buf, &params);

        assert!(&buf[0..8] == b"VIDEO_CD");
        assert!(buf[8] == 0x02 && buf[9] == 0x00);
        assert!(&buf[10..17] == b"MYALBUM");
        assert!(buf[17] == b' ');
        assert!(BigEndian::read_u16(&buf[26..28]) == 2);
        assert!(BigEndian::read_u16(&buf[28..30]) == 1);

        // PAL flags: tracks 0 and 2
        assert!(buf[30] == 0b0000_0101);

        // restriction 3 -> bits 1-2, lid2 -> bit 5, pbc_x -> bit 7
        assert!(buf[43] == (3 << 1) | (1 << 5) | (1 << 7));

        assert!(BigEndian::read_u32(&buf[44..48]) == 88);

        // Segment start LSN 300 is MSF 00:06:00
        assert!(buf[48..51] == [0x00, 0x06, 0x00]);
        assert!(buf[51] == 8);
        assert!(BigEndian::read_u16(&buf[52..54]) == 4);
        assert!(BigEndian::read_u16(&buf[54..56]) == 1);
        assert!(buf[56] == 3 | (1 << 3));
    }

    #[test]
    fn entries_records() {
        let mut buf = vec![0u8; M2F1_SIZE];

        let entries = [
            EntryRecord {
                track: Bcd::from_binary(2).unwrap(),
                address: Msf::from_lsn(375).unwrap(),
            },
            EntryRecord {
                track: Bcd::from_binary(10).unwrap(),
                address: Msf::from_lsn(7500).unwrap(),
            },
        ];

        set_entries(&mut buf, DiscType::Vcd20, false, &entries);

        assert!(&buf[0..8] == b"ENTRYVCD");
        assert!(BigEndian::read_u16(&buf[10..12]) == 2);

        // LSN 375 -> MSF 00:07:00
        assert!(buf[12] == 0x02);
        assert!(buf[13..16] == [0x00, 0x07, 0x00]);
        assert!(buf[16] == 0x10);

        let mut svd = vec![0u8; M2F1_SIZE];
        set_entries(&mut svd, DiscType::Svcd, true, &entries);
        assert!(&svd[0..8] == b"ENTRYSVD");
    }

    #[test]
    fn tracks_svd_records() {
        let mut buf = vec![0u8; M2F1_SIZE];

        let tracks = [TrackSvdEntry {
            playtime: Msf::from_sector_index(30 * 75).unwrap(),
            audio: AudioLayout::Dual,
            norm: Norm::PalS,
        }];

        set_tracks_svd(&mut buf, &tracks);

        assert!(&buf[0..8] == b"TRACKSVD");
        assert!(buf[10] == 1);
        assert!(buf[11..14] == [0x00, 0x30, 0x00]);
        assert!(buf[14] == 2 | (2 << 2));
    }

    #[test]
    fn scan_tables() {
        let points = [
            Msf::from_lsn(375).unwrap(),
            Msf::from_lsn(450).unwrap(),
        ];

        assert!(search_dat_size(2) == 13 + 6);

        let mut buf = vec![0u8; M2F1_SIZE];
        set_search_dat(&mut buf, &points);

        assert!(&buf[0..8] == b"SEARCHSV");
        assert!(BigEndian::read_u16(&buf[10..12]) == 2);
        assert!(buf[12] == 1);
        assert!(buf[13..16] == [0x00, 0x07, 0x00]);

        let mut sbuf = vec![0u8; M2F1_SIZE];
        set_scandata_dat(&mut sbuf, &points);
        assert!(&sbuf[0..8] == b"SCAN_VCD");
        assert!(sbuf[12..15] == [0x00, 0x07, 0x00]);
    }
}
