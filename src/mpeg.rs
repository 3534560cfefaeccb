//! MPEG program stream scanner.
//!
//! The engine never decodes video: it only needs to classify each
//! 2324 byte packet (one packet per CD sector), extract the stream
//! geometry from the first sequence header and locate the access
//! points (APS) where a player may start scanning. Packets are the
//! unit of everything downstream: subheader flags, entry points and
//! the SEARCH/SCANDATA tables are all derived from the scan result.
//!
//! Scanning is pure and restartable: `packet_flags` is a function of
//! the packet bytes alone and `read_packet` never caches positions
//! across calls, so an aborted pass can simply be rerun.

use crate::msf::Msf;
use crate::sector::M2F2_SIZE;
use crate::source::DataSource;
use crate::{VcdError, VcdResult};

/// MPEG stream version
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum MpegVersion {
    /// ISO 11172 (MPEG-1)
    Mpeg1,
    /// ISO 13818 (MPEG-2)
    Mpeg2,
}

/// Known video norms, derived from the stream geometry
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Norm {
    /// 352x288 at 25fps
    Pal,
    /// 352x240 at 30fps
    Ntsc,
    /// 352x240 at 24fps
    Film,
    /// 480x576 at 25fps (SVCD)
    PalS,
    /// 480x480 at 30fps (SVCD)
    NtscS,
    /// Anything else
    Other,
}

impl Norm {
    /// Derive the norm from the sequence header geometry
    pub fn from_geometry(hsize: u16, vsize: u16, frame_rate: f64) -> Norm {
        let ntsc_rate = (29.0..31.0).contains(&frame_rate);
        let film_rate = (23.0..25.0).contains(&frame_rate);
        let pal_rate = frame_rate == 25.0;

        match (hsize, vsize) {
            (352, 288) if pal_rate => Norm::Pal,
            (352, 240) if ntsc_rate => Norm::Ntsc,
            (352, 240) if film_rate => Norm::Film,
            (480, 576) if pal_rate => Norm::PalS,
            (480, 480) if ntsc_rate => Norm::NtscS,
            _ => Norm::Other,
        }
    }
}

impl std::fmt::Display for Norm {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Norm::Pal => "PAL (352x288/25fps)",
            Norm::Ntsc => "NTSC (352x240/30fps)",
            Norm::Film => "FILM (352x240/24fps)",
            Norm::PalS => "PAL S (480x576/25fps)",
            Norm::NtscS => "NTSC S (480x480/30fps)",
            Norm::Other => "UNKNOWN",
        };

        fmt.write_str(s)
    }
}

/// Audio stream layout of a program stream
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum AudioLayout {
    /// No audio at all
    NoAudio,
    /// One audio stream
    Single,
    /// Two independent audio streams
    Dual,
    /// Multichannel audio
    MultiChannel,
}

/// Classification of a single 2324 byte packet
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum PacketKind {
    /// Carries video PES data
    Video,
    /// Carries audio PES data
    Audio,
    /// Carries OGT (overlay graphics) data
    Ogt,
    /// Parses fine but carries no payload (padding, system headers)
    Empty,
    /// Entirely zero-filled
    Zero,
    /// Does not parse as an MPEG pack
    Invalid,
}

/// Per-packet scan result
#[derive(Clone, Copy, Debug)]
pub struct PacketFlags {
    /// What the packet carries
    pub kind: PacketKind,
    /// Presentation timestamp of the first PES in the packet, seconds
    pub pts: Option<f64>,
    /// Motion video stream (0xe0) present
    pub video_e0: bool,
    /// High resolution still stream (0xe1) present
    pub video_e1: bool,
    /// Low resolution still stream (0xe2) present
    pub video_e2: bool,
    /// A sequence end code terminates the video payload
    pub seq_end: bool,
    /// First audio stream (0xc0) present
    pub audio_c0: bool,
    /// Second audio stream (0xc1) present
    pub audio_c1: bool,
    /// Third audio stream (0xc2) present
    pub audio_c2: bool,
    /// An intra coded picture starts in this packet
    pub has_iframe: bool,
    /// The intra coded picture starts in the packet's first video PES
    pub iframe_at_pack_start: bool,
}

impl Default for PacketFlags {
    fn default() -> PacketFlags {
        PacketFlags {
            kind: PacketKind::Empty,
            pts: None,
            video_e0: false,
            video_e1: false,
            video_e2: false,
            seq_end: false,
            audio_c0: false,
            audio_c1: false,
            audio_c2: false,
            has_iframe: false,
            iframe_at_pack_start: false,
        }
    }
}

/// An access point: a packet at which a player may begin playback
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApsPoint {
    /// Packet index within the stream
    pub packet: u32,
    /// Presentation timestamp in seconds
    pub pts: f64,
}

/// Aggregate scan result for a whole stream
#[derive(Clone, Debug)]
pub struct MpegInfo {
    /// MPEG version of the pack headers
    pub version: MpegVersion,
    /// Detected norm
    pub norm: Norm,
    /// Horizontal size in pixels
    pub hsize: u16,
    /// Vertical size in pixels
    pub vsize: u16,
    /// Frame rate
    pub frame_rate: f64,
    /// Audio stream layout
    pub audio: AudioLayout,
    /// Total number of 2324 byte packets
    pub packets: u32,
    /// Playing time in seconds, from the first and last timestamps
    pub playtime: f64,
    /// Access points usable for entries and scan tables
    pub aps: Vec<ApsPoint>,
    /// Stream contains high resolution still pictures
    pub still_e1: bool,
    /// Stream contains low resolution still pictures
    pub still_e2: bool,
}

impl MpegInfo {
    /// Returns true if the stream contains motion video
    pub fn has_motion_video(&self) -> bool {
        !self.still_e1 && !self.still_e2 && self.hsize != 0
    }

    /// Access point with the largest `pts <= time`, falling back to
    /// the first one
    pub fn aps_at(&self, time: f64) -> Option<&ApsPoint> {
        self.aps
            .iter()
            .rev()
            .find(|a| a.pts <= time)
            .or_else(|| self.aps.first())
    }
}

const PACK_START: [u8; 4] = [0x00, 0x00, 0x01, 0xba];

const SID_PROGRAM_END: u8 = 0xb9;
const SID_SYSTEM_HEADER: u8 = 0xbb;
const SID_PRIVATE_1: u8 = 0xbd;
const SID_PADDING: u8 = 0xbe;
const SID_PRIVATE_2: u8 = 0xbf;

/// Sequence header geometry
#[derive(Clone, Copy, Debug)]
struct SequenceHeader {
    hsize: u16,
    vsize: u16,
    frame_rate: f64,
}

const FRAME_RATES: [f64; 9] = [
    0.0, 23.976, 24.0, 25.0, 29.97, 30.0, 50.0, 59.94, 60.0,
];

fn parse_sequence_header(data: &[u8]) -> Option<SequenceHeader> {
    if data.len() < 4 {
        return None;
    }

    let hsize = ((data[0] as u16) << 4) | (data[1] as u16 >> 4);
    let vsize = (((data[1] as u16) & 0xf) << 8) | data[2] as u16;
    let rate_code = (data[3] & 0xf) as usize;

    if rate_code == 0 || rate_code >= FRAME_RATES.len() {
        return None;
    }

    Some(SequenceHeader {
        hsize,
        vsize,
        frame_rate: FRAME_RATES[rate_code],
    })
}

/// Decode a 33 bit PES timestamp into seconds
fn parse_timestamp(b: &[u8]) -> Option<f64> {
    if b.len() < 5 {
        return None;
    }

    let ts = (((b[0] as u64) >> 1) & 0x7) << 30
        | (b[1] as u64) << 22
        | (((b[2] as u64) >> 1) & 0x7f) << 15
        | (b[3] as u64) << 7
        | (b[4] as u64) >> 1;

    Some(ts as f64 / 90000.0)
}

/// Extract the PTS from a PES packet body (everything after the 16 bit
/// length field) for either MPEG version
fn parse_pes_pts(body: &[u8], version: MpegVersion) -> Option<f64> {
    match version {
        MpegVersion::Mpeg2 => {
            if body.len() < 3 {
                return None;
            }

            // '10' marker, then flags and header length
            if body[0] & 0xc0 != 0x80 {
                return None;
            }

            if body[1] & 0x80 == 0 {
                // No PTS
                return None;
            }

            parse_timestamp(&body[3..])
        }
        MpegVersion::Mpeg1 => {
            let mut i = 0;

            // Stuffing bytes
            while i < body.len() && body[i] == 0xff {
                i += 1;
            }

            // Optional STD buffer size
            if i + 1 < body.len() && body[i] & 0xc0 == 0x40 {
                i += 2;
            }

            if i >= body.len() {
                return None;
            }

            match body[i] & 0xf0 {
                0x20 | 0x30 => parse_timestamp(&body[i..]),
                _ => None,
            }
        }
    }
}

/// Scan a video PES payload for picture and sequence codes
fn scan_video_payload(data: &[u8], flags: &mut PacketFlags, first_video_pes: bool) -> Option<SequenceHeader> {
    let mut seq = None;
    let mut i = 0;

    while i + 3 < data.len() {
        if data[i] != 0 || data[i + 1] != 0 || data[i + 2] != 1 {
            i += 1;
            continue;
        }

        match data[i + 3] {
            // sequence_header_code
            0xb3 => {
                if seq.is_none() {
                    seq = parse_sequence_header(&data[i + 4..]);
                }
            }
            // sequence_end_code
            0xb7 => {
                flags.seq_end = true;
            }
            // picture_start_code
            0x00 => {
                if i + 5 < data.len() {
                    let coding_type = (data[i + 5] >> 3) & 0x7;

                    if coding_type == 1 {
                        flags.has_iframe = true;

                        if first_video_pes {
                            flags.iframe_at_pack_start = true;
                        }
                    }
                }
            }
            _ => (),
        }

        i += 4;
    }

    seq
}

/// Classify one 2324 byte packet. This is a pure function of the
/// packet contents; the optional sequence header geometry of the first
/// video PES is returned alongside the flags.
pub fn packet_flags(packet: &[u8; M2F2_SIZE]) -> (PacketFlags, Option<(MpegVersion, u16, u16, f64)>) {
    let mut flags = PacketFlags::default();

    if packet.iter().all(|&b| b == 0) {
        flags.kind = PacketKind::Zero;
        return (flags, None);
    }

    if packet[0..4] != PACK_START {
        flags.kind = PacketKind::Invalid;
        return (flags, None);
    }

    // Pack header length depends on the MPEG version
    let (version, mut pos) = if packet[4] & 0xc0 == 0x40 {
        // MPEG-2: 14 bytes plus stuffing
        (MpegVersion::Mpeg2, 14 + (packet[13] & 0x7) as usize)
    } else if packet[4] & 0xf0 == 0x20 {
        // MPEG-1: fixed 12 bytes
        (MpegVersion::Mpeg1, 12)
    } else {
        flags.kind = PacketKind::Invalid;
        return (flags, None);
    };

    let mut geometry = None;
    let mut first_video_pes = true;

    while pos + 6 <= M2F2_SIZE {
        if packet[pos] != 0 || packet[pos + 1] != 0 || packet[pos + 2] != 1 {
            break;
        }

        let sid = packet[pos + 3];

        if sid == SID_PROGRAM_END {
            break;
        }

        let len = ((packet[pos + 4] as usize) << 8) | packet[pos + 5] as usize;
        let body_start = pos + 6;
        let body_end = (body_start + len).min(M2F2_SIZE);
        let body = &packet[body_start..body_end];

        match sid {
            SID_SYSTEM_HEADER | SID_PADDING | SID_PRIVATE_2 => (),
            SID_PRIVATE_1 => {
                flags.kind = pick_kind(flags.kind, PacketKind::Ogt);
            }
            0xe0..=0xef => {
                match sid & 0xf {
                    0 => flags.video_e0 = true,
                    1 => flags.video_e1 = true,
                    2 => flags.video_e2 = true,
                    _ => (),
                }

                if flags.pts.is_none() {
                    flags.pts = parse_pes_pts(body, version);
                }

                if let Some(seq) = scan_video_payload(body, &mut flags, first_video_pes) {
                    if geometry.is_none() {
                        geometry = Some((version, seq.hsize, seq.vsize, seq.frame_rate));
                    }
                }

                first_video_pes = false;
                flags.kind = pick_kind(flags.kind, PacketKind::Video);
            }
            0xc0..=0xdf => {
                match sid - 0xc0 {
                    0 => flags.audio_c0 = true,
                    1 => flags.audio_c1 = true,
                    2 => flags.audio_c2 = true,
                    _ => (),
                }

                if flags.pts.is_none() {
                    flags.pts = parse_pes_pts(body, version);
                }

                flags.kind = pick_kind(flags.kind, PacketKind::Audio);
            }
            _ => (),
        }

        pos = body_end;
    }

    (flags, geometry)
}

/// Kind precedence: video over audio over OGT over empty
fn pick_kind(current: PacketKind, new: PacketKind) -> PacketKind {
    let rank = |k: PacketKind| match k {
        PacketKind::Video => 3,
        PacketKind::Audio => 2,
        PacketKind::Ogt => 1,
        _ => 0,
    };

    if rank(new) > rank(current) {
        new
    } else {
        current
    }
}

/// Read packet `index` of `src` into `buf`, zero padding a short tail
/// read. The source is positioned absolutely on every call so the read
/// sequence is idempotent.
pub fn read_packet(
    src: &mut dyn DataSource,
    index: u32,
    buf: &mut [u8; M2F2_SIZE],
) -> VcdResult<()> {
    buf.fill(0);

    src.seek(index as u64 * M2F2_SIZE as u64)?;
    src.read(buf)?;

    Ok(())
}

/// Scan an entire stream.
///
/// When `relaxed_aps` is false an access point requires the intra
/// frame to start in the packet's first video PES (an I-frame boundary
/// that also begins a new pack); with `relaxed_aps` any packet holding
/// an I-frame with a timestamp qualifies. The source is closed once
/// drained.
pub fn scan(src: &mut dyn DataSource, relaxed_aps: bool) -> VcdResult<MpegInfo> {
    let size = src.stat()?;
    let packets = (size / M2F2_SIZE as u64) as u32;

    let mut info = MpegInfo {
        version: MpegVersion::Mpeg1,
        norm: Norm::Other,
        hsize: 0,
        vsize: 0,
        frame_rate: 0.0,
        audio: AudioLayout::NoAudio,
        packets,
        playtime: 0.0,
        aps: Vec::new(),
        still_e1: false,
        still_e2: false,
    };

    let mut got_geometry = false;
    let mut first_pts = None;
    let mut last_pts: Option<f64> = None;
    let mut audio_streams = [false; 3];

    let mut buf = [0u8; M2F2_SIZE];

    for n in 0..packets {
        read_packet(src, n, &mut buf)?;

        let (flags, geometry) = packet_flags(&buf);

        if flags.kind == PacketKind::Invalid {
            src.close();
            return Err(VcdError::InvalidMpegPacket(n));
        }

        if let (false, Some((version, h, v, rate))) = (got_geometry, geometry) {
            info.version = version;
            info.hsize = h;
            info.vsize = v;
            info.frame_rate = rate;
            info.norm = Norm::from_geometry(h, v, rate);
            got_geometry = true;
        }

        if let Some(pts) = flags.pts {
            if first_pts.is_none() {
                first_pts = Some(pts);
            }
            if last_pts.map_or(true, |l| pts > l) {
                last_pts = Some(pts);
            }
        }

        info.still_e1 |= flags.video_e1;
        info.still_e2 |= flags.video_e2;

        audio_streams[0] |= flags.audio_c0;
        audio_streams[1] |= flags.audio_c1;
        audio_streams[2] |= flags.audio_c2;

        let aps_ok = if relaxed_aps {
            flags.has_iframe
        } else {
            flags.iframe_at_pack_start
        };

        if aps_ok {
            if let Some(pts) = flags.pts {
                info.aps.push(ApsPoint { packet: n, pts });
            }
        }
    }

    src.close();

    info.audio = match audio_streams {
        [false, false, false] => AudioLayout::NoAudio,
        [_, false, false] => AudioLayout::Single,
        [_, _, false] => AudioLayout::Dual,
        _ => AudioLayout::MultiChannel,
    };

    if let (Some(begin), Some(end)) = (first_pts, last_pts) {
        if end > begin {
            info.playtime = (end - begin + 0.5).floor();
        }
    }

    Ok(info)
}

/// Scan information user data carried by SVCD streams: start code
/// `00 00 01 b2`, tag 0x10, length 14, then the previous and next
/// access point addresses as 3 byte BCD MSF plus 6 reserved bytes.
const SCAN_UDATA_TAG: u8 = 0x10;
const SCAN_UDATA_LEN: u8 = 14;

/// Patch every scan information block of `packet` with the disc
/// addresses of the surrounding access points. `None` writes the
/// 0xff "not available" filler.
pub fn patch_scan_offsets(packet: &mut [u8; M2F2_SIZE], prev: Option<Msf>, next: Option<Msf>) {
    let prev = prev.map(|m| m.pack()).unwrap_or([0xff; 3]);
    let next = next.map(|m| m.pack()).unwrap_or([0xff; 3]);

    let mut i = 0;

    while i + 6 + 6 <= M2F2_SIZE {
        let block = packet[i] == 0
            && packet[i + 1] == 0
            && packet[i + 2] == 1
            && packet[i + 3] == 0xb2
            && packet[i + 4] == SCAN_UDATA_TAG
            && packet[i + 5] == SCAN_UDATA_LEN;

        if block {
            packet[i + 6..i + 9].copy_from_slice(&prev);
            packet[i + 9..i + 12].copy_from_slice(&next);
            i += 6 + SCAN_UDATA_LEN as usize;
        } else {
            i += 1;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::MemSource;

    /// Build a minimal MPEG-1 video packet: pack header, one video PES
    /// with PTS, sequence header and an I-frame picture
    fn video_packet(pts_secs: f64) -> Vec<u8> {
        let mut p = vec![0u8; M2F2_SIZE];

        // Pack start, MPEG-1 marker
        p[0..4].copy_from_slice(&[0, 0, 1, 0xba]);
        p[4] = 0x21;

        // Video PES
        p[12..16].copy_from_slice(&[0, 0, 1, 0xe0]);
        let len = 2324 - 18;
        p[16] = (len >> 8) as u8;
        p[17] = (len & 0xff) as u8;

        // MPEG-1 PES header: PTS only
        let ts = (pts_secs * 90000.0) as u64;
        p[18] = 0x21 | (((ts >> 30) as u8 & 0x7) << 1);
        p[19] = (ts >> 22) as u8;
        p[20] = 0x01 | (((ts >> 15) as u8 & 0x7f) << 1);
        p[21] = (ts >> 7) as u8;
        p[22] = 0x01 | (((ts & 0x7f) as u8) << 1);

        // Sequence header: 352x240, 30fps (code 5)
        p[23..27].copy_from_slice(&[0, 0, 1, 0xb3]);
        p[27] = 0x16; // 352 >> 4
        p[28] = 0x00 | 0x00; // (352 & 0xf) << 4 | 240 >> 8
        p[29] = 0xf0; // 240 & 0xff
        p[30] = 0x15; // aspect 1, rate code 5

        // Picture start code, coding type I
        p[31..35].copy_from_slice(&[0, 0, 1, 0x00]);
        p[35] = 0x00;
        p[36] = 0x08; // temporal ref + coding type 1

        p
    }

    fn audio_packet(stream: u8) -> Vec<u8> {
        let mut p = vec![0u8; M2F2_SIZE];

        p[0..4].copy_from_slice(&[0, 0, 1, 0xba]);
        p[4] = 0x21;

        p[12..16].copy_from_slice(&[0, 0, 1, 0xc0 + stream]);
        p[16] = 0x00;
        p[17] = 0x20;
        p[18] = 0x0f; // no PTS marker

        p
    }

    #[test]
    fn classify_video() {
        let p = video_packet(1.0);
        let mut buf = [0u8; M2F2_SIZE];
        buf.copy_from_slice(&p);

        let (flags, geometry) = packet_flags(&buf);

        assert!(flags.kind == PacketKind::Video);
        assert!(flags.video_e0);
        assert!(flags.has_iframe);
        assert!(flags.iframe_at_pack_start);

        let (version, h, v, rate) = geometry.unwrap();
        assert!(version == MpegVersion::Mpeg1);
        assert!(h == 352);
        assert!(v == 240);
        assert!(rate == 30.0);

        let pts = flags.pts.unwrap();
        assert!((pts - 1.0).abs() < 0.001);
    }

    #[test]
    fn classify_zero_and_invalid() {
        let zero = [0u8; M2F2_SIZE];
        assert!(packet_flags(&zero).0.kind == PacketKind::Zero);

        let mut garbage = [0u8; M2F2_SIZE];
        garbage[0] = 0x47;
        assert!(packet_flags(&garbage).0.kind == PacketKind::Invalid);
    }

    #[test]
    fn scan_finds_geometry_and_aps() {
        let mut stream = Vec::new();

        for i in 0..10 {
            stream.extend_from_slice(&video_packet(i as f64));
        }
        stream.extend_from_slice(&audio_packet(0));

        let mut src = MemSource::new(stream);
        let info = scan(&mut src, false).unwrap();

        assert!(info.packets == 11);
        assert!(info.norm == Norm::Ntsc);
        assert!(info.audio == AudioLayout::Single);
        assert!(info.aps.len() == 10);
        // 0..9 seconds of timestamps round to 9 seconds of playtime
        assert!(info.playtime == 9.0);

        assert!(info.aps_at(4.2).unwrap().packet == 4);
        assert!(info.aps_at(-1.0).unwrap().packet == 0);
    }

    #[test]
    fn invalid_packet_fails_scan() {
        let mut stream = video_packet(0.0);
        stream.extend_from_slice(&[0x47; M2F2_SIZE]);

        let mut src = MemSource::new(stream);

        match scan(&mut src, false) {
            Err(VcdError::InvalidMpegPacket(1)) => (),
            other => panic!("unexpected scan result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn scan_offset_patching() {
        let mut p = [0u8; M2F2_SIZE];

        p[100..106].copy_from_slice(&[0, 0, 1, 0xb2, SCAN_UDATA_TAG, SCAN_UDATA_LEN]);
        p[106..112].fill(0xee);

        let prev = Msf::from_lsn(300).unwrap();
        let next = Msf::from_lsn(450).unwrap();

        patch_scan_offsets(&mut p, Some(prev), Some(next));

        assert!(p[106..109] == prev.pack());
        assert!(p[109..112] == next.pack());

        patch_scan_offsets(&mut p, None, None);
        assert!(p[106..112] == [0xff; 6]);
    }
}
