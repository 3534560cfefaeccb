//! Shared helpers for the end-to-end tests: an in-memory sink that
//! checks the write ordering contract and builders for synthetic MPEG
//! program streams.

use vcdauthor::sector::SECTOR_SIZE;
use vcdauthor::{CueEntry, CueKind, ImageSink, VcdResult};

/// Collects the whole image in memory, asserting the sink contract:
/// one cue sheet, then strictly consecutive LSNs.
pub struct MemSink {
    pub cues: Vec<CueEntry>,
    pub sectors: Vec<Vec<u8>>,
    pub finished: bool,
}

impl MemSink {
    pub fn new() -> MemSink {
        MemSink {
            cues: Vec::new(),
            sectors: Vec::new(),
            finished: false,
        }
    }

    pub fn payload(&self, lsn: u32) -> &[u8] {
        &self.sectors[lsn as usize][24..]
    }
}

impl ImageSink for MemSink {
    fn set_cuesheet(&mut self, cues: &[CueEntry]) -> VcdResult<()> {
        assert!(self.cues.is_empty(), "cue sheet set twice");
        assert!(self.sectors.is_empty(), "cue sheet set after first write");

        self.cues = cues.to_vec();

        Ok(())
    }

    fn write_sector(&mut self, buf: &[u8; SECTOR_SIZE], lsn: u32) -> VcdResult<()> {
        assert!(!self.cues.is_empty(), "write before cue sheet");
        assert_eq!(
            lsn as usize,
            self.sectors.len(),
            "sectors must arrive consecutively"
        );

        self.sectors.push(buf.to_vec());

        Ok(())
    }

    fn finish(&mut self) -> VcdResult<()> {
        self.finished = true;

        Ok(())
    }
}

/// Check that the cue kinds follow `TrackStart (PregapStart
/// TrackStart)* LeadOut` with ascending in-range LSNs
pub fn check_cue_shape(cues: &[CueEntry], total: u32) {
    assert!(cues.len() >= 2);

    assert!(cues[0].kind == CueKind::TrackStart && cues[0].lsn == 0);
    assert!(cues[cues.len() - 1].kind == CueKind::LeadOut);

    let mut last = 0;
    for cue in cues {
        assert!(cue.lsn >= last, "cue LSNs must not decrease");
        assert!(cue.lsn <= total);
        last = cue.lsn;
    }

    let middle = &cues[1..cues.len() - 1];
    for pair in middle.chunks(2) {
        assert!(pair[0].kind == CueKind::PregapStart);
        assert!(pair[1].kind == CueKind::TrackStart);
    }
}

fn put_pts(p: &mut [u8], prefix: u8, pts_secs: f64) {
    let ts = (pts_secs * 90000.0) as u64;

    p[0] = prefix | (((ts >> 30) as u8 & 0x7) << 1);
    p[1] = (ts >> 22) as u8;
    p[2] = 0x01 | (((ts >> 15) as u8 & 0x7f) << 1);
    p[3] = (ts >> 7) as u8;
    p[4] = 0x01 | (((ts & 0x7f) as u8) << 1);
}

fn put_sequence_header(p: &mut [u8], hsize: u16, vsize: u16, rate_code: u8) {
    p[0..4].copy_from_slice(&[0, 0, 1, 0xb3]);
    p[4] = (hsize >> 4) as u8;
    p[5] = (((hsize & 0xf) as u8) << 4) | ((vsize >> 8) as u8);
    p[6] = (vsize & 0xff) as u8;
    p[7] = 0x10 | rate_code;
}

fn put_iframe(p: &mut [u8]) {
    p[0..4].copy_from_slice(&[0, 0, 1, 0x00]);
    p[4] = 0x00;
    p[5] = 0x08; // picture_coding_type 1 (intra)
}

/// One MPEG-1 video packet: pack header, a video PES with PTS, a
/// 352x240/30fps sequence header and an intra picture
pub fn mpeg1_video_packet(pts_secs: f64) -> Vec<u8> {
    let mut p = vec![0u8; 2324];

    p[0..4].copy_from_slice(&[0, 0, 1, 0xba]);
    p[4] = 0x21;

    p[12..16].copy_from_slice(&[0, 0, 1, 0xe0]);
    let len = 2324 - 18;
    p[16] = (len >> 8) as u8;
    p[17] = (len & 0xff) as u8;

    put_pts(&mut p[18..23], 0x21, pts_secs);
    put_sequence_header(&mut p[23..31], 352, 240, 5);
    put_iframe(&mut p[31..37]);

    p
}

/// One MPEG-2 video packet on stream `stream_id`: 480x480/30fps
/// (NTSC-S) with an intra picture
pub fn mpeg2_video_packet(stream_id: u8, pts_secs: f64) -> Vec<u8> {
    let mut p = vec![0u8; 2324];

    p[0..4].copy_from_slice(&[0, 0, 1, 0xba]);
    p[4] = 0x44;
    // p[13] low bits: no stuffing

    p[14..18].copy_from_slice(&[0, 0, 1, stream_id]);
    let len = 2324 - 20;
    p[18] = (len >> 8) as u8;
    p[19] = (len & 0xff) as u8;

    // MPEG-2 PES header: marker, PTS flag, 5 header bytes
    p[20] = 0x80;
    p[21] = 0x80;
    p[22] = 5;
    put_pts(&mut p[23..28], 0x21, pts_secs);

    put_sequence_header(&mut p[28..36], 480, 480, 5);
    put_iframe(&mut p[36..42]);

    p
}

/// Concatenate `n` packets produced by `f`
pub fn stream_of<F: Fn(u32) -> Vec<u8>>(n: u32, f: F) -> Vec<u8> {
    let mut out = Vec::with_capacity(n as usize * 2324);

    for i in 0..n {
        out.extend_from_slice(&f(i));
    }

    out
}
