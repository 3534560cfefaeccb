//! End-to-end authoring scenarios: whole discs built from synthetic
//! MPEG streams into an in-memory sink.

mod common;

use common::*;

use vcdauthor::pbc::{EndList, PlayList};
use vcdauthor::sector::{parse_mode2_sector, SubMode, CI_MPEG2};
use vcdauthor::{CueKind, DataSource, Disc, DiscType, MemSource, Param, PbcNode, VcdError, VcdResult};

fn find_in_iso_track(sink: &MemSink, iso_size: u32, needle: &[u8]) -> bool {
    (0..iso_size).any(|lsn| {
        sink.payload(lsn)
            .windows(needle.len())
            .any(|w| w == needle)
    })
}

#[test]
fn empty_disc_fails() {
    let mut disc = Disc::new(DiscType::Vcd20);

    match disc.begin_output() {
        Err(VcdError::Config(msg)) => assert!(msg.contains("no sequences")),
        other => panic!("expected a config error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn minimal_vcd20() {
    let mut disc = Disc::new(DiscType::Vcd20);

    disc.set_param(Param::VolumeId("TESTDISC".to_string()));

    let stream = stream_of(1000, |i| mpeg1_video_packet(i as f64 * 0.5));
    disc.append_sequence(Box::new(MemSource::new(stream)), None, None)
        .unwrap();

    let total = disc.begin_output().unwrap();

    let layout = disc.layout_info().unwrap();
    let iso_size = layout.iso_size;

    assert!(iso_size >= 225);
    assert!(iso_size >= layout.highest_allocated + 1);
    assert_eq!(total, iso_size + 150 + 30 + 1000 + 45);

    let mut sink = MemSink::new();
    disc.write_image(&mut sink, None).unwrap();

    assert!(sink.finished);
    assert_eq!(sink.sectors.len() as u32, total);

    // Cue list: TrackStart@0, Pregap@iso, TrackStart@iso+150,
    // LeadOut@iso+1225
    check_cue_shape(&sink.cues, total);
    assert_eq!(sink.cues.len(), 4);
    assert_eq!(sink.cues[1].lsn, iso_size);
    assert!(sink.cues[1].kind == CueKind::PregapStart);
    assert_eq!(sink.cues[2].lsn, iso_size + 150);
    assert_eq!(sink.cues[3].lsn, iso_size + 1225);

    // PVD at LSN 16, terminator at 17
    assert_eq!(sink.payload(16)[0], 1);
    assert_eq!(&sink.payload(16)[1..6], b"CD001");
    assert_eq!(&sink.payload(16)[40..48], b"TESTDISC");
    assert_eq!(sink.payload(17)[0], 255);

    // Info files at their fixed addresses
    assert_eq!(&sink.payload(150)[0..8], b"VIDEO_CD");
    assert_eq!(&sink.payload(151)[0..8], b"ENTRYVCD");

    // The sequence appears as MPEGAV/AVSEQ01.DAT
    assert!(find_in_iso_track(&sink, iso_size, b"AVSEQ01.DAT;1"));
    assert!(find_in_iso_track(&sink, iso_size, b"MPEGAV"));

    // First payload packet: form 2, realtime video, per-track file
    // number
    let first = parse_mode2_sector(sink.sectors[(iso_size + 180) as usize].as_slice().try_into().unwrap()).unwrap();
    assert!(first.is_form2());
    assert!(first.submode.contains(SubMode::VIDEO | SubMode::REALT));
    assert_eq!(first.fnum, 1);

    // Last payload sector carries EOR|EOF
    let last = parse_mode2_sector(
        sink.sectors[(iso_size + 180 + 999) as usize]
            .as_slice()
            .try_into()
            .unwrap(),
    )
    .unwrap();
    assert!(last.submode.contains(SubMode::EOR | SubMode::EOF));

    disc.end_output();
}

#[test]
fn deterministic_output() {
    let mut disc = Disc::new(DiscType::Vcd20);

    let stream = stream_of(100, |i| mpeg1_video_packet(i as f64));
    disc.append_sequence(Box::new(MemSource::new(stream)), None, None)
        .unwrap();

    disc.begin_output().unwrap();

    let mut first = MemSink::new();
    disc.write_image(&mut first, None).unwrap();

    let mut second = MemSink::new();
    disc.write_image(&mut second, None).unwrap();

    assert!(first.sectors == second.sectors);

    disc.end_output();
}

#[test]
fn svcd_with_segment() {
    let mut disc = Disc::new(DiscType::Svcd);

    let still = stream_of(75, |_| mpeg2_video_packet(0xe1, 0.0));
    disc.append_segment(Box::new(MemSource::new(still)), "menu-still".to_string())
        .unwrap();

    let stream = stream_of(500, |i| mpeg2_video_packet(0xe0, i as f64 * 0.1));
    disc.append_sequence(Box::new(MemSource::new(stream)), None, None)
        .unwrap();

    let total = disc.begin_output().unwrap();
    let layout = disc.layout_info().unwrap();

    // Segment groups are two second aligned
    let segment_start = layout.segment_start.unwrap();
    assert_eq!(segment_start % 150, 0);
    assert!(layout.ext_file_start > segment_start);

    let mut sink = MemSink::new();
    disc.write_image(&mut sink, None).unwrap();
    assert_eq!(sink.sectors.len() as u32, total);

    let iso_size = layout.iso_size;

    // SVCD identity and directory contents
    assert_eq!(&sink.payload(150)[0..8], b"SUPERVCD");
    assert!(find_in_iso_track(&sink, iso_size, b"ITEM0001.MPG;1"));
    assert!(find_in_iso_track(&sink, iso_size, b"SCANDATA.DAT;1"));
    assert!(find_in_iso_track(&sink, iso_size, b"AVSEQ01.MPG;1"));
    assert!(find_in_iso_track(&sink, iso_size, b"TRACKS.SVD;1"));
    assert!(find_in_iso_track(&sink, iso_size, b"SEARCH.DAT;1"));

    // Stream sectors use file number 1 and coding info 0x80
    let payload_lsn = iso_size + 150 + 30;
    let parsed = parse_mode2_sector(
        sink.sectors[payload_lsn as usize].as_slice().try_into().unwrap(),
    )
    .unwrap();
    assert_eq!(parsed.fnum, 1);
    assert_eq!(parsed.coding_info, CI_MPEG2);

    // Segment sectors too
    let seg = parse_mode2_sector(
        sink.sectors[segment_start as usize].as_slice().try_into().unwrap(),
    )
    .unwrap();
    assert_eq!(seg.fnum, 1);
    assert!(seg.submode.contains(SubMode::VIDEO));

    // Last sector of the segment unit closes the item
    let seg_end = parse_mode2_sector(
        sink.sectors[(segment_start + 149) as usize]
            .as_slice()
            .try_into()
            .unwrap(),
    )
    .unwrap();
    assert!(seg_end.submode.contains(SubMode::EOR | SubMode::EOF));

    disc.end_output();
}

#[test]
fn pbc_cycles_legal_dangling_refs_fail() {
    let stream = || {
        Box::new(MemSource::new(stream_of(80, |i| {
            mpeg1_video_packet(i as f64)
        })))
    };

    // Two play lists pointing at each other compile fine
    let mut disc = Disc::new(DiscType::Vcd20);
    disc.append_sequence(stream(), Some("track-1".to_string()), None)
        .unwrap();

    disc.add_pbc_node(PbcNode::PlayList(PlayList {
        id: "a".to_string(),
        next: Some("b".to_string()),
        items: vec!["track-1".to_string()],
        ..Default::default()
    }))
    .unwrap();
    disc.add_pbc_node(PbcNode::PlayList(PlayList {
        id: "b".to_string(),
        next: Some("a".to_string()),
        items: vec!["track-1".to_string()],
        ..Default::default()
    }))
    .unwrap();

    let total = disc.begin_output().unwrap();

    let mut sink = MemSink::new();
    disc.write_image(&mut sink, None).unwrap();
    assert_eq!(sink.sectors.len() as u32, total);

    // LOT.VCD lives at its fixed address with lid 1 at offset 0
    assert_eq!(&sink.payload(152)[0..4], &[0x00, 0x00, 0x00, 0x00]);
    // PSD starts with a play list descriptor
    assert_eq!(sink.payload(184)[0], 0x10);

    assert!(find_in_iso_track(&sink, disc.layout_info().unwrap().iso_size, b"LOT.VCD;1"));
    assert!(find_in_iso_track(&sink, disc.layout_info().unwrap().iso_size, b"PSD_X.VCD;1"));

    disc.end_output();

    // An end list referencing an unknown id fails at begin_output
    let mut disc = Disc::new(DiscType::Vcd20);
    disc.append_sequence(stream(), None, None).unwrap();

    disc.add_pbc_node(PbcNode::EndList(EndList {
        id: "end".to_string(),
        next_disc: 2,
        play_item: Some("no-such-id".to_string()),
    }))
    .unwrap();

    match disc.begin_output() {
        Err(VcdError::UnknownId(id)) => assert_eq!(id, "no-such-id"),
        other => panic!("expected unknown id, got {:?}", other.map(|_| ())),
    }
}

/// A source pretending to hold `packets` zero packets without
/// materializing them
struct SyntheticZeroSource {
    packets: u32,
}

impl DataSource for SyntheticZeroSource {
    fn stat(&mut self) -> VcdResult<u64> {
        Ok(self.packets as u64 * 2324)
    }

    fn seek(&mut self, _offset: u64) -> VcdResult<()> {
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> VcdResult<usize> {
        buf.fill(0);
        Ok(buf.len())
    }

    fn close(&mut self) {}
}

#[test]
fn oversize_disc_fails() {
    let mut disc = Disc::new(DiscType::Vcd20);

    disc.append_sequence(Box::new(SyntheticZeroSource { packets: 340_000 }), None, None)
        .unwrap();

    match disc.begin_output() {
        Err(VcdError::Layout(msg)) => assert!(msg.contains("74 minute")),
        other => panic!("expected a layout error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn pause_points_set_trigger_bit() {
    let mut disc = Disc::new(DiscType::Vcd20);

    // Packets at 0.0, 1.0, ... 9.0 seconds
    let stream = stream_of(10, |i| mpeg1_video_packet(i as f64));
    disc.append_sequence(Box::new(MemSource::new(stream)), None, None)
        .unwrap();

    disc.add_sequence_pause(0, 4.5, None).unwrap();

    disc.begin_output().unwrap();
    let iso_size = disc.layout_info().unwrap().iso_size;

    let mut sink = MemSink::new();
    disc.write_image(&mut sink, None).unwrap();

    let data_start = iso_size + 150 + 30;

    for packet in 0..10u32 {
        let parsed = parse_mode2_sector(
            sink.sectors[(data_start + packet) as usize]
                .as_slice()
                .try_into()
                .unwrap(),
        )
        .unwrap();

        // The first packet at or past 4.5 seconds is packet 5
        assert_eq!(
            parsed.submode.contains(SubMode::TRIG),
            packet == 5,
            "trigger bit wrong on packet {}",
            packet
        );
    }

    disc.end_output();
}

#[test]
fn progress_callback_aborts() {
    let mut disc = Disc::new(DiscType::Vcd20);

    let stream = stream_of(100, |i| mpeg1_video_packet(i as f64));
    disc.append_sequence(Box::new(MemSource::new(stream)), None, None)
        .unwrap();

    disc.begin_output().unwrap();

    let mut calls = 0;
    let mut cb = |_p: &vcdauthor::Progress| {
        calls += 1;
        calls > 3
    };

    let mut sink = MemSink::new();

    match disc.write_image(&mut sink, Some(&mut cb)) {
        Err(VcdError::Aborted) => (),
        other => panic!("expected an abort, got {:?}", other.map(|_| ())),
    }

    // The abort happened mid-image
    let total = disc.layout_info().unwrap().total_sectors;
    assert!((sink.sectors.len() as u32) < total);

    disc.end_output();
}

#[test]
fn custom_files_and_dirs() {
    let mut disc = Disc::new(DiscType::Vcd20);

    let stream = stream_of(80, |i| mpeg1_video_packet(i as f64));
    disc.append_sequence(Box::new(MemSource::new(stream)), None, None)
        .unwrap();

    disc.add_dir("DATA").unwrap();
    disc.add_file(
        "DATA/README.TXT",
        Box::new(MemSource::new(b"hello from the readme".to_vec())),
        false,
    )
    .unwrap();

    let total = disc.begin_output().unwrap();
    let layout = disc.layout_info().unwrap();

    let mut sink = MemSink::new();
    disc.write_image(&mut sink, None).unwrap();
    assert_eq!(sink.sectors.len() as u32, total);

    assert!(find_in_iso_track(&sink, layout.iso_size, b"README.TXT;1"));

    // The file contents are in the custom file area, closed by EOF
    let file_lsn = layout.custom_file_start;
    assert!(sink.payload(file_lsn).starts_with(b"hello from the readme"));

    let parsed = parse_mode2_sector(
        sink.sectors[file_lsn as usize].as_slice().try_into().unwrap(),
    )
    .unwrap();
    assert!(parsed.submode.contains(SubMode::DATA | SubMode::EOF));
    assert!(!parsed.is_form2());

    disc.end_output();
}
