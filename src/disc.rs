//! The disc object: parameter surface, layout planner and image
//! writer.
//!
//! A [`Disc`] accumulates everything the user wants on the disc, then
//! runs a three step output cycle:
//!
//! 1. `begin_output` freezes the object and lays out the ISO track:
//!    every LSN is assigned to exactly one role (ISO9660 metadata,
//!    info files, playback control, segment stills, custom files,
//!    padding) through the sector allocator.
//! 2. `write_image` streams the whole image, LSN 0 upward, through an
//!    [`ImageSink`], emitting the cue sheet first.
//! 3. `end_output` releases the layout state.
//!
//! MPEG sequence tracks live outside the ISO track and are not
//! allocated through the bitmap: they follow it sequentially, each
//! with its pregap and data gaps, addressed by `relative_start_extent`
//! offsets that only get an absolute meaning once the ISO size is
//! frozen.

use std::collections::BTreeMap;

use log::{debug, warn};

use crate::info::{self, EntryRecord, InfoParams, SegmentContent, TrackSvdEntry};
use crate::iso9660::{self, IsoDirectory};
use crate::mpeg::{self, AudioLayout, MpegInfo, MpegVersion, Norm, PacketKind};
use crate::msf::Msf;
use crate::pbc::{CompiledPbc, PbcCompiler, PbcNode, LOT_VCD_SIZE};
use crate::salloc::SectorAllocator;
use crate::sector::{
    self, SubMode, CI_AUDIO, CI_MPEG2, CI_STILL, CI_VIDEO, M2F1_SIZE, M2F2_SIZE, M2RAW_SIZE,
    SECTOR_SIZE,
};
use crate::sink::{CueEntry, CueKind, ImageSink};
use crate::source::DataSource;
use crate::{Bcd, DiscType, VcdError, VcdResult};

/// Hard floor for the ISO track size
const MIN_ISO_SIZE: u32 = 75;
/// The first three seconds of the ISO track are kept blank-reserved
const BLANK_AREA_SECTORS: u32 = 225;
/// A 74 minute disc, the largest image we will lay out
const MAX_IMAGE_SECTORS: u32 = 74 * 60 * 75;

/// Fixed info file addresses
const INFO_SECTOR: u32 = 150;
const ENTRIES_SECTOR: u32 = 151;
const LOT_SECTOR: u32 = 152;
const PSD_SECTOR: u32 = LOT_SECTOR + LOT_VCD_SIZE;

/// Segment groups are aligned to two second boundaries
const SEGMENT_ALIGN: u32 = 150;
/// Packets per segment unit
const SEGMENT_UNIT_PACKETS: u32 = 150;

const MAX_SEQUENCES: usize = 99;
const MAX_ENTRIES_PER_SEQUENCE: usize = 98;

/// Play item number bases
const PIN_SEQUENCE_BASE: u16 = 2;
const PIN_ENTRY_BASE: u16 = 100;
const PIN_SEGMENT_BASE: u16 = 1000;

/// User-settable disc parameters. Out of range values are clamped to
/// their stated interval with a warning.
#[derive(Clone, Debug)]
pub enum Param {
    /// ISO volume label, up to 32 characters
    VolumeId(String),
    /// ISO application identifier, up to 128 characters
    ApplicationId(String),
    /// VCD album identification, up to 16 characters
    AlbumId(String),
    /// Number of discs in the set, 1..65535
    VolumeCount(u32),
    /// Index of this disc in the set, 0..65534
    VolumeNumber(u32),
    /// Parental restriction class, 0..3
    Restriction(u32),
    /// Loosen the access point scan criterion
    RelaxedAps(bool),
    /// Auto-advance to list id 2 when changing volumes
    NextVolumeLid2(bool),
    /// Auto-advance to sequence 2 when changing volumes
    NextVolumeSeq2(bool),
    /// SVCD compatibility: place streams in MPEGAV/ (non-compliant)
    SvcdVcd3MpegAv(bool),
    /// SVCD compatibility: legacy ENTRYSVD signature
    SvcdVcd3EntrySvd(bool),
    /// Patch the scan information offsets inside SVCD streams
    UpdateScanOffsets(bool),
}

/// Progress report handed to the `write_image` callback
#[derive(Clone, Copy, Debug)]
pub struct Progress {
    /// Sectors written so far
    pub sectors_written: u32,
    /// Total sectors of the image
    pub total_sectors: u32,
    /// Track currently being written (1 is the ISO track)
    pub in_track: u32,
    /// Total number of tracks
    pub total_tracks: u32,
}

/// Facts about a frozen layout, available between `begin_output` and
/// `end_output`
#[derive(Clone, Copy, Debug)]
pub struct LayoutInfo {
    /// Size of the ISO track in sectors
    pub iso_size: u32,
    /// LSN of the first segment unit, if any segments exist
    pub segment_start: Option<u32>,
    /// First sector of the EXT area files
    pub ext_file_start: u32,
    /// First sector of the custom files
    pub custom_file_start: u32,
    /// Highest sector the allocator handed out
    pub highest_allocated: u32,
    /// Total image size in sectors
    pub total_sectors: u32,
}

/// A time point within a sequence, optionally addressable by id
struct TimedPoint {
    time: f64,
    id: Option<String>,
}

/// One full motion MPEG track
struct SequenceItem {
    source: Box<dyn DataSource>,
    id: Option<String>,
    default_entry_id: Option<String>,
    info: MpegInfo,
    /// Entry points, sorted by time
    entries: Vec<TimedPoint>,
    /// Pause points, sorted by time
    pauses: Vec<TimedPoint>,
    /// Start of the track relative to the ISO track end
    relative_start_extent: u32,
}

impl SequenceItem {
    fn track_sectors(&self, disc_type: DiscType) -> u32 {
        disc_type.pre_track_gap()
            + disc_type.pre_data_gap()
            + self.info.packets
            + disc_type.post_data_gap()
    }
}

/// One still picture segment group
struct SegmentItem {
    source: Box<dyn DataSource>,
    id: String,
    info: MpegInfo,
    /// Number of 150 sector units the group occupies
    segment_count: u32,
    start_extent: u32,
}

/// User supplied data file
struct CustomFile {
    source: Box<dyn DataSource>,
    iso_path: String,
    raw: bool,
    size: u32,
    sectors: u32,
    start_extent: u32,
}

/// A staged header area: a pre-allocated LSN range with its in-memory
/// contents and the submode end flags of its last sector
struct DictEntry {
    key: &'static str,
    sector: u32,
    length: u32,
    buf: Vec<u8>,
    end_flags: SubMode,
}

struct Dict {
    entries: Vec<DictEntry>,
}

impl Dict {
    fn new() -> Dict {
        Dict {
            entries: Vec::new(),
        }
    }

    /// Reserve `[sector, sector + length)` and stage a zeroed buffer
    /// for it. Double reservations of fixed addresses are layout bugs,
    /// not user errors.
    fn insert(
        &mut self,
        allocator: &mut SectorAllocator,
        key: &'static str,
        sector: u32,
        length: u32,
        end_flags: SubMode,
    ) {
        assert!(length > 0);
        assert!(
            allocator.reserve_at(sector, length).is_some(),
            "double allocation of sector {}",
            sector
        );

        self.entries.push(DictEntry {
            key,
            sector,
            length,
            buf: vec![0; (length as usize) * M2F1_SIZE],
            end_flags,
        });
    }

    fn get(&self, key: &str) -> &DictEntry {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .unwrap_or_else(|| panic!("no dict entry `{}`", key))
    }

    fn get_mut(&mut self, key: &str) -> &mut DictEntry {
        self.entries
            .iter_mut()
            .find(|e| e.key == key)
            .unwrap_or_else(|| panic!("no dict entry `{}`", key))
    }

    fn contains(&self, key: &str) -> bool {
        self.entries.iter().any(|e| e.key == key)
    }

    /// Contents and flags for `sector`, if it belongs to a staged area
    fn sector_data(&self, sector: u32) -> Option<(&[u8], SubMode)> {
        self.entries.iter().find_map(|e| {
            if sector < e.sector || sector - e.sector >= e.length {
                return None;
            }

            let n = (sector - e.sector) as usize;
            let data = &e.buf[n * M2F1_SIZE..(n + 1) * M2F1_SIZE];

            let flags = if sector + 1 == e.sector + e.length {
                e.end_flags
            } else {
                SubMode::empty()
            };

            Some((data, flags))
        })
    }
}

/// Layout state living between `begin_output` and `end_output`
struct Output {
    allocator: SectorAllocator,
    dir: IsoDirectory,
    dict: Dict,
    pbc: Option<CompiledPbc>,
    iso_size: u32,
    /// LSN of the first segment unit, if any segments exist
    mpeg_segment_start_extent: Option<u32>,
    /// First sector of the EXT area files
    ext_file_start_extent: u32,
    /// First sector of the custom files
    custom_file_start_extent: u32,
}

/// The root object of the authoring engine
pub struct Disc {
    disc_type: DiscType,

    volume_id: String,
    application_id: String,
    album_id: String,
    volume_count: u16,
    volume_number: u16,
    restriction: u8,

    relaxed_aps: bool,
    next_vol_lid2: bool,
    next_vol_seq2: bool,
    svcd_vcd3_mpegav: bool,
    svcd_vcd3_entrysvd: bool,
    update_scan_offsets: bool,

    sequences: Vec<SequenceItem>,
    segments: Vec<SegmentItem>,
    custom_files: Vec<CustomFile>,
    custom_dirs: Vec<String>,
    pbc_nodes: Vec<PbcNode>,

    /// One past the last sector of the last track, relative to the ISO
    /// track end
    relative_end_extent: u32,

    output: Option<Output>,
}

impl Disc {
    /// Create an empty disc of the given flavour
    pub fn new(disc_type: DiscType) -> Disc {
        Disc {
            disc_type,
            volume_id: String::new(),
            application_id: String::new(),
            album_id: String::new(),
            volume_count: 1,
            volume_number: 0,
            restriction: 0,
            relaxed_aps: false,
            next_vol_lid2: false,
            next_vol_seq2: false,
            svcd_vcd3_mpegav: false,
            svcd_vcd3_entrysvd: false,
            update_scan_offsets: false,
            sequences: Vec::new(),
            segments: Vec::new(),
            custom_files: Vec::new(),
            custom_dirs: Vec::new(),
            pbc_nodes: Vec::new(),
            relative_end_extent: 0,
            output: None,
        }
    }

    /// The flavour this disc was created with
    pub fn disc_type(&self) -> DiscType {
        self.disc_type
    }

    /// Layout facts, once `begin_output` has run
    pub fn layout_info(&self) -> Option<LayoutInfo> {
        self.output.as_ref().map(|out| LayoutInfo {
            iso_size: out.iso_size,
            segment_start: out.mpeg_segment_start_extent,
            ext_file_start: out.ext_file_start_extent,
            custom_file_start: out.custom_file_start_extent,
            highest_allocated: out.allocator.highest().unwrap_or(0),
            total_sectors: out.iso_size + self.relative_end_extent,
        })
    }

    fn check_not_in_output(&self) -> VcdResult<()> {
        if self.output.is_some() {
            return Err(VcdError::Config(
                "disc is frozen between begin_output and end_output".to_string(),
            ));
        }

        Ok(())
    }

    fn clamp_str(value: String, max: usize, what: &str) -> String {
        if value.len() > max {
            warn!("{} `{}` truncated to {} characters", what, value, max);
            value[..max].to_string()
        } else {
            value
        }
    }

    fn clamp_num(value: u32, low: u32, high: u32, what: &str) -> u32 {
        let clamped = value.clamp(low, high);

        if clamped != value {
            warn!("{} {} out of range, clamped to {}", what, value, clamped);
        }

        clamped
    }

    /// Set a disc parameter. Out of range values are clamped with a
    /// warning rather than rejected.
    pub fn set_param(&mut self, param: Param) {
        match param {
            Param::VolumeId(v) => self.volume_id = Disc::clamp_str(v, 32, "volume id"),
            Param::ApplicationId(v) => {
                self.application_id = Disc::clamp_str(v, 128, "application id")
            }
            Param::AlbumId(v) => self.album_id = Disc::clamp_str(v, 16, "album id"),
            Param::VolumeCount(v) => {
                self.volume_count = Disc::clamp_num(v, 1, 65535, "volume count") as u16
            }
            Param::VolumeNumber(v) => {
                self.volume_number = Disc::clamp_num(v, 0, 65534, "volume number") as u16
            }
            Param::Restriction(v) => {
                self.restriction = Disc::clamp_num(v, 0, 3, "restriction") as u8
            }
            Param::RelaxedAps(v) => self.relaxed_aps = v,
            Param::NextVolumeLid2(v) => self.next_vol_lid2 = v,
            Param::NextVolumeSeq2(v) => self.next_vol_seq2 = v,
            Param::SvcdVcd3MpegAv(v) => {
                if v {
                    warn!("deprecated SVCD VCD3 MPEGAV compatibility mode enabled");
                }
                self.svcd_vcd3_mpegav = v;
            }
            Param::SvcdVcd3EntrySvd(v) => {
                if v {
                    warn!("deprecated SVCD VCD3 ENTRYSVD signature enabled");
                }
                self.svcd_vcd3_entrysvd = v;
            }
            Param::UpdateScanOffsets(v) => self.update_scan_offsets = v,
        }
    }

    /// Append a full motion MPEG sequence. The stream is scanned
    /// immediately; the scan result stays available through
    /// [`Disc::sequence_info`]. Returns the sequence index.
    pub fn append_sequence(
        &mut self,
        mut source: Box<dyn DataSource>,
        id: Option<String>,
        default_entry_id: Option<String>,
    ) -> VcdResult<usize> {
        self.check_not_in_output()?;

        if self.sequences.len() >= MAX_SEQUENCES {
            return Err(VcdError::Config(format!(
                "at most {} sequences fit on a disc",
                MAX_SEQUENCES
            )));
        }

        let n = self.sequences.len();

        let size = source.stat()?;
        if size % M2F2_SIZE as u64 != 0 {
            warn!("sequence {} is not a multiple of 2324 bytes", n);
        }

        let info = mpeg::scan(source.as_mut(), self.relaxed_aps)?;

        if self.disc_type.is_svcd() && info.version == MpegVersion::Mpeg1 {
            warn!("SVCD should not contain MPEG1 tracks!");
        }
        if !self.disc_type.is_svcd() && info.version == MpegVersion::Mpeg2 {
            warn!("VCD should not contain MPEG2 tracks!");
        }

        if info.packets < 75 {
            warn!("sequence {} is shorter than 75 sectors", n);
        }

        if !info.has_motion_video() {
            warn!("sequence {} does not look like motion video", n);
        }

        debug!(
            "sequence {} estimated playtime: {} seconds",
            n, info.playtime
        );

        self.relative_end_extent += self.disc_type.pre_track_gap();
        let relative_start_extent = self.relative_end_extent;
        self.relative_end_extent +=
            self.disc_type.pre_data_gap() + info.packets + self.disc_type.post_data_gap();

        self.sequences.push(SequenceItem {
            source,
            id,
            default_entry_id,
            info,
            entries: Vec::new(),
            pauses: Vec::new(),
            relative_start_extent,
        });

        Ok(n)
    }

    /// Scan result of sequence `index`
    pub fn sequence_info(&self, index: usize) -> &MpegInfo {
        &self.sequences[index].info
    }

    /// Remove sequence `index` again, shifting the tracks behind it
    /// down
    pub fn remove_sequence(&mut self, index: usize) -> VcdResult<()> {
        self.check_not_in_output()?;

        if index >= self.sequences.len() {
            return Err(VcdError::Config(format!("no sequence {}", index)));
        }

        let length = self.sequences[index].track_sectors(self.disc_type);

        for seq in self.sequences.iter_mut().skip(index + 1) {
            seq.relative_start_extent -= length;
        }
        self.relative_end_extent -= length;

        self.sequences.remove(index);

        Ok(())
    }

    /// Add an entry point to sequence `sequence` at `time` seconds
    pub fn add_sequence_entry(
        &mut self,
        sequence: usize,
        time: f64,
        id: Option<String>,
    ) -> VcdResult<()> {
        self.check_not_in_output()?;

        let seq = self
            .sequences
            .get_mut(sequence)
            .ok_or_else(|| VcdError::Config(format!("no sequence {}", sequence)))?;

        if seq.entries.len() >= MAX_ENTRIES_PER_SEQUENCE {
            return Err(VcdError::Config(format!(
                "at most {} entry points per sequence",
                MAX_ENTRIES_PER_SEQUENCE
            )));
        }

        let at = seq.entries.partition_point(|e| e.time <= time);
        seq.entries.insert(at, TimedPoint { time, id });

        Ok(())
    }

    /// Add a pause point to sequence `sequence` at `time` seconds. The
    /// sector carrying the first packet at or past `time` gets the
    /// trigger submode bit.
    pub fn add_sequence_pause(
        &mut self,
        sequence: usize,
        time: f64,
        id: Option<String>,
    ) -> VcdResult<()> {
        self.check_not_in_output()?;

        let seq = self
            .sequences
            .get_mut(sequence)
            .ok_or_else(|| VcdError::Config(format!("no sequence {}", sequence)))?;

        let at = seq.pauses.partition_point(|p| p.time <= time);
        seq.pauses.insert(at, TimedPoint { time, id });

        Ok(())
    }

    /// Append a still picture segment group
    pub fn append_segment(
        &mut self,
        mut source: Box<dyn DataSource>,
        id: String,
    ) -> VcdResult<usize> {
        self.check_not_in_output()?;

        let info = mpeg::scan(source.as_mut(), self.relaxed_aps)?;

        if info.packets == 0 {
            return Err(VcdError::Config(format!("segment `{}` is empty", id)));
        }

        let segment_count = info.packets.div_ceil(SEGMENT_UNIT_PACKETS);

        let n = self.segments.len();
        self.segments.push(SegmentItem {
            source,
            id,
            info,
            segment_count,
            start_extent: 0,
        });

        Ok(n)
    }

    /// Add a custom data file at `iso_path`. With `raw` set the source
    /// must hold complete 2336 byte Mode 2 sectors (subheader included)
    /// and its size must be a multiple of 2336.
    pub fn add_file(
        &mut self,
        iso_path: &str,
        mut source: Box<dyn DataSource>,
        raw: bool,
    ) -> VcdResult<()> {
        self.check_not_in_output()?;

        iso9660::validate_iso_path(iso_path, true)?;

        let size = source.stat()? as u32;

        let sectors = if raw {
            if size % M2RAW_SIZE as u32 != 0 {
                return Err(VcdError::Media(format!(
                    "raw mode2 file must have a size multiple of {}",
                    M2RAW_SIZE
                )));
            }
            size / M2RAW_SIZE as u32
        } else {
            size.div_ceil(M2F1_SIZE as u32)
        };

        self.custom_files.push(CustomFile {
            source,
            iso_path: iso_path.to_string(),
            raw,
            size,
            sectors,
            start_extent: 0,
        });

        Ok(())
    }

    /// Add a custom directory at `iso_path`
    pub fn add_dir(&mut self, iso_path: &str) -> VcdResult<()> {
        self.check_not_in_output()?;

        iso9660::validate_iso_path(iso_path, false)?;
        self.custom_dirs.push(iso_path.to_string());

        Ok(())
    }

    /// Append a playback control node. Compiled during `begin_output`.
    pub fn add_pbc_node(&mut self, node: PbcNode) -> VcdResult<()> {
        self.check_not_in_output()?;

        if self.disc_type == DiscType::Vcd11 {
            return Err(VcdError::Config(
                "VCD 1.1 does not support playback control".to_string(),
            ));
        }

        self.pbc_nodes.push(node);

        Ok(())
    }

    /// Play item number of the entry table slot `index`
    fn entry_pin(index: usize) -> u16 {
        PIN_ENTRY_BASE + index as u16
    }

    /// Build the unified id -> play item number table covering
    /// sequences, entry points and segments, rejecting duplicates.
    /// PBC node ids are checked against it but resolve to list
    /// offsets inside the compiler.
    fn build_pin_map(&self) -> VcdResult<BTreeMap<String, u16>> {
        let mut map: BTreeMap<String, u16> = BTreeMap::new();

        let mut add = |map: &mut BTreeMap<String, u16>, id: &str, pin: u16| {
            if map.insert(id.to_string(), pin).is_some() {
                return Err(VcdError::DuplicateId(id.to_string()));
            }
            Ok(())
        };

        let mut entry_index = 0usize;

        for (n, seq) in self.sequences.iter().enumerate() {
            if let Some(id) = &seq.id {
                add(&mut map, id, PIN_SEQUENCE_BASE + n as u16)?;
            }

            // The implicit track start entry carries the default entry
            // id
            if let Some(id) = &seq.default_entry_id {
                add(&mut map, id, Disc::entry_pin(entry_index))?;
            }
            entry_index += 1;

            for entry in &seq.entries {
                if let Some(id) = &entry.id {
                    add(&mut map, id, Disc::entry_pin(entry_index))?;
                }
                entry_index += 1;
            }
        }

        if entry_index > info::MAX_ENTRIES {
            return Err(VcdError::Config(format!(
                "{} entry points, the entry table holds at most {}",
                entry_index,
                info::MAX_ENTRIES
            )));
        }

        let mut unit = 0u32;
        for segment in &self.segments {
            add(&mut map, &segment.id, PIN_SEGMENT_BASE + unit as u16)?;
            unit += segment.segment_count;
        }

        if unit as usize > info::MAX_SEGMENTS {
            return Err(VcdError::Config(format!(
                "{} segment units, the item table holds at most {}",
                unit,
                info::MAX_SEGMENTS
            )));
        }

        for node in &self.pbc_nodes {
            if map.contains_key(node.id()) {
                return Err(VcdError::DuplicateId(node.id().to_string()));
            }
        }

        // Pause point ids share the namespace too
        for seq in &self.sequences {
            for pause in &seq.pauses {
                if let Some(id) = &pause.id {
                    if map.contains_key(id) || self.pbc_nodes.iter().any(|n| n.id() == id) {
                        return Err(VcdError::DuplicateId(id.clone()));
                    }
                }
            }
        }

        Ok(map)
    }

    /// Number of SEARCH.DAT scan points: one per half second of
    /// playing time per sequence, inclusive
    fn search_point_count(&self) -> usize {
        self.sequences
            .iter()
            .map(|s| (s.info.playtime * 2.0) as usize + 1)
            .sum()
    }

    /// Number of SCANDATA.DAT scan points: one per frame
    fn scandata_point_count(&self) -> usize {
        self.sequences
            .iter()
            .map(|s| (s.info.playtime * s.info.frame_rate).ceil() as usize)
            .sum()
    }

    /// Freeze the disc and lay out the ISO track. Returns the total
    /// image size in sectors.
    pub fn begin_output(&mut self) -> VcdResult<u32> {
        self.check_not_in_output()?;

        if self.sequences.is_empty() {
            return Err(VcdError::Config("no sequences".to_string()));
        }

        let pin_map = self.build_pin_map()?;

        let pbc = if self.pbc_nodes.is_empty() {
            None
        } else {
            Some(PbcCompiler::new(&self.pbc_nodes, &pin_map).compile()?)
        };

        let mut allocator = SectorAllocator::new();
        let mut dict = Dict::new();

        // ISO9660 required silence
        allocator.reserve_at(0, 16).expect("empty bitmap");

        dict.insert(&mut allocator, "pvd", 16, 1, SubMode::EOR);
        dict.insert(&mut allocator, "evd", 17, 1, SubMode::EOR | SubMode::EOF);

        // Directory region placeholder, resized to the exact directory
        // size once the tree is complete
        let dir_region = if self.disc_type.is_svcd() {
            150 - 18
        } else {
            75 - 18
        };
        allocator.reserve_at(18, dir_region).expect("empty bitmap");

        if !self.disc_type.is_svcd() {
            // Keep the karaoke area blank
            allocator.reserve_at(75, 75).expect("empty bitmap");
        }

        dict.insert(&mut allocator, "info", INFO_SECTOR, 1, SubMode::EOF);
        dict.insert(&mut allocator, "entries", ENTRIES_SECTOR, 1, SubMode::EOF);

        if let Some(pbc) = &pbc {
            dict.insert(&mut allocator, "lot", LOT_SECTOR, LOT_VCD_SIZE, SubMode::EOF);

            let psd_sectors = (pbc.psd.len() as u32).div_ceil(M2F1_SIZE as u32).max(1);
            dict.insert(&mut allocator, "psd", PSD_SECTOR, psd_sectors, SubMode::EOF);
        }

        if self.disc_type.is_svcd() {
            let tracks_sector = allocator.reserve_next(1);
            allocator.free(tracks_sector, 1);
            dict.insert(&mut allocator, "tracks", tracks_sector, 1, SubMode::EOF);

            let search_sectors =
                info::search_dat_size(self.search_point_count()).div_ceil(M2F1_SIZE as u32);
            let search_sector = allocator.reserve_next(search_sectors);
            allocator.free(search_sector, search_sectors);
            dict.insert(
                &mut allocator,
                "search",
                search_sector,
                search_sectors,
                SubMode::EOF,
            );
        }

        // Keep the rest of the first three seconds blank
        for n in 0..BLANK_AREA_SECTORS {
            allocator.reserve_at(n, 1);
        }

        // Segment groups, aligned to 150 sector boundaries
        let mpeg_segment_start_extent = if self.segments.is_empty() {
            None
        } else {
            let highest = allocator.highest().unwrap();
            let start = (highest + 1).div_ceil(SEGMENT_ALIGN) * SEGMENT_ALIGN;

            // Keep the bitmap dense across the alignment gap
            if start > highest + 1 {
                allocator
                    .reserve_at(highest + 1, start - highest - 1)
                    .expect("alignment gap already taken");
            }

            let mut cursor = start;
            for segment in self.segments.iter_mut() {
                let sectors = segment.segment_count * SEGMENT_ALIGN;

                segment.start_extent = allocator
                    .reserve_at(cursor, sectors)
                    .expect("segment area already taken");
                assert_eq!(segment.start_extent % SEGMENT_ALIGN, 0);

                cursor += sectors;
            }

            Some(start)
        };

        // EXT area files
        let ext_file_start_extent = allocator.highest().unwrap() + 1;

        if self.disc_type == DiscType::Vcd20 {
            if let Some(pbc) = &pbc {
                let lot_x_sector = allocator.reserve_next(LOT_VCD_SIZE);
                allocator.free(lot_x_sector, LOT_VCD_SIZE);
                dict.insert(
                    &mut allocator,
                    "lot_x",
                    lot_x_sector,
                    LOT_VCD_SIZE,
                    SubMode::EOF,
                );

                let psd_x_sectors = (pbc.psd_x.len() as u32).div_ceil(M2F1_SIZE as u32).max(1);
                let psd_x_sector = allocator.reserve_next(psd_x_sectors);
                allocator.free(psd_x_sector, psd_x_sectors);
                dict.insert(
                    &mut allocator,
                    "psd_x",
                    psd_x_sector,
                    psd_x_sectors,
                    SubMode::EOF,
                );
            }
        }

        if self.disc_type.is_svcd() {
            let scandata_sectors =
                info::scandata_dat_size(self.scandata_point_count()).div_ceil(M2F1_SIZE as u32);
            let scandata_sector = allocator.reserve_next(scandata_sectors);
            allocator.free(scandata_sector, scandata_sectors);
            dict.insert(
                &mut allocator,
                "scandata",
                scandata_sector,
                scandata_sectors,
                SubMode::EOF,
            );
        }

        // Custom files
        let custom_file_start_extent = allocator.highest().unwrap() + 1;

        for file in self.custom_files.iter_mut() {
            // Zero sized files still get a placeholder sector
            file.start_extent = allocator.reserve_next(file.sectors.max(1));
        }

        // After this point no sector may be allocated anymore
        let iso_size = MIN_ISO_SIZE.max(allocator.highest().unwrap() + 1);

        debug!(
            "iso9660: highest allocated sector is {} (using {} as iso size)",
            allocator.highest().unwrap(),
            iso_size
        );

        let total_sectors = iso_size + self.relative_end_extent;

        if total_sectors > MAX_IMAGE_SECTORS {
            warn!(
                "image of {} sectors exceeds the 74 minute disc capacity",
                total_sectors
            );
            return Err(VcdError::Layout(format!(
                "image of {} sectors does not fit a 74 minute disc ({} sectors)",
                total_sectors, MAX_IMAGE_SECTORS
            )));
        }

        // Directory tree
        let mut dir = IsoDirectory::new();
        self.populate_directory(&mut dir, &dict, pbc.as_ref(), iso_size)?;

        let dirs_size = dir.get_size();

        let dir_limit = if self.disc_type.is_svcd() { 150 } else { 75 };
        if 18 + dirs_size + 2 > dir_limit {
            return Err(VcdError::Layout("directory section too big".to_string()));
        }

        assert!(dir.pathtable_size() <= M2F1_SIZE as u32);

        allocator.free(18, dir_region);
        dict.insert(
            &mut allocator,
            "dir",
            18,
            dirs_size,
            SubMode::EOR | SubMode::EOF,
        );
        dict.insert(
            &mut allocator,
            "ptl",
            18 + dirs_size,
            1,
            SubMode::EOR | SubMode::EOF,
        );
        dict.insert(
            &mut allocator,
            "ptm",
            18 + dirs_size + 1,
            1,
            SubMode::EOR | SubMode::EOF,
        );

        self.output = Some(Output {
            allocator,
            dir,
            dict,
            pbc,
            iso_size,
            mpeg_segment_start_extent,
            ext_file_start_extent,
            custom_file_start_extent,
        });

        Ok(total_sectors)
    }

    /// Create the directory tree for the frozen layout
    fn populate_directory(
        &self,
        dir: &mut IsoDirectory,
        dict: &Dict,
        pbc: Option<&CompiledPbc>,
        iso_size: u32,
    ) -> VcdResult<()> {
        let svcd = self.disc_type.is_svcd();

        if svcd {
            dir.mkdir("EXT")?;
            dir.mkdir(if self.svcd_vcd3_mpegav {
                "MPEGAV"
            } else {
                "MPEG2"
            })?;
            dir.mkdir("SVCD")?;

            if !self.segments.is_empty() {
                dir.mkdir("SEGMENT")?;
            }
        } else {
            dir.mkdir("CDI")?;
            dir.mkdir("EXT")?;
            dir.mkdir("MPEGAV")?;
            dir.mkdir("SEGMENT")?;
            dir.mkdir("VCD")?;
        }

        for custom_dir in &self.custom_dirs {
            dir.mkdir(custom_dir)?;
        }

        let info_dir = if svcd { "SVCD" } else { "VCD" };
        let info_ext = if svcd { "SVD" } else { "VCD" };

        dir.mkfile(
            &format!("{}/INFO.{};1", info_dir, info_ext),
            dict.get("info").sector,
            M2F1_SIZE as u32,
            false,
            0,
        )?;
        dir.mkfile(
            &format!("{}/ENTRIES.{};1", info_dir, info_ext),
            dict.get("entries").sector,
            M2F1_SIZE as u32,
            false,
            0,
        )?;

        if let Some(pbc) = pbc {
            dir.mkfile(
                &format!("{}/LOT.{};1", info_dir, info_ext),
                dict.get("lot").sector,
                LOT_VCD_SIZE * M2F1_SIZE as u32,
                false,
                0,
            )?;
            dir.mkfile(
                &format!("{}/PSD.{};1", info_dir, info_ext),
                dict.get("psd").sector,
                pbc.psd.len() as u32,
                false,
                0,
            )?;

            if self.disc_type == DiscType::Vcd20 {
                dir.mkfile(
                    "EXT/LOT_X.VCD;1",
                    dict.get("lot_x").sector,
                    LOT_VCD_SIZE * M2F1_SIZE as u32,
                    false,
                    0,
                )?;
                dir.mkfile(
                    "EXT/PSD_X.VCD;1",
                    dict.get("psd_x").sector,
                    pbc.psd_x.len() as u32,
                    false,
                    0,
                )?;
            }
        }

        if svcd {
            dir.mkfile(
                "SVCD/TRACKS.SVD;1",
                dict.get("tracks").sector,
                M2F1_SIZE as u32,
                false,
                0,
            )?;
            dir.mkfile(
                "SVCD/SEARCH.DAT;1",
                dict.get("search").sector,
                info::search_dat_size(self.search_point_count()),
                false,
                0,
            )?;
            dir.mkfile(
                "EXT/SCANDATA.DAT;1",
                dict.get("scandata").sector,
                info::scandata_dat_size(self.scandata_point_count()),
                false,
                0,
            )?;
        }

        for (n, segment) in self.segments.iter().enumerate() {
            let path = if svcd {
                format!("SEGMENT/ITEM{:04}.MPG;1", n + 1)
            } else {
                format!("SEGMENT/ITEM{:04}.DAT;1", n + 1)
            };

            dir.mkfile(
                &path,
                segment.start_extent,
                segment.segment_count * SEGMENT_ALIGN * M2F1_SIZE as u32,
                true,
                1,
            )?;
        }

        for file in &self.custom_files {
            dir.mkfile(
                &format!("{};1", file.iso_path),
                file.start_extent,
                file.size,
                file.raw,
                1,
            )?;
        }

        for (n, seq) in self.sequences.iter().enumerate() {
            let path = if svcd && !self.svcd_vcd3_mpegav {
                format!("MPEG2/AVSEQ{:02}.MPG;1", n + 1)
            } else {
                format!("MPEGAV/AVSEQ{:02}.DAT;1", n + 1)
            };

            let extent = iso_size + seq.relative_start_extent + self.disc_type.pre_data_gap();

            dir.mkfile(
                &path,
                extent,
                seq.info.packets * M2F1_SIZE as u32,
                true,
                (n + 1) as u8,
            )?;
        }

        Ok(())
    }

    /// Total image size in sectors, running a throwaway layout pass
    pub fn image_size(&mut self) -> VcdResult<u32> {
        let total = self.begin_output()?;
        self.end_output();

        Ok(total)
    }

    /// Release the layout state created by `begin_output`
    pub fn end_output(&mut self) {
        self.output = None;

        for seq in self.sequences.iter_mut() {
            seq.source.close();
        }
        for segment in self.segments.iter_mut() {
            segment.source.close();
        }
        for file in self.custom_files.iter_mut() {
            file.source.close();
        }
    }

    /// The cue list describing the frozen track layout
    fn cue_list(&self, iso_size: u32) -> Vec<CueEntry> {
        let mut cues = vec![CueEntry {
            lsn: 0,
            kind: CueKind::TrackStart,
        }];

        for seq in &self.sequences {
            cues.push(CueEntry {
                lsn: iso_size + seq.relative_start_extent - self.disc_type.pre_track_gap(),
                kind: CueKind::PregapStart,
            });
            cues.push(CueEntry {
                lsn: iso_size + seq.relative_start_extent,
                kind: CueKind::TrackStart,
            });
        }

        cues.push(CueEntry {
            lsn: iso_size + self.relative_end_extent,
            kind: CueKind::LeadOut,
        });

        cues
    }

    /// First MPEG packet sector of sequence `seq`
    fn sequence_data_start(&self, seq: &SequenceItem, iso_size: u32) -> u32 {
        iso_size + seq.relative_start_extent + self.disc_type.pre_data_gap()
    }

    /// ENTRIES records: one per track start plus the user entry points
    fn entry_records(&self, iso_size: u32) -> Vec<EntryRecord> {
        let mut records = Vec::new();

        for (n, seq) in self.sequences.iter().enumerate() {
            let data_start = self.sequence_data_start(seq, iso_size);

            let track = Bcd::from_binary((n + 2) as u8).unwrap();

            records.push(EntryRecord {
                track,
                address: Msf::from_lsn(data_start).unwrap(),
            });

            for entry in &seq.entries {
                let packet = seq.info.aps_at(entry.time).map_or(0, |aps| aps.packet);

                records.push(EntryRecord {
                    track,
                    address: Msf::from_lsn(data_start + packet).unwrap(),
                });
            }
        }

        records
    }

    /// SEARCH.DAT points: the closest access point for every half
    /// second tick of every sequence
    fn search_points(&self, iso_size: u32) -> Vec<Msf> {
        let mut points = Vec::new();

        for seq in &self.sequences {
            let data_start = self.sequence_data_start(seq, iso_size);

            let ticks = (seq.info.playtime * 2.0) as usize + 1;

            for tick in 0..ticks {
                let time = tick as f64 / 2.0;
                let packet = seq.info.aps_at(time).map_or(0, |aps| aps.packet);

                points.push(Msf::from_lsn(data_start + packet).unwrap());
            }
        }

        points
    }

    /// SCANDATA.DAT points: the closest access point for every frame
    fn scandata_points(&self, iso_size: u32) -> Vec<Msf> {
        let mut points = Vec::new();

        for seq in &self.sequences {
            if seq.info.frame_rate == 0.0 {
                continue;
            }

            let data_start = self.sequence_data_start(seq, iso_size);

            let frames = (seq.info.playtime * seq.info.frame_rate).ceil() as usize;

            for frame in 0..frames {
                let time = frame as f64 / seq.info.frame_rate;
                let packet = seq.info.aps_at(time).map_or(0, |aps| aps.packet);

                points.push(Msf::from_lsn(data_start + packet).unwrap());
            }
        }

        points
    }

    /// INFO segment content table: one slot per 150 sector unit
    fn segment_contents(&self) -> Vec<SegmentContent> {
        let mut contents = Vec::new();

        for segment in &self.segments {
            let audio = match segment.info.audio {
                AudioLayout::NoAudio => 0,
                AudioLayout::Single => 1,
                AudioLayout::Dual => 2,
                AudioLayout::MultiChannel => 3,
            };

            let video = if segment.info.still_e1 {
                2
            } else if segment.info.still_e2 {
                1
            } else if segment.info.hsize != 0 {
                3
            } else {
                0
            };

            for unit in 0..segment.segment_count {
                contents.push(SegmentContent {
                    audio,
                    video,
                    continuation: unit + 1 < segment.segment_count,
                });
            }
        }

        contents
    }

    /// Fill every staged header buffer. Pure function of the frozen
    /// layout, called once per `write_image`.
    fn fill_dict_buffers(&mut self) {
        let iso_size = self.output.as_ref().unwrap().iso_size;

        // Everything derived from &self must be computed before the
        // mutable borrow of the output state below
        let pal_tracks: Vec<bool> = self
            .sequences
            .iter()
            .map(|s| matches!(s.info.norm, Norm::Pal | Norm::PalS))
            .collect();
        let segment_contents = self.segment_contents();
        let entry_records = self.entry_records(iso_size);

        let svcd = self.disc_type.is_svcd();

        let svcd_tables = if svcd {
            let tracks: Vec<TrackSvdEntry> = self
                .sequences
                .iter()
                .map(|s| TrackSvdEntry {
                    playtime: Msf::from_sector_index((s.info.playtime * 75.0) as u32)
                        .unwrap_or_else(Msf::zero),
                    audio: s.info.audio,
                    norm: s.info.norm,
                })
                .collect();

            Some((
                tracks,
                self.search_points(iso_size),
                self.scandata_points(iso_size),
            ))
        } else {
            None
        };

        let disc_type = self.disc_type;
        let album_id = self.album_id.clone();
        let volume_id = self.volume_id.clone();
        let application_id = self.application_id.clone();
        let volume_count = self.volume_count;
        let volume_number = self.volume_number;
        let restriction = self.restriction;
        let use_lid2 = self.next_vol_lid2;
        let use_sequence2 = self.next_vol_seq2;
        let legacy_entry_id = self.svcd_vcd3_entrysvd;
        let update_scan_offsets = self.update_scan_offsets;

        let out = self.output.as_mut().unwrap();

        // Directory records and path tables
        let mut dir_buf = vec![0u8; out.dict.get("dir").length as usize * M2F1_SIZE];
        out.dir.dump_entries(&mut dir_buf, 18);

        let mut ptl = vec![0u8; M2F1_SIZE];
        let mut ptm = vec![0u8; M2F1_SIZE];
        out.dir.dump_pathtables(&mut ptl, &mut ptm);

        // Volume descriptors
        {
            let ptl_sector = out.dict.get("ptl").sector;
            let ptm_sector = out.dict.get("ptm").sector;
            let pathtable_size = out.dir.pathtable_size();

            iso9660::set_iso_pvd(
                &mut out.dict.get_mut("pvd").buf,
                &volume_id,
                &application_id,
                iso_size,
                &dir_buf,
                ptl_sector,
                ptm_sector,
                pathtable_size,
                volume_count,
                volume_number,
            );
        }
        iso9660::set_iso_evd(&mut out.dict.get_mut("evd").buf);

        out.dict.get_mut("dir").buf = dir_buf;
        out.dict.get_mut("ptl").buf = ptl;
        out.dict.get_mut("ptm").buf = ptm;

        // Playback control
        if let Some(pbc) = &out.pbc {
            out.dict.get_mut("lot").buf.copy_from_slice(&pbc.lot);

            let psd = out.dict.get_mut("psd");
            psd.buf[..pbc.psd.len()].copy_from_slice(&pbc.psd);

            if out.dict.contains("lot_x") {
                out.dict.get_mut("lot_x").buf.copy_from_slice(&pbc.lot_x);

                let psd_x = out.dict.get_mut("psd_x");
                psd_x.buf[..pbc.psd_x.len()].copy_from_slice(&pbc.psd_x);
            }
        }

        // INFO
        {
            let params = InfoParams {
                disc_type,
                album_id: &album_id,
                volume_count,
                volume_number,
                restriction,
                use_lid2,
                use_sequence2,
                extended_pbc: out.dict.contains("lot_x"),
                update_scan_offsets,
                psd_size: out.pbc.as_ref().map_or(0, |p| p.psd.len() as u32),
                first_segment_lsn: out.mpeg_segment_start_extent,
                max_lid: out.pbc.as_ref().map_or(0, |p| p.max_lid),
                pal_tracks: &pal_tracks,
                segments: &segment_contents,
            };

            info::set_info(&mut out.dict.get_mut("info").buf, &params);
        }

        // ENTRIES
        info::set_entries(
            &mut out.dict.get_mut("entries").buf,
            disc_type,
            legacy_entry_id,
            &entry_records,
        );

        // SVCD tables
        if let Some((tracks, search, scandata)) = svcd_tables {
            info::set_tracks_svd(&mut out.dict.get_mut("tracks").buf, &tracks);
            info::set_search_dat(&mut out.dict.get_mut("search").buf, &search);
            info::set_scandata_dat(&mut out.dict.get_mut("scandata").buf, &scandata);
        }
    }

    /// Stream the entire image into `sink`. The optional progress
    /// callback is invoked every 75 sectors and at track boundaries;
    /// returning `true` aborts the write (partially written sink
    /// output is the caller's to clean up).
    pub fn write_image<'a>(
        &mut self,
        sink: &'a mut dyn ImageSink,
        progress: Option<&'a mut dyn FnMut(&Progress) -> bool>,
    ) -> VcdResult<()> {
        if self.output.is_none() {
            return Err(VcdError::Config(
                "write_image requires begin_output".to_string(),
            ));
        }

        self.fill_dict_buffers();

        let iso_size = self.output.as_ref().unwrap().iso_size;
        let total_sectors = iso_size + self.relative_end_extent;
        let total_tracks = self.sequences.len() as u32 + 1;

        sink.set_cuesheet(&self.cue_list(iso_size))?;

        let mut writer = SectorWriter {
            sink,
            progress,
            sectors_written: 0,
            total_sectors,
            in_track: 1,
            total_tracks,
            last_callback: None,
        };

        writer.callback(true)?;

        self.write_iso_track(&mut writer)?;

        for n in 0..self.sequences.len() {
            writer.in_track += 1;
            writer.callback(true)?;

            self.write_sequence(&mut writer, n)?;
        }

        writer.callback(true)?;

        assert_eq!(writer.sectors_written, total_sectors);

        writer.sink.finish()?;

        Ok(())
    }

    /// Write the ISO track: staged header sectors, segment groups,
    /// custom files, zero form 1 filler everywhere else
    fn write_iso_track(&mut self, writer: &mut SectorWriter) -> VcdResult<()> {
        debug!("writing track 1 (ISO9660)...");

        let svcd = self.disc_type.is_svcd();

        let Disc {
            output,
            segments,
            custom_files,
            ..
        } = self;

        let out = output.as_ref().unwrap();
        let iso_size = out.iso_size;

        // (start, sectors, index) spans of segment groups and custom
        // files
        let segment_spans: Vec<(u32, u32, usize)> = segments
            .iter()
            .enumerate()
            .map(|(n, s)| (s.start_extent, s.segment_count * SEGMENT_ALIGN, n))
            .collect();
        let file_spans: Vec<(u32, u32, usize)> = custom_files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.sectors > 0)
            .map(|(n, f)| (f.start_extent, f.sectors, n))
            .collect();

        let zero = [0u8; M2F1_SIZE];
        let mut lsn = 0;

        while lsn < iso_size {
            if let Some(&(start, sectors, n)) = segment_spans.iter().find(|s| s.0 == lsn) {
                write_segment(writer, &mut segments[n], start, sectors, svcd)?;
                lsn += sectors;
                continue;
            }

            if let Some(&(start, sectors, n)) = file_spans.iter().find(|s| s.0 == lsn) {
                write_custom_file(writer, &mut custom_files[n], start, sectors)?;
                lsn += sectors;
                continue;
            }

            let (data, end_flags) = out
                .dict
                .sector_data(lsn)
                .unwrap_or((&zero[..], SubMode::empty()));

            let sm = SubMode::DATA | end_flags;
            let sector = sector::encode_mode2_sector(data, lsn, 0, 0, sm, 0);
            writer.put(&sector, lsn)?;

            lsn += 1;
        }

        Ok(())
    }

    /// Write one MPEG sequence track: pregap, pre-data gap, payload
    /// packets, post-data gap
    fn write_sequence(&mut self, writer: &mut SectorWriter, index: usize) -> VcdResult<()> {
        let iso_size = self.output.as_ref().unwrap().iso_size;
        let svcd = self.disc_type.is_svcd();
        let disc_type = self.disc_type;
        let update_scan_offsets = self.update_scan_offsets && svcd;
        let vcd3_compat = self.svcd_vcd3_mpegav;

        let seq = &mut self.sequences[index];

        debug!(
            "writing track {}, {}, {}...",
            index + 2,
            match seq.info.version {
                MpegVersion::Mpeg1 => "MPEG1",
                MpegVersion::Mpeg2 => "MPEG2",
            },
            seq.info.norm
        );

        // IEC 62107 wants file number 1 on every SVCD stream sector;
        // the VCD3 compatibility mode keeps per-track numbers
        let fnum = if svcd && !vcd3_compat {
            1
        } else {
            (index + 1) as u8
        };

        let mut lsn = iso_size + seq.relative_start_extent - disc_type.pre_track_gap();

        let zero_f2 = [0u8; M2F2_SIZE];

        for _ in 0..disc_type.pre_track_gap() {
            let sector = sector::encode_mode2_sector(&zero_f2, lsn, 0, 0, SubMode::FORM2, 0);
            writer.put(&sector, lsn)?;
            lsn += 1;
        }

        for _ in 0..disc_type.pre_data_gap() {
            let sector = sector::encode_mode2_sector(
                &zero_f2,
                lsn,
                fnum,
                0,
                SubMode::FORM2 | SubMode::REALT,
                0,
            );
            writer.put(&sector, lsn)?;
            lsn += 1;
        }

        let data_start = iso_size + seq.relative_start_extent + disc_type.pre_data_gap();

        let mut pause_cursor = 0;
        let mut buf = [0u8; M2F2_SIZE];

        for n in 0..seq.info.packets {
            mpeg::read_packet(seq.source.as_mut(), n, &mut buf)?;

            let (flags, _) = mpeg::packet_flags(&buf);

            let mut sm = SubMode::FORM2 | SubMode::REALT;
            let mut ci = 0;

            match flags.kind {
                PacketKind::Video => {
                    sm |= SubMode::VIDEO;
                    ci = if svcd {
                        CI_MPEG2
                    } else if flags.video_e1 || flags.video_e2 {
                        CI_STILL
                    } else {
                        CI_VIDEO
                    };
                }
                PacketKind::Audio => {
                    sm |= SubMode::AUDIO;
                    ci = if svcd { CI_MPEG2 } else { CI_AUDIO };
                }
                PacketKind::Ogt => {
                    if svcd {
                        ci = CI_MPEG2;
                    }
                }
                PacketKind::Empty | PacketKind::Zero => (),
                PacketKind::Invalid => {
                    seq.source.close();
                    return Err(VcdError::InvalidMpegPacket(n));
                }
            }

            if flags.seq_end && n + 1 < seq.info.packets {
                warn!(
                    "program end marker seen at packet {} -- before actual end of stream",
                    n
                );
            }

            // Pause points trigger on the first packet at or past
            // their timestamp
            if let Some(pts) = flags.pts {
                while pause_cursor < seq.pauses.len() && seq.pauses[pause_cursor].time <= pts {
                    sm |= SubMode::TRIG;
                    pause_cursor += 1;
                }
            }

            if n + 1 == seq.info.packets {
                sm |= SubMode::EOR | SubMode::EOF;
            }

            if update_scan_offsets {
                let prev = seq
                    .info
                    .aps
                    .iter()
                    .rev()
                    .find(|a| a.packet <= n)
                    .and_then(|a| Msf::from_lsn(data_start + a.packet));
                let next = seq
                    .info
                    .aps
                    .iter()
                    .find(|a| a.packet > n)
                    .and_then(|a| Msf::from_lsn(data_start + a.packet));

                mpeg::patch_scan_offsets(&mut buf, prev, next);
            }

            let sector = sector::encode_mode2_sector(&buf, lsn, fnum, 1, sm, ci);
            writer.put(&sector, lsn)?;
            lsn += 1;
        }

        seq.source.close();

        for _ in 0..disc_type.post_data_gap() {
            let sector = sector::encode_mode2_sector(
                &zero_f2,
                lsn,
                fnum,
                0,
                SubMode::FORM2 | SubMode::REALT,
                0,
            );
            writer.put(&sector, lsn)?;
            lsn += 1;
        }

        Ok(())
    }
}

/// Tracks write position and drives the progress callback
struct SectorWriter<'a> {
    sink: &'a mut dyn ImageSink,
    progress: Option<&'a mut dyn FnMut(&Progress) -> bool>,
    sectors_written: u32,
    total_sectors: u32,
    in_track: u32,
    total_tracks: u32,
    last_callback: Option<u32>,
}

impl SectorWriter<'_> {
    const CALLBACK_FREQUENCY: u32 = 75;

    fn put(&mut self, sector: &[u8; SECTOR_SIZE], lsn: u32) -> VcdResult<()> {
        assert_eq!(
            lsn, self.sectors_written,
            "sectors must be written in LSN order"
        );

        self.sink.write_sector(sector, lsn)?;
        self.sectors_written += 1;

        self.callback(false)
    }

    fn callback(&mut self, force: bool) -> VcdResult<()> {
        if let Some(last) = self.last_callback {
            if !force && last + SectorWriter::CALLBACK_FREQUENCY > self.sectors_written {
                return Ok(());
            }
        }

        self.last_callback = Some(self.sectors_written);

        if let Some(cb) = self.progress.as_mut() {
            let report = Progress {
                sectors_written: self.sectors_written,
                total_sectors: self.total_sectors,
                in_track: self.in_track,
                total_tracks: self.total_tracks,
            };

            if cb(&report) {
                return Err(VcdError::Aborted);
            }
        }

        Ok(())
    }
}

/// Write one segment group: the MPEG packets of the still, then form 2
/// zero padding up to the 150 sector allocation, EOR|EOF on the last
/// allocated sector
fn write_segment(
    writer: &mut SectorWriter,
    segment: &mut SegmentItem,
    start: u32,
    sectors: u32,
    svcd: bool,
) -> VcdResult<()> {
    debug!(
        "writing segment `{}` ({} packets)",
        segment.id, segment.info.packets
    );

    let mut buf = [0u8; M2F2_SIZE];

    for n in 0..sectors {
        let lsn = start + n;

        let mut sm = SubMode::FORM2 | SubMode::REALT;
        let mut ci = 0;
        let mut cnum = 0;

        if n < segment.info.packets {
            mpeg::read_packet(segment.source.as_mut(), n, &mut buf)?;

            let (flags, _) = mpeg::packet_flags(&buf);

            match flags.kind {
                PacketKind::Video => {
                    sm |= SubMode::VIDEO;
                    ci = if svcd { CI_MPEG2 } else { CI_STILL };
                    cnum = 1;
                }
                PacketKind::Audio => {
                    sm |= SubMode::AUDIO;
                    ci = if svcd { CI_MPEG2 } else { CI_AUDIO };
                    cnum = 1;
                }
                PacketKind::Ogt => {
                    if svcd {
                        ci = CI_MPEG2;
                    }
                    cnum = 1;
                }
                PacketKind::Empty | PacketKind::Zero => (),
                PacketKind::Invalid => {
                    segment.source.close();
                    return Err(VcdError::InvalidMpegPacket(n));
                }
            }
        } else {
            buf.fill(0);
        }

        if n + 1 == sectors {
            sm |= SubMode::EOR | SubMode::EOF;
        }

        let sector = sector::encode_mode2_sector(&buf, lsn, 1, cnum, sm, ci);
        writer.put(&sector, lsn)?;
    }

    segment.source.close();

    Ok(())
}

/// Stream a custom file: raw sources pass through sector by sector,
/// plain sources become form 1 data sectors with EOF on the last one
fn write_custom_file(
    writer: &mut SectorWriter,
    file: &mut CustomFile,
    start: u32,
    sectors: u32,
) -> VcdResult<()> {
    debug!(
        "writing custom file `{}` (size={})",
        file.iso_path, file.size
    );

    file.source.seek(0)?;

    if file.raw {
        let mut buf = [0u8; M2RAW_SIZE];

        for n in 0..sectors {
            buf.fill(0);
            file.source.read(&mut buf)?;

            let sector = sector::encode_mode2_raw_sector(&buf, start + n);
            writer.put(&sector, start + n)?;
        }
    } else {
        let mut buf = [0u8; M2F1_SIZE];

        for n in 0..sectors {
            buf.fill(0);
            file.source.read(&mut buf)?;

            let sm = if n + 1 == sectors {
                SubMode::DATA | SubMode::EOF
            } else {
                SubMode::DATA
            };

            let sector = sector::encode_mode2_sector(&buf, start + n, 1, 0, sm, 0);
            writer.put(&sector, start + n)?;
        }
    }

    file.source.close();

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::source::MemSource;

    #[test]
    fn no_sequences_fails() {
        let mut disc = Disc::new(DiscType::Vcd20);

        match disc.begin_output() {
            Err(VcdError::Config(msg)) => assert!(msg.contains("no sequences")),
            _ => panic!("empty disc accepted"),
        }
    }

    #[test]
    fn parameter_clamping() {
        let mut disc = Disc::new(DiscType::Vcd20);

        disc.set_param(Param::VolumeCount(0));
        assert!(disc.volume_count == 1);

        disc.set_param(Param::VolumeNumber(70000));
        assert!(disc.volume_number == 65534);

        disc.set_param(Param::Restriction(9));
        assert!(disc.restriction == 3);

        disc.set_param(Param::VolumeId("X".repeat(40)));
        assert!(disc.volume_id.len() == 32);
    }

    #[test]
    fn pbc_on_vcd11_rejected() {
        let mut disc = Disc::new(DiscType::Vcd11);

        let node = PbcNode::EndList(crate::pbc::EndList {
            id: "end".to_string(),
            ..Default::default()
        });

        assert!(disc.add_pbc_node(node).is_err());
    }

    #[test]
    fn custom_path_validation() {
        let mut disc = Disc::new(DiscType::Vcd20);

        let src = Box::new(MemSource::new(vec![0; 100]));
        assert!(matches!(
            disc.add_file("vcd/info.vcd", src, false),
            Err(VcdError::InvalidIsoPath(_))
        ));

        let src = Box::new(MemSource::new(vec![0; 100]));
        assert!(disc.add_file("README.TXT", src, false).is_ok());
    }

    #[test]
    fn raw_file_size_checked() {
        let mut disc = Disc::new(DiscType::Vcd20);

        let src = Box::new(MemSource::new(vec![0; 2336 + 1]));
        assert!(matches!(
            disc.add_file("RAW.DAT", src, true),
            Err(VcdError::Media(_))
        ));

        let src = Box::new(MemSource::new(vec![0; 2 * 2336]));
        assert!(disc.add_file("RAW.DAT", src, true).is_ok());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let mut disc = Disc::new(DiscType::Vcd20);

        // Two zero packet streams would not scan, craft tiny valid
        // streams instead: an empty (all padding) packet is fine
        let packet = vec![0u8; 2324];

        let src = Box::new(MemSource::new(packet.clone()));
        disc.append_sequence(src, Some("same".to_string()), None)
            .unwrap();

        let src = Box::new(MemSource::new(packet));
        disc.append_sequence(src, Some("same".to_string()), None)
            .unwrap();

        assert!(matches!(
            disc.begin_output(),
            Err(VcdError::DuplicateId(_))
        ));
    }

    #[test]
    fn too_many_segment_units_rejected() {
        let mut disc = Disc::new(DiscType::Vcd20);

        let src = Box::new(MemSource::new(vec![0u8; 2324]));
        disc.append_sequence(src, None, None).unwrap();

        // One more single-unit segment than the INFO item table holds
        for n in 0..=info::MAX_SEGMENTS {
            let src = Box::new(MemSource::new(vec![0u8; 2324]));
            disc.append_segment(src, format!("still-{}", n)).unwrap();
        }

        match disc.begin_output() {
            Err(VcdError::Config(msg)) => assert!(msg.contains("segment units")),
            other => panic!("oversized item table accepted: {:?}", other.map(|_| ())),
        }
    }
}
