//! Authoring engine for Video CD and Super Video CD disc images.
//!
//! The crate takes pre-encoded MPEG program streams plus optional
//! auxiliary files and playback-control metadata and synthesizes a
//! complete CD-ROM XA disc image together with the cue sheet describing
//! its track layout. The MPEG data is never re-encoded; it is scanned,
//! classified and wrapped sector by sector into raw 2352-byte XA Mode 2
//! sectors.
//!
//! The central type is [`Disc`]: populate it with parameters, MPEG
//! sequences, still-picture segments, custom files and playback-control
//! nodes, then run the `begin_output` / `write_image` / `end_output`
//! cycle against an [`ImageSink`].

#![warn(missing_docs)]

pub mod bcd;
pub mod disc;
mod edc;
pub mod info;
pub mod iso9660;
pub mod mpeg;
pub mod msf;
pub mod pbc;
pub mod salloc;
pub mod sector;
pub mod sink;
pub mod source;

pub use bcd::Bcd;
pub use disc::{Disc, Param, Progress};
pub use mpeg::MpegInfo;
pub use msf::Msf;
pub use pbc::PbcNode;
pub use sink::{BinCueSink, CdrdaoSink, CueEntry, CueKind, ImageSink};
pub use source::{DataSource, FileSource, MemSource};

use std::io;
use thiserror::Error;

/// The flavours of disc this engine can author.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum DiscType {
    /// Video CD 1.1 (no playback control)
    Vcd11,
    /// Video CD 2.0
    Vcd20,
    /// Super Video CD (IEC 62107)
    Svcd,
}

impl DiscType {
    /// Number of empty sectors written before each MPEG track
    pub fn pre_track_gap(self) -> u32 {
        2 * 75
    }

    /// Number of empty real-time sectors between the track start and
    /// the first MPEG packet
    pub fn pre_data_gap(self) -> u32 {
        30
    }

    /// Number of empty real-time sectors after the last MPEG packet of
    /// a track
    pub fn post_data_gap(self) -> u32 {
        45
    }

    /// Returns true for the Super Video CD flavour
    pub fn is_svcd(self) -> bool {
        self == DiscType::Svcd
    }
}

/// Error type for all authoring operations.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum VcdError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("duplicate id `{0}`")]
    DuplicateId(String),
    #[error("unknown id `{0}` referenced from playback control")]
    UnknownId(String),
    #[error("`{0}` is not a valid ISO9660 pathname")]
    InvalidIsoPath(String),
    #[error("invalid MPEG packet at packet #{0} -- please fix this MPEG file")]
    InvalidMpegPacket(u32),
    #[error("media error: {0}")]
    Media(String),
    #[error("disc layout error: {0}")]
    Layout(String),
    #[error("sink error: {0}")]
    Sink(String),
    #[error(
        "The sync pattern at the start of a CD-ROM sector (0x00, 0xff * 10, 0x00) was invalid"
    )]
    BadSyncPattern,
    #[error("Attempted to parse invalid BCD data")]
    BadBcd,
    #[error("Sector format mismatch")]
    BadFormat,
    #[error("image write aborted by the progress callback")]
    Aborted,
}

/// Convenience type alias for a `Result<R, VcdError>`
pub type VcdResult<R> = std::result::Result<R, VcdError>;

#[test]
fn vcderror_display() {
    // Make sure that VcdError implements Display. This should be true if we
    // set an `#[error("...")]` for every variant
    println!("{}", VcdError::Aborted);
}
