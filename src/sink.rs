//! Disc image sinks.
//!
//! The writer hands every sector of the image, in strictly ascending
//! LSN order, to an [`ImageSink`] after announcing the track layout
//! once through the cue list. Two backends are provided: a single
//! BIN file with a CDRWIN style cue sheet, and a CDRDAO TOC with one
//! `.img` file per track (pregaps split into `_pregap.img` files).

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::msf::Msf;
use crate::sector::SECTOR_SIZE;
use crate::{VcdError, VcdResult};

/// The role of a cue point
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum CueKind {
    /// First sector of a track
    TrackStart,
    /// First sector of the pregap preceding the next track
    PregapStart,
    /// An additional index within the current track
    SubIndex,
    /// One past the last sector of the image
    LeadOut,
}

/// One cue point of the track layout
#[derive(Clone, Copy, Debug)]
pub struct CueEntry {
    /// Logical sector number of the boundary
    pub lsn: u32,
    /// What the boundary is
    pub kind: CueKind,
}

/// Where the image ends up.
///
/// `set_cuesheet` is called exactly once before the first sector;
/// `write_sector` calls arrive with monotonically increasing LSNs;
/// `finish` flushes and releases the sink.
pub trait ImageSink {
    /// Receive the track layout
    fn set_cuesheet(&mut self, cues: &[CueEntry]) -> VcdResult<()>;

    /// Write one raw 2352 byte sector
    fn write_sector(&mut self, buf: &[u8; SECTOR_SIZE], lsn: u32) -> VcdResult<()>;

    /// Flush and release the sink
    fn finish(&mut self) -> VcdResult<()>;
}

/// Render a CDRWIN cue sheet for `cues` referencing `bin_name`.
/// Pregaps become `INDEX 00` entries of the following track.
fn render_cue_sheet(cues: &[CueEntry], bin_name: &str) -> String {
    let mut out = format!("FILE \"{}\" BINARY\r\n", bin_name);

    let mut track_no = 0u32;
    let mut pending_pregap: Option<u32> = None;
    let mut index_no = 1u32;

    for cue in cues {
        match cue.kind {
            CueKind::TrackStart => {
                track_no += 1;
                index_no = 1;

                out.push_str(&format!("  TRACK {:02} MODE2/2352\r\n", track_no));

                if let Some(lsn) = pending_pregap.take() {
                    out.push_str(&format!(
                        "    INDEX 00 {}\r\n",
                        Msf::from_sector_index(lsn).unwrap()
                    ));
                }

                out.push_str(&format!(
                    "    INDEX 01 {}\r\n",
                    Msf::from_sector_index(cue.lsn).unwrap()
                ));
            }
            CueKind::PregapStart => {
                pending_pregap = Some(cue.lsn);
            }
            CueKind::SubIndex => {
                index_no += 1;
                out.push_str(&format!(
                    "    INDEX {:02} {}\r\n",
                    index_no,
                    Msf::from_sector_index(cue.lsn).unwrap()
                ));
            }
            CueKind::LeadOut => (),
        }
    }

    out
}

/// BIN/CUE backend: the whole image in one file, described by a cue
/// sheet
pub struct BinCueSink {
    bin: File,
    cue_path: PathBuf,
    bin_name: String,
}

impl BinCueSink {
    /// Create `bin_path` and prepare to write the cue sheet to
    /// `cue_path` when the layout is known
    pub fn create<P: AsRef<Path>, Q: AsRef<Path>>(bin_path: P, cue_path: Q) -> VcdResult<BinCueSink> {
        let bin_path = bin_path.as_ref();

        let bin_name = bin_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "videocd.bin".to_string());

        Ok(BinCueSink {
            bin: File::create(bin_path)?,
            cue_path: cue_path.as_ref().to_path_buf(),
            bin_name,
        })
    }
}

impl ImageSink for BinCueSink {
    fn set_cuesheet(&mut self, cues: &[CueEntry]) -> VcdResult<()> {
        let sheet = render_cue_sheet(cues, &self.bin_name);

        let mut cue = File::create(&self.cue_path)?;
        cue.write_all(sheet.as_bytes())?;

        Ok(())
    }

    fn write_sector(&mut self, buf: &[u8; SECTOR_SIZE], lsn: u32) -> VcdResult<()> {
        self.bin
            .seek(SeekFrom::Start(lsn as u64 * SECTOR_SIZE as u64))?;
        self.bin.write_all(buf)?;

        Ok(())
    }

    fn finish(&mut self) -> VcdResult<()> {
        self.bin.flush()?;

        Ok(())
    }
}

/// Render a CDRDAO TOC for `cues`, with image files derived from
/// `img_base`
fn render_toc(cues: &[CueEntry], img_base: &str) -> VcdResult<String> {
    let mut out = String::from("// CDRDAO TOC\nCD_ROM_XA\n");

    let mut track_no = 0u32;
    let mut last_track_lsn = 0u32;
    let mut last_was_pregap = false;

    for cue in cues {
        match cue.kind {
            CueKind::TrackStart => {
                track_no += 1;
                last_track_lsn = cue.lsn;

                out.push_str(&format!(
                    "\n// Track {}\nTRACK MODE2_RAW\n COPY\n",
                    track_no
                ));

                if last_was_pregap {
                    out.push_str(&format!(
                        " DATAFILE \"{}_{:02}_pregap.img\"\n START\n",
                        img_base, track_no
                    ));
                }

                out.push_str(&format!(" DATAFILE \"{}_{:02}.img\"\n", img_base, track_no));
            }
            CueKind::SubIndex => {
                // Index times are relative to their track start
                if cue.lsn < last_track_lsn {
                    return Err(VcdError::Sink(format!(
                        "subindex at LSN {} precedes its track start at LSN {}",
                        cue.lsn, last_track_lsn
                    )));
                }

                let msf = Msf::from_sector_index(cue.lsn - last_track_lsn).unwrap();
                out.push_str(&format!(" INDEX {}\n", msf));
            }
            CueKind::PregapStart | CueKind::LeadOut => (),
        }

        last_was_pregap = cue.kind == CueKind::PregapStart;
    }

    out.push_str("\n// EOF\n");

    Ok(out)
}

/// CDRDAO backend: a TOC file plus one `.img` file per track and per
/// pregap
pub struct CdrdaoSink {
    toc_path: PathBuf,
    /// Base path the `.img` files derive from
    img_base: String,
    cues: Vec<CueEntry>,
    current: Option<(String, File, u32)>,
}

impl CdrdaoSink {
    /// Prepare a sink writing `toc_path` and `<img_base>_NN.img`
    /// files
    pub fn create<P: AsRef<Path>>(toc_path: P, img_base: &str) -> CdrdaoSink {
        CdrdaoSink {
            toc_path: toc_path.as_ref().to_path_buf(),
            img_base: img_base.to_string(),
            cues: Vec::new(),
            current: None,
        }
    }

    /// File name and start LSN of the image segment containing `lsn`
    fn segment_for(&self, lsn: u32) -> (String, u32) {
        let mut track_no = 0u32;
        let mut segment_start = 0u32;
        let mut segment_pregap = false;
        let mut last_start = 0u32;
        let mut last_pregap = false;

        for cue in &self.cues {
            match cue.kind {
                CueKind::TrackStart | CueKind::PregapStart | CueKind::LeadOut => {
                    if cue.lsn > lsn {
                        segment_start = last_start;
                        segment_pregap = last_pregap;
                        break;
                    }

                    last_start = cue.lsn;
                    last_pregap = cue.kind == CueKind::PregapStart;

                    if cue.kind == CueKind::TrackStart {
                        track_no += 1;
                    }
                }
                CueKind::SubIndex => (),
            }
        }

        let name = if segment_pregap {
            format!("{}_{:02}_pregap.img", self.img_base, track_no + 1)
        } else {
            format!("{}_{:02}.img", self.img_base, track_no)
        };

        (name, segment_start)
    }
}

impl ImageSink for CdrdaoSink {
    fn set_cuesheet(&mut self, cues: &[CueEntry]) -> VcdResult<()> {
        let toc = render_toc(cues, &self.img_base)?;
        self.cues = cues.to_vec();

        let mut f = File::create(&self.toc_path)?;
        f.write_all(toc.as_bytes())?;

        Ok(())
    }

    fn write_sector(&mut self, buf: &[u8; SECTOR_SIZE], lsn: u32) -> VcdResult<()> {
        let (name, start) = self.segment_for(lsn);

        let switch = match &self.current {
            Some((current_name, _, _)) => current_name != &name,
            None => true,
        };

        if switch {
            log::debug!("cdrdao sink: opening `{}`", name);

            let file = File::create(&name)?;
            self.current = Some((name, file, start));
        }

        let (_, file, start) = self.current.as_mut().unwrap();

        file.seek(SeekFrom::Start((lsn - *start) as u64 * SECTOR_SIZE as u64))?;
        file.write_all(buf)?;

        Ok(())
    }

    fn finish(&mut self) -> VcdResult<()> {
        if let Some((_, file, _)) = self.current.as_mut() {
            file.flush()?;
        }
        self.current = None;

        Ok(())
    }
}
