//! Playback control (PBC) compiler.
//!
//! A VCD 2.0 / SVCD player navigates the disc through two structures:
//! the PSD (Play Sequence Descriptor), a byte stream of play list,
//! selection list and end list descriptors cross-referencing each
//! other by offset, and the LOT (List ID Offset Table) mapping each
//! 16 bit list id to its PSD offset. The user describes the graph with
//! symbolic ids; compilation numbers the lists, resolves every
//! reference and emits both the base VCD 2.0 encoding (16 bit offsets)
//! and the extended 0.4 encoding (32 bit offsets) together with their
//! LOT indexes.
//!
//! Cycles between lists are perfectly legal; only dangling references
//! are errors.

use std::collections::BTreeMap;

use byteorder::{BigEndian, ByteOrder};

use crate::sector::M2F1_SIZE;
use crate::{VcdError, VcdResult};

/// LOT size in sectors, fixed by the VCD specification
pub const LOT_VCD_SIZE: u32 = 32;

/// Descriptor type tags
const PSD_TYPE_PLAY_LIST: u8 = 0x10;
const PSD_TYPE_SELECTION_LIST: u8 = 0x18;
const PSD_TYPE_EXT_SELECTION_LIST: u8 = 0x1a;
const PSD_TYPE_END_LIST: u8 = 0x1f;

/// "Unavailable" list offset in the base encoding
const OFS_NONE: u16 = 0xffff;
/// "Unavailable" list offset in the extended encoding
const OFS_NONE_EXT: u32 = 0xffff_ffff;

/// A play list: plays its items one after the other
#[derive(Clone, Debug, Default)]
pub struct PlayList {
    /// Symbolic id, unique across the whole disc
    pub id: String,
    /// List to go to on "previous"
    pub prev: Option<String>,
    /// List to go to on "next"
    pub next: Option<String>,
    /// List to go to on "return"
    pub return_to: Option<String>,
    /// Raw playing time descriptor value (0 plays each item fully)
    pub playing_time: u16,
    /// Seconds to wait after the list, -1 waits forever
    pub wait_time: i32,
    /// Seconds to wait after each item, -1 waits forever
    pub auto_pause_time: i32,
    /// Play item references (sequences, segments, entry points)
    pub items: Vec<String>,
}

/// Rectangular hot spot of an extended selection item
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectionArea {
    /// Upper left corner
    pub x1: u16,
    /// Upper left corner
    pub y1: u16,
    /// Lower right corner
    pub x2: u16,
    /// Lower right corner
    pub y2: u16,
}

/// A selection list: branches to one of its items on numeric input
#[derive(Clone, Debug, Default)]
pub struct Selection {
    /// Symbolic id, unique across the whole disc
    pub id: String,
    /// Base selection number (first key mapped to an item)
    pub bsn: u8,
    /// List to go to on "previous"
    pub prev: Option<String>,
    /// List to go to on "next"
    pub next: Option<String>,
    /// List to go to on "return"
    pub return_to: Option<String>,
    /// List selected when the timeout expires
    pub default_to: Option<String>,
    /// List to go to on timeout, if different from the default
    pub timeout_to: Option<String>,
    /// Seconds before the timeout fires, -1 waits forever
    pub timeout_time: i32,
    /// How often the selection loops its backdrop (0x7f = forever)
    pub loop_count: u8,
    /// Delay the jump until the current item finished playing
    pub jump_delayed: bool,
    /// Branch targets, one per selectable number
    pub items: Vec<String>,
}

/// A selection list carrying hot spot coordinates, only representable
/// in the extended PSD
#[derive(Clone, Debug, Default)]
pub struct ExtendedSelection {
    /// The plain selection fields
    pub base: Selection,
    /// One hot spot per item
    pub areas: Vec<SelectionArea>,
}

/// Terminates navigation, optionally handing over to another volume
#[derive(Clone, Debug, Default)]
pub struct EndList {
    /// Symbolic id, unique across the whole disc
    pub id: String,
    /// Volume to continue on (0 stops playback)
    pub next_disc: u8,
    /// Play item displayed when the end list is reached
    pub play_item: Option<String>,
}

/// One node of the playback control graph
#[derive(Clone, Debug)]
pub enum PbcNode {
    /// Sequential play list
    PlayList(PlayList),
    /// Numeric selection menu
    Selection(Selection),
    /// Selection with hot spot areas
    ExtendedSelection(ExtendedSelection),
    /// Navigation terminator
    EndList(EndList),
}

impl PbcNode {
    /// Symbolic id of the node
    pub fn id(&self) -> &str {
        match self {
            PbcNode::PlayList(p) => &p.id,
            PbcNode::Selection(s) => &s.id,
            PbcNode::ExtendedSelection(s) => &s.base.id,
            PbcNode::EndList(e) => &e.id,
        }
    }
}

/// Encode a wait time in seconds into the descriptor byte: 0-60 map
/// directly, longer waits are stored in 10 second steps, -1 becomes
/// the "wait forever" marker
fn encode_wait_time(seconds: i32) -> u8 {
    if seconds < 0 {
        return 255;
    }

    if seconds <= 60 {
        return seconds as u8;
    }

    let code = 60 + (seconds - 60) / 10;

    code.min(254) as u8
}

/// Result of a PBC compilation
pub struct CompiledPbc {
    /// Base (VCD 2.0) play sequence descriptor
    pub psd: Vec<u8>,
    /// Extended (0.4 format) play sequence descriptor
    pub psd_x: Vec<u8>,
    /// LOT for the base PSD, always `LOT_VCD_SIZE` sectors
    pub lot: Vec<u8>,
    /// LOT for the extended PSD
    pub lot_x: Vec<u8>,
    /// Highest list id in use
    pub max_lid: u16,
}

struct NodeLayout {
    lid: u16,
    /// Byte offset in the base PSD
    offset: u32,
    /// Byte offset in the extended PSD
    offset_x: u32,
}

/// Compiles the node list against `pin_map`, the unified symbol table
/// mapping sequence/segment/entry ids to their play item numbers.
pub struct PbcCompiler<'a> {
    nodes: &'a [PbcNode],
    pin_map: &'a BTreeMap<String, u16>,
    /// node id -> node index
    lists: BTreeMap<&'a str, usize>,
    layouts: Vec<NodeLayout>,
}

impl<'a> PbcCompiler<'a> {
    /// Create a compiler over `nodes`
    pub fn new(nodes: &'a [PbcNode], pin_map: &'a BTreeMap<String, u16>) -> PbcCompiler<'a> {
        PbcCompiler {
            nodes,
            pin_map,
            lists: BTreeMap::new(),
            layouts: Vec::new(),
        }
    }

    /// Run all three passes and emit the binary structures
    pub fn compile(mut self) -> VcdResult<CompiledPbc> {
        self.number()?;
        self.size();
        self.emit()
    }

    /// Pass 1: assign lids in declaration order and validate every
    /// cross reference
    fn number(&mut self) -> VcdResult<()> {
        for (n, node) in self.nodes.iter().enumerate() {
            // Uniqueness against the global table was checked by the
            // caller; here we only guard against two lists sharing an
            // id
            if self.lists.insert(node.id(), n).is_some() {
                return Err(VcdError::DuplicateId(node.id().to_string()));
            }
        }

        for node in self.nodes {
            match node {
                PbcNode::PlayList(p) => {
                    self.check_list_refs(&[&p.prev, &p.next, &p.return_to])?;

                    for item in &p.items {
                        if !self.pin_map.contains_key(item) {
                            return Err(VcdError::UnknownId(item.clone()));
                        }
                    }
                }
                PbcNode::Selection(s) | PbcNode::ExtendedSelection(ExtendedSelection { base: s, .. }) => {
                    self.check_selection(s)?;
                }
                PbcNode::EndList(e) => {
                    if let Some(item) = &e.play_item {
                        if !self.pin_map.contains_key(item) {
                            return Err(VcdError::UnknownId(item.clone()));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn check_selection(&self, s: &Selection) -> VcdResult<()> {
        self.check_list_refs(&[&s.prev, &s.next, &s.return_to, &s.default_to, &s.timeout_to])?;

        if s.items.len() > 99 {
            return Err(VcdError::Config(format!(
                "selection `{}` has {} items, at most 99 are allowed",
                s.id,
                s.items.len()
            )));
        }

        for item in &s.items {
            if !self.lists.contains_key(item.as_str()) {
                return Err(VcdError::UnknownId(item.clone()));
            }
        }

        // A selection branching to itself is only meaningful when its
        // default points there too
        let self_ref = s.items.iter().any(|i| *i == s.id);
        let default_self = s.default_to.as_deref() == Some(s.id.as_str());

        if self_ref && !default_self {
            return Err(VcdError::Config(format!(
                "selection `{}` points at itself without defaulting to itself",
                s.id
            )));
        }

        Ok(())
    }

    fn check_list_refs(&self, refs: &[&Option<String>]) -> VcdResult<()> {
        for r in refs {
            if let Some(id) = r {
                if !self.lists.contains_key(id.as_str()) {
                    return Err(VcdError::UnknownId(id.clone()));
                }
            }
        }

        Ok(())
    }

    /// Descriptor sizes in both encodings, each padded so descriptors
    /// start on the 8 byte grid the offsets are expressed in
    fn node_sizes(node: &PbcNode) -> (u32, u32) {
        let pad8 = |n: u32| (n + 7) & !7;

        match node {
            PbcNode::PlayList(p) => {
                let n = p.items.len() as u32;
                (pad8(14 + 2 * n), pad8(20 + 2 * n))
            }
            PbcNode::Selection(s) => {
                let n = s.items.len() as u32;
                (pad8(18 + 2 * n), pad8(28 + 4 * n))
            }
            PbcNode::ExtendedSelection(x) => {
                let n = x.base.items.len() as u32;
                (pad8(18 + 2 * n), pad8(28 + 4 * n + 8 * n))
            }
            PbcNode::EndList(_) => (8, 8),
        }
    }

    /// Pass 2: compute the offset of every descriptor in both
    /// encodings
    fn size(&mut self) {
        let mut offset = 0u32;
        let mut offset_x = 0u32;

        for (n, node) in self.nodes.iter().enumerate() {
            self.layouts.push(NodeLayout {
                lid: (n + 1) as u16,
                offset,
                offset_x,
            });

            let (sz, sz_x) = PbcCompiler::node_sizes(node);
            offset += sz;
            offset_x += sz_x;
        }
    }

    fn list_offset(&self, id: &Option<String>, extended: bool) -> u32 {
        match id {
            None => {
                if extended {
                    OFS_NONE_EXT
                } else {
                    OFS_NONE as u32
                }
            }
            Some(id) => {
                let n = self.lists[id.as_str()];
                let layout = &self.layouts[n];

                let byte_ofs = if extended {
                    layout.offset_x
                } else {
                    layout.offset
                };

                byte_ofs / 8
            }
        }
    }

    fn pin(&self, id: &str) -> u16 {
        self.pin_map[id]
    }

    /// Pass 3: serialize both PSDs and build the LOTs
    fn emit(self) -> VcdResult<CompiledPbc> {
        let mut psd = Vec::new();
        let mut psd_x = Vec::new();

        for (n, node) in self.nodes.iter().enumerate() {
            let layout = &self.layouts[n];

            debug_assert_eq!(psd.len() as u32, layout.offset);
            debug_assert_eq!(psd_x.len() as u32, layout.offset_x);

            self.emit_node(node, layout.lid, false, &mut psd);
            self.emit_node(node, layout.lid, true, &mut psd_x);
        }

        let lot = self.build_lot(false);
        let lot_x = self.build_lot(true);

        Ok(CompiledPbc {
            psd,
            psd_x,
            lot,
            lot_x,
            max_lid: self.nodes.len() as u16,
        })
    }

    fn put_u16(out: &mut Vec<u8>, v: u16) {
        let mut b = [0u8; 2];
        BigEndian::write_u16(&mut b, v);
        out.extend_from_slice(&b);
    }

    fn put_u32(out: &mut Vec<u8>, v: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, v);
        out.extend_from_slice(&b);
    }

    fn put_ofs(&self, out: &mut Vec<u8>, id: &Option<String>, extended: bool) {
        let ofs = self.list_offset(id, extended);

        if extended {
            PbcCompiler::put_u32(out, ofs);
        } else {
            PbcCompiler::put_u16(out, ofs as u16);
        }
    }

    fn emit_node(&self, node: &PbcNode, lid: u16, extended: bool, out: &mut Vec<u8>) {
        let start = out.len();

        match node {
            PbcNode::PlayList(p) => {
                out.push(PSD_TYPE_PLAY_LIST);
                out.push(p.items.len() as u8);
                PbcCompiler::put_u16(out, lid);
                self.put_ofs(out, &p.prev, extended);
                self.put_ofs(out, &p.next, extended);
                self.put_ofs(out, &p.return_to, extended);
                PbcCompiler::put_u16(out, p.playing_time);
                out.push(encode_wait_time(p.wait_time));
                out.push(encode_wait_time(p.auto_pause_time));

                for item in &p.items {
                    PbcCompiler::put_u16(out, self.pin(item));
                }
            }
            PbcNode::Selection(s) => {
                self.emit_selection(s, None, lid, extended, out);
            }
            PbcNode::ExtendedSelection(x) => {
                let areas = if extended { Some(&x.areas) } else { None };
                self.emit_selection(&x.base, areas, lid, extended, out);
            }
            PbcNode::EndList(e) => {
                out.push(PSD_TYPE_END_LIST);
                out.push(0);
                PbcCompiler::put_u16(out, lid);
                out.push(e.next_disc);

                let pin = e.play_item.as_deref().map_or(0, |i| self.pin(i));
                PbcCompiler::put_u16(out, pin);
                out.push(0);
            }
        }

        // Pad to the 8 byte offset grid
        let (sz, sz_x) = PbcCompiler::node_sizes(node);
        let size = if extended { sz_x } else { sz };
        out.resize(start + size as usize, 0);
    }

    fn emit_selection(
        &self,
        s: &Selection,
        areas: Option<&Vec<SelectionArea>>,
        lid: u16,
        extended: bool,
        out: &mut Vec<u8>,
    ) {
        let ext_areas = areas.map_or(false, |a| !a.is_empty());

        out.push(if ext_areas {
            PSD_TYPE_EXT_SELECTION_LIST
        } else {
            PSD_TYPE_SELECTION_LIST
        });
        out.push(0); // flags
        out.push(s.items.len() as u8);
        out.push(s.bsn);
        PbcCompiler::put_u16(out, lid);
        self.put_ofs(out, &s.prev, extended);
        self.put_ofs(out, &s.next, extended);
        self.put_ofs(out, &s.return_to, extended);
        self.put_ofs(out, &s.default_to, extended);
        self.put_ofs(out, &s.timeout_to, extended);
        out.push(encode_wait_time(s.timeout_time));
        out.push((s.loop_count & 0x7f) | if s.jump_delayed { 0x80 } else { 0 });

        for item in &s.items {
            self.put_ofs(out, &Some(item.clone()), extended);
        }

        if let Some(areas) = areas {
            for area in areas {
                PbcCompiler::put_u16(out, area.x1);
                PbcCompiler::put_u16(out, area.y1);
                PbcCompiler::put_u16(out, area.x2);
                PbcCompiler::put_u16(out, area.y2);
            }
        }
    }

    /// The LOT is a fixed 32 sector array of big-endian 16 bit words:
    /// word 0 is reserved, word `lid` holds that list's offset on the
    /// 8 byte grid, unused entries are 0xffff
    fn build_lot(&self, extended: bool) -> Vec<u8> {
        let mut lot = vec![0xffu8; (LOT_VCD_SIZE as usize) * M2F1_SIZE];

        BigEndian::write_u16(&mut lot[0..2], 0);

        for layout in &self.layouts {
            let byte_ofs = if extended {
                layout.offset_x
            } else {
                layout.offset
            };

            let word = layout.lid as usize * 2;
            BigEndian::write_u16(&mut lot[word..word + 2], (byte_ofs / 8) as u16);
        }

        lot
    }
}
