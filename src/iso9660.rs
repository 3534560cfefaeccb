//! ISO9660 filesystem builder.
//!
//! The ISO track of a (S)VCD is a tiny, strictly shaped ISO9660
//! filesystem: a primary volume descriptor at LSN 16, the terminator at
//! 17, then the directory records and both path tables. This module
//! builds the directory tree in memory, validates pathnames against
//! the d-character rules and serializes the records with the CD-ROM XA
//! extension attributes every (S)VCD player expects.
//!
//! Recording timestamps are deliberately zeroed: the same disc object
//! must serialize to the same bytes on every run.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::sector::M2F1_SIZE;
use crate::{VcdError, VcdResult};

bitflags::bitflags! {
    /// XA attribute word carried by every directory record
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XaAttributes: u16 {
        /// Owner read
        const U_READ = 1 << 0;
        /// Owner execute
        const U_EXEC = 1 << 2;
        /// Group read
        const G_READ = 1 << 4;
        /// Group execute
        const G_EXEC = 1 << 6;
        /// World read
        const O_READ = 1 << 8;
        /// World execute
        const O_EXEC = 1 << 10;
        /// Mode 2 form 1 sectors
        const MODE2_FORM1 = 1 << 11;
        /// Mode 2 form 2 sectors
        const MODE2_FORM2 = 1 << 12;
        /// Interleaved file
        const INTERLEAVED = 1 << 13;
        /// CD-DA audio
        const CDDA = 1 << 14;
        /// Directory
        const DIRECTORY = 1 << 15;
    }
}

impl XaAttributes {
    /// Read and execute for everybody
    pub fn all_perms() -> XaAttributes {
        XaAttributes::U_READ
            | XaAttributes::U_EXEC
            | XaAttributes::G_READ
            | XaAttributes::G_EXEC
            | XaAttributes::O_READ
            | XaAttributes::O_EXEC
    }
}

/// Append the 14 byte big-endian XA record to a directory record
fn put_xa_record(buf: &mut [u8], attributes: XaAttributes, filenum: u8) {
    BigEndian::write_u16(&mut buf[0..2], 0); // user id
    BigEndian::write_u16(&mut buf[2..4], 0); // group id
    BigEndian::write_u16(&mut buf[4..6], attributes.bits());
    buf[6] = b'X';
    buf[7] = b'A';
    buf[8] = filenum;
    // 5 reserved bytes stay zero
}

const XA_RECORD_SIZE: usize = 14;

/// Returns true for the characters allowed in ISO9660 identifiers
fn is_dchar(c: u8) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_'
}

fn valid_component(name: &str, is_file: bool) -> bool {
    if name.is_empty() {
        return false;
    }

    if is_file {
        let (base, ext) = match name.split_once('.') {
            Some((b, e)) => (b, Some(e)),
            None => (name, None),
        };

        if base.is_empty() || base.len() > 8 || !base.bytes().all(is_dchar) {
            return false;
        }

        match ext {
            Some(e) => !e.is_empty() && e.len() <= 3 && e.bytes().all(is_dchar),
            None => true,
        }
    } else {
        name.len() <= 8 && name.bytes().all(is_dchar)
    }
}

/// Validate a full iso pathname (`DIR/SUB/FILE.EXT`, no version
/// number). The last component is checked with the file rules when
/// `is_file` is set.
pub fn validate_iso_path(path: &str, is_file: bool) -> VcdResult<()> {
    if path.is_empty() || path.len() > 255 {
        return Err(VcdError::InvalidIsoPath(path.to_string()));
    }

    let components: Vec<&str> = path.split('/').collect();

    for (n, component) in components.iter().enumerate() {
        let last = n + 1 == components.len();

        if !valid_component(component, is_file && last) {
            return Err(VcdError::InvalidIsoPath(path.to_string()));
        }
    }

    Ok(())
}

struct FileEntry {
    name: String,
    extent: u32,
    size: u32,
    form2: bool,
    filenum: u8,
}

struct DirNode {
    name: String,
    children: Vec<DirNode>,
    files: Vec<FileEntry>,
    /// Assigned by `layout`
    extent: u32,
    /// Assigned by `layout`, in sectors
    sectors: u32,
}

impl DirNode {
    fn new(name: &str) -> DirNode {
        DirNode {
            name: name.to_string(),
            children: Vec::new(),
            files: Vec::new(),
            extent: 0,
            sectors: 0,
        }
    }

    fn find_child(&mut self, name: &str) -> Option<&mut DirNode> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// Directory record length for an identifier of `name_len` bytes
    fn record_len(name_len: usize) -> usize {
        let mut len = 33 + name_len;

        if len % 2 != 0 {
            len += 1;
        }

        len + XA_RECORD_SIZE
    }

    /// Byte size of this directory's record area, honoring the rule
    /// that a record never crosses a sector boundary
    fn content_size(&self) -> usize {
        // Self and parent records
        let mut offset = 2 * DirNode::record_len(1);

        let mut names: Vec<&str> = self
            .children
            .iter()
            .map(|c| c.name.as_str())
            .chain(self.files.iter().map(|f| f.name.as_str()))
            .collect();
        names.sort_unstable();

        for name in names {
            let len = DirNode::record_len(name.len());

            if M2F1_SIZE - (offset % M2F1_SIZE) < len {
                offset = (offset / M2F1_SIZE + 1) * M2F1_SIZE;
            }

            offset += len;
        }

        offset
    }

    fn content_sectors(&self) -> u32 {
        self.content_size().div_ceil(M2F1_SIZE) as u32
    }
}

/// In-memory directory tree of the ISO track.
pub struct IsoDirectory {
    root: DirNode,
}

impl Default for IsoDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl IsoDirectory {
    /// Create a tree holding only the root directory
    pub fn new() -> IsoDirectory {
        IsoDirectory {
            root: DirNode::new(""),
        }
    }

    fn node_for_path(&mut self, components: &[&str]) -> VcdResult<&mut DirNode> {
        let mut node = &mut self.root;

        for c in components {
            node = node
                .find_child(c)
                .ok_or_else(|| VcdError::Config(format!("no such directory `{}`", c)))?;
        }

        Ok(node)
    }

    /// Create the directory `path`. The parent must already exist.
    pub fn mkdir(&mut self, path: &str) -> VcdResult<()> {
        validate_iso_path(path, false)?;

        let components: Vec<&str> = path.split('/').collect();
        let (name, parents) = components.split_last().unwrap();

        let node = self.node_for_path(parents)?;

        if node.find_child(name).is_some() || node.files.iter().any(|f| &f.name == name) {
            return Err(VcdError::Config(format!("`{}` already exists", path)));
        }

        node.children.push(DirNode::new(name));

        Ok(())
    }

    /// Register the file `path` (including its `;1` version suffix)
    /// living at `extent` and spanning `size` bytes. `form2` selects
    /// the XA form 2 attribute used for real-time MPEG data; `filenum`
    /// is replicated into the XA record.
    pub fn mkfile(
        &mut self,
        path: &str,
        extent: u32,
        size: u32,
        form2: bool,
        filenum: u8,
    ) -> VcdResult<()> {
        let bare = path.strip_suffix(";1").unwrap_or(path);
        validate_iso_path(bare, true)?;

        let components: Vec<&str> = path.split('/').collect();
        let (name, parents) = components.split_last().unwrap();

        let node = self.node_for_path(parents)?;

        if node.files.iter().any(|f| &f.name == name) || node.find_child(name).is_some() {
            return Err(VcdError::Config(format!("`{}` already exists", path)));
        }

        node.files.push(FileEntry {
            name: name.to_string(),
            extent,
            size,
            form2,
            filenum,
        });

        Ok(())
    }

    /// Sector count needed for all directory record areas (the path
    /// tables are not included)
    pub fn get_size(&self) -> u32 {
        let mut total = 0;

        let mut stack = vec![&self.root];
        while let Some(dir) = stack.pop() {
            total += dir.content_sectors();
            stack.extend(dir.children.iter());
        }

        total
    }

    /// Assign directory extents depth-first from `base_extent`
    fn layout(&mut self, base_extent: u32) {
        fn assign(dir: &mut DirNode, next: &mut u32) {
            dir.extent = *next;
            dir.sectors = dir.content_sectors();
            *next += dir.sectors;

            dir.children.sort_by(|a, b| a.name.cmp(&b.name));

            for child in dir.children.iter_mut() {
                assign(child, next);
            }
        }

        let mut next = base_extent;
        assign(&mut self.root, &mut next);
    }

    /// Serialize all directory records into `buf` (which must span
    /// `get_size()` sectors), assigning directory extents starting at
    /// `base_extent`. The first 34 bytes of `buf` end up holding the
    /// root directory record needed by the volume descriptor.
    pub fn dump_entries(&mut self, buf: &mut [u8], base_extent: u32) {
        self.layout(base_extent);

        fn put_record(
            buf: &mut [u8],
            offset: &mut usize,
            name: &[u8],
            extent: u32,
            size: u32,
            is_dir: bool,
            form2: bool,
            filenum: u8,
        ) {
            let len = DirNode::record_len(name.len());

            if M2F1_SIZE - (*offset % M2F1_SIZE) < len {
                *offset = (*offset / M2F1_SIZE + 1) * M2F1_SIZE;
            }

            let rec = &mut buf[*offset..*offset + len];

            rec[0] = len as u8;
            rec[1] = 0; // extended attribute length
            LittleEndian::write_u32(&mut rec[2..6], extent);
            BigEndian::write_u32(&mut rec[6..10], extent);
            LittleEndian::write_u32(&mut rec[10..14], size);
            BigEndian::write_u32(&mut rec[14..18], size);
            // 7 recording date bytes stay zero
            rec[25] = if is_dir { 0x02 } else { 0x00 };
            rec[26] = 0; // file unit size
            rec[27] = 0; // interleave gap
            LittleEndian::write_u16(&mut rec[28..30], 1);
            BigEndian::write_u16(&mut rec[30..32], 1);
            rec[32] = name.len() as u8;
            rec[33..33 + name.len()].copy_from_slice(name);

            let xa_offset = len - XA_RECORD_SIZE;
            let mut attributes = XaAttributes::all_perms();

            attributes |= if is_dir {
                XaAttributes::DIRECTORY
            } else if form2 {
                XaAttributes::MODE2_FORM2
            } else {
                XaAttributes::MODE2_FORM1
            };

            put_xa_record(&mut rec[xa_offset..], attributes, filenum);

            *offset += len;
        }

        fn dump_dir(dir: &DirNode, parent: &DirNode, buf: &mut [u8], base_extent: u32) {
            let start = ((dir.extent - base_extent) as usize) * M2F1_SIZE;
            let mut offset = start;

            let dir_bytes = |d: &DirNode| d.sectors * M2F1_SIZE as u32;

            // Self and parent entries
            put_record(
                buf,
                &mut offset,
                &[0x00],
                dir.extent,
                dir_bytes(dir),
                true,
                false,
                0,
            );
            put_record(
                buf,
                &mut offset,
                &[0x01],
                parent.extent,
                dir_bytes(parent),
                true,
                false,
                0,
            );

            // Children in sorted name order, directories and files
            // interleaved
            enum Entry<'a> {
                Dir(&'a DirNode),
                File(&'a FileEntry),
            }

            let mut entries: Vec<Entry> = dir
                .children
                .iter()
                .map(Entry::Dir)
                .chain(dir.files.iter().map(Entry::File))
                .collect();

            entries.sort_by(|a, b| {
                let name = |e: &Entry| match e {
                    Entry::Dir(d) => d.name.clone(),
                    Entry::File(f) => f.name.clone(),
                };
                name(a).cmp(&name(b))
            });

            for entry in &entries {
                match entry {
                    Entry::Dir(d) => put_record(
                        buf,
                        &mut offset,
                        d.name.as_bytes(),
                        d.extent,
                        dir_bytes(d),
                        true,
                        false,
                        0,
                    ),
                    Entry::File(f) => put_record(
                        buf,
                        &mut offset,
                        f.name.as_bytes(),
                        f.extent,
                        f.size,
                        false,
                        f.form2,
                        f.filenum,
                    ),
                }
            }

            for child in dir.children.iter() {
                dump_dir(child, dir, buf, base_extent);
            }
        }

        let root = &self.root;
        dump_dir(root, root, buf, base_extent);
    }

    /// Number every directory in path table order (breadth first,
    /// children sorted) and return `(dir, parent_number)` pairs
    fn path_table_order(&self) -> Vec<(&DirNode, u16)> {
        let mut out: Vec<(&DirNode, u16)> = vec![(&self.root, 1)];
        let mut cursor = 0;

        while cursor < out.len() {
            let (dir, _) = out[cursor];
            let own_number = (cursor + 1) as u16;

            // Children were sorted during layout
            for child in dir.children.iter() {
                out.push((child, own_number));
            }

            cursor += 1;
        }

        out
    }

    /// Byte size of one path table
    pub fn pathtable_size(&self) -> u32 {
        self.path_table_order()
            .iter()
            .map(|(d, _)| {
                let name_len = d.name.len().max(1);
                (8 + name_len + name_len % 2) as u32
            })
            .sum()
    }

    /// Serialize the little-endian and big-endian path tables. Must be
    /// called after `dump_entries` (the directory extents are assigned
    /// there).
    pub fn dump_pathtables(&self, l_buf: &mut [u8], m_buf: &mut [u8]) {
        let mut offset = 0;

        for (dir, parent) in self.path_table_order() {
            let name: &[u8] = if dir.name.is_empty() {
                &[0x00]
            } else {
                dir.name.as_bytes()
            };

            let len = 8 + name.len() + name.len() % 2;

            let l = &mut l_buf[offset..offset + len];
            l[0] = name.len() as u8;
            l[1] = 0;
            LittleEndian::write_u32(&mut l[2..6], dir.extent);
            LittleEndian::write_u16(&mut l[6..8], parent);
            l[8..8 + name.len()].copy_from_slice(name);

            let m = &mut m_buf[offset..offset + len];
            m[0] = name.len() as u8;
            m[1] = 0;
            BigEndian::write_u32(&mut m[2..6], dir.extent);
            BigEndian::write_u16(&mut m[6..8], parent);
            m[8..8 + name.len()].copy_from_slice(name);

            offset += len;
        }
    }
}

fn put_str_pad(buf: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(buf.len());

    buf[..n].copy_from_slice(&bytes[..n]);
    buf[n..].fill(b' ');
}

/// All-zero "unspecified" ISO9660 long form date
fn put_zero_date(buf: &mut [u8]) {
    buf[..16].fill(b'0');
    buf[16] = 0;
}

/// Fill in the Primary Volume Descriptor. `dir_buf` is the serialized
/// directory area (its first 34 bytes are the root directory record).
#[allow(clippy::too_many_arguments)]
pub fn set_iso_pvd(
    pvd: &mut [u8],
    volume_id: &str,
    application_id: &str,
    iso_size: u32,
    dir_buf: &[u8],
    ptl_sector: u32,
    ptm_sector: u32,
    pathtable_size: u32,
    volume_count: u16,
    volume_number: u16,
) {
    assert!(pvd.len() >= M2F1_SIZE);

    pvd[0] = 1; // volume descriptor type
    pvd[1..6].copy_from_slice(b"CD001");
    pvd[6] = 1; // descriptor version

    put_str_pad(&mut pvd[8..40], "CD-RTOS CD-BRIDGE");
    put_str_pad(&mut pvd[40..72], volume_id);

    LittleEndian::write_u32(&mut pvd[80..84], iso_size);
    BigEndian::write_u32(&mut pvd[84..88], iso_size);

    LittleEndian::write_u16(&mut pvd[120..122], volume_count);
    BigEndian::write_u16(&mut pvd[122..124], volume_count);
    LittleEndian::write_u16(&mut pvd[124..126], volume_number.max(1));
    BigEndian::write_u16(&mut pvd[126..128], volume_number.max(1));
    LittleEndian::write_u16(&mut pvd[128..130], M2F1_SIZE as u16);
    BigEndian::write_u16(&mut pvd[130..132], M2F1_SIZE as u16);

    LittleEndian::write_u32(&mut pvd[132..136], pathtable_size);
    BigEndian::write_u32(&mut pvd[136..140], pathtable_size);
    LittleEndian::write_u32(&mut pvd[140..144], ptl_sector);
    BigEndian::write_u32(&mut pvd[148..152], ptm_sector);

    pvd[156..190].copy_from_slice(&dir_buf[0..34]);

    put_str_pad(&mut pvd[190..318], ""); // volume set id
    put_str_pad(&mut pvd[318..446], ""); // publisher
    put_str_pad(&mut pvd[446..574], ""); // data preparer
    put_str_pad(&mut pvd[574..702], application_id);
    put_str_pad(&mut pvd[702..739], ""); // copyright file
    put_str_pad(&mut pvd[739..776], ""); // abstract file
    put_str_pad(&mut pvd[776..813], ""); // bibliographic file

    put_zero_date(&mut pvd[813..830]);
    put_zero_date(&mut pvd[830..847]);
    put_zero_date(&mut pvd[847..864]);
    put_zero_date(&mut pvd[864..881]);

    pvd[881] = 1; // file structure version

    // CD-ROM XA identifying signature
    pvd[1024..1032].copy_from_slice(b"CD-XA001");
}

/// Fill in the Volume Descriptor Set Terminator
pub fn set_iso_evd(evd: &mut [u8]) {
    assert!(evd.len() >= M2F1_SIZE);

    evd[0] = 255;
    evd[1..6].copy_from_slice(b"CD001");
    evd[6] = 1;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(validate_iso_path("VCD/INFO.VCD", true).is_ok());
        assert!(validate_iso_path("vcd/info.vcd", true).is_err());
        assert!(validate_iso_path("MPEGAV/AVSEQ01.DAT", true).is_ok());
        assert!(validate_iso_path("SEGMENT", false).is_ok());
        assert!(validate_iso_path("TOOLONGNAME", false).is_err());
        assert!(validate_iso_path("DIR/BASENAME9.EXT", true).is_err());
        assert!(validate_iso_path("A/B.TOOL", true).is_err());
        assert!(validate_iso_path("", false).is_err());
        assert!(validate_iso_path("X Y", false).is_err());
    }

    fn sample_tree() -> IsoDirectory {
        let mut dir = IsoDirectory::new();

        dir.mkdir("MPEGAV").unwrap();
        dir.mkdir("VCD").unwrap();
        dir.mkfile("VCD/INFO.VCD;1", 150, 2048, false, 0).unwrap();
        dir.mkfile("VCD/ENTRIES.VCD;1", 151, 2048, false, 0).unwrap();
        dir.mkfile("MPEGAV/AVSEQ01.DAT;1", 330, 1000 * 2048, true, 1)
            .unwrap();

        dir
    }

    #[test]
    fn tree_building() {
        let mut dir = sample_tree();

        assert!(dir.mkdir("VCD").is_err());
        assert!(dir.mkfile("NODIR/X.Y;1", 0, 0, false, 0).is_err());
        assert!(dir.mkfile("VCD/INFO.VCD;1", 150, 2048, false, 0).is_err());

        // Root, MPEGAV and VCD all fit one sector each
        assert!(dir.get_size() == 3);
    }

    #[test]
    fn entry_serialization() {
        let mut dir = sample_tree();

        let sectors = dir.get_size() as usize;
        let mut buf = vec![0u8; sectors * M2F1_SIZE];

        dir.dump_entries(&mut buf, 18);

        // Root record: extent 18, directory flag set
        assert!(buf[0] as usize == DirNode::record_len(1));
        assert!(LittleEndian::read_u32(&buf[2..6]) == 18);
        assert!(BigEndian::read_u32(&buf[6..10]) == 18);
        assert!(buf[25] == 0x02);
        assert!(buf[32] == 1);
        assert!(buf[33] == 0x00);

        // XA signature is in place
        let xa = DirNode::record_len(1) - XA_RECORD_SIZE;
        assert!(buf[xa + 6] == b'X' && buf[xa + 7] == b'A');

        // MPEGAV sorts before VCD and lands at extent 19
        let mpegav_rec_start = 2 * DirNode::record_len(1);
        let name_ofs = mpegav_rec_start + 33;
        assert!(&buf[name_ofs..name_ofs + 6] == b"MPEGAV");
        assert!(LittleEndian::read_u32(&buf[mpegav_rec_start + 2..mpegav_rec_start + 6]) == 19);
    }

    #[test]
    fn path_tables() {
        let mut dir = sample_tree();

        let sectors = dir.get_size() as usize;
        let mut buf = vec![0u8; sectors * M2F1_SIZE];
        dir.dump_entries(&mut buf, 18);

        let size = dir.pathtable_size() as usize;
        // Root (10) + MPEGAV (14) + VCD (12 after padding)
        assert!(size == 10 + 14 + 12);

        let mut l = vec![0u8; size];
        let mut m = vec![0u8; size];
        dir.dump_pathtables(&mut l, &mut m);

        // Root entry
        assert!(l[0] == 1);
        assert!(LittleEndian::read_u32(&l[2..6]) == 18);
        assert!(LittleEndian::read_u16(&l[6..8]) == 1);
        assert!(BigEndian::read_u32(&m[2..6]) == 18);

        // First child is MPEGAV, parented to root
        assert!(l[10] == 6);
        assert!(&l[18..24] == b"MPEGAV");
        assert!(LittleEndian::read_u16(&l[16..18]) == 1);
    }

    #[test]
    fn pvd_fields() {
        let mut dir = sample_tree();

        let sectors = dir.get_size() as usize;
        let mut buf = vec![0u8; sectors * M2F1_SIZE];
        dir.dump_entries(&mut buf, 18);

        let mut pvd = vec![0u8; M2F1_SIZE];
        set_iso_pvd(&mut pvd, "MYDISC", "VCDAUTHOR", 300, &buf, 21, 22, dir.pathtable_size(), 1, 1);

        assert!(pvd[0] == 1);
        assert!(&pvd[1..6] == b"CD001");
        assert!(&pvd[40..46] == b"MYDISC");
        assert!(LittleEndian::read_u32(&pvd[80..84]) == 300);
        assert!(BigEndian::read_u32(&pvd[84..88]) == 300);
        assert!(LittleEndian::read_u32(&pvd[140..144]) == 21);
        assert!(BigEndian::read_u32(&pvd[148..152]) == 22);
        assert!(&pvd[1024..1032] == b"CD-XA001");

        // Root record got copied in
        assert!(pvd[156] == buf[0]);

        let mut evd = vec![0u8; M2F1_SIZE];
        set_iso_evd(&mut evd);
        assert!(evd[0] == 255);
        assert!(&evd[1..6] == b"CD001");
    }
}
