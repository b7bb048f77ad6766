#![forbid(unsafe_code)]

use e2r_types::{
    BlockNumber, EXT2_DIND_BLOCK, EXT2_DIR_ENTRY_HEADER_LEN, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GOOD_OLD_REV, EXT2_GROUP_DESC_SIZE, EXT2_IND_BLOCK, EXT2_N_BLOCKS, EXT2_NDIR_BLOCKS,
    EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_SIZE, GroupNumber,
    InodeNumber, ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG,
    S_IFSOCK, ext2_block_size_from_log, inode_index_in_group, inode_to_group,
    read_fixed, read_le_u16, read_le_u32, read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision ─────────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,
    /// First non-reserved inode (revision >= 1 only; 11 for revision 0).
    pub first_ino: u32,
    /// Raw `s_inode_size` (only meaningful for revision >= 1).
    pub raw_inode_size: u16,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub feature_ro_compat: u32,

    // ── State & timestamps ───────────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
}

/// Where an inode lives: owning group, slot within the group, byte offset
/// within that group's inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeLocation {
    pub group: GroupNumber,
    pub index: u32,
    pub offset_in_table: u64,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from a 1024-byte superblock region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT2_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = ext2_block_size_from_log(log_block_size) else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };

        let rev_level = read_le_u32(region, 0x4C)?;
        let (first_ino, raw_inode_size) = if rev_level == EXT2_GOOD_OLD_REV {
            (11, EXT2_GOOD_OLD_INODE_SIZE)
        } else {
            (read_le_u32(region, 0x54)?, read_le_u16(region, 0x58)?)
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,

            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            rev_level,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,
            first_ino,
            raw_inode_size,

            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            feature_ro_compat: read_le_u32(region, 0x64)?,

            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
        })
    }

    /// On-disk inode record size (128 for revision 0 images).
    #[must_use]
    pub fn inode_size(&self) -> u16 {
        if self.rev_level == EXT2_GOOD_OLD_REV {
            EXT2_GOOD_OLD_INODE_SIZE
        } else {
            self.raw_inode_size
        }
    }

    /// Number of block groups: `ceil((blocks_count - first_data_block) / blocks_per_group)`.
    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(self.first_data_block)
            .div_ceil(self.blocks_per_group)
    }

    /// Block holding the first group descriptor (the block after the superblock).
    #[must_use]
    pub fn group_desc_table_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.first_data_block) + 1)
    }

    /// Compute the byte offset of a group descriptor within the image.
    #[must_use]
    pub fn group_desc_offset(&self, group: GroupNumber) -> Option<u64> {
        let table_start = self
            .group_desc_table_block()
            .0
            .checked_mul(u64::from(self.block_size))?;
        let desc_offset = u64::from(group.0).checked_mul(EXT2_GROUP_DESC_SIZE as u64)?;
        table_start.checked_add(desc_offset)
    }

    /// Validate geometry: non-zero counts, supported block size, inode size,
    /// and cross-field consistency.
    ///
    /// `inodes_per_group == 0` would later divide by zero in inode
    /// location math, so it is rejected here explicitly.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.inodes_count == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "cannot be zero",
            });
        }
        if self.blocks_count == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "cannot be zero",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if !matches!(self.block_size, 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "unsupported block size (1K/2K/4K only)",
            });
        }

        // Bitmaps are one block each, so a group cannot track more than
        // block_size * 8 blocks or inodes.
        let bitmap_bits = self.block_size.saturating_mul(8);
        if self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "exceeds block_size * 8 (inode bitmap capacity)",
            });
        }

        let inode_size = self.inode_size();
        if inode_size < EXT2_GOOD_OLD_INODE_SIZE || !inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        if u32::from(inode_size) > self.block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }

        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        let expected_first = u32::from(self.block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K blocks and 0 otherwise",
            });
        }

        let groups = self.groups_count();
        let max_inodes = u64::from(groups).saturating_mul(u64::from(self.inodes_per_group));
        if u64::from(self.inodes_count) > max_inodes {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inodes_count exceeds groups * inodes_per_group",
            });
        }

        let gdt_end = self
            .group_desc_offset(GroupNumber(groups))
            .unwrap_or(u64::MAX);
        let device_bytes = u64::from(self.blocks_count).saturating_mul(u64::from(self.block_size));
        if gdt_end > device_bytes {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "group descriptor table extends beyond filesystem",
            });
        }

        Ok(())
    }

    /// Locate an inode: `(ino - 1) / inodes_per_group` selects the group and
    /// `(ino - 1) % inodes_per_group` the slot in that group's inode table.
    pub fn locate_inode(&self, ino: InodeNumber) -> Result<InodeLocation, ParseError> {
        if ino.is_null() {
            return Err(ParseError::InvalidField {
                field: "inode_number",
                reason: "inode 0 is reserved",
            });
        }
        if ino.0 > self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "inode_number",
                reason: "inode number exceeds s_inodes_count",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }

        let group = inode_to_group(ino, self.inodes_per_group);
        let index = inode_index_in_group(ino, self.inodes_per_group);
        Ok(InodeLocation {
            group,
            index,
            offset_in_table: u64::from(index) * u64::from(self.inode_size()),
        })
    }

    /// Absolute byte offset of a located inode given its group's inode table block.
    pub fn inode_device_offset(
        &self,
        loc: &InodeLocation,
        inode_table: u32,
    ) -> Result<u64, ParseError> {
        u64::from(inode_table)
            .checked_mul(u64::from(self.block_size))
            .and_then(|start| start.checked_add(loc.offset_in_table))
            .ok_or(ParseError::InvalidField {
                field: "bg_inode_table",
                reason: "overflow computing inode byte offset",
            })
    }
}

// ── Group descriptor ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT2_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    /// File size in bytes. For regular files the high 32 bits come from
    /// `i_size_high` (`i_dir_acl` on revision 0).
    pub size: u64,
    pub links_count: u16,
    /// 512-byte sectors allocated to the inode.
    pub sectors: u32,
    pub flags: u32,
    pub generation: u32,
    pub file_acl: u32,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    /// `i_block`: 12 direct, one single-, double- and triple-indirect pointer.
    pub block: [u32; EXT2_N_BLOCKS],
}

impl Ext2Inode {
    /// Parse an ext2 inode from raw bytes (at least the 128-byte base record).
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let base = usize::from(EXT2_GOOD_OLD_INODE_SIZE);
        if bytes.len() < base {
            return Err(ParseError::InsufficientData {
                needed: base,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mode = read_le_u16(bytes, 0x00)?;
        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        let size_hi = u64::from(read_le_u32(bytes, 0x6C)?);
        let size = if mode & S_IFMT == S_IFREG {
            size_lo | (size_hi << 32)
        } else {
            size_lo
        };

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (slot, ptr) in block.iter_mut().enumerate() {
            *ptr = read_le_u32(bytes, 0x28 + slot * 4)?;
        }

        Ok(Self {
            mode,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size,
            links_count: read_le_u16(bytes, 0x1A)?,
            sectors: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            generation: read_le_u32(bytes, 0x64)?,
            file_acl: read_le_u32(bytes, 0x68)?,

            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,

            block,
        })
    }

    /// Extract the file type bits from the mode field.
    #[must_use]
    pub fn file_type_mode(&self) -> u16 {
        self.mode & S_IFMT
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.file_type_mode() == S_IFREG
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.file_type_mode() == S_IFDIR
    }

    #[must_use]
    pub fn kind(&self) -> Ext2FileType {
        Ext2FileType::from_mode(self.mode)
    }

    /// The 12 direct block pointers.
    #[must_use]
    pub fn direct_blocks(&self) -> &[u32] {
        &self.block[..EXT2_NDIR_BLOCKS]
    }

    #[must_use]
    pub fn single_indirect(&self) -> u32 {
        self.block[EXT2_IND_BLOCK]
    }

    #[must_use]
    pub fn double_indirect(&self) -> u32 {
        self.block[EXT2_DIND_BLOCK]
    }
}

// ── Indirect blocks ─────────────────────────────────────────────────────────

/// Read pointer `index` from an indirect block's array of little-endian u32s.
pub fn indirect_pointer(block: &[u8], index: u32) -> Result<u32, ParseError> {
    let offset = usize::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(4))
        .ok_or(ParseError::IntegerConversion {
            field: "indirect_index",
        })?;
    read_le_u32(block, offset)
}

// ── Directory entry parsing ─────────────────────────────────────────────────

/// File type as recorded in a directory entry or derived from an inode mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// A parsed directory entry (`ext2_dir_entry_2`) with an owned name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    /// Exactly `name_len` bytes; never NUL-terminated.
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// A borrowed directory entry (zero-copy reference into the block buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2DirEntryRef<'a> {
    /// Byte offset of this record within its block.
    pub offset: usize,
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: &'a [u8],
}

impl Ext2DirEntryRef<'_> {
    /// Convert to an owned [`Ext2DirEntry`] (copies exactly `name_len` bytes).
    #[must_use]
    pub fn to_owned(&self) -> Ext2DirEntry {
        Ext2DirEntry {
            inode: self.inode,
            rec_len: self.rec_len,
            name_len: self.name_len,
            file_type: self.file_type,
            name: self.name.to_vec(),
        }
    }
}

/// Iterator over the live entries of one directory block.
///
/// Yields `Result<Ext2DirEntryRef<'a>, ParseError>`. Records with inode 0
/// are unused slots (deleted entries, trailing padding) and are skipped.
/// The record chain is advanced by `rec_len`; a zero, unaligned, or
/// boundary-crossing `rec_len` ends iteration with an error, so a corrupt
/// block can never loop forever or read past its end.
#[derive(Debug, Clone)]
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DirBlockIter<'a> {
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            done: false,
        }
    }

    fn decode_next(&mut self) -> Result<Option<Ext2DirEntryRef<'a>>, ParseError> {
        while self.offset + EXT2_DIR_ENTRY_HEADER_LEN <= self.block.len() {
            let offset = self.offset;
            let inode = read_le_u32(self.block, offset)?;
            let rec_len = read_le_u16(self.block, offset + 4)?;
            let name_len = read_u8(self.block, offset + 6)?;
            let file_type_raw = read_u8(self.block, offset + 7)?;

            if rec_len == 0 {
                return Err(ParseError::InvalidField {
                    field: "rec_len",
                    reason: "rec_len is zero",
                });
            }
            let rec = usize::from(rec_len);
            if rec < EXT2_DIR_ENTRY_HEADER_LEN {
                return Err(ParseError::InvalidField {
                    field: "rec_len",
                    reason: "rec_len smaller than entry header",
                });
            }
            if rec % 4 != 0 {
                return Err(ParseError::InvalidField {
                    field: "rec_len",
                    reason: "rec_len not 4-byte aligned",
                });
            }
            let entry_end = offset + rec;
            if entry_end > self.block.len() {
                return Err(ParseError::InvalidField {
                    field: "rec_len",
                    reason: "entry extends past block boundary",
                });
            }
            self.offset = entry_end;

            if inode == 0 {
                continue;
            }

            let name_start = offset + EXT2_DIR_ENTRY_HEADER_LEN;
            let name_end = name_start + usize::from(name_len);
            if name_end > entry_end {
                return Err(ParseError::InvalidField {
                    field: "name_len",
                    reason: "name extends past rec_len",
                });
            }

            return Ok(Some(Ext2DirEntryRef {
                offset,
                inode,
                rec_len,
                name_len,
                file_type: Ext2FileType::from_raw(file_type_raw),
                name: &self.block[name_start..name_end],
            }));
        }
        Ok(None)
    }
}

impl<'a> Iterator for DirBlockIter<'a> {
    type Item = Result<Ext2DirEntryRef<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.decode_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Create an iterator over directory entries in a block buffer.
#[must_use]
pub fn iter_dir_block(block: &[u8]) -> DirBlockIter<'_> {
    DirBlockIter::new(block)
}
