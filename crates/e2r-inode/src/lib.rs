#![forbid(unsafe_code)]
//! Global metadata loading and inode resolution.
//!
//! Reads the superblock and the block-group descriptor table once per
//! session, and turns inode numbers into parsed inode records by way of
//! the owning group's inode table.

use e2r_block::{BlockReader, ByteDevice, read_superblock_region};
use e2r_error::{E2rError, Result};
use e2r_ondisk::{Ext2GroupDesc, Ext2Inode, Ext2Superblock};
use e2r_types::{BlockNumber, EXT2_GROUP_DESC_SIZE, GroupNumber, InodeNumber, ParseError};
use tracing::{debug, trace};

fn corrupt(what: &str, err: &ParseError) -> E2rError {
    E2rError::CorruptImage(format!("{what}: {err}"))
}

/// The descriptor table must end inside the backing image. This bounds the
/// group count by the image size whatever the superblock claims.
fn ensure_gdt_fits(sb: &Ext2Superblock, image_len: u64) -> Result<()> {
    let gdt_end = sb
        .group_desc_offset(GroupNumber(sb.groups_count()))
        .unwrap_or(u64::MAX);
    if gdt_end > image_len {
        return Err(E2rError::CorruptImage(format!(
            "group descriptor table ends at byte {gdt_end}, image is {image_len} bytes"
        )));
    }
    Ok(())
}

/// Read the superblock at byte 1024.
///
/// The magic number is always checked. With `validate`, the geometry
/// sanity rules run too and the descriptor table must fit inside the
/// backing image.
pub fn load_superblock(dev: &dyn ByteDevice, validate: bool) -> Result<Ext2Superblock> {
    let region = read_superblock_region(dev)?;
    let sb = Ext2Superblock::parse_superblock_region(&region)
        .map_err(|err| corrupt("superblock", &err))?;

    if validate {
        sb.validate_geometry()
            .map_err(|err| corrupt("superblock", &err))?;
        ensure_gdt_fits(&sb, dev.len_bytes())?;
    }

    debug!(
        block_size = sb.block_size,
        inodes_count = sb.inodes_count,
        blocks_count = sb.blocks_count,
        inodes_per_group = sb.inodes_per_group,
        blocks_per_group = sb.blocks_per_group,
        groups = sb.groups_count(),
        inode_size = sb.inode_size(),
        rev = sb.rev_level,
        "loaded superblock"
    );
    Ok(sb)
}

/// Read every group descriptor from the table following the superblock.
///
/// The table must fit inside the image even when the superblock was
/// loaded without validation, and each descriptor's inode table must lie
/// inside the filesystem.
pub fn load_group_descriptors(
    reader: &BlockReader,
    sb: &Ext2Superblock,
) -> Result<Vec<Ext2GroupDesc>> {
    ensure_gdt_fits(sb, reader.device().len_bytes())?;
    let bs = u64::from(sb.block_size);
    let table_blocks = u64::from(sb.inodes_per_group)
        .saturating_mul(u64::from(sb.inode_size()))
        .div_ceil(bs);
    let groups = sb.groups_count();

    let mut descs = Vec::with_capacity(groups as usize);
    for group in 0..groups {
        let offset = sb.group_desc_offset(GroupNumber(group)).ok_or_else(|| {
            E2rError::CorruptImage(format!("group {group} descriptor offset overflows"))
        })?;
        let block = BlockNumber(offset / bs);
        let in_block = (offset % bs) as usize;
        let raw = reader.read_block(block, in_block, EXT2_GROUP_DESC_SIZE)?;
        let desc = Ext2GroupDesc::parse_from_bytes(&raw)
            .map_err(|err| corrupt(&format!("group {group} descriptor"), &err))?;

        let table_end = u64::from(desc.inode_table).saturating_add(table_blocks);
        if desc.inode_table == 0 || table_end > u64::from(sb.blocks_count) {
            return Err(E2rError::CorruptImage(format!(
                "group {group} inode table at block {} (+{table_blocks}) outside {} blocks",
                desc.inode_table, sb.blocks_count
            )));
        }
        trace!(group, inode_table = desc.inode_table, "group descriptor");
        descs.push(desc);
    }
    Ok(descs)
}

/// Absolute byte offset of inode `ino`'s record in the image.
///
/// `(ino - 1) / inodes_per_group` selects the group; the record sits
/// `((ino - 1) % inodes_per_group) * inode_size` bytes into that group's
/// inode table.
pub fn inode_byte_offset(
    sb: &Ext2Superblock,
    groups: &[Ext2GroupDesc],
    ino: InodeNumber,
) -> Result<u64> {
    if ino.is_null() || ino.0 > sb.inodes_count {
        return Err(E2rError::InvalidInode {
            ino: ino.0,
            inodes_count: sb.inodes_count,
        });
    }
    let loc = sb
        .locate_inode(ino)
        .map_err(|err| corrupt(&format!("inode {ino}"), &err))?;
    let desc = groups.get(loc.group.0 as usize).ok_or_else(|| {
        E2rError::CorruptImage(format!(
            "inode {ino} belongs to group {} but only {} groups exist",
            loc.group,
            groups.len()
        ))
    })?;
    sb.inode_device_offset(&loc, desc.inode_table)
        .map_err(|err| corrupt(&format!("inode {ino}"), &err))
}

/// Read and parse inode `ino`.
///
/// Fails with `InvalidInode` when `ino` is 0 or beyond `s_inodes_count`.
pub fn resolve_inode(
    reader: &BlockReader,
    groups: &[Ext2GroupDesc],
    sb: &Ext2Superblock,
    ino: InodeNumber,
) -> Result<Ext2Inode> {
    let offset = inode_byte_offset(sb, groups, ino)?;
    let bs = u64::from(sb.block_size);
    let block = BlockNumber(offset / bs);
    let in_block = (offset % bs) as usize;
    let raw = reader.read_block(block, in_block, usize::from(sb.inode_size()))?;
    let inode =
        Ext2Inode::parse_from_bytes(&raw).map_err(|err| corrupt(&format!("inode {ino}"), &err))?;
    trace!(
        ino = ino.0,
        block = block.0,
        offset = in_block,
        mode = inode.mode,
        size = inode.size,
        "resolved inode"
    );
    Ok(inode)
}
