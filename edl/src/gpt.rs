// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! GUID partition table decoding, fed from raw sector buffers pulled over
//! Firehose. Nothing here touches the device; the strategies do the reads.

use indexmap::IndexMap;
use uuid::Uuid;

use crate::types::{EdlError, Result};

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_HEADER_MIN_SIZE: usize = 92;
const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_GPT_PARTITION_TYPE: u8 = 0xEE;

#[derive(Clone, Debug)]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub current_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: Uuid,
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

// GUIDs mix a little-endian prefix with big-endian tail bytes
fn read_mixed_endian_uuid(data: &[u8]) -> Uuid {
    let d1 = u32::from_le_bytes(data[0..4].try_into().unwrap());
    let d2 = u16::from_le_bytes(data[4..6].try_into().unwrap());
    let d3 = u16::from_le_bytes(data[6..8].try_into().unwrap());
    Uuid::from_fields(d1, d2, d3, data[8..16].try_into().unwrap())
}

impl GptHeader {
    /// Parse and CRC-validate one header sector.
    pub fn parse(sector: &[u8]) -> Result<GptHeader> {
        if sector.len() < GPT_HEADER_MIN_SIZE {
            return Err(EdlError::InvalidGpt("header sector too short".to_owned()));
        }
        if &sector[0..8] != GPT_SIGNATURE {
            return Err(EdlError::InvalidGpt(format!(
                "bad signature {}",
                hex::encode(&sector[0..8])
            )));
        }

        let header_size = u32::from_le_bytes(sector[12..16].try_into().unwrap());
        if !(GPT_HEADER_MIN_SIZE..=sector.len()).contains(&(header_size as usize)) {
            return Err(EdlError::InvalidGpt(format!(
                "implausible header size {header_size}"
            )));
        }

        let stored_crc = u32::from_le_bytes(sector[16..20].try_into().unwrap());
        let mut scratch = sector[..header_size as usize].to_vec();
        scratch[16..20].fill(0);
        let computed = crc32fast::hash(&scratch);
        if computed != stored_crc {
            return Err(EdlError::InvalidGpt(format!(
                "header crc mismatch (stored {stored_crc:#010x}, computed {computed:#010x})"
            )));
        }

        Ok(GptHeader {
            revision: u32::from_le_bytes(sector[8..12].try_into().unwrap()),
            header_size,
            current_lba: u64::from_le_bytes(sector[24..32].try_into().unwrap()),
            alternate_lba: u64::from_le_bytes(sector[32..40].try_into().unwrap()),
            first_usable_lba: u64::from_le_bytes(sector[40..48].try_into().unwrap()),
            last_usable_lba: u64::from_le_bytes(sector[48..56].try_into().unwrap()),
            disk_guid: read_mixed_endian_uuid(&sector[56..72]),
            entries_lba: u64::from_le_bytes(sector[72..80].try_into().unwrap()),
            num_entries: u32::from_le_bytes(sector[80..84].try_into().unwrap()),
            entry_size: u32::from_le_bytes(sector[84..88].try_into().unwrap()),
            entries_crc32: u32::from_le_bytes(sector[88..92].try_into().unwrap()),
        })
    }

    pub fn entries_len_bytes(&self) -> usize {
        self.num_entries as usize * self.entry_size as usize
    }

    pub fn entries_len_sectors(&self, sector_size: usize) -> u64 {
        self.entries_len_bytes().div_ceil(sector_size) as u64
    }
}

#[derive(Clone, Debug)]
pub struct Partition {
    pub lun: u8,
    pub name: String,
    pub start_lba: u64,
    pub sectors: u64,
    pub type_guid: Uuid,
    pub unique_guid: Uuid,
    pub attributes: u64,
    pub sector_size: usize,
}

impl Partition {
    pub fn size_bytes(&self) -> u64 {
        self.sectors * self.sector_size as u64
    }

    /// Last sector of the partition, inclusive.
    pub fn end_lba(&self) -> u64 {
        self.start_lba + self.sectors - 1
    }
}

fn decode_utf16le_name(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Decode and validate the entry array described by `hdr`.
fn parse_entries(
    entries: &[u8],
    hdr: &GptHeader,
    lun: u8,
    sector_size: usize,
) -> Result<Vec<Partition>> {
    let len = hdr.entries_len_bytes();
    if entries.len() < len {
        return Err(EdlError::InvalidGpt(format!(
            "entry array truncated ({} < {len})",
            entries.len()
        )));
    }
    if (hdr.entry_size as usize) < 128 {
        return Err(EdlError::InvalidGpt(format!(
            "implausible entry size {}",
            hdr.entry_size
        )));
    }

    let computed = crc32fast::hash(&entries[..len]);
    if computed != hdr.entries_crc32 {
        return Err(EdlError::InvalidGpt(format!(
            "entry array crc mismatch (stored {:#010x}, computed {computed:#010x})",
            hdr.entries_crc32
        )));
    }

    let mut parts = Vec::new();
    for raw in entries[..len].chunks_exact(hdr.entry_size as usize) {
        let type_guid = read_mixed_endian_uuid(&raw[0..16]);
        if type_guid.is_nil() {
            continue;
        }

        let start_lba = u64::from_le_bytes(raw[32..40].try_into().unwrap());
        let end_lba = u64::from_le_bytes(raw[40..48].try_into().unwrap());
        if end_lba < start_lba {
            return Err(EdlError::InvalidGpt(format!(
                "entry ends ({end_lba}) before it starts ({start_lba})"
            )));
        }

        parts.push(Partition {
            lun,
            name: decode_utf16le_name(&raw[56..128]),
            start_lba,
            sectors: end_lba - start_lba + 1,
            type_guid,
            unique_guid: read_mixed_endian_uuid(&raw[16..32]),
            attributes: u64::from_le_bytes(raw[48..56].try_into().unwrap()),
            sector_size,
        });
    }

    parts.sort_by_key(|p| p.start_lba);
    for pair in parts.windows(2) {
        if pair[0].end_lba() >= pair[1].start_lba {
            return Err(EdlError::InvalidGpt(format!(
                "partitions {} and {} overlap",
                pair[0].name, pair[1].name
            )));
        }
    }

    Ok(parts)
}

fn check_protective_mbr(sector: &[u8]) -> Result<()> {
    if sector.len() < 512 || sector[510..512] != MBR_BOOT_SIGNATURE {
        return Err(EdlError::InvalidGpt("missing MBR boot signature".to_owned()));
    }

    let has_gpt_entry = (0..4).any(|i| sector[446 + i * 16 + 4] == MBR_GPT_PARTITION_TYPE);
    if !has_gpt_entry {
        return Err(EdlError::InvalidGpt(
            "protective MBR carries no GPT entry".to_owned(),
        ));
    }

    Ok(())
}

/// Parse a buffer beginning at LBA 0: protective MBR, primary header at
/// LBA 1, then the entry array wherever the header points.
pub fn parse_primary_gpt(buf: &[u8], sector_size: usize, lun: u8) -> Result<Vec<Partition>> {
    if buf.len() < 2 * sector_size {
        return Err(EdlError::InvalidGpt("buffer shorter than MBR+header".to_owned()));
    }

    check_protective_mbr(&buf[..sector_size.max(512).min(buf.len())])?;

    let hdr = GptHeader::parse(&buf[sector_size..2 * sector_size])?;
    let offset = (hdr.entries_lba as usize)
        .checked_mul(sector_size)
        .ok_or_else(|| EdlError::InvalidGpt("entry array offset overflow".to_owned()))?;
    if offset >= buf.len() {
        return Err(EdlError::InvalidGpt(format!(
            "entry array at LBA {} is outside the buffer",
            hdr.entries_lba
        )));
    }

    parse_entries(&buf[offset..], &hdr, lun, sector_size)
}

/// Parse a buffer covering the *tail* of a LUN, with the backup header in
/// its very last sector and the entry array somewhere before it.
/// `total_sectors` is the size of the LUN, so LBAs can be rebased.
pub fn parse_backup_gpt(
    buf: &[u8],
    sector_size: usize,
    lun: u8,
    total_sectors: u64,
) -> Result<Vec<Partition>> {
    if buf.len() < sector_size || buf.len() % sector_size != 0 {
        return Err(EdlError::InvalidGpt(
            "backup buffer not sector aligned".to_owned(),
        ));
    }

    let hdr = GptHeader::parse(&buf[buf.len() - sector_size..])?;

    let buf_sectors = (buf.len() / sector_size) as u64;
    let buf_start_lba = total_sectors - buf_sectors;
    if hdr.entries_lba < buf_start_lba {
        return Err(EdlError::InvalidGpt(format!(
            "backup entry array at LBA {} is outside the buffer",
            hdr.entries_lba
        )));
    }

    let offset = ((hdr.entries_lba - buf_start_lba) as usize) * sector_size;
    parse_entries(&buf[offset..], &hdr, lun, sector_size)
}

/// One coherent view of every LUN's partition table. Replaced wholesale on
/// re-read, never patched in place.
#[derive(Clone, Debug, Default)]
pub struct GptSnapshot {
    luns: IndexMap<u8, Vec<Partition>>,
}

impl GptSnapshot {
    pub fn insert_lun(&mut self, lun: u8, parts: Vec<Partition>) {
        self.luns.insert(lun, parts);
    }

    pub fn partitions(&self, lun: u8) -> &[Partition] {
        self.luns.get(&lun).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn luns(&self) -> impl Iterator<Item = u8> + '_ {
        self.luns.keys().copied()
    }

    pub fn all(&self) -> impl Iterator<Item = &Partition> {
        self.luns.values().flatten()
    }

    /// First match across LUNs, in LUN order.
    pub fn find(&self, name: &str) -> Option<&Partition> {
        self.all().find(|p| p.name == name)
    }

    /// Name of the lowest-LBA partition of a LUN.
    pub fn first_partition_name(&self, lun: u8) -> Option<&str> {
        self.partitions(lun).first().map(|p| p.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.luns.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Best-effort magic sniffing of a partition dump, for table display only.
pub fn sniff_image_format(prefix: &[u8]) -> Option<&'static str> {
    if prefix.starts_with(b"ANDROID!") {
        return Some("android-boot");
    }
    if prefix.starts_with(b"\x7fELF") {
        return Some("elf");
    }
    if prefix.starts_with(b"AVB0") {
        return Some("vbmeta");
    }
    if prefix.starts_with(b"hsqs") {
        return Some("squashfs");
    }
    if prefix.len() >= 4 && u32::from_le_bytes(prefix[0..4].try_into().unwrap()) == 0xED26_FF3A {
        return Some("android-sparse");
    }
    if prefix.len() >= 0x43A && prefix[0x438..0x43A] == [0x53, 0xEF] {
        return Some("ext4");
    }
    if prefix.len() >= 1028 {
        match u32::from_le_bytes(prefix[1024..1028].try_into().unwrap()) {
            0xE0F5_E1E2 => return Some("erofs"),
            0xF2F5_2010 => return Some("f2fs"),
            _ => {}
        }
    }
    None
}
