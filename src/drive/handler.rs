//! The drive handler abstraction: what the drive mechanics talk to
//! instead of a real disk surface.
//!
//! Concrete image file formats (D64/T64/...) live on the host side;
//! the core ships [`RamDisk`], a RAM-backed implementation of the
//! original 1541 sector layout that doubles as the reference handler
//! for tests and raw-image mounting.

use std::io::Read;

use crate::error::{Error, Result};

/// Sectors per track, indexed by (track - 1).  Original 1541 geometry:
/// 35 tracks in four speed zones, 683 sectors total.
#[rustfmt::skip]
pub static SECTORS_PER_TRACK: [u8; 35] = [
    21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21, 21,
    19, 19, 19, 19, 19, 19, 19,
    18, 18, 18, 18, 18, 18,
    17, 17, 17, 17, 17,
];

pub const TRACK_COUNT: u8 = 35;
pub const TOTAL_SECTORS: usize = 683;
pub const DIRECTORY_TRACK: u8 = 18;

/// Flat sector index of (track, sector), tracks counted from 1.
pub fn sector_index(track: u8, sector: u8) -> Option<usize> {
    if track == 0 || track > TRACK_COUNT {
        return None;
    }
    if sector >= SECTORS_PER_TRACK[(track - 1) as usize] {
        return None;
    }
    let mut index = 0usize;
    for t in 0..(track - 1) as usize {
        index += SECTORS_PER_TRACK[t] as usize;
    }
    Some(index + sector as usize)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Del,
    Seq,
    Prg,
    Usr,
    Rel,
}

impl FileType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => FileType::Del,
            1 => FileType::Seq,
            2 => FileType::Prg,
            3 => FileType::Usr,
            _ => FileType::Rel,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            FileType::Del => 0,
            FileType::Seq => 1,
            FileType::Prg => 2,
            FileType::Usr => 3,
            FileType::Rel => 4,
        }
    }

    pub fn tag(self) -> &'static str {
        match self {
            FileType::Del => "DEL",
            FileType::Seq => "SEQ",
            FileType::Prg => "PRG",
            FileType::Usr => "USR",
            FileType::Rel => "REL",
        }
    }
}

/// One directory entry.
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// PETSCII name, padded with $A0.
    pub name: [u8; 16],
    pub file_type: FileType,
    pub blocks: u16,
    pub first_track: u8,
    pub first_sector: u8,
    pub rel_track: u8,
    pub rel_sector: u8,
    pub rel_record_len: u8,
    pub tape_offset: u32,
}

impl FileEntry {
    /// Name with the $A0 padding stripped.
    pub fn display_name(&self) -> Vec<u8> {
        self.name.iter().copied().take_while(|&b| b != 0xA0).collect()
    }
}

/// Abstract disk behind the drive.
pub trait DriveHandler {
    /// Attach an image from raw bytes.
    fn mount(&mut self, bytes: &[u8]) -> Result<()>;

    /// Release backing storage.
    fn destroy(&mut self);

    fn directory_entries(&self) -> Vec<FileEntry>;

    /// Whole-file read; the first two returned bytes are the load
    /// address.
    fn read_file(&mut self, name: &[u8], file_type: FileType) -> Result<Vec<u8>>;

    /// Create or replace a file from a SAVE stream (load address
    /// included in `data`).
    fn write_file(&mut self, name: &[u8], file_type: FileType, data: &[u8]) -> Result<()>;

    fn goto_block(&mut self, track: u8, sector: u8) -> Result<()>;
    fn read_block(&mut self) -> [u8; 256];
    fn write_block(&mut self, data: &[u8; 256]) -> Result<()>;

    fn disk_id(&self) -> [u8; 2];
    fn label(&self) -> String;
    fn was_modified(&self) -> bool;

    /// Replay a change stream (sequence of `(i32 sector, [u8;256])`
    /// records, big-endian, terminated by sector -1).
    fn apply_delta(&mut self, reader: &mut dyn Read) -> Result<()>;
}

// ── RamDisk ───────────────────────────────────────────────────

/// RAM-backed 1541 surface: 683 × 256-byte sectors in the original
/// layout (BAM at 18/0, directory chain from 18/1).
pub struct RamDisk {
    sectors: Vec<[u8; 256]>,
    /// Sector allocation map (the BAM, kept unpacked).
    allocated: Vec<bool>,
    current: usize,
    modified: bool,
}

impl RamDisk {
    pub fn new(label: &str, id: [u8; 2]) -> Self {
        let mut disk = Self {
            sectors: vec![[0u8; 256]; TOTAL_SECTORS],
            allocated: vec![false; TOTAL_SECTORS],
            current: 0,
            modified: false,
        };
        disk.format(label, id);
        disk
    }

    /// Write a fresh BAM and empty directory.
    pub fn format(&mut self, label: &str, id: [u8; 2]) {
        for s in self.sectors.iter_mut() {
            s.fill(0);
        }
        self.allocated.iter_mut().for_each(|a| *a = false);
        self.allocated[sector_index(DIRECTORY_TRACK, 0).unwrap()] = true;
        self.allocated[sector_index(DIRECTORY_TRACK, 1).unwrap()] = true;
        let bam = &mut self.sectors[sector_index(DIRECTORY_TRACK, 0).unwrap()];
        bam[0] = DIRECTORY_TRACK; // first directory sector
        bam[1] = 1;
        bam[2] = 0x41; // DOS version 'A'
        for (i, slot) in bam[0x90..0xA0].iter_mut().enumerate() {
            *slot = label.as_bytes().get(i).copied().unwrap_or(0xA0);
        }
        bam[0xA2] = id[0];
        bam[0xA3] = id[1];
        bam[0xA5] = 0x32; // '2'
        bam[0xA6] = 0x41; // 'A'
        // Directory sector 18/1: empty chain.
        let dir = &mut self.sectors[sector_index(DIRECTORY_TRACK, 1).unwrap()];
        dir[0] = 0;
        dir[1] = 0xFF;
        self.modified = false;
    }

    fn sector(&self, track: u8, sector: u8) -> Option<&[u8; 256]> {
        sector_index(track, sector).and_then(|i| self.sectors.get(i))
    }

    /// Claim the next free data sector, skipping the directory track.
    fn allocate(&mut self) -> Option<(u8, u8)> {
        if self.sectors.len() != TOTAL_SECTORS {
            return None; // destroyed surface
        }
        let order = (1..=TRACK_COUNT).filter(|&t| t != DIRECTORY_TRACK);
        for track in order {
            for sector in 0..SECTORS_PER_TRACK[(track - 1) as usize] {
                let idx = sector_index(track, sector).unwrap();
                if !self.allocated[idx] {
                    self.allocated[idx] = true;
                    return Some((track, sector));
                }
            }
        }
        None
    }

    /// Store `data` as a chained file and append a directory entry.
    pub fn add_file(&mut self, name: &[u8], file_type: FileType, data: &[u8]) -> Result<()> {
        // Lay the data down in 254-byte chunks with (track, sector)
        // links in the first two bytes of each block.
        let chunks: Vec<&[u8]> = data.chunks(254).collect();
        let blocks = chunks.len().max(1);

        let mut chain = Vec::with_capacity(blocks);
        for _ in 0..blocks {
            let slot = self.allocate().ok_or_else(|| Error::Image("disk full".into()))?;
            chain.push(slot);
        }

        for (i, chunk) in chunks.iter().enumerate() {
            let (track, sector) = chain[i];
            let idx = sector_index(track, sector).unwrap();
            let block = &mut self.sectors[idx];
            if i + 1 < chain.len() {
                block[0] = chain[i + 1].0;
                block[1] = chain[i + 1].1;
            } else {
                block[0] = 0;
                block[1] = chunk.len() as u8 + 1;
            }
            block[2..2 + chunk.len()].copy_from_slice(chunk);
        }

        self.append_directory_entry(name, file_type, blocks as u16, chain[0])?;
        self.modified = true;
        Ok(())
    }

    fn append_directory_entry(
        &mut self,
        name: &[u8],
        file_type: FileType,
        blocks: u16,
        first: (u8, u8),
    ) -> Result<()> {
        // Find a free 32-byte slot in the directory chain.
        let mut dir_sector = 1u8;
        loop {
            let idx = sector_index(DIRECTORY_TRACK, dir_sector)
                .ok_or_else(|| Error::Image("directory full".into()))?;
            for slot in 0..8 {
                let off = slot * 32;
                if self.sectors[idx][off + 2] == 0 {
                    let block = &mut self.sectors[idx];
                    block[off + 2] = 0x80 | file_type.bits();
                    block[off + 3] = first.0;
                    block[off + 4] = first.1;
                    for i in 0..16 {
                        block[off + 5 + i] = name.get(i).copied().unwrap_or(0xA0);
                    }
                    block[off + 30] = (blocks & 0xFF) as u8;
                    block[off + 31] = (blocks >> 8) as u8;
                    return Ok(());
                }
            }
            // Chain to the next directory sector, extending if needed.
            let (nt, ns) = (self.sectors[idx][0], self.sectors[idx][1]);
            if nt == 0 {
                let next = dir_sector + 1;
                if sector_index(DIRECTORY_TRACK, next).is_none() {
                    return Err(Error::Image("directory full".into()));
                }
                self.sectors[idx][0] = DIRECTORY_TRACK;
                self.sectors[idx][1] = next;
                let nidx = sector_index(DIRECTORY_TRACK, next).unwrap();
                self.sectors[nidx][0] = 0;
                self.sectors[nidx][1] = 0xFF;
                self.allocated[nidx] = true;
                dir_sector = next;
            } else {
                dir_sector = ns;
            }
        }
    }

    /// Rebuild the allocation map by walking the directory and every
    /// file chain (used after mounting a raw image).
    fn rebuild_allocation(&mut self) {
        self.allocated.iter_mut().for_each(|a| *a = false);
        if let Some(i) = sector_index(DIRECTORY_TRACK, 0) {
            self.allocated[i] = true;
        }
        // Directory chain.
        let mut track = DIRECTORY_TRACK;
        let mut sector = 1u8;
        let mut hops = 0;
        while track != 0 && hops < 32 {
            hops += 1;
            let Some(idx) = sector_index(track, sector) else { break };
            self.allocated[idx] = true;
            let block = self.sectors[idx];
            track = block[0];
            sector = block[1];
        }
        // File chains.
        for entry in self.directory_entries() {
            let mut track = entry.first_track;
            let mut sector = entry.first_sector;
            let mut hops = 0;
            while track != 0 && hops < TOTAL_SECTORS {
                hops += 1;
                let Some(idx) = sector_index(track, sector) else { break };
                self.allocated[idx] = true;
                track = self.sectors[idx][0];
                sector = self.sectors[idx][1];
            }
        }
    }

    fn find_entry(&self, name: &[u8], file_type: FileType) -> Option<FileEntry> {
        self.directory_entries()
            .into_iter()
            .find(|e| e.file_type == file_type && matches_name(name, &e.name))
    }
}

/// PETSCII pattern match: `*` matches any tail, `?` any single byte.
fn matches_name(pattern: &[u8], name: &[u8; 16]) -> bool {
    let name: Vec<u8> = name.iter().copied().take_while(|&b| b != 0xA0).collect();
    let mut pi = 0;
    let mut ni = 0;
    while pi < pattern.len() {
        match pattern[pi] {
            b'*' => return true,
            b'?' => {
                if ni >= name.len() {
                    return false;
                }
                pi += 1;
                ni += 1;
            }
            b => {
                if ni >= name.len() || name[ni] != b {
                    return false;
                }
                pi += 1;
                ni += 1;
            }
        }
    }
    ni == name.len()
}

impl DriveHandler for RamDisk {
    fn mount(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.len() < TOTAL_SECTORS * 256 {
            return Err(Error::Image(format!(
                "image too small: {} bytes, need {}",
                bytes.len(),
                TOTAL_SECTORS * 256
            )));
        }
        if self.sectors.len() != TOTAL_SECTORS {
            self.sectors = vec![[0u8; 256]; TOTAL_SECTORS];
            self.allocated = vec![false; TOTAL_SECTORS];
        }
        for (i, s) in self.sectors.iter_mut().enumerate() {
            s.copy_from_slice(&bytes[i * 256..(i + 1) * 256]);
        }
        self.rebuild_allocation();
        self.modified = false;
        Ok(())
    }

    fn destroy(&mut self) {
        self.sectors.clear();
    }

    fn directory_entries(&self) -> Vec<FileEntry> {
        let mut entries = Vec::new();
        let mut track = DIRECTORY_TRACK;
        let mut sector = 1u8;
        let mut hops = 0;
        while track != 0 && hops < 32 {
            hops += 1;
            let Some(block) = self.sector(track, sector) else { break };
            for slot in 0..8 {
                let off = slot * 32;
                let type_byte = block[off + 2];
                if type_byte & 0x80 == 0 {
                    continue;
                }
                let mut name = [0u8; 16];
                name.copy_from_slice(&block[off + 5..off + 21]);
                entries.push(FileEntry {
                    name,
                    file_type: FileType::from_bits(type_byte),
                    blocks: block[off + 30] as u16 | ((block[off + 31] as u16) << 8),
                    first_track: block[off + 3],
                    first_sector: block[off + 4],
                    rel_track: block[off + 21],
                    rel_sector: block[off + 22],
                    rel_record_len: block[off + 23],
                    tape_offset: 0,
                });
            }
            track = block[0];
            sector = block[1];
        }
        entries
    }

    fn read_file(&mut self, name: &[u8], file_type: FileType) -> Result<Vec<u8>> {
        let entry = self
            .find_entry(name, file_type)
            .ok_or_else(|| Error::ResourceNotAvailable(format!(
                "file not found: {}",
                String::from_utf8_lossy(name)
            )))?;

        let mut data = Vec::new();
        let mut track = entry.first_track;
        let mut sector = entry.first_sector;
        let mut hops = 0;
        while track != 0 && hops < TOTAL_SECTORS {
            hops += 1;
            let block = self
                .sector(track, sector)
                .ok_or_else(|| Error::Image(format!("broken chain at {track}/{sector}")))?;
            if block[0] == 0 {
                let len = (block[1] as usize).saturating_sub(1).min(254);
                data.extend_from_slice(&block[2..2 + len]);
            } else {
                data.extend_from_slice(&block[2..256]);
            }
            track = block[0];
            sector = block[1];
            if track != 0 && sector_index(track, sector).is_none() {
                return Err(Error::Image(format!("broken chain at {track}/{sector}")));
            }
        }
        Ok(data)
    }

    fn write_file(&mut self, name: &[u8], file_type: FileType, data: &[u8]) -> Result<()> {
        self.add_file(name, file_type, data)
    }

    fn goto_block(&mut self, track: u8, sector: u8) -> Result<()> {
        self.current = sector_index(track, sector)
            .ok_or_else(|| Error::Image(format!("no such block {track}/{sector}")))?;
        Ok(())
    }

    fn read_block(&mut self) -> [u8; 256] {
        self.sectors.get(self.current).copied().unwrap_or([0; 256])
    }

    fn write_block(&mut self, data: &[u8; 256]) -> Result<()> {
        let slot = self
            .sectors
            .get_mut(self.current)
            .ok_or_else(|| Error::Image("no surface mounted".into()))?;
        *slot = *data;
        self.modified = true;
        Ok(())
    }

    fn disk_id(&self) -> [u8; 2] {
        self.sector(DIRECTORY_TRACK, 0)
            .map(|bam| [bam[0xA2], bam[0xA3]])
            .unwrap_or([0; 2])
    }

    fn label(&self) -> String {
        let Some(bam) = self.sector(DIRECTORY_TRACK, 0) else {
            return String::new();
        };
        bam[0x90..0xA0]
            .iter()
            .take_while(|&&b| b != 0xA0)
            .map(|&b| b as char)
            .collect()
    }

    fn was_modified(&self) -> bool {
        self.modified
    }

    fn apply_delta(&mut self, reader: &mut dyn Read) -> Result<()> {
        loop {
            let mut head = [0u8; 4];
            reader.read_exact(&mut head)?;
            let sector = i32::from_be_bytes(head);
            if sector < 0 {
                return Ok(());
            }
            let sector = sector as usize;
            let mut block = [0u8; 256];
            reader.read_exact(&mut block)?;
            let slot = self
                .sectors
                .get_mut(sector)
                .ok_or_else(|| Error::Image(format!("delta sector out of range: {sector}")))?;
            *slot = block;
            self.modified = true;
        }
    }
}
