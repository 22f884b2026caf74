//! ROM image loader.
//!
//! Both `.bin` and `.rom` extensions are accepted (`.bin` tried
//! first).  The drive DOS ROM is optional; without it the drive falls
//! back to its stub and the IEC-only emulation level.
//!
//! # Search paths (tried in order)
//! 1. `$C64_ROM_DIR` environment variable
//! 2. `./roms/` and the working directory
//! 3. next to the executable
//! 4. `~/.local/share/c64/roms/`
//! 5. `/usr/share/vice/C64/`

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use log::info;

pub struct RomSet {
    pub kernal: Vec<u8>,
    pub basic: Vec<u8>,
    pub chargen: Vec<u8>,
    /// 1541 DOS ROM, when present.
    pub drive: Option<Vec<u8>>,
}

impl RomSet {
    /// Search the standard paths and load the three system ROMs.
    pub fn load() -> io::Result<Self> {
        let dir = find_rom_dir()?;
        Self::load_from(&dir)
    }

    /// Load from an explicit directory.
    pub fn load_from<P: AsRef<Path>>(dir: P) -> io::Result<Self> {
        let dir = dir.as_ref();
        let kernal = load_rom(dir, "kernal", 0x2000)?;
        let basic = load_rom(dir, "basic", 0x2000)?;
        let chargen = load_rom(dir, "chargen", 0x1000)?;
        let drive = load_rom(dir, "dos1541", 0x4000)
            .or_else(|_| load_rom(dir, "d1541", 0x4000))
            .ok();
        Ok(Self { kernal, basic, chargen, drive })
    }
}

// ── Internal helpers ──────────────────────────────────────────

fn find_rom_dir() -> io::Result<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();

    if let Ok(val) = env::var("C64_ROM_DIR") {
        candidates.push(PathBuf::from(val));
    }
    if let Ok(cwd) = env::current_dir() {
        candidates.push(cwd.join("roms"));
        candidates.push(cwd.clone());
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(d) = exe.parent() {
            candidates.push(d.join("roms"));
            candidates.push(d.to_path_buf());
        }
    }
    if let Some(home) = env::var_os("HOME") {
        candidates.push(PathBuf::from(home).join(".local/share/c64/roms"));
    }
    candidates.push(PathBuf::from("/usr/share/vice/C64"));
    candidates.push(PathBuf::from("/usr/local/share/vice/C64"));

    for dir in &candidates {
        if has_all_roms(dir) {
            return Ok(dir.clone());
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!(
            "C64 ROM files not found.  Searched:\n{}\nPlace kernal.bin/rom (8 KiB), \
             basic.bin/rom (8 KiB), and chargen.bin/rom (4 KiB) in one of those \
             directories, or set C64_ROM_DIR.",
            candidates
                .iter()
                .map(|p| format!("  {}", p.display()))
                .collect::<Vec<_>>()
                .join("\n")
        ),
    ))
}

fn has_all_roms(dir: &Path) -> bool {
    ["kernal", "basic", "chargen"]
        .iter()
        .all(|name| rom_path(dir, name).is_some())
}

fn rom_path(dir: &Path, name: &str) -> Option<PathBuf> {
    for ext in ["bin", "rom"] {
        let p = dir.join(format!("{name}.{ext}"));
        if p.is_file() {
            return Some(p);
        }
    }
    None
}

fn load_rom(dir: &Path, name: &str, expected: usize) -> io::Result<Vec<u8>> {
    let path = rom_path(dir, name).ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, format!("{name} ROM not found"))
    })?;
    let data = fs::read(&path)?;
    if data.len() < expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "{}: {} bytes where {} expected",
                path.display(),
                data.len(),
                expected
            ),
        ));
    }
    info!("loaded ROM {}", path.display());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_from_directory() {
        let dir = std::env::temp_dir().join("breadbin-rom-test");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("kernal.bin"), vec![0u8; 0x2000]).unwrap();
        fs::write(dir.join("basic.rom"), vec![0u8; 0x2000]).unwrap();
        fs::write(dir.join("chargen.bin"), vec![0u8; 0x1000]).unwrap();

        let set = RomSet::load_from(&dir).unwrap();
        assert_eq!(set.kernal.len(), 0x2000);
        assert_eq!(set.basic.len(), 0x2000);
        assert_eq!(set.chargen.len(), 0x1000);
        assert!(set.drive.is_none());

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn short_rom_is_rejected() {
        let dir = std::env::temp_dir().join("breadbin-rom-short");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("kernal.bin"), vec![0u8; 16]).unwrap();
        assert!(load_rom(&dir, "kernal", 0x2000).is_err());
        let _ = fs::remove_dir_all(dir);
    }
}
