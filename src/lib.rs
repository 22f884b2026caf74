//! Breadbin, a cycle-accurate Commodore 64 emulator core.
//!
//! Two independent 6502-family CPUs (the 6510 mainboard CPU and the 1541
//! drive CPU) advance in cycle-accounted steps on a shared wall clock.
//! Every peripheral chip (VIC-II, CIA ×2, SID, the drive VIAs) hangs off
//! a memory-mapped bus and is serviced lazily through the [`chip::IoChip`]
//! contract.  The two machines talk over the bit-banged IEC serial bus.
//!
//! The crate is a pure core: pixel output is a frame buffer, audio output
//! is a stream of PCM blocks, and host integration happens over a
//! [`crossbeam_channel`] of [`event::HostEvent`]s.  Window, blitter, audio
//! backend, and file chooser all live on the host side.

pub mod banks;
pub mod c64;
pub mod chip;
pub mod cia;
pub mod config;
pub mod cpu;
pub mod drive;
pub mod error;
pub mod event;
pub mod iec;
pub mod joystick;
pub mod keyboard;
pub mod mmu;
pub mod perf;
pub mod roms;
pub mod sid;
pub mod snapshot;
pub mod vic;

pub use c64::C64;
pub use config::Config;
pub use error::Error;
pub use event::HostEvent;

/// PAL C64 CPU clock in cycles per second.
pub const CPU_FREQUENCY: u32 = 985_248;
