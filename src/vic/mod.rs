//! MOS 6569 (VIC-II) raster engine.
//!
//! The chip advances in per-cycle steps, 63 cycles per raster line and
//! 312 lines per frame, executing a fixed micro-sequence on every line:
//! sprite pointer fetches on the odd early cycles, the bad-line matrix
//! DMA at cycle 12, one painted character column per cycle from 15 to
//! 54, border handling and the sprite draw at 57, and the line wrap at
//! 63.  Bus stealing is modeled as a stall counter the CPU consumes
//! before its next access, which keeps the co-scheduling deterministic.

pub mod palette;
pub mod sprites;

use palette::PALETTE;
use sprites::SpriteUnit;

use crate::event::{EventSink, HostEvent};

// ── Geometry ──────────────────────────────────────────────────

pub const CYCLES_PER_LINE: u32 = 63;
pub const RASTER_LINES: u32 = 312;

pub const DISPLAY_WIDTH: usize = 320;
pub const DISPLAY_HEIGHT: usize = 200;
pub const BORDER_X: usize = 40;
pub const BORDER_Y: usize = 35;
pub const TOTAL_WIDTH: usize = DISPLAY_WIDTH + 2 * BORDER_X; // 400
pub const TOTAL_HEIGHT: usize = DISPLAY_HEIGHT + 2 * BORDER_Y; // 270

/// First raster line mapped to buffer row 0 (display starts at 51).
const FIRST_VISIBLE_LINE: u32 = 51 - BORDER_Y as u32;
/// First raster line of the 25-row display window.
const FIRST_DISPLAY_LINE: u32 = 51;
const LAST_DISPLAY_LINE: u32 = 250;

const FIRST_DMA_LINE: u32 = 0x30;
const LAST_DMA_LINE: u32 = 0xF7;

// ── IRQ bits ($D019/$D01A) ────────────────────────────────────

const IRQ_RASTER: u8 = 1 << 0;
const IRQ_SPRITE_BG: u8 = 1 << 1;
const IRQ_SPRITE_SPRITE: u8 = 1 << 2;
const IRQ_LIGHTPEN: u8 = 1 << 3;

// ── VIC memory view ───────────────────────────────────────────

/// The VIC's 16 KiB window onto system memory: one of four banks, with
/// the character ROM shadowed at $1000 in banks 0 and 2.
pub struct VicMemory<'a> {
    pub ram: &'a [u8; 0x1_0000],
    pub char_rom: &'a [u8; 0x1000],
    pub color_ram: &'a [u8; 0x400],
    /// Bank 0..3 (already un-inverted from CIA2 port A).
    pub bank: u8,
}

impl VicMemory<'_> {
    #[inline]
    pub fn read(&self, addr: u16) -> u8 {
        let addr = addr & 0x3FFF;
        if self.bank & 1 == 0 && (0x1000..0x2000).contains(&addr) {
            self.char_rom[(addr & 0x0FFF) as usize]
        } else {
            self.ram[(((self.bank as usize) << 14) | addr as usize)]
        }
    }

    #[inline]
    pub fn color(&self, offset: u16) -> u8 {
        self.color_ram[(offset & 0x3FF) as usize] & 0x0F
    }
}

// ── The chip ──────────────────────────────────────────────────

pub struct Vic {
    pub regs: [u8; 0x40],

    // Raster position.
    line_cycle: u32,
    raster_y: u32,
    frame: u64,

    // Screen state machine.
    video_counter: u16,
    video_counter_base: u16,
    row_counter: u8,
    display_active: bool,
    bad_lines_enabled: bool,
    is_bad_line: bool,

    // Border flip-flops.
    main_border: bool,
    vertical_border: bool,

    // Raster IRQ edge detector.
    raster_irq_condition: bool,
    irq_flags: u8,
    irq_mask: u8,
    irq_state: bool,

    // Line buffers refreshed by the bad-line DMA.
    matrix_line: [u8; 40],
    color_line: [u8; 40],

    // Collision bits for the line being painted.
    fg_mask: Vec<bool>,

    // Bus stealing.
    stall_cycles: u32,
    bus_available: bool,

    pub sprites: SpriteUnit,

    // Paint cache: one hash per (display line, character column).
    paint_hash: Vec<u64>,
    cache_bleed_row: usize,

    // Double-buffered output.
    back: Vec<u32>,
    front: Vec<u32>,

    // Frame skipping.
    frame_skip: u32,
    skip_counter: u32,
    paint_this_frame: bool,

    last_border_rgb: u32,
    lp_latched: bool,
    lp_x: u8,
    lp_y: u8,

    events: EventSink,
}

impl Vic {
    pub fn new() -> Self {
        Self {
            regs: [0; 0x40],
            line_cycle: 1,
            raster_y: RASTER_LINES - 1,
            frame: 0,
            video_counter: 0,
            video_counter_base: 0,
            row_counter: 0,
            display_active: false,
            bad_lines_enabled: false,
            is_bad_line: false,
            main_border: true,
            vertical_border: true,
            raster_irq_condition: false,
            irq_flags: 0,
            irq_mask: 0,
            irq_state: false,
            matrix_line: [0; 40],
            color_line: [0; 40],
            fg_mask: vec![false; TOTAL_WIDTH],
            stall_cycles: 0,
            bus_available: true,
            sprites: SpriteUnit::new(TOTAL_WIDTH),
            paint_hash: vec![u64::MAX; DISPLAY_HEIGHT * 40],
            cache_bleed_row: 0,
            back: vec![PALETTE[0]; TOTAL_WIDTH * TOTAL_HEIGHT],
            front: vec![PALETTE[0]; TOTAL_WIDTH * TOTAL_HEIGHT],
            frame_skip: 1,
            skip_counter: 0,
            paint_this_frame: true,
            last_border_rgb: PALETTE[0],
            lp_latched: false,
            lp_x: 0,
            lp_y: 0,
            events: EventSink::disconnected(),
        }
    }

    pub fn set_event_sink(&mut self, sink: EventSink) {
        self.events = sink;
    }

    pub fn reset(&mut self) {
        let events = self.events.clone();
        *self = Self::new();
        self.events = events;
    }

    // ── Host interface ────────────────────────────────────────

    /// The published frame, 0xAARRGGBB, row-major 400×270.
    pub fn rgb_data(&self) -> &[u32] {
        &self.front
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn raster_line(&self) -> u32 {
        self.raster_y
    }

    /// Emit only every n-th frame (clamped to 1..=4 by the caller).
    pub fn set_frame_skip(&mut self, n: u32) {
        self.frame_skip = n.clamp(1, 4);
    }

    pub fn frame_skip(&self) -> u32 {
        self.frame_skip
    }

    /// Cycles the CPU owes the VIC for DMA.  Consumed once per take.
    pub fn take_stall(&mut self) -> u32 {
        std::mem::take(&mut self.stall_cycles)
    }

    pub fn bus_available(&self) -> bool {
        self.bus_available
    }

    pub fn irq_asserted(&self) -> bool {
        self.irq_state
    }

    pub fn trigger_lightpen(&mut self) {
        if !self.lp_latched {
            self.lp_latched = true;
            self.lp_x = (self.line_cycle * 8).min(0xFF) as u8;
            self.lp_y = (self.raster_y & 0xFF) as u8;
            self.irq_flags |= IRQ_LIGHTPEN;
            self.update_irq_line();
        }
    }

    // ── Register access ───────────────────────────────────────

    pub fn read(&mut self, reg: u8) -> u8 {
        let reg = (reg & 0x3F) as usize;
        match reg {
            0x11 => (self.regs[0x11] & 0x7F) | (((self.raster_y >> 1) & 0x80) as u8),
            0x12 => (self.raster_y & 0xFF) as u8,
            0x13 => self.lp_x,
            0x14 => self.lp_y,
            0x19 => self.irq_flags | 0x70,
            0x1A => self.irq_mask | 0xF0,
            0x1E => self.sprites.take_sprite_sprite(),
            0x1F => self.sprites.take_sprite_background(),
            _ if reg < 0x20 => self.regs[reg],
            _ if reg < 0x2F => self.regs[reg] | 0xF0,
            _ => 0xFF,
        }
    }

    pub fn write(&mut self, reg: u8, data: u8) {
        let reg = (reg & 0x3F) as usize;
        self.regs[reg] = data;
        match reg {
            0x11 | 0x12 => {
                self.raster_irq_edge_detect();
                self.update_irq_line();
            }
            0x19 => {
                // Acknowledge written flag bits.
                self.irq_flags &= !data & 0x0F;
                self.update_irq_line();
            }
            0x1A => {
                self.irq_mask = data & 0x0F;
                self.update_irq_line();
            }
            0x20 => {
                let rgb = palette::rgb(data);
                if rgb != self.last_border_rgb {
                    self.last_border_rgb = rgb;
                    self.events.emit(HostEvent::BorderColor(rgb));
                }
            }
            _ => {}
        }
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.bytes(&self.regs);
        w.u32(self.line_cycle);
        w.u32(self.raster_y);
        w.u64(self.frame);
        w.u16(self.video_counter);
        w.u16(self.video_counter_base);
        w.u8(self.row_counter);
        w.bool(self.display_active);
        w.bool(self.bad_lines_enabled);
        w.bool(self.is_bad_line);
        w.bool(self.main_border);
        w.bool(self.vertical_border);
        w.bool(self.raster_irq_condition);
        w.u8(self.irq_flags);
        w.u8(self.irq_mask);
        w.bool(self.irq_state);
        w.bytes(&self.matrix_line);
        w.bytes(&self.color_line);
        w.u32(self.stall_cycles);
        w.bool(self.bus_available);
        self.sprites.save(w);
        w.u32(self.frame_skip);
        w.u32(self.skip_counter);
        w.bool(self.paint_this_frame);
    }

    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        r.bytes_into(&mut self.regs)?;
        self.line_cycle = r.u32()?;
        self.raster_y = r.u32()?;
        self.frame = r.u64()?;
        self.video_counter = r.u16()?;
        self.video_counter_base = r.u16()?;
        self.row_counter = r.u8()?;
        self.display_active = r.bool()?;
        self.bad_lines_enabled = r.bool()?;
        self.is_bad_line = r.bool()?;
        self.main_border = r.bool()?;
        self.vertical_border = r.bool()?;
        self.raster_irq_condition = r.bool()?;
        self.irq_flags = r.u8()?;
        self.irq_mask = r.u8()?;
        self.irq_state = r.bool()?;
        r.bytes_into(&mut self.matrix_line)?;
        r.bytes_into(&mut self.color_line)?;
        self.stall_cycles = r.u32()?;
        self.bus_available = r.bool()?;
        self.sprites.restore(r)?;
        self.frame_skip = r.u32()?;
        self.skip_counter = r.u32()?;
        self.paint_this_frame = r.bool()?;
        // Pixel caches are rebuilt, not carried.
        self.paint_hash.fill(u64::MAX);
        self.fg_mask.fill(false);
        Ok(())
    }

    // ── Derived register state ────────────────────────────────

    fn yscroll(&self) -> u32 {
        (self.regs[0x11] & 0x07) as u32
    }

    fn xscroll(&self) -> usize {
        (self.regs[0x16] & 0x07) as usize
    }

    fn den(&self) -> bool {
        self.regs[0x11] & 0x10 != 0
    }

    fn ecm(&self) -> bool {
        self.regs[0x11] & 0x40 != 0
    }

    fn bmm(&self) -> bool {
        self.regs[0x11] & 0x20 != 0
    }

    fn mcm(&self) -> bool {
        self.regs[0x16] & 0x10 != 0
    }

    fn matrix_base(&self) -> u16 {
        ((self.regs[0x18] as u16 & 0xF0) >> 4) << 10
    }

    fn char_base(&self) -> u16 {
        ((self.regs[0x18] as u16 & 0x0E) >> 1) << 11
    }

    fn bitmap_base(&self) -> u16 {
        ((self.regs[0x18] as u16 & 0x08) >> 3) << 13
    }

    fn raster_irq_line(&self) -> u32 {
        self.regs[0x12] as u32 | (((self.regs[0x11] & 0x80) as u32) << 1)
    }

    fn background(&self, n: usize) -> u8 {
        self.regs[0x21 + n] & 0x0F
    }

    // ── Pipeline ──────────────────────────────────────────────

    /// Run the pipeline until `target` VIC cycles have been consumed
    /// since power-on.  One VIC cycle equals one CPU cycle.
    pub fn run_to(&mut self, target: u64, total: &mut u64, mem: &VicMemory<'_>) {
        while *total < target {
            self.emulate_cycle(mem);
            *total += 1;
        }
    }

    /// Execute the micro-sequence slot for the current line cycle.
    pub fn emulate_cycle(&mut self, mem: &VicMemory<'_>) {
        match self.line_cycle {
            // Sprite pointer fetches for sprites 3..7 steal the bus for
            // this cycle and the next when the sprite is enabled.
            1 | 3 | 5 | 7 | 9 => {
                let i = 3 + ((self.line_cycle - 1) / 2) as usize;
                if self.sprites.needs_dma(i) {
                    self.block_bus(2);
                }
            }
            11 => {
                self.bus_available = true;
            }
            12 => {
                if self.is_bad_line {
                    // The 40 character fetches take the bus away.
                    self.block_bus(40);
                }
            }
            13 => {
                if self.paint_this_frame {
                    self.paint_left_border();
                }
            }
            14 => {
                self.video_counter = self.video_counter_base;
                if self.is_bad_line {
                    self.row_counter = 0;
                }
            }
            15..=54 => {
                if self.line_cycle == 17 {
                    self.check_vertical_border();
                }
                let col = (self.line_cycle - 15) as usize;
                if self.is_bad_line {
                    self.fetch_matrix(col, mem);
                }
                self.paint_char_column(col, mem);
            }
            55 | 56 => {
                if self.line_cycle == 56 && !self.sprites.needs_dma(0) {
                    self.bus_available = true;
                }
            }
            57 => {
                self.main_border = true;
                if self.paint_this_frame {
                    self.paint_right_border();
                }
                self.draw_sprites(mem);
            }
            58 => {
                if self.sprites.needs_dma(0) {
                    self.block_bus(2);
                }
                if self.row_counter == 7 {
                    self.display_active = false;
                    self.video_counter_base = self.video_counter;
                } else if self.display_active || self.is_bad_line {
                    self.row_counter += 1;
                }
                self.sprites.load_registers(&self.regs);
                self.sprites.check_display_start(self.raster_y);
            }
            60 | 62 => {
                let i = 1 + ((self.line_cycle - 60) / 2) as usize;
                if self.sprites.needs_dma(i) {
                    self.block_bus(2);
                }
            }
            63 => {
                self.end_of_line();
            }
            _ => {}
        }

        self.line_cycle += 1;
        if self.line_cycle > CYCLES_PER_LINE {
            self.line_cycle = 1;
        }
    }

    fn block_bus(&mut self, cycles: u32) {
        self.bus_available = false;
        self.stall_cycles += cycles;
    }

    /// Line wrap: advance raster y, evaluate the bad-line condition for
    /// the new line, fire the raster IRQ edge, and flush the frame on
    /// the 312 → 0 wrap.
    fn end_of_line(&mut self) {
        self.raster_y += 1;

        if self.raster_y >= RASTER_LINES {
            self.raster_y = 0;
            self.video_counter_base = 0;
            self.display_active = false;
            self.bad_lines_enabled = false;
            self.sprites.end_frame();
            self.finish_frame();
        }

        // DEN latch window for bad lines.
        if self.raster_y == FIRST_DMA_LINE && self.den() {
            self.bad_lines_enabled = true;
        }
        if self.raster_y > LAST_DMA_LINE {
            self.bad_lines_enabled = false;
        }

        self.is_bad_line = self.bad_lines_enabled
            && (FIRST_DMA_LINE..=LAST_DMA_LINE).contains(&self.raster_y)
            && (self.raster_y & 7) == self.yscroll();
        if self.is_bad_line {
            self.display_active = true;
        }

        self.check_vertical_border();
        self.raster_irq_edge_detect();
        self.update_irq_line();

        // Reset line-local paint state.
        self.fg_mask.fill(false);
        self.main_border = false;
    }

    fn finish_frame(&mut self) {
        self.frame += 1;
        self.skip_counter += 1;
        if self.paint_this_frame {
            self.front.copy_from_slice(&self.back);
            self.events.emit(HostEvent::FrameReady { frame: self.frame });
        }
        self.paint_this_frame = self.skip_counter >= self.frame_skip;
        if self.paint_this_frame {
            self.skip_counter = 0;
        }

        // Bleed one cache row per frame so stale pixels can't live
        // forever behind an unlucky hash.
        let row = self.cache_bleed_row;
        self.paint_hash[row * 40..(row + 1) * 40].fill(u64::MAX);
        self.cache_bleed_row = (row + 1) % DISPLAY_HEIGHT;
    }

    fn raster_irq_edge_detect(&mut self) {
        let old = self.raster_irq_condition;
        self.raster_irq_condition = self.raster_y == self.raster_irq_line();
        if !old && self.raster_irq_condition {
            self.irq_flags |= IRQ_RASTER;
        }
    }

    fn update_irq_line(&mut self) {
        let new_state = self.irq_flags & self.irq_mask & 0x0F != 0;
        if new_state {
            self.irq_flags |= 0x80;
        } else {
            self.irq_flags &= 0x7F;
        }
        self.irq_state = new_state;
    }

    // ── Fetching ──────────────────────────────────────────────

    fn fetch_matrix(&mut self, col: usize, mem: &VicMemory<'_>) {
        let addr = self.matrix_base() + self.video_counter + col as u16;
        self.matrix_line[col] = mem.read(addr & 0x3FFF);
        self.color_line[col] = mem.color(self.video_counter + col as u16);
    }

    // ── Painting ──────────────────────────────────────────────

    fn buffer_row(&self) -> Option<usize> {
        let y = self.raster_y;
        if y < FIRST_VISIBLE_LINE {
            return None;
        }
        let row = (y - FIRST_VISIBLE_LINE) as usize;
        (row < TOTAL_HEIGHT).then_some(row)
    }

    fn check_vertical_border(&mut self) {
        if self.raster_y == LAST_DISPLAY_LINE + 1 {
            self.vertical_border = true;
        }
        if self.raster_y == FIRST_DISPLAY_LINE && self.den() {
            self.vertical_border = false;
        }
    }

    fn paint_left_border(&mut self) {
        let Some(row) = self.buffer_row() else { return };
        let rgb = palette::rgb(self.regs[0x20]);
        let start = row * TOTAL_WIDTH;
        self.back[start..start + BORDER_X].fill(rgb);
        if self.vertical_border {
            // Outside the display window the whole line is border.
            self.back[start..start + TOTAL_WIDTH].fill(rgb);
        }
    }

    fn paint_right_border(&mut self) {
        if !self.main_border {
            return;
        }
        let Some(row) = self.buffer_row() else { return };
        let rgb = palette::rgb(self.regs[0x20]);
        let start = row * TOTAL_WIDTH + BORDER_X + DISPLAY_WIDTH;
        self.back[start..row * TOTAL_WIDTH + TOTAL_WIDTH].fill(rgb);
    }

    /// Paint the 8 pixels of one character column on the current line.
    fn paint_char_column(&mut self, col: usize, mem: &VicMemory<'_>) {
        if self.vertical_border {
            return;
        }
        let Some(row) = self.buffer_row() else { return };
        if !(FIRST_DISPLAY_LINE..=LAST_DISPLAY_LINE).contains(&self.raster_y) {
            return;
        }

        let matrix = self.matrix_line[col];
        let color = self.color_line[col];
        let mode = ((self.ecm() as u8) << 2) | ((self.bmm() as u8) << 1) | self.mcm() as u8;

        // Fetch the graphics byte for this column.
        let gfx = if self.display_active {
            if self.bmm() {
                let addr = self.bitmap_base()
                    + (self.video_counter + col as u16) * 8
                    + self.row_counter as u16;
                mem.read(addr & 0x3FFF)
            } else {
                let index = if self.ecm() { matrix & 0x3F } else { matrix } as u16;
                mem.read((self.char_base() + index * 8 + self.row_counter as u16) & 0x3FFF)
            }
        } else {
            // Idle state fetch.
            mem.read(if self.ecm() { 0x39FF } else { 0x3FFF })
        };

        let display_row = (self.raster_y - FIRST_DISPLAY_LINE) as usize;
        let xscroll = self.xscroll();

        // Skip the pixel writes when nothing feeding this cell changed.
        let hash = self.cell_hash(mode, matrix, color, gfx, xscroll);
        let cache_slot = display_row * 40 + col;
        let cache_hit = self.paint_hash[cache_slot] == hash;
        self.paint_hash[cache_slot] = hash;
        let paint = self.paint_this_frame && !cache_hit;

        let (pixels, fg) = self.decode_pixels(mode, matrix, color, gfx);

        let base_x = BORDER_X + col * 8 + xscroll;
        let line_start = row * TOTAL_WIDTH;
        if col == 0 && paint && xscroll > 0 {
            let bg = palette::rgb(self.background(0));
            self.back[line_start + BORDER_X..line_start + BORDER_X + xscroll].fill(bg);
        }
        for (i, (&rgb, &is_fg)) in pixels.iter().zip(fg.iter()).enumerate() {
            let x = base_x + i;
            if x >= BORDER_X + DISPLAY_WIDTH {
                break;
            }
            self.fg_mask[x] = is_fg;
            if paint {
                self.back[line_start + x] = rgb;
            }
        }

        if self.display_active {
            self.video_counter = (self.video_counter + 1) & 0x3FF;
        }
    }

    fn cell_hash(&self, mode: u8, matrix: u8, color: u8, gfx: u8, xscroll: usize) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in [
            mode,
            self.background(0),
            self.background(1),
            self.background(2),
            self.background(3),
            xscroll as u8,
            self.yscroll() as u8,
            gfx,
            matrix,
            color,
        ] {
            h ^= b as u64;
            h = h.wrapping_mul(0x1000_0000_01b3);
        }
        h
    }

    /// Decode one graphics byte into 8 pixels + collision flags under
    /// the current mode.
    fn decode_pixels(&self, mode: u8, matrix: u8, color: u8, gfx: u8) -> ([u32; 8], [bool; 8]) {
        let mut pixels = [0u32; 8];
        let mut fg = [false; 8];

        let put = |pixels: &mut [u32; 8], i: usize, index: u8| {
            pixels[i] = palette::rgb(index);
        };

        match mode {
            // Standard text.
            0b000 => {
                for i in 0..8 {
                    let bit = gfx & (0x80 >> i) != 0;
                    fg[i] = bit;
                    put(&mut pixels, i, if bit { color } else { self.background(0) });
                }
            }
            // Multicolor text: color RAM bit 3 selects per character.
            0b001 => {
                if color & 0x08 != 0 {
                    for i in 0..8 {
                        let pair = (gfx >> (6 - (i & !1))) & 0x03;
                        let (index, is_fg) = match pair {
                            0b00 => (self.background(0), false),
                            0b01 => (self.background(1), false),
                            0b10 => (self.background(2), true),
                            _ => (color & 0x07, true),
                        };
                        fg[i] = is_fg;
                        put(&mut pixels, i, index);
                    }
                } else {
                    for i in 0..8 {
                        let bit = gfx & (0x80 >> i) != 0;
                        fg[i] = bit;
                        put(&mut pixels, i, if bit { color & 0x07 } else { self.background(0) });
                    }
                }
            }
            // Standard bitmap: matrix nibbles are the two colors.
            0b010 => {
                for i in 0..8 {
                    let bit = gfx & (0x80 >> i) != 0;
                    fg[i] = bit;
                    put(&mut pixels, i, if bit { matrix >> 4 } else { matrix & 0x0F });
                }
            }
            // Multicolor bitmap.
            0b011 => {
                for i in 0..8 {
                    let pair = (gfx >> (6 - (i & !1))) & 0x03;
                    let (index, is_fg) = match pair {
                        0b00 => (self.background(0), false),
                        0b01 => (matrix >> 4, false),
                        0b10 => (matrix & 0x0F, true),
                        _ => (color, true),
                    };
                    fg[i] = is_fg;
                    put(&mut pixels, i, index);
                }
            }
            // ECM text: matrix bits 6..7 pick the background register.
            0b100 => {
                let bg = self.background((matrix >> 6) as usize);
                for i in 0..8 {
                    let bit = gfx & (0x80 >> i) != 0;
                    fg[i] = bit;
                    put(&mut pixels, i, if bit { color } else { bg });
                }
            }
            // Invalid modes: black pixels, collision bits still live.
            _ => {
                let multicolor = mode & 0x01 != 0 && (mode & 0x02 != 0 || color & 0x08 != 0);
                for i in 0..8 {
                    fg[i] = if multicolor {
                        (gfx >> (6 - (i & !1))) & 0x02 != 0
                    } else {
                        gfx & (0x80 >> i) != 0
                    };
                    pixels[i] = PALETTE[0];
                }
            }
        }

        (pixels, fg)
    }

    fn draw_sprites(&mut self, mem: &VicMemory<'_>) {
        let Some(row) = self.buffer_row() else { return };
        let matrix_base = self.matrix_base();
        let line = &mut self.back[row * TOTAL_WIDTH..(row + 1) * TOTAL_WIDTH];
        let mut touched = [false; 40];
        let (ss_irq, sb_irq) = self.sprites.draw_line(
            mem,
            matrix_base,
            line,
            &self.fg_mask,
            self.paint_this_frame,
            &PALETTE,
            &mut touched,
        );

        // Sprite pixels invalidate the paint cache under them.
        if (FIRST_DISPLAY_LINE..=LAST_DISPLAY_LINE).contains(&self.raster_y) {
            let display_row = (self.raster_y - FIRST_DISPLAY_LINE) as usize;
            for (col, hit) in touched.iter().enumerate() {
                if *hit {
                    self.paint_hash[display_row * 40 + col] = u64::MAX;
                }
            }
        }

        if ss_irq {
            self.irq_flags |= IRQ_SPRITE_SPRITE;
        }
        if sb_irq {
            self.irq_flags |= IRQ_SPRITE_BG;
        }
        if ss_irq || sb_irq {
            self.update_irq_line();
        }
    }
}

impl Default for Vic {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_mem() -> (Box<[u8; 0x1_0000]>, Box<[u8; 0x1000]>, Box<[u8; 0x400]>) {
        (Box::new([0; 0x1_0000]), Box::new([0; 0x1000]), Box::new([0; 0x400]))
    }

    fn run_line(vic: &mut Vic, mem: &VicMemory<'_>) {
        for _ in 0..CYCLES_PER_LINE {
            vic.emulate_cycle(mem);
        }
    }

    #[test]
    fn raster_register_follows_lines() {
        let (ram, chr, col) = test_mem();
        let mem = VicMemory { ram: &ram, char_rom: &chr, color_ram: &col, bank: 0 };
        let mut vic = Vic::new();
        // Power-on parks the raster on the last line; one line wraps.
        run_line(&mut vic, &mem);
        assert_eq!(vic.raster_line(), 0);
        run_line(&mut vic, &mem);
        assert_eq!(vic.raster_line(), 1);
        assert_eq!(vic.read(0x12), 1);
    }

    #[test]
    fn raster_irq_fires_on_match() {
        let (ram, chr, col) = test_mem();
        let mem = VicMemory { ram: &ram, char_rom: &chr, color_ram: &col, bank: 0 };
        let mut vic = Vic::new();
        vic.write(0x12, 0x37);
        vic.write(0x1A, 0x01);
        for _ in 0..RASTER_LINES {
            run_line(&mut vic, &mem);
            if vic.irq_asserted() {
                break;
            }
        }
        assert_eq!(vic.raster_line(), 0x37);
        assert!(vic.irq_asserted());
        // Acknowledge drops the line.
        vic.write(0x19, 0x01);
        assert!(!vic.irq_asserted());
    }

    #[test]
    fn bad_line_steals_forty_cycles() {
        let (ram, chr, col) = test_mem();
        let mem = VicMemory { ram: &ram, char_rom: &chr, color_ram: &col, bank: 0 };
        let mut vic = Vic::new();
        vic.write(0x11, 0x10); // DEN, yscroll 0

        let mut stalls_per_bad_line = Vec::new();
        for _ in 0..RASTER_LINES + 2 {
            run_line(&mut vic, &mem);
            let stall = vic.take_stall();
            if vic.is_bad_line {
                stalls_per_bad_line.push(stall);
            }
        }
        assert!(!stalls_per_bad_line.is_empty());
        // Invariant: a bad line never steals more than 40 cycles for
        // the matrix fetch (sprites add their own on top; none here).
        for stall in stalls_per_bad_line {
            assert!(stall <= 40, "stall {stall}");
        }
    }

    #[test]
    fn bad_lines_need_den() {
        let (ram, chr, col) = test_mem();
        let mem = VicMemory { ram: &ram, char_rom: &chr, color_ram: &col, bank: 0 };
        let mut vic = Vic::new();
        // DEN off: no line may be bad.
        for _ in 0..RASTER_LINES + 2 {
            run_line(&mut vic, &mem);
            assert!(!vic.is_bad_line);
            let _ = vic.take_stall();
        }
    }

    #[test]
    fn sprite_collision_registers_clear_on_read() {
        let (mut ram, chr, col) = test_mem();
        // Solid sprite images at pointer 13 → data at 13*64.
        for b in ram[13 * 64..13 * 64 + 63].iter_mut() {
            *b = 0xFF;
        }
        // Sprite pointers at default matrix base $0400 + $3F8.
        ram[0x07F8] = 13;
        ram[0x07F9] = 13;
        let mem = VicMemory { ram: &ram, char_rom: &chr, color_ram: &col, bank: 0 };

        let mut vic = Vic::new();
        vic.write(0x18, 0x10); // matrix at $0400
        vic.write(0x15, 0x03); // sprites 0 and 1 enabled
        // Both at x=100, y=100.
        vic.write(0x00, 100);
        vic.write(0x01, 100);
        vic.write(0x02, 100);
        vic.write(0x03, 100);
        vic.write(0x1A, 0x04); // sprite-sprite IRQ enabled

        for _ in 0..2 * RASTER_LINES {
            run_line(&mut vic, &mem);
            let _ = vic.take_stall();
            if vic.sprites.sprite_sprite_collision != 0 {
                break;
            }
        }

        // Both colliding sprites' bits are set at the moment of the hit.
        let collisions = vic.read(0x1E);
        assert_eq!(collisions & 0x03, 0x03);
        assert!(vic.irq_asserted());
        // Clear-on-read.
        assert_eq!(vic.read(0x1E), 0);
    }

    #[test]
    fn standard_text_mode_renders_glyph_rows() {
        let (mut ram, mut chr, mut col) = test_mem();
        ram[0x0400] = 1; // char code 1 in the first matrix cell
        col[0] = 1; // white
        chr[8] = 0xAA; // glyph row 0 of char 1: alternating pixels
        let mem = VicMemory { ram: &ram, char_rom: &chr, color_ram: &col, bank: 0 };

        let mut vic = Vic::new();
        vic.write(0x11, 0x13); // DEN, yscroll 3 (standard screen)
        vic.write(0x16, 0x00); // xscroll 0
        vic.write(0x18, 0x14); // matrix $0400, chars at $1000 (char ROM)
        vic.write(0x20, 14); // light blue border
        vic.write(0x21, 6); // blue background

        for _ in 0..2 * RASTER_LINES + 1 {
            run_line(&mut vic, &mem);
            let _ = vic.take_stall();
        }

        // Raster 51 is the first display line (buffer row 35); the
        // first cell starts at x = 40.
        let row = 35 * TOTAL_WIDTH;
        let white = palette::rgb(1);
        let blue = palette::rgb(6);
        for i in 0..8 {
            let expected = if 0xAAu8 & (0x80 >> i) != 0 { white } else { blue };
            assert_eq!(vic.rgb_data()[row + 40 + i], expected, "pixel {i}");
        }
        // Border on both flanks.
        assert_eq!(vic.rgb_data()[row], palette::rgb(14));
        assert_eq!(vic.rgb_data()[row + TOTAL_WIDTH - 1], palette::rgb(14));
    }

    #[test]
    fn frame_flush_publishes_buffer() {
        let (ram, chr, col) = test_mem();
        let mem = VicMemory { ram: &ram, char_rom: &chr, color_ram: &col, bank: 0 };
        let (sink, rx) = EventSink::channel(16);
        let mut vic = Vic::new();
        vic.set_event_sink(sink);
        vic.write(0x20, 14); // light blue border

        for _ in 0..RASTER_LINES + 1 {
            run_line(&mut vic, &mem);
            let _ = vic.take_stall();
        }

        let mut saw_frame = false;
        while let Ok(ev) = rx.try_recv() {
            if matches!(ev, HostEvent::FrameReady { .. }) {
                saw_frame = true;
            }
        }
        assert!(saw_frame);
        assert_eq!(vic.rgb_data().len(), TOTAL_WIDTH * TOTAL_HEIGHT);
    }
}
