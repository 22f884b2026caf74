//! CIA interval timer.
//!
//! Each CIA has two 16-bit down-counters with reload latches.  Timer A
//! counts system cycles; timer B counts cycles or timer-A underflows
//! (cascade mode, where its effective period becomes latch_B × latch_A).
//!
//! The timer is clocked lazily: it records the absolute cycle of its
//! next underflow and the owner calls `update` once that cycle has been
//! crossed.  Starting charges a 2-cycle delay, each continuous reload a
//! 1-cycle restart delay.

use crate::chip::NEVER;

/// Cycles between writing the start bit and the first count.
pub const START_DELAY: u64 = 2;
/// Extra cycle consumed by a continuous reload.
pub const RELOAD_DELAY: u64 = 1;

pub struct CiaTimer {
    pub latch: u16,
    pub started: bool,
    pub one_shot: bool,
    /// Timer B only: count timer-A underflows instead of cycles.
    pub cascade: bool,
    /// Timer-A latch, cached for the cascade period.
    cascade_base: u64,

    /// Counter value while stopped.
    counter: u16,
    /// Absolute cycle of the next underflow while running.
    trigger: u64,
    /// Cycle of the most recent underflow (for the PB pulse output).
    last_underflow: u64,
    /// PB6/PB7 toggle flip-flop.
    pub pb_toggle: bool,
}

impl CiaTimer {
    pub fn new() -> Self {
        Self {
            latch: 0xFFFF,
            started: false,
            one_shot: false,
            cascade: false,
            cascade_base: 0x1_0000,
            counter: 0xFFFF,
            trigger: NEVER,
            last_underflow: NEVER,
            pb_toggle: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Cycles of one full period under the current mode.
    fn period(&self) -> u64 {
        if self.cascade {
            (self.latch as u64).max(1) * self.cascade_base.max(1)
        } else {
            self.latch as u64 + 1
        }
    }

    pub fn set_cascade_base(&mut self, latch_a: u16) {
        self.cascade_base = latch_a as u64 + 1;
    }

    /// Cycles per count step (one cycle, or one timer-A period).
    fn unit(&self) -> u64 {
        if self.cascade {
            self.cascade_base.max(1)
        } else {
            1
        }
    }

    pub fn latch_lo(&mut self, data: u8) {
        self.latch = (self.latch & 0xFF00) | data as u16;
    }

    /// Writing the high latch byte also loads the counter when stopped.
    pub fn latch_hi(&mut self, data: u8) {
        self.latch = (self.latch & 0x00FF) | ((data as u16) << 8);
        if !self.started {
            self.counter = self.latch;
        }
    }

    /// Apply a control-register write.  `now` is the current cycle.
    pub fn set_control(&mut self, cr: u8, now: u64) {
        let start = cr & 0x01 != 0;
        self.one_shot = cr & 0x08 != 0;

        if cr & 0x10 != 0 {
            // Force load strobe.
            self.counter = self.latch;
            if self.started {
                self.trigger = now + START_DELAY + self.counter as u64 * self.unit();
            }
        }

        if start && !self.started {
            self.started = true;
            self.pb_toggle = true;
            self.trigger = now + START_DELAY + self.counter as u64 * self.unit();
        } else if !start && self.started {
            self.counter = self.value(now);
            self.started = false;
            self.trigger = NEVER;
        }
    }

    /// Current 16-bit counter value.
    pub fn value(&self, now: u64) -> u16 {
        if !self.started {
            return self.counter;
        }
        if self.trigger == NEVER || self.trigger <= now {
            return 0;
        }
        let remaining = self.trigger - now;
        (remaining / self.unit()).min(0xFFFF) as u16
    }

    /// Absolute cycle at which this timer next underflows.
    pub fn next_trigger(&self) -> u64 {
        if self.started {
            self.trigger
        } else {
            NEVER
        }
    }

    /// Consume all underflows up to `now`.  Returns how many fired.
    pub fn update(&mut self, now: u64) -> u32 {
        let mut fired = 0;
        while self.started && self.trigger <= now {
            fired += 1;
            self.last_underflow = self.trigger;
            self.pb_toggle = !self.pb_toggle;
            if self.one_shot {
                self.started = false;
                self.counter = self.latch;
                self.trigger = NEVER;
            } else {
                self.trigger += self.period() + RELOAD_DELAY;
            }
        }
        fired
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.u16(self.latch);
        w.bool(self.started);
        w.bool(self.one_shot);
        w.bool(self.cascade);
        w.u64(self.cascade_base);
        w.u16(self.counter);
        w.u64(self.trigger);
        w.u64(self.last_underflow);
        w.bool(self.pb_toggle);
    }

    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        self.latch = r.u16()?;
        self.started = r.bool()?;
        self.one_shot = r.bool()?;
        self.cascade = r.bool()?;
        self.cascade_base = r.u64()?;
        self.counter = r.u16()?;
        self.trigger = r.u64()?;
        self.last_underflow = r.u64()?;
        self.pb_toggle = r.bool()?;
        Ok(())
    }

    /// PB6/PB7 output: toggle flip-flop in toggle mode, a one-cycle
    /// pulse otherwise.
    pub fn pb_output(&self, cr: u8, now: u64) -> bool {
        if cr & 0x04 != 0 {
            self.pb_toggle
        } else {
            self.last_underflow != NEVER && now.saturating_sub(self.last_underflow) <= 1
        }
    }
}

impl Default for CiaTimer {
    fn default() -> Self {
        Self::new()
    }
}
