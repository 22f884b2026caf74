//! Keyboard matrix.
//!
//! The C64 keyboard is an 8×8 switch matrix scanned through CIA1: one
//! port drives rows low, the other reads the columns.  Both orientations
//! are kept so either port can act as the scan side, with the invariant
//! `rows[r].bit(c) == cols[c].bit(r)` for every key.  Lines are
//! active-low: an idle matrix reads $FF.

pub struct KeyboardMatrix {
    /// Indexed by row; each byte holds the column lines for that row.
    rows: [u8; 8],
    /// Indexed by column; each byte holds the row lines for that column.
    cols: [u8; 8],
}

impl KeyboardMatrix {
    pub fn new() -> Self {
        Self { rows: [0xFF; 8], cols: [0xFF; 8] }
    }

    pub fn reset(&mut self) {
        self.rows = [0xFF; 8];
        self.cols = [0xFF; 8];
    }

    pub fn key_down(&mut self, row: u8, col: u8) {
        let (row, col) = (row as usize & 7, col as usize & 7);
        self.rows[row] &= !(1 << col);
        self.cols[col] &= !(1 << row);
    }

    pub fn key_up(&mut self, row: u8, col: u8) {
        let (row, col) = (row as usize & 7, col as usize & 7);
        self.rows[row] |= 1 << col;
        self.cols[col] |= 1 << row;
    }

    /// Column lines seen while `row_select` drives rows (0 bit = selected
    /// row).  This is what a CIA1 PRB read folds in.
    pub fn read_columns(&self, row_select: u8) -> u8 {
        let mut lines = 0xFF;
        for r in 0..8 {
            if row_select & (1 << r) == 0 {
                lines &= self.rows[r];
            }
        }
        lines
    }

    /// Row lines seen while `col_select` drives columns; the symmetric
    /// read used for CIA1 PRA.
    pub fn read_rows(&self, col_select: u8) -> u8 {
        let mut lines = 0xFF;
        for c in 0..8 {
            if col_select & (1 << c) == 0 {
                lines &= self.cols[c];
            }
        }
        lines
    }

    pub(crate) fn save(&self, w: &mut crate::snapshot::SnapshotWriter) {
        w.bytes(&self.rows);
        w.bytes(&self.cols);
    }

    pub(crate) fn restore(
        &mut self,
        r: &mut crate::snapshot::SnapshotReader<'_>,
    ) -> crate::error::Result<()> {
        r.bytes_into(&mut self.rows)?;
        r.bytes_into(&mut self.cols)?;
        Ok(())
    }

    pub fn rows(&self) -> &[u8; 8] {
        &self.rows
    }

    pub fn cols(&self) -> &[u8; 8] {
        &self.cols
    }
}

impl Default for KeyboardMatrix {
    fn default() -> Self {
        Self::new()
    }
}

/// Physical keys and their matrix positions, for hosts translating
/// their own key events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum C64Key {
    InstDel, Return, CursorRight, F7, F1, F3, F5, CursorDown,
    Digit3, W, A, Digit4, Z, S, E, LeftShift,
    Digit5, R, D, Digit6, C, F, T, X,
    Digit7, Y, G, Digit8, B, H, U, V,
    Digit9, I, J, Digit0, M, K, O, N,
    Plus, P, L, Minus, Period, Colon, At, Comma,
    Pound, Asterisk, Semicolon, Home, RightShift, Equals, ArrowUp, Slash,
    Digit1, ArrowLeft, Control, Digit2, Space, Commodore, Q, RunStop,
}

impl C64Key {
    /// The key's (row, column) in the matrix.
    #[rustfmt::skip]
    pub fn matrix(self) -> (u8, u8) {
        use C64Key::*;
        match self {
            InstDel => (0, 0), Return => (0, 1), CursorRight => (0, 2), F7 => (0, 3),
            F1 => (0, 4), F3 => (0, 5), F5 => (0, 6), CursorDown => (0, 7),
            Digit3 => (1, 0), W => (1, 1), A => (1, 2), Digit4 => (1, 3),
            Z => (1, 4), S => (1, 5), E => (1, 6), LeftShift => (1, 7),
            Digit5 => (2, 0), R => (2, 1), D => (2, 2), Digit6 => (2, 3),
            C => (2, 4), F => (2, 5), T => (2, 6), X => (2, 7),
            Digit7 => (3, 0), Y => (3, 1), G => (3, 2), Digit8 => (3, 3),
            B => (3, 4), H => (3, 5), U => (3, 6), V => (3, 7),
            Digit9 => (4, 0), I => (4, 1), J => (4, 2), Digit0 => (4, 3),
            M => (4, 4), K => (4, 5), O => (4, 6), N => (4, 7),
            Plus => (5, 0), P => (5, 1), L => (5, 2), Minus => (5, 3),
            Period => (5, 4), Colon => (5, 5), At => (5, 6), Comma => (5, 7),
            Pound => (6, 0), Asterisk => (6, 1), Semicolon => (6, 2), Home => (6, 3),
            RightShift => (6, 4), Equals => (6, 5), ArrowUp => (6, 6), Slash => (6, 7),
            Digit1 => (7, 0), ArrowLeft => (7, 1), Control => (7, 2), Digit2 => (7, 3),
            Space => (7, 4), Commodore => (7, 5), Q => (7, 6), RunStop => (7, 7),
        }
    }
}

impl KeyboardMatrix {
    pub fn press(&mut self, key: C64Key) {
        let (row, col) = key.matrix();
        self.key_down(row, col);
    }

    pub fn release(&mut self, key: C64Key) {
        let (row, col) = key.matrix();
        self.key_up(row, col);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_symmetry_invariant() {
        let mut kb = KeyboardMatrix::new();
        kb.key_down(3, 5);
        kb.key_down(0, 0);
        for r in 0..8u8 {
            for c in 0..8u8 {
                let by_row = kb.rows()[r as usize] & (1 << c) == 0;
                let by_col = kb.cols()[c as usize] & (1 << r) == 0;
                assert_eq!(by_row, by_col, "row {r} col {c}");
            }
        }
        kb.key_up(3, 5);
        assert_eq!(kb.rows()[3], 0xFF);
        assert_eq!(kb.cols()[5] & (1 << 3), 1 << 3);
    }

    #[test]
    fn selected_row_pulls_column_low() {
        let mut kb = KeyboardMatrix::new();
        kb.key_down(2, 4);
        // Row 2 selected (bit 2 low): column 4 reads low.
        assert_eq!(kb.read_columns(!(1 << 2)), 0xFF & !(1 << 4));
        // Row 2 not selected: nothing reads low.
        assert_eq!(kb.read_columns(0xFF), 0xFF);
        // Symmetric scan.
        assert_eq!(kb.read_rows(!(1 << 4)), 0xFF & !(1 << 2));
    }

    #[test]
    fn idle_matrix_reads_ff() {
        let kb = KeyboardMatrix::new();
        assert_eq!(kb.read_columns(0x00), 0xFF);
        assert_eq!(kb.read_rows(0x00), 0xFF);
    }

    #[test]
    fn named_keys_land_on_their_matrix_slot() {
        let mut kb = KeyboardMatrix::new();
        kb.press(C64Key::Space);
        assert_eq!(kb.rows()[7] & (1 << 4), 0);
        kb.release(C64Key::Space);
        kb.press(C64Key::RunStop);
        assert_eq!(kb.rows()[7] & (1 << 7), 0);
    }

    #[test]
    fn every_key_has_a_unique_slot() {
        use std::collections::HashSet;
        let keys = [
            C64Key::InstDel, C64Key::Return, C64Key::CursorRight, C64Key::F7,
            C64Key::F1, C64Key::F3, C64Key::F5, C64Key::CursorDown,
            C64Key::Digit3, C64Key::W, C64Key::A, C64Key::Digit4,
            C64Key::Z, C64Key::S, C64Key::E, C64Key::LeftShift,
            C64Key::Digit5, C64Key::R, C64Key::D, C64Key::Digit6,
            C64Key::C, C64Key::F, C64Key::T, C64Key::X,
            C64Key::Digit7, C64Key::Y, C64Key::G, C64Key::Digit8,
            C64Key::B, C64Key::H, C64Key::U, C64Key::V,
            C64Key::Digit9, C64Key::I, C64Key::J, C64Key::Digit0,
            C64Key::M, C64Key::K, C64Key::O, C64Key::N,
            C64Key::Plus, C64Key::P, C64Key::L, C64Key::Minus,
            C64Key::Period, C64Key::Colon, C64Key::At, C64Key::Comma,
            C64Key::Pound, C64Key::Asterisk, C64Key::Semicolon, C64Key::Home,
            C64Key::RightShift, C64Key::Equals, C64Key::ArrowUp, C64Key::Slash,
            C64Key::Digit1, C64Key::ArrowLeft, C64Key::Control, C64Key::Digit2,
            C64Key::Space, C64Key::Commodore, C64Key::Q, C64Key::RunStop,
        ];
        let slots: HashSet<(u8, u8)> = keys.iter().map(|k| k.matrix()).collect();
        assert_eq!(slots.len(), 64);
    }
}
