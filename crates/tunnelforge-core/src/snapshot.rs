use serde::{Deserialize, Serialize};

/// Cell foreground/background color.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellColor {
    /// Index into the 256-color palette.
    Palette(u8),
    Rgb(u8, u8, u8),
}

impl CellColor {
    pub fn is_rgb(&self) -> bool {
        matches!(self, CellColor::Rgb(..))
    }
}

/// Packed cell style flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StyleBits(pub u8);

impl StyleBits {
    pub const BOLD: StyleBits = StyleBits(0x01);
    pub const ITALIC: StyleBits = StyleBits(0x02);
    pub const UNDERLINE: StyleBits = StyleBits(0x04);
    pub const DIM: StyleBits = StyleBits(0x08);
    pub const INVERSE: StyleBits = StyleBits(0x10);
    pub const INVISIBLE: StyleBits = StyleBits(0x20);
    pub const STRIKETHROUGH: StyleBits = StyleBits(0x40);

    pub const fn empty() -> Self {
        StyleBits(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: StyleBits) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: StyleBits) {
        self.0 |= other.0;
    }
}

impl std::ops::BitOr for StyleBits {
    type Output = StyleBits;

    fn bitor(self, rhs: StyleBits) -> StyleBits {
        StyleBits(self.0 | rhs.0)
    }
}

/// One grid cell.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// The grapheme in this cell. Combining marks are appended to the base char.
    pub ch: String,
    /// Display width in columns (1 or 2).
    pub width: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fg: Option<CellColor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg: Option<CellColor>,
    #[serde(default, skip_serializing_if = "StyleBits::is_empty")]
    pub style: StyleBits,
}

impl Cell {
    /// A default-styled space.
    pub fn blank() -> Self {
        Self {
            ch: " ".to_string(),
            width: 1,
            fg: None,
            bg: None,
            style: StyleBits::empty(),
        }
    }

    pub fn new(ch: impl Into<String>, width: u8) -> Self {
        Self {
            ch: ch.into(),
            width,
            ..Self::blank()
        }
    }

    pub fn with_fg(mut self, color: CellColor) -> Self {
        self.fg = Some(color);
        self
    }

    pub fn with_bg(mut self, color: CellColor) -> Self {
        self.bg = Some(color);
        self
    }

    pub fn with_style(mut self, style: StyleBits) -> Self {
        self.style = style;
        self
    }

    /// A space with no colors and no style. Blank cells are trimmed from row ends.
    pub fn is_blank(&self) -> bool {
        self.ch == " " && self.fg.is_none() && self.bg.is_none() && self.style.is_empty()
    }
}

/// Point-in-time view of a terminal's visible grid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferSnapshot {
    pub cols: u32,
    pub rows: u32,
    /// Index of the first visible line within the full buffer.
    pub viewport_y: i32,
    pub cursor_x: i32,
    /// Cursor row relative to the visible window.
    pub cursor_y: i32,
    pub cells: Vec<Vec<Cell>>,
}

impl BufferSnapshot {
    /// Build a snapshot from raw rows, trimming trailing blanks.
    ///
    /// `rows` becomes the number of rows left after trimming.
    pub fn from_rows(
        cols: u32,
        viewport_y: i32,
        cursor_x: i32,
        cursor_y: i32,
        rows: Vec<Vec<Cell>>,
    ) -> Self {
        let cells = trim_rows(rows);
        Self {
            cols,
            rows: cells.len() as u32,
            viewport_y,
            cursor_x,
            cursor_y,
            cells,
        }
    }
}

/// Drop trailing blank cells from a row, keeping at least one cell.
pub fn trim_row(mut row: Vec<Cell>) -> Vec<Cell> {
    while row.len() > 1 && row.last().is_some_and(Cell::is_blank) {
        row.pop();
    }
    if row.is_empty() {
        row.push(Cell::blank());
    }
    row
}

/// Trim every row, then drop trailing rows that hold a single blank cell.
/// At least one row is always kept.
pub fn trim_rows(rows: Vec<Vec<Cell>>) -> Vec<Vec<Cell>> {
    let mut rows: Vec<Vec<Cell>> = rows.into_iter().map(trim_row).collect();
    while rows.len() > 1 && rows.last().is_some_and(|r| r.len() == 1 && r[0].is_blank()) {
        rows.pop();
    }
    if rows.is_empty() {
        rows.push(vec![Cell::blank()]);
    }
    rows
}
