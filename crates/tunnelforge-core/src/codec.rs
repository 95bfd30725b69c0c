//! Binary snapshot codec.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! 0   u16 magic 0x5654 ("VT")
//! 2   u8  version (1)
//! 3   u8  flags (0)
//! 4   u32 cols
//! 8   u32 rows
//! 12  i32 viewport_y
//! 16  i32 cursor_x
//! 20  i32 cursor_y
//! 24  u32 reserved
//! 32  rows...
//! ```
//!
//! Each row is either `0xFE n` (n blank rows) or `0xFD count:u16` followed by
//! `count` cells. A blank row is one default space; the last row is always
//! written with `0xFD`. A cell starts with a type byte:
//!
//! ```text
//! 0x80 extended data follows (style byte, then colors)
//! 0x40 unicode char
//! 0x20 has fg      0x08 fg is rgb
//! 0x10 has bg      0x04 bg is rgb
//! 0x03 char class: 00 space, 01 ascii, 10 unicode
//! ```
//!
//! A default-styled space is the single byte `0x00`.

use crate::snapshot::{BufferSnapshot, Cell, CellColor, StyleBits};
use unicode_width::UnicodeWidthStr;

pub const MAGIC: u16 = 0x5654;
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 32;

pub const ROW_EMPTY: u8 = 0xFE;
pub const ROW_CONTENT: u8 = 0xFD;

const TYPE_EXTENDED: u8 = 0x80;
const TYPE_UNICODE: u8 = 0x40;
const TYPE_FG: u8 = 0x20;
const TYPE_BG: u8 = 0x10;
const TYPE_FG_RGB: u8 = 0x08;
const TYPE_BG_RGB: u8 = 0x04;
const CLASS_MASK: u8 = 0x03;
const CLASS_SPACE: u8 = 0x00;
const CLASS_ASCII: u8 = 0x01;
const CLASS_UNICODE: u8 = 0x02;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("unexpected end of data at offset {0}")]
    Truncated(usize),
    #[error("unknown row marker 0x{marker:02x} at offset {offset}")]
    BadRowMarker { marker: u8, offset: usize },
    #[error("invalid UTF-8 in cell at offset {0}")]
    InvalidUtf8(usize),
    #[error("unknown char class {class} at offset {offset}")]
    BadCharClass { class: u8, offset: usize },
}

enum CharRepr<'a> {
    Space,
    Ascii(u8),
    Unicode(&'a [u8]),
}

fn char_repr(ch: &str) -> CharRepr<'_> {
    let bytes = ch.as_bytes();
    match bytes {
        b" " => CharRepr::Space,
        [b] if b.is_ascii() => CharRepr::Ascii(*b),
        _ => {
            // Length prefix is a single byte.
            let mut end = bytes.len().min(u8::MAX as usize);
            while !ch.is_char_boundary(end) {
                end -= 1;
            }
            CharRepr::Unicode(&bytes[..end])
        }
    }
}

fn push_color(out: &mut Vec<u8>, color: CellColor) {
    match color {
        CellColor::Palette(idx) => out.push(idx),
        CellColor::Rgb(r, g, b) => out.extend_from_slice(&[r, g, b]),
    }
}

/// Append one encoded cell to `out`.
pub fn encode_cell(out: &mut Vec<u8>, cell: &Cell) {
    let repr = char_repr(&cell.ch);
    let extended = cell.fg.is_some() || cell.bg.is_some() || !cell.style.is_empty();

    let mut type_byte = match repr {
        CharRepr::Space => CLASS_SPACE,
        CharRepr::Ascii(_) => CLASS_ASCII,
        CharRepr::Unicode(_) => TYPE_UNICODE | CLASS_UNICODE,
    };
    if extended {
        type_byte |= TYPE_EXTENDED;
    }
    if let Some(fg) = cell.fg {
        type_byte |= TYPE_FG;
        if fg.is_rgb() {
            type_byte |= TYPE_FG_RGB;
        }
    }
    if let Some(bg) = cell.bg {
        type_byte |= TYPE_BG;
        if bg.is_rgb() {
            type_byte |= TYPE_BG_RGB;
        }
    }
    out.push(type_byte);

    match repr {
        CharRepr::Space => {}
        CharRepr::Ascii(b) => out.push(b),
        CharRepr::Unicode(bytes) => {
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
    }

    if extended {
        out.push(cell.style.0);
        if let Some(fg) = cell.fg {
            push_color(out, fg);
        }
        if let Some(bg) = cell.bg {
            push_color(out, bg);
        }
    }
}

fn is_blank_row(row: &[Cell]) -> bool {
    match row {
        [] => true,
        [cell] => cell.is_blank(),
        _ => false,
    }
}

/// Encode a snapshot into the binary frame format.
pub fn encode_snapshot(snapshot: &BufferSnapshot) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + snapshot.cells.len() * 8);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.push(VERSION);
    out.push(0);
    out.extend_from_slice(&snapshot.cols.to_le_bytes());
    out.extend_from_slice(&snapshot.rows.to_le_bytes());
    out.extend_from_slice(&snapshot.viewport_y.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_x.to_le_bytes());
    out.extend_from_slice(&snapshot.cursor_y.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    let last = snapshot.cells.len().saturating_sub(1);
    for (i, row) in snapshot.cells.iter().enumerate() {
        if i < last && is_blank_row(row) {
            out.extend_from_slice(&[ROW_EMPTY, 1]);
            continue;
        }
        let count = row.len().min(u16::MAX as usize);
        out.push(ROW_CONTENT);
        out.extend_from_slice(&(count as u16).to_le_bytes());
        for cell in &row[..count] {
            encode_cell(&mut out, cell);
        }
    }
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.data.get(self.pos).ok_or(DecodeError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(DecodeError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn color(&mut self, rgb: bool) -> Result<CellColor, DecodeError> {
        if rgb {
            let [r, g, b] = self.array::<3>()?;
            Ok(CellColor::Rgb(r, g, b))
        } else {
            Ok(CellColor::Palette(self.u8()?))
        }
    }
}

fn display_width(ch: &str) -> u8 {
    UnicodeWidthStr::width(ch).clamp(1, 2) as u8
}

fn decode_cell(reader: &mut Reader<'_>) -> Result<Cell, DecodeError> {
    let start = reader.pos;
    let type_byte = reader.u8()?;

    let ch = match type_byte & CLASS_MASK {
        CLASS_SPACE => " ".to_string(),
        CLASS_ASCII => (reader.u8()? as char).to_string(),
        CLASS_UNICODE => {
            let len = reader.u8()? as usize;
            let bytes = reader.bytes(len)?;
            std::str::from_utf8(bytes)
                .map_err(|_| DecodeError::InvalidUtf8(start))?
                .to_string()
        }
        class => return Err(DecodeError::BadCharClass { class, offset: start }),
    };

    let mut cell = Cell::new(ch, 1);
    cell.width = display_width(&cell.ch);

    if type_byte & TYPE_EXTENDED != 0 {
        cell.style = StyleBits(reader.u8()?);
        if type_byte & TYPE_FG != 0 {
            cell.fg = Some(reader.color(type_byte & TYPE_FG_RGB != 0)?);
        }
        if type_byte & TYPE_BG != 0 {
            cell.bg = Some(reader.color(type_byte & TYPE_BG_RGB != 0)?);
        }
    }
    Ok(cell)
}

/// Decode a binary frame produced by [`encode_snapshot`].
pub fn decode_snapshot(data: &[u8]) -> Result<BufferSnapshot, DecodeError> {
    if data.len() < HEADER_LEN {
        return Err(DecodeError::TooShort(data.len()));
    }
    let mut reader = Reader { data, pos: 0 };
    let magic = u16::from_le_bytes(reader.array()?);
    if magic != MAGIC {
        return Err(DecodeError::BadMagic(magic));
    }
    let version = reader.u8()?;
    if version != VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let _flags = reader.u8()?;
    let cols = u32::from_le_bytes(reader.array()?);
    let rows = u32::from_le_bytes(reader.array()?);
    let viewport_y = i32::from_le_bytes(reader.array()?);
    let cursor_x = i32::from_le_bytes(reader.array()?);
    let cursor_y = i32::from_le_bytes(reader.array()?);
    let _reserved = reader.array::<4>()?;

    let mut cells = Vec::new();
    while reader.pos < data.len() {
        let offset = reader.pos;
        match reader.u8()? {
            ROW_EMPTY => {
                let count = reader.u8()?;
                for _ in 0..count {
                    cells.push(vec![Cell::blank()]);
                }
            }
            ROW_CONTENT => {
                let count = u16::from_le_bytes(reader.array()?) as usize;
                let mut row = Vec::with_capacity(count);
                for _ in 0..count {
                    row.push(decode_cell(&mut reader)?);
                }
                cells.push(row);
            }
            marker => return Err(DecodeError::BadRowMarker { marker, offset }),
        }
    }

    Ok(BufferSnapshot {
        cols,
        rows,
        viewport_y,
        cursor_x,
        cursor_y,
        cells,
    })
}
