use alacritty_terminal::event::VoidListener;
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line, Point};
use alacritty_terminal::term::cell::{Cell as TermCell, Flags};
use alacritty_terminal::term::test::TermSize;
use alacritty_terminal::term::{Config as TermConfig, Term};
use alacritty_terminal::vte::ansi::{Color, NamedColor, Processor};
use tunnelforge_core::snapshot::{BufferSnapshot, Cell, CellColor, StyleBits};

/// Terminal size in cells
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Headless emulator: alacritty's grid fed with transcript output, no PTY and
/// no renderer attached.
pub struct HeadlessTerminal {
    term: Term<VoidListener>,
    processor: Processor,
    size: TerminalSize,
    scrollback: usize,
}

impl HeadlessTerminal {
    pub fn new(size: TerminalSize, scrollback: usize) -> Self {
        let config = TermConfig {
            scrolling_history: scrollback,
            ..TermConfig::default()
        };
        let size = clamp_size(size);
        let term_size = TermSize::new(size.cols as usize, size.rows as usize);
        let term = Term::new(config, &term_size, VoidListener);

        Self {
            term,
            processor: Processor::new(),
            size,
            scrollback,
        }
    }

    /// Feed output bytes through the parser.
    pub fn write(&mut self, data: &[u8]) {
        self.processor.advance(&mut self.term, data);
    }

    pub fn resize(&mut self, size: TerminalSize) {
        let size = clamp_size(size);
        if size == self.size {
            return;
        }
        self.size = size;
        self.term
            .resize(TermSize::new(size.cols as usize, size.rows as usize));
    }

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    pub fn scrollback(&self) -> usize {
        self.scrollback
    }

    /// Lines held by the emulator: history plus the screen.
    pub fn total_lines(&self) -> usize {
        let grid = self.term.grid();
        grid.history_size() + grid.screen_lines()
    }

    /// `total_lines / scrollback`. May exceed 1.0 by up to one screen.
    pub fn utilization(&self) -> f64 {
        if self.scrollback == 0 {
            return 1.0;
        }
        self.total_lines() as f64 / self.scrollback as f64
    }

    /// Index of the first visible line within the full buffer.
    pub fn viewport_y(&self) -> usize {
        self.term.grid().history_size()
    }

    /// Cursor position relative to the visible window.
    pub fn cursor(&self) -> (i32, i32) {
        let point = self.term.grid().cursor.point;
        (point.column.0 as i32, point.line.0)
    }

    /// Read the visible window into a trimmed snapshot.
    pub fn snapshot(&self) -> BufferSnapshot {
        let grid = self.term.grid();
        let screen_lines = grid.screen_lines();
        let cols = grid.columns();

        let mut rows = Vec::with_capacity(screen_lines);
        for line in 0..screen_lines as i32 {
            let mut row = Vec::with_capacity(cols);
            for col in 0..cols {
                let cell = &grid[Point::new(Line(line), Column(col))];
                if cell
                    .flags
                    .intersects(Flags::WIDE_CHAR_SPACER | Flags::LEADING_WIDE_CHAR_SPACER)
                {
                    continue;
                }
                row.push(convert_cell(cell));
            }
            rows.push(row);
        }

        let (cursor_x, cursor_y) = self.cursor();
        BufferSnapshot::from_rows(
            cols as u32,
            self.viewport_y() as i32,
            cursor_x,
            cursor_y,
            rows,
        )
    }
}

fn clamp_size(size: TerminalSize) -> TerminalSize {
    TerminalSize {
        cols: size.cols.max(1),
        rows: size.rows.max(1),
    }
}

fn convert_cell(cell: &TermCell) -> Cell {
    let mut ch = String::new();
    ch.push(if cell.c == '\0' { ' ' } else { cell.c });
    if let Some(extra) = cell.zerowidth() {
        ch.extend(extra.iter());
    }

    let width = if cell.flags.contains(Flags::WIDE_CHAR) { 2 } else { 1 };

    Cell {
        ch,
        width,
        fg: convert_color(&cell.fg, NamedColor::Foreground),
        bg: convert_color(&cell.bg, NamedColor::Background),
        style: convert_flags(cell.flags),
    }
}

/// Map an alacritty color to a wire color. The terminal's own default
/// (`default_named`) maps to `None`.
fn convert_color(color: &Color, default_named: NamedColor) -> Option<CellColor> {
    match color {
        Color::Spec(rgb) => Some(CellColor::Rgb(rgb.r, rgb.g, rgb.b)),
        Color::Indexed(idx) => Some(CellColor::Palette(*idx)),
        Color::Named(named) if *named == default_named => None,
        Color::Named(named) => {
            let idx = *named as usize;
            if idx < 16 {
                return Some(CellColor::Palette(idx as u8));
            }
            let dim_base = NamedColor::DimBlack as usize;
            if (dim_base..dim_base + 8).contains(&idx) {
                return Some(CellColor::Palette((idx - dim_base) as u8));
            }
            // Foreground/background/cursor variants
            None
        }
    }
}

fn convert_flags(flags: Flags) -> StyleBits {
    let mut style = StyleBits::empty();
    if flags.contains(Flags::BOLD) {
        style.insert(StyleBits::BOLD);
    }
    if flags.contains(Flags::ITALIC) {
        style.insert(StyleBits::ITALIC);
    }
    if flags.intersects(Flags::ALL_UNDERLINES) {
        style.insert(StyleBits::UNDERLINE);
    }
    if flags.contains(Flags::DIM) {
        style.insert(StyleBits::DIM);
    }
    if flags.contains(Flags::INVERSE) {
        style.insert(StyleBits::INVERSE);
    }
    if flags.contains(Flags::HIDDEN) {
        style.insert(StyleBits::INVISIBLE);
    }
    if flags.contains(Flags::STRIKEOUT) {
        style.insert(StyleBits::STRIKETHROUGH);
    }
    style
}
