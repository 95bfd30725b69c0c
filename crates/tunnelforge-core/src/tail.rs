//! Byte-offset tailing of transcript files.
//!
//! Offsets are always byte positions in the file, never character counts.
//! A read only ever covers `[offset, size)`; bytes before `offset` are never
//! read again by the same tail.

use crate::transcript::{TranscriptHeader, TranscriptRecord};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Size of the buffer used to read the header line.
pub const HEADER_READ_SIZE: usize = 4096;

/// A complete transcript line together with its byte range in the file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscriptLine {
    /// Offset of the first byte of the line.
    pub start: u64,
    /// Offset one past the terminating newline.
    pub end: u64,
    pub text: String,
}

/// Split `buf` (which starts at file offset `base`) into complete lines.
/// Returns the lines and the number of bytes consumed; anything after the
/// last newline is left for the caller to keep.
pub fn split_lines(buf: &[u8], base: u64) -> (Vec<TranscriptLine>, usize) {
    let mut lines = Vec::new();
    let mut line_start = 0usize;
    for (i, &b) in buf.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        let raw = &buf[line_start..i];
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        lines.push(TranscriptLine {
            start: base + line_start as u64,
            end: base + i as u64 + 1,
            text: String::from_utf8_lossy(raw).into_owned(),
        });
        line_start = i + 1;
    }
    (lines, line_start)
}

/// Read the header record from the first line of a transcript.
///
/// Returns `Ok(None)` when the first line is not a header.
pub fn read_header(path: &Path) -> io::Result<Option<TranscriptHeader>> {
    let mut file = File::open(path)?;
    let mut chunk = [0u8; HEADER_READ_SIZE];
    let mut line = Vec::new();
    loop {
        let n = file.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        if let Some(pos) = chunk[..n].iter().position(|&b| b == b'\n') {
            line.extend_from_slice(&chunk[..pos]);
            break;
        }
        line.extend_from_slice(&chunk[..n]);
    }
    let text = String::from_utf8_lossy(&line);
    match TranscriptRecord::parse(&text) {
        Ok(TranscriptRecord::Header(header)) => Ok(Some(header)),
        _ => Ok(None),
    }
}

/// Read every complete line starting at byte `offset`.
///
/// Returns the lines and the offset just past the last complete line. A
/// trailing partial line is not returned.
pub fn read_lines_from(path: &Path, offset: u64) -> io::Result<(Vec<TranscriptLine>, u64)> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    let offset = offset.min(size);
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity((size - offset) as usize);
    file.take(size - offset).read_to_end(&mut buf)?;
    let (lines, consumed) = split_lines(&buf, offset);
    Ok((lines, offset + consumed as u64))
}

/// Incremental reader over a growing transcript.
#[derive(Debug)]
pub struct TranscriptTail {
    path: PathBuf,
    offset: u64,
    last_size: u64,
    last_mtime: Option<SystemTime>,
    partial: Vec<u8>,
}

impl TranscriptTail {
    /// Tail `path` starting at byte `offset`.
    pub fn new(path: impl Into<PathBuf>, offset: u64) -> Self {
        Self {
            path: path.into(),
            offset,
            last_size: offset,
            last_mtime: None,
            partial: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset just past the last complete line returned so far.
    pub fn line_offset(&self) -> u64 {
        self.offset - self.partial.len() as u64
    }

    /// Record the file's current size and mtime as the baseline without
    /// reading anything.
    pub fn record_baseline(&mut self) -> io::Result<()> {
        let meta = std::fs::metadata(&self.path)?;
        self.last_size = meta.len();
        self.last_mtime = meta.modified().ok();
        Ok(())
    }

    /// Read whatever was appended since the last call and return the complete
    /// lines. Shrinking files are logged and otherwise ignored.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let meta = std::fs::metadata(&self.path)?;
        let size = meta.len();
        let mtime = meta.modified().ok();

        if size == self.last_size && mtime == self.last_mtime && size <= self.offset {
            return Ok(Vec::new());
        }
        self.last_size = size;
        self.last_mtime = mtime;

        if size < self.offset {
            log::warn!(
                "Transcript {} shrank from {} to {} bytes, waiting for it to grow",
                self.path.display(),
                self.offset,
                size
            );
            return Ok(Vec::new());
        }
        if size == self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let len = size - self.offset;
        let mut chunk = Vec::with_capacity(len as usize);
        file.take(len).read_to_end(&mut chunk)?;
        self.offset += chunk.len() as u64;

        self.partial.extend_from_slice(&chunk);
        let (lines, consumed) = split_lines(&self.partial, 0);
        self.partial.drain(..consumed);
        Ok(lines.into_iter().map(|l| l.text).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, data: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data).unwrap();
    }

    #[test]
    fn split_lines_tracks_byte_offsets() {
        let (lines, consumed) = split_lines("ab\né\npartial".as_bytes(), 10);
        assert_eq!(lines.len(), 2);
        assert_eq!((lines[0].start, lines[0].end), (10, 13));
        assert_eq!((lines[1].start, lines[1].end), (13, 16));
        assert_eq!(lines[1].text, "é");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn header_is_read_from_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        append(&path, b"{\"version\":2,\"width\":80,\"height\":24}\n[0.1,\"o\",\"x\"]\n");
        let header = read_header(&path).unwrap().unwrap();
        assert_eq!((header.width, header.height), (80, 24));

        let other = dir.path().join("other");
        append(&other, b"[0.1,\"o\",\"x\"]\n");
        assert!(read_header(&other).unwrap().is_none());
        assert!(read_header(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn long_header_spans_several_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        let title = "t".repeat(HEADER_READ_SIZE + 1000);
        let header = format!(
            "{{\"version\":2,\"width\":100,\"height\":30,\"title\":\"{}\"}}\n[0.1,\"o\",\"x\"]\n",
            title
        );
        append(&path, header.as_bytes());
        let header = read_header(&path).unwrap().unwrap();
        assert_eq!((header.width, header.height), (100, 30));
        assert_eq!(header.extra["title"].as_str().unwrap().len(), title.len());
    }

    #[test]
    fn read_lines_from_stops_at_last_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        append(&path, b"one\ntwo\nthr");
        let (lines, end) = read_lines_from(&path, 4).unwrap();
        assert_eq!(lines.iter().map(|l| l.text.as_str()).collect::<Vec<_>>(), vec!["two"]);
        assert_eq!(end, 8);

        let (lines, end) = read_lines_from(&path, 1000).unwrap();
        assert!(lines.is_empty());
        assert_eq!(end, 11);
    }

    #[test]
    fn tail_keeps_partial_lines_and_never_rereads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        append(&path, b"first\n");
        let mut tail = TranscriptTail::new(&path, 0);

        assert_eq!(tail.read_new_lines().unwrap(), vec!["first".to_string()]);
        assert_eq!(tail.line_offset(), 6);
        assert!(tail.read_new_lines().unwrap().is_empty());

        // Multi-byte character split across two appends.
        let bytes = "sé\n".as_bytes();
        append(&path, &bytes[..2]);
        assert!(tail.read_new_lines().unwrap().is_empty());
        assert_eq!(tail.line_offset(), 6);
        append(&path, &bytes[2..]);
        assert_eq!(tail.read_new_lines().unwrap(), vec!["sé".to_string()]);
        assert_eq!(tail.line_offset(), 6 + bytes.len() as u64);
    }

    #[test]
    fn tail_ignores_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        append(&path, b"aaaa\nbbbb\n");
        let mut tail = TranscriptTail::new(&path, 0);
        assert_eq!(tail.read_new_lines().unwrap().len(), 2);

        std::fs::write(&path, b"c\n").unwrap();
        assert!(tail.read_new_lines().unwrap().is_empty());
        assert_eq!(tail.line_offset(), 10);
    }
}
