//! Prune points: output that clears the screen, after which nothing earlier
//! in the transcript is needed to reproduce what a viewer sees.

use tunnelforge_core::tail::TranscriptLine;
use tunnelforge_core::transcript::{TranscriptHeader, TranscriptRecord};

/// Sequences that clear or reset the terminal.
pub const PRUNE_SEQUENCES: [&str; 9] = [
    "\x1b[3J",
    "\x1bc",
    "\x1b[2J",
    "\x1b[H\x1b[J",
    "\x1b[H\x1b[2J",
    "\x1b[?1049h",
    "\x1b[?1049l",
    "\x1b[?47h",
    "\x1b[?47l",
];

pub fn describe(sequence: &str) -> &'static str {
    match sequence {
        "\x1b[3J" => "Clear scrollback buffer",
        "\x1bc" => "Terminal reset (RIS)",
        "\x1b[2J" => "Clear screen",
        "\x1b[H\x1b[J" => "Home cursor + clear",
        "\x1b[H\x1b[2J" => "Home cursor + clear screen",
        "\x1b[?1049h" => "Enter alternate screen",
        "\x1b[?1049l" => "Exit alternate screen",
        "\x1b[?47h" => "Save screen (legacy)",
        "\x1b[?47l" => "Restore screen (legacy)",
        _ => "Unknown sequence",
    }
}

/// The prune sequence that occurs last in `data`, with its byte index.
pub fn find_last_prune_sequence(data: &str) -> Option<(&'static str, usize)> {
    PRUNE_SEQUENCES
        .iter()
        .filter_map(|seq| data.rfind(seq).map(|idx| (*seq, idx)))
        .max_by_key(|(_, idx)| *idx)
}

/// Where replay can start.
#[derive(Clone, Debug, PartialEq)]
pub struct PrunePoint {
    /// Index into [`ReplayScan::events`] of the record holding the clear.
    pub event_index: usize,
    /// Start of the line to resume scanning from next time: the last resize
    /// before the clear, or the clear itself.
    pub offset: u64,
    /// Terminal size in effect at the clear.
    pub resize_before_clear: Option<(u16, u16)>,
    pub sequence: &'static str,
}

/// Result of scanning a transcript for replay.
#[derive(Debug, Default)]
pub struct ReplayScan {
    /// The most recent header seen in the scanned range.
    pub header: Option<TranscriptHeader>,
    /// Every non-header record in file order.
    pub events: Vec<TranscriptRecord>,
    pub prune: Option<PrunePoint>,
    pub parse_failures: usize,
}

impl ReplayScan {
    /// Scan complete lines, tracking the latest resize and the last clear.
    pub fn scan(lines: &[TranscriptLine]) -> Self {
        let mut scan = Self::default();
        let mut current_resize: Option<(u16, u16, u64)> = None;

        for line in lines {
            let record = match TranscriptRecord::parse(&line.text) {
                Ok(record) => record,
                Err(tunnelforge_core::transcript::ParseError::Empty) => continue,
                Err(e) => {
                    log::debug!("Skipping transcript line during replay scan: {}", e);
                    scan.parse_failures += 1;
                    continue;
                }
            };

            match &record {
                TranscriptRecord::Header(header) => {
                    scan.header = Some(header.clone());
                    continue;
                }
                TranscriptRecord::Resize { cols, rows, .. } => {
                    current_resize = Some((*cols, *rows, line.start));
                }
                TranscriptRecord::Output { data, .. } => {
                    if let Some((sequence, _)) = find_last_prune_sequence(data) {
                        let offset = current_resize.map_or(line.start, |(_, _, start)| start);
                        log::debug!(
                            "Found prune sequence '{}' at event {} (resume offset {})",
                            describe(sequence),
                            scan.events.len(),
                            offset
                        );
                        scan.prune = Some(PrunePoint {
                            event_index: scan.events.len(),
                            offset,
                            resize_before_clear: current_resize.map(|(c, r, _)| (c, r)),
                            sequence,
                        });
                    }
                }
                _ => {}
            }
            scan.events.push(record);
        }
        scan
    }

    /// Records to send to a new viewer: the header (sized as of the prune
    /// point), then every replayable event after the prune point with its
    /// timestamp zeroed. Input is not replayed. Nothing follows an exit.
    pub fn replay_records(&self) -> Vec<TranscriptRecord> {
        let mut out = Vec::new();
        if let Some(header) = &self.header {
            let header = match &self.prune {
                Some(PrunePoint {
                    resize_before_clear: Some((cols, rows)),
                    ..
                }) => header.with_size(*cols, *rows),
                _ => header.clone(),
            };
            out.push(TranscriptRecord::Header(header));
        }

        let start = self.prune.as_ref().map_or(0, |p| p.event_index + 1);
        for event in self.events.iter().skip(start) {
            match event {
                TranscriptRecord::Output { .. } | TranscriptRecord::Resize { .. } => {
                    out.push(event.with_time(0.0));
                }
                TranscriptRecord::Exit { .. } => {
                    out.push(event.clone());
                    break;
                }
                _ => {}
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunnelforge_core::tail::split_lines;

    fn lines(text: &str) -> Vec<TranscriptLine> {
        split_lines(text.as_bytes(), 0).0
    }

    #[test]
    fn last_sequence_wins() {
        assert_eq!(find_last_prune_sequence("a\x1b[2Jb\x1b[3Jc"), Some(("\x1b[3J", 6)));
        assert_eq!(find_last_prune_sequence("\x1b[H\x1b[2J"), Some(("\x1b[2J", 3)));
        assert_eq!(find_last_prune_sequence("plain"), None);
        assert_eq!(describe("\x1b[?1049h"), "Enter alternate screen");
        assert_eq!(describe("\x1b[0m"), "Unknown sequence");
    }

    #[test]
    fn prune_uses_size_before_clear() {
        let text = concat!(
            "{\"version\":2,\"width\":80,\"height\":24}\n",
            "[0.1,\"o\",\"before\"]\n",
            "[0.2,\"r\",\"100x30\"]\n",
            "[0.3,\"o\",\"\\u001b[2J\"]\n",
            "[0.4,\"o\",\"after\"]\n",
        );
        let all = lines(text);
        let scan = ReplayScan::scan(&all);
        let prune = scan.prune.clone().unwrap();
        assert_eq!(prune.event_index, 2);
        assert_eq!(prune.resize_before_clear, Some((100, 30)));
        assert_eq!(prune.offset, all[2].start);

        let replay = scan.replay_records();
        assert_eq!(
            replay,
            vec![
                TranscriptRecord::Header(TranscriptHeader::new(100, 30)),
                TranscriptRecord::Output {
                    time: 0.0,
                    data: "after".into()
                },
            ]
        );
    }

    #[test]
    fn no_prune_replays_everything_with_zero_time() {
        let text = concat!(
            "{\"version\":2,\"width\":80,\"height\":24}\n",
            "[1.5,\"o\",\"a\"]\n",
            "[1.6,\"i\",\"typed\"]\n",
            "not json\n",
            "[2.0,\"r\",\"90x20\"]\n",
            "[\"exit\",0,\"s1\"]\n",
            "[3.0,\"o\",\"late\"]\n",
        );
        let scan = ReplayScan::scan(&lines(text));
        assert!(scan.prune.is_none());
        assert_eq!(scan.parse_failures, 1);
        let replay = scan.replay_records();
        assert_eq!(replay.len(), 4);
        assert_eq!(replay[0], TranscriptRecord::Header(TranscriptHeader::new(80, 24)));
        assert_eq!(replay[1].to_json(), r#"[0,"o","a"]"#);
        assert_eq!(replay[2].to_json(), r#"[0,"r","90x20"]"#);
        assert!(replay[3].is_exit());
    }

    #[test]
    fn clear_without_resize_keeps_header_size() {
        let text = concat!(
            "{\"version\":2,\"width\":80,\"height\":24}\n",
            "[0.1,\"o\",\"old\\u001bc\"]\n",
            "[0.2,\"o\",\"new\"]\n",
        );
        let all = lines(text);
        let scan = ReplayScan::scan(&all);
        assert_eq!(scan.prune.as_ref().unwrap().offset, all[1].start);
        let replay = scan.replay_records();
        assert_eq!(replay[0], TranscriptRecord::Header(TranscriptHeader::new(80, 24)));
        assert_eq!(replay.len(), 2);
    }
}
