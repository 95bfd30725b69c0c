use crate::stream::pruning::ReplayScan;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tunnelforge_core::session::SessionStore;
use tunnelforge_core::tail::{TranscriptTail, read_header, read_lines_from};
use tunnelforge_core::transcript::{ParseError, TranscriptRecord, truncate};
use tunnelforge_terminal::watch::FileWatch;

pub type SinkId = u64;

/// Receiving side of a stream subscription. The channel closes when the
/// session exits, the viewer is detached, or the watcher shuts down.
pub type SinkReceiver = async_channel::Receiver<TranscriptRecord>;

struct Sink {
    id: SinkId,
    tx: async_channel::Sender<TranscriptRecord>,
    started: Instant,
}

impl Sink {
    fn send(&self, session_id: &str, record: TranscriptRecord) {
        if self.tx.try_send(record).is_err() {
            log::debug!("Stream sink {} for {} is gone", self.id, session_id);
        }
    }
}

#[derive(Default)]
struct WatcherState {
    sinks: Vec<Sink>,
    /// `None` until the first viewer's replay has run.
    tail: Option<TranscriptTail>,
    watch: Option<FileWatch>,
    /// Set once the entry has left the map. Late arrivals start over.
    retired: bool,
}

type SharedState = Arc<Mutex<WatcherState>>;

struct Inner {
    store: Arc<dyn SessionStore>,
    watchers: Mutex<HashMap<String, SharedState>>,
    next_sink_id: AtomicU64,
}

/// Streams a session transcript to any number of viewers: a pruned replay of
/// what is already there, then every new record as it is appended.
///
/// One file watch per session, shared by all of its viewers. Each session has
/// its own lock, so a slow replay only holds up viewers of the same session.
#[derive(Clone)]
pub struct StreamWatcher {
    inner: Arc<Inner>,
}

impl StreamWatcher {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                watchers: Mutex::new(HashMap::new()),
                next_sink_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribe a new viewer to `session_id`.
    ///
    /// The replay is queued on the returned receiver before any live record.
    /// Fails when the transcript cannot be read.
    pub fn attach(
        &self,
        session_id: &str,
        transcript: &Path,
    ) -> io::Result<(SinkId, SinkReceiver)> {
        let (tx, rx) = async_channel::unbounded();
        let sink = Sink {
            id: self.inner.next_sink_id.fetch_add(1, Ordering::Relaxed),
            tx,
            started: Instant::now(),
        };
        let id = sink.id;

        loop {
            let shared = self
                .inner
                .watchers
                .lock()
                .entry(session_id.to_string())
                .or_default()
                .clone();
            let mut state = shared.lock();
            if state.retired {
                continue;
            }
            let result = self.add_sink(session_id, transcript, &mut state, sink);
            if state.sinks.is_empty() {
                self.retire(session_id, &shared, &mut state);
            }
            return result.map(|()| (id, rx));
        }
    }

    /// Remove a viewer. The session's watch stops with its last viewer.
    pub fn detach(&self, session_id: &str, sink_id: SinkId) {
        let Some(shared) = self.existing(session_id) else {
            log::debug!("No stream watcher for session {}", session_id);
            return;
        };
        let mut state = shared.lock();
        let before = state.sinks.len();
        state.sinks.retain(|s| s.id != sink_id);
        if state.sinks.len() == before {
            return;
        }
        log::info!(
            "Viewer detached from stream {} ({} remaining)",
            session_id,
            state.sinks.len()
        );
        if state.sinks.is_empty() {
            self.retire(session_id, &shared, &mut state);
            log::info!("Stream watcher stopped for session {} (no viewers)", session_id);
        }
    }

    pub fn viewer_count(&self, session_id: &str) -> usize {
        self.existing(session_id)
            .map_or(0, |shared| shared.lock().sinks.len())
    }

    /// Deliver whatever was appended to the transcript since the last call.
    pub fn on_file_changed(&self, session_id: &str) {
        let Some(shared) = self.existing(session_id) else {
            return;
        };
        let mut state = shared.lock();
        if state.retired {
            return;
        }
        Self::pump(session_id, &mut state);
        state.sinks.retain(|s| !s.tx.is_closed());
        if state.sinks.is_empty() {
            self.retire(session_id, &shared, &mut state);
            log::info!("Stream watcher stopped for session {}", session_id);
        }
    }

    /// Close every watch and end every viewer's stream.
    pub fn shutdown(&self) {
        let drained: Vec<SharedState> = self
            .inner
            .watchers
            .lock()
            .drain()
            .map(|(_, shared)| shared)
            .collect();
        if !drained.is_empty() {
            log::info!("Closing {} stream watchers", drained.len());
        }
        for shared in drained {
            let mut state = shared.lock();
            state.retired = true;
            state.watch = None;
            for sink in state.sinks.drain(..) {
                sink.tx.close();
            }
        }
    }

    fn existing(&self, session_id: &str) -> Option<SharedState> {
        self.inner.watchers.lock().get(session_id).cloned()
    }

    /// Replay to `sink` and, unless the replay ended the session, add it to
    /// the live viewers. The first viewer also sets up the tail and watch.
    fn add_sink(
        &self,
        session_id: &str,
        transcript: &Path,
        state: &mut WatcherState,
        sink: Sink,
    ) -> io::Result<()> {
        if state.tail.is_some() {
            // Bring existing viewers up to date so the new replay and the
            // live tail meet at the same line boundary.
            Self::pump(session_id, state);
            let upto = state.tail.as_ref().map_or(0, |t| t.line_offset());
            let ended = self.replay(session_id, transcript, &sink, Some(upto))?.1;
            if !ended {
                state.sinks.push(sink);
                log::info!(
                    "Viewer attached to stream {} ({} total)",
                    session_id,
                    state.sinks.len()
                );
            }
            return Ok(());
        }

        let (end_offset, ended) = self.replay(session_id, transcript, &sink, None)?;
        if ended {
            return Ok(());
        }

        let mut tail = TranscriptTail::new(transcript, end_offset);
        if let Err(e) = tail.record_baseline() {
            log::debug!("No baseline for {}: {}", transcript.display(), e);
        }
        state.watch = self.start_watch(session_id, transcript);
        state.tail = Some(tail);
        state.sinks.push(sink);
        log::info!("Stream watcher created for session {}", session_id);
        Ok(())
    }

    /// Drop the session's entry, unless it has already been replaced.
    /// Called with the session's own lock held.
    fn retire(&self, session_id: &str, shared: &SharedState, state: &mut WatcherState) {
        state.retired = true;
        state.watch = None;
        let mut watchers = self.inner.watchers.lock();
        if watchers
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, shared))
        {
            watchers.remove(session_id);
        }
    }

    fn start_watch(&self, session_id: &str, transcript: &Path) -> Option<FileWatch> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let id = session_id.to_string();
        match FileWatch::spawn(transcript, move || {
            if let Some(inner) = weak.upgrade() {
                StreamWatcher { inner }.on_file_changed(&id);
            }
        }) {
            Ok(watch) => Some(watch),
            Err(e) => {
                log::warn!("Failed to watch {}: {}", transcript.display(), e);
                None
            }
        }
    }

    /// Send the pruned replay to one sink. Returns the offset just past the
    /// last line replayed and whether the replay ended the stream.
    fn replay(
        &self,
        session_id: &str,
        transcript: &Path,
        sink: &Sink,
        upto: Option<u64>,
    ) -> io::Result<(u64, bool)> {
        let info = match self.inner.store.load(session_id) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Failed to load session info for {}: {:#}", session_id, e);
                None
            }
        };
        let start = info.as_ref().and_then(|i| i.prune_offset).unwrap_or(0);

        let header = match read_header(transcript) {
            Ok(header) => header,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("Transcript not found: {}", transcript.display());
                return Err(e);
            }
            Err(e) => {
                log::debug!("Failed to read header for {}: {}", session_id, e);
                None
            }
        };

        // Scans from the stored offset to the end on every attach.
        let (mut lines, mut end_offset) = read_lines_from(transcript, start)?;
        if let Some(upto) = upto {
            lines.retain(|l| l.end <= upto);
            end_offset = end_offset.min(upto);
        }

        let mut scan = ReplayScan::scan(&lines);
        if scan.header.is_none() {
            scan.header = header;
        }

        if let Some(prune) = &scan.prune {
            log::info!(
                "Pruning replay of {}: skipping {} events before '{}'",
                session_id,
                prune.event_index + 1,
                crate::stream::pruning::describe(prune.sequence)
            );
            if let Some(mut info) = info.filter(|i| i.prune_offset != Some(prune.offset)) {
                info.prune_offset = Some(prune.offset);
                if let Err(e) = self.inner.store.save(session_id, &info) {
                    log::warn!("Failed to save prune offset for {}: {:#}", session_id, e);
                }
            }
        }

        let mut ended = false;
        for record in scan.replay_records() {
            ended = record.is_exit();
            sink.send(session_id, record);
        }
        if ended {
            log::info!("Session {} already ended, closing stream", session_id);
            sink.tx.close();
        }
        Ok((end_offset, ended))
    }

    /// Read new lines and fan them out to every sink.
    fn pump(session_id: &str, state: &mut WatcherState) {
        let Some(tail) = state.tail.as_mut() else {
            return;
        };
        let lines = match tail.read_new_lines() {
            Ok(lines) => lines,
            Err(e) => {
                log::warn!("Failed to read transcript for {}: {}", session_id, e);
                return;
            }
        };

        for line in lines {
            let now = Instant::now();
            match TranscriptRecord::parse(&line) {
                Ok(TranscriptRecord::Header(_)) | Err(ParseError::Empty) => {}
                Ok(record @ TranscriptRecord::Exit { .. }) => {
                    log::info!("Session {} exited, closing {} streams", session_id, state.sinks.len());
                    for sink in state.sinks.drain(..) {
                        sink.send(session_id, record.clone());
                        sink.tx.close();
                    }
                }
                Ok(record) => {
                    for sink in &state.sinks {
                        let elapsed = now.saturating_duration_since(sink.started).as_secs_f64();
                        sink.send(session_id, record.with_time(elapsed));
                    }
                }
                Err(_) => {
                    log::debug!("Forwarding raw line for {}: {}", session_id, truncate(&line));
                    for sink in &state.sinks {
                        let elapsed = now.saturating_duration_since(sink.started).as_secs_f64();
                        sink.send(
                            session_id,
                            TranscriptRecord::Output {
                                time: elapsed,
                                data: line.clone(),
                            },
                        );
                    }
                }
            }
        }
    }
}

/// Detaches its viewer when dropped, e.g. when an HTTP response stream ends.
pub struct AttachGuard {
    watcher: StreamWatcher,
    session_id: String,
    sink_id: SinkId,
}

impl AttachGuard {
    pub fn new(watcher: StreamWatcher, session_id: impl Into<String>, sink_id: SinkId) -> Self {
        Self {
            watcher,
            session_id: session_id.into(),
            sink_id,
        }
    }
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.watcher.detach(&self.session_id, self.sink_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemorySessionStore;
    use std::io::Write;
    use std::path::PathBuf;
    use tunnelforge_core::session::SessionInfo;
    use tunnelforge_core::transcript::TranscriptHeader;

    fn append(path: &Path, lines: &[&str]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
    }

    fn drain(rx: &SinkReceiver) -> Vec<TranscriptRecord> {
        let mut out = Vec::new();
        while let Ok(r) = rx.try_recv() {
            out.push(r);
        }
        out
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        store: Arc<MemorySessionStore>,
        watcher: StreamWatcher,
    }

    fn fixture(lines: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        append(&path, lines);
        let store = Arc::new(MemorySessionStore::default());
        let watcher = StreamWatcher::new(store.clone());
        Fixture {
            _dir: dir,
            path,
            store,
            watcher,
        }
    }

    const HEADER: &str = r#"{"version":2,"width":80,"height":24}"#;

    #[tokio::test]
    async fn missing_transcript_fails() {
        let fx = fixture(&[]);
        let missing = fx.path.with_file_name("nope");
        assert!(fx.watcher.attach("s1", &missing).is_err());
        assert_eq!(fx.watcher.viewer_count("s1"), 0);
    }

    #[tokio::test]
    async fn replay_then_live_with_relative_time() {
        let fx = fixture(&[HEADER, r#"[1.5,"o","hello"]"#]);
        let (_, rx) = fx.watcher.attach("s1", &fx.path).unwrap();
        let replay = drain(&rx);
        assert_eq!(replay[0], TranscriptRecord::Header(TranscriptHeader::new(80, 24)));
        assert_eq!(replay[1].to_json(), r#"[0,"o","hello"]"#);

        append(&fx.path, &[r#"[9.0,"o","live"]"#, "raw text", HEADER]);
        fx.watcher.on_file_changed("s1");
        let live = drain(&rx);
        assert_eq!(live.len(), 2);
        match &live[0] {
            TranscriptRecord::Output { time, data } => {
                assert_eq!(data, "live");
                assert!(*time < 5.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&live[1], TranscriptRecord::Output { data, .. } if data == "raw text"));

        // No byte is delivered twice.
        fx.watcher.on_file_changed("s1");
        assert!(drain(&rx).is_empty());
    }

    #[tokio::test]
    async fn replay_is_idempotent_and_persists_prune_offset() {
        let fx = fixture(&[
            HEADER,
            r#"[0.1,"o","old"]"#,
            r#"[0.2,"r","100x30"]"#,
            r#"[0.3,"o","\u001b[2J"]"#,
            r#"[0.4,"o","new"]"#,
        ]);
        fx.store.insert("s1", SessionInfo::default());

        let (a, rx_a) = fx.watcher.attach("s1", &fx.path).unwrap();
        let first = drain(&rx_a);
        assert_eq!(first[0], TranscriptRecord::Header(TranscriptHeader::new(100, 30)));
        assert_eq!(first.len(), 2);
        let offset = fx.store.load("s1").unwrap().unwrap().prune_offset.unwrap();
        assert!(offset > 0);

        fx.watcher.detach("s1", a);
        assert_eq!(fx.watcher.viewer_count("s1"), 0);

        let (_, rx_b) = fx.watcher.attach("s1", &fx.path).unwrap();
        assert_eq!(drain(&rx_b), first);
        assert_eq!(fx.store.load("s1").unwrap().unwrap().prune_offset, Some(offset));
    }

    #[tokio::test]
    async fn second_viewer_gets_replay_without_duplicates() {
        let fx = fixture(&[HEADER, r#"[0.1,"o","a"]"#]);
        let (_, rx_a) = fx.watcher.attach("s1", &fx.path).unwrap();
        drain(&rx_a);

        append(&fx.path, &[r#"[0.2,"o","b"]"#]);
        let (_, rx_b) = fx.watcher.attach("s1", &fx.path).unwrap();
        assert_eq!(fx.watcher.viewer_count("s1"), 2);

        // The first viewer got "b" live; the second got it in its replay.
        assert_eq!(drain(&rx_a).len(), 1);
        let replay_b = drain(&rx_b);
        assert_eq!(replay_b.len(), 3);

        append(&fx.path, &[r#"[0.3,"o","c"]"#]);
        fx.watcher.on_file_changed("s1");
        assert_eq!(drain(&rx_a).len(), 1);
        assert_eq!(drain(&rx_b).len(), 1);
    }

    #[tokio::test]
    async fn exit_ends_every_stream() {
        let fx = fixture(&[HEADER]);
        let (_, rx) = fx.watcher.attach("s1", &fx.path).unwrap();
        drain(&rx);

        append(&fx.path, &[r#"["exit",0,"s1"]"#]);
        fx.watcher.on_file_changed("s1");
        assert!(drain(&rx)[0].is_exit());
        assert!(rx.is_closed());
        assert_eq!(fx.watcher.viewer_count("s1"), 0);
    }

    #[tokio::test]
    async fn replay_of_finished_session_closes_immediately() {
        let fx = fixture(&[HEADER, r#"[0.1,"o","x"]"#, r#"["exit",1]"#]);
        let (_, rx) = fx.watcher.attach("s1", &fx.path).unwrap();
        let records = drain(&rx);
        assert_eq!(records.len(), 3);
        assert!(rx.is_closed());
        assert_eq!(fx.watcher.viewer_count("s1"), 0);
    }

    #[tokio::test]
    async fn busy_session_does_not_block_another() {
        let fx = fixture(&[HEADER]);
        let other = fx.path.with_file_name("other");
        append(&other, &[HEADER]);
        let (_, rx_a) = fx.watcher.attach("a", &fx.path).unwrap();
        let (_, rx_b) = fx.watcher.attach("b", &other).unwrap();
        drain(&rx_a);
        drain(&rx_b);

        let busy = fx.watcher.existing("a").unwrap();
        let held = busy.lock();

        append(&other, &[r#"[0.1,"o","b"]"#]);
        let watcher = fx.watcher.clone();
        let third = fx.path.with_file_name("third");
        append(&third, &[HEADER]);
        let runtime = tokio::runtime::Handle::current();
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _runtime = runtime.enter();
            watcher.on_file_changed("b");
            let attached = watcher.attach("c", &third).is_ok();
            let _ = done_tx.send((attached, watcher.viewer_count("b")));
        });
        let (attached, viewers) = done_rx
            .recv_timeout(std::time::Duration::from_secs(5))
            .expect("other sessions waited on a busy one");
        assert!(attached);
        assert_eq!(viewers, 1);
        assert_eq!(drain(&rx_b).len(), 1);

        drop(held);
        assert_eq!(fx.watcher.viewer_count("a"), 1);
    }

    #[tokio::test]
    async fn guard_detaches_and_shutdown_closes() {
        let fx = fixture(&[HEADER]);
        let (a, _rx_a) = fx.watcher.attach("s1", &fx.path).unwrap();
        let (_, rx_b) = fx.watcher.attach("s1", &fx.path).unwrap();
        drop(AttachGuard::new(fx.watcher.clone(), "s1", a));
        assert_eq!(fx.watcher.viewer_count("s1"), 1);

        fx.watcher.shutdown();
        assert!(rx_b.is_closed());
        assert_eq!(fx.watcher.viewer_count("s1"), 0);
    }
}
