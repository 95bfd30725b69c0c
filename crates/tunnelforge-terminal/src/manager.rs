use crate::flow_control::{Admission, FlowControl, FlowControlConfig, Tick};
use crate::terminal::{HeadlessTerminal, TerminalSize};
use crate::watch::FileWatch;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tunnelforge_core::api::BufferStats;
use tunnelforge_core::codec::encode_snapshot;
use tunnelforge_core::session::{is_valid_session_id, transcript_path};
use tunnelforge_core::snapshot::BufferSnapshot;
use tunnelforge_core::tail::TranscriptTail;
use tunnelforge_core::transcript::{ParseError, TranscriptRecord, truncate};

/// Emulator and housekeeping settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalSettings {
    /// Initial geometry before the transcript header is seen.
    pub cols: u16,
    pub rows: u16,
    pub scrollback: usize,
    /// Delay between a change and the snapshot pushed to listeners.
    pub debounce_ms: u64,
    /// Terminals unused for this long are disposed by the idle sweep.
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for TerminalSettings {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            scrollback: 5000,
            debounce_ms: 50,
            idle_timeout_secs: 24 * 60 * 60,
            sweep_interval_secs: 10 * 60,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TerminalError {
    #[error("no transcript for session {0}")]
    SessionNotFound(String),
    #[error("terminal manager is shut down")]
    ShutDown,
}

/// Called with a fresh snapshot after a session's buffer changed.
pub type ChangeCallback = Arc<dyn Fn(&str, &BufferSnapshot) + Send + Sync>;
pub type ListenerId = u64;

/// Per-session emulator state. Only touched under its own lock.
struct SessionTerminal {
    terminal: HeadlessTerminal,
    tail: TranscriptTail,
    flow: FlowControl,
    watch: Option<FileWatch>,
    /// Output read in the current batch, not yet fed to the emulator.
    pending_writes: Vec<u8>,
    last_used: Instant,
    notify_task: Option<tokio::task::JoinHandle<()>>,
    exited: bool,
    parse_failures: usize,
}

fn flush_writes(terminal: &mut HeadlessTerminal, pending: &mut Vec<u8>) {
    if !pending.is_empty() {
        terminal.write(pending);
        pending.clear();
    }
}

impl SessionTerminal {
    fn flush(&mut self) {
        flush_writes(&mut self.terminal, &mut self.pending_writes);
    }

    fn snapshot(&mut self) -> BufferSnapshot {
        self.flush();
        self.terminal.snapshot()
    }

    /// Apply one transcript line. Returns true if the visible state changed.
    fn apply_line(&mut self, session_id: &str, line: &str) -> bool {
        match TranscriptRecord::parse(line) {
            Ok(TranscriptRecord::Header(header)) => {
                self.flush();
                self.terminal.resize(TerminalSize {
                    cols: header.width,
                    rows: header.height,
                });
                true
            }
            Ok(TranscriptRecord::Resize { cols, rows, .. }) => {
                self.flush();
                self.terminal.resize(TerminalSize { cols, rows });
                true
            }
            Ok(TranscriptRecord::Output { data, .. }) => {
                self.pending_writes.extend_from_slice(data.as_bytes());
                true
            }
            Ok(TranscriptRecord::Input { .. }) => false,
            Ok(TranscriptRecord::Exit { code, .. }) => {
                self.flush();
                log::info!("Session {} exited with code {}", session_id, code);
                self.exited = true;
                self.watch = None;
                false
            }
            Err(ParseError::Empty) => false,
            Err(e) => {
                self.parse_failures += 1;
                if self.parse_failures == 1 {
                    log::warn!("Skipping bad transcript line in {}: {} ({})", session_id, e, truncate(line));
                } else {
                    log::debug!(
                        "Skipping bad transcript line in {} ({} so far): {}",
                        session_id,
                        self.parse_failures,
                        e
                    );
                }
                false
            }
        }
    }

    fn dispose(&mut self) {
        self.watch = None;
        if let Some(task) = self.notify_task.take() {
            task.abort();
        }
        self.pending_writes.clear();
    }
}

struct Inner {
    control_dir: PathBuf,
    settings: TerminalSettings,
    flow_config: FlowControlConfig,
    sessions: Mutex<HashMap<String, Arc<Mutex<SessionTerminal>>>>,
    listeners: Mutex<HashMap<String, Vec<(ListenerId, ChangeCallback)>>>,
    next_listener_id: AtomicU64,
    /// Round-robin position of the flow-control tick over paused sessions.
    tick_cursor: AtomicUsize,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    shut_down: AtomicBool,
}

/// Owns one headless terminal per session, fed from the session transcript.
///
/// Lock order is sessions map, then a single session. Listener callbacks run
/// with no lock held.
#[derive(Clone)]
pub struct TerminalManager {
    inner: Arc<Inner>,
}

impl TerminalManager {
    pub fn new(
        control_dir: impl Into<PathBuf>,
        settings: TerminalSettings,
        flow_config: FlowControlConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                control_dir: control_dir.into(),
                settings,
                flow_config,
                sessions: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(1),
                tick_cursor: AtomicUsize::new(0),
                background: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn upgrade(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn control_dir(&self) -> &Path {
        &self.inner.control_dir
    }

    /// Start the flow-control tick and the idle sweep. Both stop on
    /// [`shutdown`](Self::shutdown) or when the manager is dropped.
    pub fn spawn_background_tasks(&self) {
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.flow_config.check_interval();
        let tick = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                let Some(manager) = Self::upgrade(&weak) else { break };
                manager.tick_flow_control();
            }
        });

        let weak = Arc::downgrade(&self.inner);
        let every = Duration::from_secs(self.inner.settings.sweep_interval_secs.max(1));
        let max_age = Duration::from_secs(self.inner.settings.idle_timeout_secs);
        let sweep = tokio::spawn(async move {
            let mut timer = tokio::time::interval(every);
            timer.tick().await;
            loop {
                timer.tick().await;
                let Some(manager) = Self::upgrade(&weak) else { break };
                let removed = manager.cleanup_inactive(max_age);
                if removed > 0 {
                    log::info!("Idle sweep removed {} terminals", removed);
                }
            }
        });

        self.inner.background.lock().extend([tick, sweep]);
    }

    fn session(&self, session_id: &str) -> Option<Arc<Mutex<SessionTerminal>>> {
        self.inner.sessions.lock().get(session_id).cloned()
    }

    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ensure a terminal exists for `session_id`, creating it and replaying the
    /// transcript from byte 0 if needed. Refreshes the idle timestamp.
    pub fn get_or_create(&self, session_id: &str) -> Result<(), TerminalError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(TerminalError::ShutDown);
        }
        if let Some(session) = self.session(session_id) {
            session.lock().last_used = Instant::now();
            return Ok(());
        }

        if !is_valid_session_id(session_id) {
            return Err(TerminalError::SessionNotFound(session_id.to_string()));
        }
        let path = transcript_path(&self.inner.control_dir, session_id);
        if !path.is_file() {
            log::debug!("No transcript at {}", path.display());
            return Err(TerminalError::SessionNotFound(session_id.to_string()));
        }

        let settings = &self.inner.settings;
        let session = Arc::new(Mutex::new(SessionTerminal {
            terminal: HeadlessTerminal::new(
                TerminalSize {
                    cols: settings.cols,
                    rows: settings.rows,
                },
                settings.scrollback,
            ),
            tail: TranscriptTail::new(&path, 0),
            flow: FlowControl::new(self.inner.flow_config.clone()),
            watch: None,
            pending_writes: Vec::new(),
            last_used: Instant::now(),
            notify_task: None,
            exited: false,
            parse_failures: 0,
        }));

        {
            let mut sessions = self.inner.sessions.lock();
            if sessions.contains_key(session_id) {
                return Ok(());
            }
            sessions.insert(session_id.to_string(), session.clone());
        }
        log::info!(
            "Terminal created for session {} ({}x{})",
            session_id,
            settings.cols,
            settings.rows
        );

        let watch = self.start_watch(session_id, &path);
        session.lock().watch = watch;
        self.on_file_changed(session_id);
        Ok(())
    }

    fn start_watch(&self, session_id: &str, path: &Path) -> Option<FileWatch> {
        let weak = Arc::downgrade(&self.inner);
        let id = session_id.to_string();
        match FileWatch::spawn(path, move || {
            if let Some(manager) = Self::upgrade(&weak) {
                manager.on_file_changed(&id);
            }
        }) {
            Ok(watch) => Some(watch),
            Err(e) => {
                log::warn!("Failed to watch {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Read whatever was appended to the transcript and run it through flow
    /// control into the emulator.
    pub fn on_file_changed(&self, session_id: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };

        let changed = {
            let mut guard = session.lock();
            let s = &mut *guard;
            if s.flow.is_paused() || s.exited {
                return;
            }
            let lines = match s.tail.read_new_lines() {
                Ok(lines) => lines,
                Err(e) => {
                    log::warn!("Failed to read transcript for {}: {}", session_id, e);
                    return;
                }
            };

            let now = Instant::now();
            let mut changed = false;
            for line in lines {
                if s.exited {
                    break;
                }
                let admission = s.flow.admit(session_id, &line, now, || {
                    flush_writes(&mut s.terminal, &mut s.pending_writes);
                    s.terminal.utilization()
                });
                match admission {
                    Admission::Apply => changed |= s.apply_line(session_id, &line),
                    Admission::Queued { just_paused: true } => {
                        // Stop reading until the buffer drains.
                        s.watch = None;
                    }
                    Admission::Queued { .. } | Admission::Dropped => {}
                }
            }
            s.flush();
            changed
        };

        if changed {
            self.schedule_notify(session_id);
        }
    }

    /// Re-check one paused session (round-robin). Resumed sessions get their
    /// queued lines applied and their file watch restarted.
    pub fn tick_flow_control(&self) {
        let paused: Vec<(String, Arc<Mutex<SessionTerminal>>)> = {
            let sessions = self.inner.sessions.lock();
            let mut paused: Vec<_> = sessions
                .iter()
                .filter(|(_, s)| s.lock().flow.is_paused())
                .map(|(id, s)| (id.clone(), s.clone()))
                .collect();
            paused.sort_by(|a, b| a.0.cmp(&b.0));
            paused
        };
        if paused.is_empty() {
            return;
        }

        let idx = self.inner.tick_cursor.fetch_add(1, Ordering::Relaxed) % paused.len();
        let (session_id, session) = &paused[idx];

        let (resumed, changed, path) = {
            let mut guard = session.lock();
            let s = &mut *guard;
            s.flush();
            let utilization = s.terminal.utilization();
            match s.flow.tick(session_id, utilization, Instant::now()) {
                Tick::Resume(lines) => {
                    let mut changed = false;
                    for line in &lines {
                        if s.exited {
                            break;
                        }
                        changed |= s.apply_line(session_id, line);
                    }
                    s.flush();
                    (!s.exited, changed, s.tail.path().to_path_buf())
                }
                Tick::TimedOut { .. } => (!s.exited, false, s.tail.path().to_path_buf()),
                Tick::StillPaused | Tick::NotPaused => return,
            }
        };

        if resumed {
            let watch = self.start_watch(session_id, &path);
            session.lock().watch = watch;
            // Pick up anything written while the watch was down.
            self.on_file_changed(session_id);
        }
        if changed {
            self.schedule_notify(session_id);
        }
    }

    fn has_listeners(&self, session_id: &str) -> bool {
        self.inner
            .listeners
            .lock()
            .get(session_id)
            .is_some_and(|l| !l.is_empty())
    }

    /// Arrange for listeners to get a snapshot after the debounce delay. A
    /// pending notification absorbs later changes instead of being pushed back.
    fn schedule_notify(&self, session_id: &str) {
        if !self.has_listeners(session_id) {
            return;
        }
        let Some(session) = self.session(session_id) else {
            return;
        };
        let mut s = session.lock();
        if s.notify_task.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let id = session_id.to_string();
        let delay = Duration::from_millis(self.inner.settings.debounce_ms);
        s.notify_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = Self::upgrade(&weak) {
                manager.notify_listeners(&id);
            }
        }));
    }

    fn notify_listeners(&self, session_id: &str) {
        let Some(session) = self.session(session_id) else {
            return;
        };
        let snapshot = {
            let mut s = session.lock();
            s.notify_task = None;
            s.snapshot()
        };
        let callbacks: Vec<ChangeCallback> = self
            .inner
            .listeners
            .lock()
            .get(session_id)
            .map(|l| l.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(session_id, &snapshot);
        }
    }

    /// Register for snapshots of `session_id` after each change. Creates the
    /// terminal if needed.
    pub fn subscribe_to_changes(
        &self,
        session_id: &str,
        callback: ChangeCallback,
    ) -> Result<ListenerId, TerminalError> {
        self.get_or_create(session_id)?;
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let mut listeners = self.inner.listeners.lock();
        let entry = listeners.entry(session_id.to_string()).or_default();
        entry.push((id, callback));
        log::info!(
            "Buffer listener subscribed for session {} ({} total)",
            session_id,
            entry.len()
        );
        Ok(id)
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, session_id: &str, listener_id: ListenerId) -> bool {
        let mut listeners = self.inner.listeners.lock();
        let Some(entry) = listeners.get_mut(session_id) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|(id, _)| *id != listener_id);
        let removed = entry.len() != before;
        if removed {
            log::info!(
                "Buffer listener unsubscribed for session {} ({} remaining)",
                session_id,
                entry.len()
            );
        }
        if entry.is_empty() {
            listeners.remove(session_id);
        }
        removed
    }

    pub fn listener_count(&self, session_id: &str) -> usize {
        self.inner
            .listeners
            .lock()
            .get(session_id)
            .map_or(0, Vec::len)
    }

    /// Current trimmed snapshot of the visible window.
    pub fn snapshot(&self, session_id: &str) -> Result<BufferSnapshot, TerminalError> {
        self.get_or_create(session_id)?;
        let session = self
            .session(session_id)
            .ok_or_else(|| TerminalError::SessionNotFound(session_id.to_string()))?;
        let mut s = session.lock();
        Ok(s.snapshot())
    }

    /// Current snapshot in the binary wire format.
    pub fn encode_snapshot(&self, session_id: &str) -> Result<Vec<u8>, TerminalError> {
        let snapshot = self.snapshot(session_id)?;
        Ok(encode_snapshot(&snapshot))
    }

    pub fn buffer_stats(&self, session_id: &str) -> Result<BufferStats, TerminalError> {
        self.get_or_create(session_id)?;
        let session = self
            .session(session_id)
            .ok_or_else(|| TerminalError::SessionNotFound(session_id.to_string()))?;
        let mut s = session.lock();
        s.flush();
        let size = s.terminal.size();
        let (cursor_x, cursor_y) = s.terminal.cursor();
        let scrollback = s.terminal.scrollback();
        Ok(BufferStats {
            total_rows: s.terminal.total_lines(),
            cols: size.cols as usize,
            rows: size.rows as usize,
            viewport_y: s.terminal.viewport_y() as i32,
            cursor_x,
            cursor_y,
            scrollback,
            is_paused: s.flow.is_paused(),
            pending_lines: s.flow.pending_len(),
            buffer_utilization: (s.terminal.utilization() * 100.0).round() as u32,
            max_buffer_lines: scrollback,
        })
    }

    /// Dispose a session's terminal, its watch and timers, and every listener.
    pub fn cleanup(&self, session_id: &str) {
        let removed = self.inner.sessions.lock().remove(session_id);
        self.inner.listeners.lock().remove(session_id);
        if let Some(session) = removed {
            session.lock().dispose();
            log::info!("Terminal closed for session {}", session_id);
        }
    }

    /// Dispose terminals not used within `max_age`. Returns how many were removed.
    pub fn cleanup_inactive(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .inner
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.lock().last_used) > max_age)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            log::info!("Cleaning up idle terminal for session {}", id);
            self.cleanup(id);
        }
        stale.len()
    }

    /// Stop background tasks and dispose every session.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.inner.background.lock().drain(..) {
            task.abort();
        }
        for id in self.active_sessions() {
            self.cleanup(&id);
        }
        log::info!("Terminal manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    struct Fixture {
        _dir: tempfile::TempDir,
        control_dir: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let control_dir = dir.path().to_path_buf();
            Self {
                _dir: dir,
                control_dir,
            }
        }

        fn append(&self, session_id: &str, lines: &[&str]) {
            let path = transcript_path(&self.control_dir, session_id);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap();
            for line in lines {
                writeln!(f, "{}", line).unwrap();
            }
        }

        fn manager(&self, settings: TerminalSettings, flow: FlowControlConfig) -> TerminalManager {
            TerminalManager::new(&self.control_dir, settings, flow)
        }
    }

    fn first_row(snapshot: &BufferSnapshot) -> String {
        snapshot.cells[0].iter().map(|c| c.ch.as_str()).collect()
    }

    fn output(text: &str) -> String {
        serde_json::json!([0.1, "o", text]).to_string()
    }

    const HEADER: &str = r#"{"version":2,"width":80,"height":24}"#;

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let fx = Fixture::new();
        let mgr = fx.manager(TerminalSettings::default(), FlowControlConfig::default());
        assert_eq!(
            mgr.get_or_create("missing"),
            Err(TerminalError::SessionNotFound("missing".into()))
        );
        assert_eq!(
            mgr.get_or_create("../etc"),
            Err(TerminalError::SessionNotFound("../etc".into()))
        );
        assert!(mgr.active_sessions().is_empty());
    }

    #[tokio::test]
    async fn replays_existing_transcript() {
        let fx = Fixture::new();
        fx.append("s1", &[HEADER, &output("hello\r\n"), r#"[0.2,"r","100x30"]"#, "garbage", &output("world")]);
        let mgr = fx.manager(TerminalSettings::default(), FlowControlConfig::default());

        let snap = mgr.snapshot("s1").unwrap();
        assert_eq!(snap.cols, 100);
        assert_eq!(first_row(&snap), "hello");
        assert_eq!(snap.cells[1].iter().map(|c| c.ch.as_str()).collect::<String>(), "world");

        let stats = mgr.buffer_stats("s1").unwrap();
        assert_eq!((stats.cols, stats.rows), (100, 30));
        assert_eq!(stats.max_buffer_lines, 5000);
        assert!(!stats.is_paused);
        mgr.shutdown();
    }

    #[tokio::test]
    async fn never_rereads_consumed_bytes() {
        let fx = Fixture::new();
        fx.append("s1", &[HEADER, &output("ab")]);
        let mgr = fx.manager(TerminalSettings::default(), FlowControlConfig::default());
        mgr.get_or_create("s1").unwrap();

        fx.append("s1", &[&output("cd")]);
        mgr.on_file_changed("s1");
        mgr.on_file_changed("s1");
        mgr.on_file_changed("s1");
        assert_eq!(first_row(&mgr.snapshot("s1").unwrap()), "abcd");
        mgr.shutdown();
    }

    #[tokio::test]
    async fn listeners_get_one_debounced_snapshot_per_burst() {
        let fx = Fixture::new();
        fx.append("s1", &[HEADER]);
        let mgr = fx.manager(TerminalSettings::default(), FlowControlConfig::default());

        let calls = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = calls.clone();
        let listener = mgr
            .subscribe_to_changes(
                "s1",
                Arc::new(move |_id: &str, snap: &BufferSnapshot| {
                    sink.lock().push(first_row(snap));
                }),
            )
            .unwrap();
        assert_eq!(mgr.listener_count("s1"), 1);

        for chunk in ["a", "b", "c"] {
            fx.append("s1", &[&output(chunk)]);
            mgr.on_file_changed("s1");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*calls.lock(), vec!["abc".to_string()]);

        assert!(mgr.unsubscribe("s1", listener));
        assert!(!mgr.unsubscribe("s1", listener));
        fx.append("s1", &[&output("d")]);
        mgr.on_file_changed("s1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.lock().len(), 1);
        mgr.shutdown();
    }

    #[tokio::test]
    async fn exit_stops_ingestion() {
        let fx = Fixture::new();
        fx.append("s1", &[HEADER, &output("done"), r#"["exit",0,"s1"]"#, &output("late")]);
        let mgr = fx.manager(TerminalSettings::default(), FlowControlConfig::default());
        assert_eq!(first_row(&mgr.snapshot("s1").unwrap()), "done");

        fx.append("s1", &[&output("later")]);
        mgr.on_file_changed("s1");
        assert_eq!(first_row(&mgr.snapshot("s1").unwrap()), "done");
        mgr.shutdown();
    }

    #[tokio::test]
    async fn pauses_under_pressure_and_bounds_queue() {
        let fx = Fixture::new();
        let mut lines = vec![HEADER.to_string()];
        for i in 0..200 {
            lines.push(output(&format!("{}\r\n", i)));
        }
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        fx.append("s1", &refs);

        let settings = TerminalSettings {
            scrollback: 50,
            ..TerminalSettings::default()
        };
        let flow = FlowControlConfig {
            buffer_check_interval: 10,
            max_pending_lines: 5,
            max_pause_ms: 0,
            ..FlowControlConfig::default()
        };
        let mgr = fx.manager(settings, flow);
        mgr.get_or_create("s1").unwrap();

        let stats = mgr.buffer_stats("s1").unwrap();
        assert!(stats.is_paused);
        assert_eq!(stats.pending_lines, 5);

        // Writes while paused are left in the file.
        fx.append("s1", &[&output("after pause")]);
        mgr.on_file_changed("s1");
        assert_eq!(mgr.buffer_stats("s1").unwrap().pending_lines, 5);

        // Utilization never drops here, so the pause times out and reading
        // picks up where it stopped.
        std::thread::sleep(Duration::from_millis(5));
        mgr.tick_flow_control();
        let stats = mgr.buffer_stats("s1").unwrap();
        assert!(!stats.is_paused);
        assert_eq!(stats.pending_lines, 0);
        let snap = mgr.snapshot("s1").unwrap();
        let last = snap.cells.last().map(|r| r.iter().map(|c| c.ch.as_str()).collect::<String>());
        assert_eq!(last.as_deref(), Some("after pause"));
        mgr.shutdown();
    }

    #[tokio::test]
    async fn cleanup_removes_sessions_and_listeners() {
        let fx = Fixture::new();
        fx.append("s1", &[HEADER]);
        fx.append("s2", &[HEADER]);
        let mgr = fx.manager(TerminalSettings::default(), FlowControlConfig::default());
        mgr.subscribe_to_changes("s1", Arc::new(|_: &str, _: &BufferSnapshot| {}))
            .unwrap();
        mgr.get_or_create("s2").unwrap();
        assert_eq!(mgr.active_sessions(), vec!["s1".to_string(), "s2".to_string()]);

        mgr.cleanup("s1");
        assert_eq!(mgr.listener_count("s1"), 0);
        assert_eq!(mgr.active_sessions(), vec!["s2".to_string()]);

        assert_eq!(mgr.cleanup_inactive(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(mgr.cleanup_inactive(Duration::ZERO), 1);
        assert!(mgr.active_sessions().is_empty());

        mgr.shutdown();
        assert_eq!(mgr.get_or_create("s2"), Err(TerminalError::ShutDown));
    }
}
