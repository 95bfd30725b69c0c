use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use tokio::sync::mpsc;

/// Change notifications for a single file.
///
/// The parent directory is watched (some backends cannot watch single files)
/// and events are filtered to the target file name. Notifications coalesce:
/// at most one is queued while the handler runs. Dropping the handle stops
/// the watcher and aborts the handler task.
pub struct FileWatch {
    _watcher: RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl FileWatch {
    /// Start watching `path`, calling `on_change` on the current tokio runtime
    /// after each modification.
    pub fn spawn<F>(path: &Path, mut on_change: F) -> notify::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        let target_name = path.file_name().map(|n| n.to_os_string());

        let mut watcher =
            notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        let is_target = event
                            .paths
                            .iter()
                            .any(|p| p.file_name().map(|n| n.to_os_string()) == target_name);
                        if !is_target {
                            return;
                        }
                        if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                            // Full channel means a notification is already pending.
                            let _ = tx.try_send(());
                        }
                    }
                    Err(e) => log::warn!("File watch error: {}", e),
                }
            })?;

        let watch_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                on_change();
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for FileWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn notifies_on_append_only_for_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stdout");
        std::fs::write(&path, b"").unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let watch = FileWatch::spawn(&path, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        std::fs::write(dir.path().join("other"), b"noise").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"data\n").unwrap();
        f.sync_all().unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while hits.load(Ordering::SeqCst) == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(hits.load(Ordering::SeqCst) >= 1);

        drop(watch);
        let before = hits.load(Ordering::SeqCst);
        f.write_all(b"more\n").unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(hits.load(Ordering::SeqCst), before);
    }

    #[test]
    fn missing_directory_fails() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        assert!(FileWatch::spawn(Path::new("/nonexistent/dir/stdout"), || {}).is_err());
    }
}
