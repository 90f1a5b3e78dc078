//! End-to-end engine scenarios with a scripted change source.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tidsync::config::{RetryConfig, WatchConfig};
use tidsync::watcher::{EventSink, RawEvent, SourceFactory, VcsNotifyOptions};
use tidsync::{
    AlertLog, ChangeSource, Document, FileStore, LocalFileStore, RouteConfig, Settings, SyncEngine,
    SyncError, VcsNotifier, WatchError, WatchState,
};
use tokio::sync::Notify;

type Sinks = Arc<Mutex<HashMap<PathBuf, EventSink>>>;

/// Change source whose events are pushed by the test.
struct ManualSource {
    sinks: Sinks,
    root: Option<PathBuf>,
}

impl ChangeSource for ManualSource {
    fn start(&mut self, root: &Path, sink: EventSink) -> Result<(), WatchError> {
        self.root = Some(root.to_path_buf());
        self.sinks.lock().insert(root.to_path_buf(), sink);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(root) = self.root.take() {
            self.sinks.lock().remove(&root);
        }
    }

    fn update_exclusions(&mut self, _patterns: &[String]) -> Result<(), WatchError> {
        Ok(())
    }
}

fn manual_factory(sinks: &Sinks) -> SourceFactory {
    let sinks = Arc::clone(sinks);
    Arc::new(move || {
        Box::new(ManualSource {
            sinks: Arc::clone(&sinks),
            root: None,
        }) as Box<dyn ChangeSource>
    })
}

#[derive(Default)]
struct RecordingVcs {
    calls: Mutex<Vec<(PathBuf, VcsNotifyOptions)>>,
}

impl VcsNotifier for RecordingVcs {
    fn notify_file_change(&self, root: &Path, options: VcsNotifyOptions) {
        self.calls.lock().push((root.to_path_buf(), options));
    }
}

fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.watch = WatchConfig {
        batch_window_ms: 20,
        delete_grace_ms: 200,
        inclusion_delay_ms: 150,
        sync_debounce_ms: 20,
        vcs_debounce_ms: 20,
        ..WatchConfig::default()
    };
    settings.retry = RetryConfig {
        initial_delay_ms: 1,
        multiplier: 2.0,
        max_delay_ms: 4,
        max_attempts: 3,
    };
    settings
}

async fn wait_for_sink(sinks: &Sinks, root: &Path) {
    for _ in 0..200 {
        if sinks.lock().contains_key(root) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("root {} never started", root.display());
}

fn push(sinks: &Sinks, root: &Path, event: RawEvent) {
    let sink = sinks.lock().get(root).cloned().unwrap();
    sink(event);
}

async fn signalled(notify: &Notify) {
    tokio::time::timeout(Duration::from_secs(5), notify.notified())
        .await
        .expect("sync signal");
}

#[tokio::test]
async fn test_own_writes_are_not_reported_back() {
    let dir = TempDir::new().unwrap();
    let sinks: Sinks = Arc::default();
    let notify = Arc::new(Notify::new());
    let engine = SyncEngine::builder(dir.path())
        .settings(fast_settings())
        .sync_target(notify.clone())
        .source_factory(manual_factory(&sinks))
        .start()
        .unwrap();
    let main = engine.main_root().to_path_buf();
    wait_for_sink(&sinks, &main).await;

    let record = engine
        .save(&Document::new("Entry").with_field("text", "mine"))
        .await
        .unwrap();
    assert_eq!(record.absolute_path, main.join("Entry.tid"));
    push(&sinks, &main, RawEvent::Modified(record.absolute_path.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(engine.drain_changes().is_empty());

    // Past the inclusion delay, edits are external again.
    fs::write(&record.absolute_path, "title: Entry\n\ntheirs").unwrap();
    push(&sinks, &main, RawEvent::Modified(record.absolute_path.clone()));
    signalled(&notify).await;

    let drained = engine.drain_changes();
    assert_eq!(drained.modifications, vec!["Entry"]);
    assert!(drained.deletions.is_empty());
    let doc = engine.load_document("Entry").unwrap();
    assert_eq!(doc.field("text"), Some("theirs"));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_then_recreate_within_grace_is_a_modification() {
    let dir = TempDir::new().unwrap();
    let sinks: Sinks = Arc::default();
    let notify = Arc::new(Notify::new());
    let engine = SyncEngine::builder(dir.path())
        .settings(fast_settings())
        .sync_target(notify.clone())
        .source_factory(manual_factory(&sinks))
        .start()
        .unwrap();
    let main = engine.main_root().to_path_buf();
    wait_for_sink(&sinks, &main).await;

    let path = engine
        .save(&Document::new("Entry").with_field("text", "v1"))
        .await
        .unwrap()
        .absolute_path;
    tokio::time::sleep(Duration::from_millis(200)).await;

    fs::remove_file(&path).unwrap();
    push(&sinks, &main, RawEvent::Removed(path.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    fs::write(&path, "title: Entry\n\nv2").unwrap();
    push(&sinks, &main, RawEvent::Created(path.clone()));

    signalled(&notify).await;
    // Let the cancelled grace period run out.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let drained = engine.drain_changes();
    assert_eq!(drained.modifications, vec!["Entry"]);
    assert!(drained.deletions.is_empty());
    assert!(engine.index().read().record_for_title("Entry").is_some());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_external_delete_after_grace() {
    let dir = TempDir::new().unwrap();
    let sinks: Sinks = Arc::default();
    let notify = Arc::new(Notify::new());
    let engine = SyncEngine::builder(dir.path())
        .settings(fast_settings())
        .sync_target(notify.clone())
        .source_factory(manual_factory(&sinks))
        .start()
        .unwrap();
    let main = engine.main_root().to_path_buf();
    wait_for_sink(&sinks, &main).await;

    let path = engine.save(&Document::new("Gone")).await.unwrap().absolute_path;
    tokio::time::sleep(Duration::from_millis(200)).await;

    fs::remove_file(&path).unwrap();
    push(&sinks, &main, RawEvent::Removed(path));
    signalled(&notify).await;

    let drained = engine.drain_changes();
    assert_eq!(drained.deletions, vec!["Gone"]);
    assert!(drained.modifications.is_empty());
    assert!(engine.index().read().record_for_title("Gone").is_none());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_routes_from_settings_file_and_reload() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path();
    let settings_path = workspace.join(".tidsync").join("settings.toml");
    fs::create_dir_all(settings_path.parent().unwrap()).unwrap();

    let watch_table = r#"
[watch]
batch_window_ms = 20
delete_grace_ms = 50
inclusion_delay_ms = 150
sync_debounce_ms = 20
vcs_debounce_ms = 20
"#;
    let routes_table = r#"
[[routes]]
id = "journal"
root = "journal"
tags = ["Journal"]
"#;
    fs::write(&settings_path, format!("{watch_table}{routes_table}")).unwrap();

    let sinks: Sinks = Arc::default();
    let notify = Arc::new(Notify::new());
    let vcs = Arc::new(RecordingVcs::default());
    let engine = SyncEngine::builder(workspace)
        .sync_target(notify.clone())
        .vcs_notifier(vcs.clone())
        .source_factory(manual_factory(&sinks))
        .start()
        .unwrap();
    assert_eq!(engine.settings_path(), settings_path.as_path());
    assert_eq!(engine.settings().watch.batch_window_ms, 20);

    let journal = workspace.join("journal");
    assert_eq!(engine.sub_roots(), vec![journal.clone()]);
    wait_for_sink(&sinks, &journal).await;
    assert_eq!(engine.watcher().root_state(&journal), WatchState::Watching);

    let record = engine
        .save(&Document::new("Day 1").with_tags(["Journal"]))
        .await
        .unwrap();
    assert_eq!(record.absolute_path, journal.join("Day 1.tid"));

    // An external file in the route root is picked up like any other.
    let external = journal.join("Day 2.tid");
    fs::write(&external, "title: Day 2\ntags: Journal\n\nnotes").unwrap();
    push(&sinks, &journal, RawEvent::Created(external));
    signalled(&notify).await;
    assert_eq!(engine.drain_changes().modifications, vec!["Day 2"]);

    for _ in 0..200 {
        if !vcs.calls.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let calls = vcs.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, journal);
    assert!(calls[0].1.only_when_relevant_view_open);

    // Dropping the route stops watching its root.
    fs::write(&settings_path, watch_table).unwrap();
    assert_eq!(engine.reload_routes().unwrap(), 0);
    assert!(engine.sub_roots().is_empty());
    for _ in 0..200 {
        if engine.watcher().root_state(&journal) == WatchState::Stopped {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.watcher().root_state(&journal), WatchState::Stopped);
    assert!(!sinks.lock().contains_key(&journal));

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_broken_settings_keep_previous_routes() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path();
    let settings_path = workspace.join(".tidsync").join("settings.toml");
    fs::create_dir_all(settings_path.parent().unwrap()).unwrap();
    fs::write(
        &settings_path,
        "[[routes]]\nid = \"journal\"\nroot = \"journal\"\ntags = [\"Journal\"]\n",
    )
    .unwrap();

    let sinks: Sinks = Arc::default();
    let engine = SyncEngine::builder(workspace)
        .source_factory(manual_factory(&sinks))
        .start()
        .unwrap();
    assert_eq!(engine.router().routes().len(), 1);

    fs::write(&settings_path, "[[routes]\nthis is not toml").unwrap();
    assert!(matches!(engine.reload_routes(), Err(SyncError::Config { .. })));
    assert_eq!(engine.router().routes().len(), 1);
    assert_eq!(engine.sub_roots(), vec![workspace.join("journal")]);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discover_existing_documents() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path();
    let main = workspace.join("tiddlers");
    let journal = workspace.join("journal");
    fs::create_dir_all(main.join("files")).unwrap();
    fs::create_dir_all(&journal).unwrap();
    fs::write(main.join("Home.tid"), "title: Home\n\nwelcome").unwrap();
    fs::write(main.join("files").join("Attachment.tid"), "title: Attachment\n\n").unwrap();
    fs::write(journal.join("Day.tid"), "title: Day\ntags: Journal\n\n").unwrap();

    let mut settings = fast_settings();
    settings.routes = vec![RouteConfig::new("journal", "journal", ["Journal"])];
    let sinks: Sinks = Arc::default();
    let engine = SyncEngine::builder(workspace)
        .settings(settings)
        .source_factory(manual_factory(&sinks))
        .start()
        .unwrap();

    let discovered = engine.discover();
    let mut titles: Vec<&str> = discovered.documents.iter().map(Document::title).collect();
    titles.sort();
    assert_eq!(titles, vec!["Day", "Home"]);
    assert!(discovered.failed.is_empty());

    let index = engine.index().read();
    assert_eq!(
        index.record_for_title("Day").unwrap().absolute_path,
        journal.join("Day.tid")
    );
    drop(index);

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_discover_reports_each_title_once() {
    let dir = TempDir::new().unwrap();
    let workspace = dir.path();
    let main = workspace.join("tiddlers");
    let journal = workspace.join("journal");
    fs::create_dir_all(&main).unwrap();
    fs::create_dir_all(&journal).unwrap();
    fs::write(main.join("Day.tid"), "title: Day\n\nmain copy").unwrap();
    fs::write(journal.join("Day.tid"), "title: Day\ntags: Journal\n\n").unwrap();
    for i in 0..20 {
        fs::write(journal.join(format!("Note{i}.tid")), format!("title: Note{i}\n\n")).unwrap();
    }

    let mut settings = fast_settings();
    settings.routes = vec![RouteConfig::new("journal", "journal", ["Journal"])];
    let sinks: Sinks = Arc::default();
    let engine = SyncEngine::builder(workspace)
        .settings(settings)
        .source_factory(manual_factory(&sinks))
        .start()
        .unwrap();

    let discovered = engine.discover();
    let days = discovered
        .documents
        .iter()
        .filter(|doc| doc.title() == "Day")
        .count();
    assert_eq!(days, 1);
    assert_eq!(discovered.documents.len(), 21);

    engine.shutdown().await.unwrap();
}

/// Store that reports a busy file for the first `busy` writes.
struct BusyStore {
    busy: u32,
    writes: AtomicU32,
}

#[async_trait]
impl FileStore for BusyStore {
    async fn write(&self, path: &Path, contents: &str) -> io::Result<()> {
        let attempt = self.writes.fetch_add(1, Ordering::SeqCst);
        if attempt < self.busy {
            return Err(io::Error::from(io::ErrorKind::ResourceBusy));
        }
        LocalFileStore.write(path, contents).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        LocalFileStore.remove(path).await
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

#[tokio::test]
async fn test_locked_file_is_retried_then_written() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BusyStore {
        busy: 2,
        writes: AtomicU32::new(0),
    });
    let alerts = Arc::new(AlertLog::new());
    let engine = SyncEngine::builder(dir.path())
        .settings(fast_settings())
        .file_store(store.clone())
        .alerts(alerts.clone())
        .source_factory(manual_factory(&Sinks::default()))
        .start()
        .unwrap();

    let record = engine.save(&Document::new("Locked")).await.unwrap();
    assert!(record.absolute_path.exists());
    assert_eq!(store.writes.load(Ordering::SeqCst), 3);
    assert!(alerts.is_empty());

    engine.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_retries_raise_an_alert() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(BusyStore {
        busy: u32::MAX,
        writes: AtomicU32::new(0),
    });
    let alerts = Arc::new(AlertLog::new());
    let engine = SyncEngine::builder(dir.path())
        .settings(fast_settings())
        .file_store(store.clone())
        .alerts(alerts.clone())
        .source_factory(manual_factory(&Sinks::default()))
        .start()
        .unwrap();

    let err = engine.save(&Document::new("Stuck")).await.unwrap_err();
    assert!(matches!(err, SyncError::RetriesExhausted { .. }));
    assert_eq!(err.attempts(), Some(3));
    assert!(engine.index().read().record_for_title("Stuck").is_none());

    let raised = alerts.take();
    assert_eq!(raised.len(), 1);
    assert_eq!(raised[0].attempts, 3);
    assert!(raised[0].title.starts_with("alerts/sync/"));

    engine.shutdown().await.unwrap();
}
