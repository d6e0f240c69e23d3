use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::ImageRef;

/// Current on-disk schema. Payloads with any other version tag are
/// rejected rather than migrated; earlier revisions of this app stored a
/// flat message list that is not compatible with the thread collection.
const SCHEMA_VERSION: u32 = 1;
const THREADS_KEY: &str = "threads";

/// Key-value persistence port. The production backend is a directory of
/// JSON files; tests swap in an in-memory map.
pub trait StateStore {
    fn read(&self, key: &str) -> Result<Option<String>>;
    fn write(&self, key: &str, value: &str) -> Result<()>;
}

pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn default_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("could not determine config directory")?;
        Ok(config_dir.join("sonar"))
    }
}

impl StateStore for FileStateStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let path = self.dir.join(format!("{}.json", key));
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&path)?))
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(format!("{}.json", key)), value)?;
        Ok(())
    }
}

impl<S: StateStore> StateStore for std::sync::Arc<S> {
    fn read(&self, key: &str) -> Result<Option<String>> {
        (**self).read(key)
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        (**self).write(key, value)
    }
}

/// In-memory backend for unit tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStateStore {
    entries: std::sync::Mutex<HashMap<String, String>>,
}

impl StateStore for MemoryStateStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// One completed exchange. Immutable once appended to a thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub user_prompt: String,
    pub reply: String,
    pub citations: Vec<String>,
    pub related_questions: Vec<String>,
    pub images: Vec<ImageRef>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

#[derive(Serialize, Deserialize)]
struct SavedThreads {
    version: u32,
    active: String,
    threads: HashMap<String, Thread>,
}

pub struct ThreadStore {
    threads: HashMap<String, Thread>,
    active: String,
    last_id: i64,
    backend: Box<dyn StateStore>,
}

impl ThreadStore {
    /// Rehydrate from the backend, or start with a single empty thread.
    /// A payload that fails to parse or carries an unknown schema version
    /// is rejected and left on disk untouched until the next mutation.
    pub fn load(backend: Box<dyn StateStore>) -> Result<Self> {
        let saved = match backend.read(THREADS_KEY)? {
            Some(raw) => match serde_json::from_str::<SavedThreads>(&raw) {
                Ok(saved) if saved.version == SCHEMA_VERSION => Some(saved),
                Ok(saved) => {
                    warn!(version = saved.version, "unsupported thread schema, starting fresh");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "stored threads unreadable, starting fresh");
                    None
                }
            },
            None => None,
        };

        let mut store = match saved {
            Some(mut saved) => {
                // A dangling active pointer is repaired, not treated as
                // corruption: the newest thread becomes active.
                if !saved.threads.contains_key(&saved.active) {
                    saved.active = saved
                        .threads
                        .values()
                        .max_by_key(|t| t.created_at)
                        .map(|t| t.id.clone())
                        .unwrap_or_default();
                    if !saved.active.is_empty() {
                        warn!(active = %saved.active, "active thread missing, falling back to newest");
                    }
                }
                Self {
                    last_id: saved
                        .threads
                        .keys()
                        .filter_map(|id| id.parse().ok())
                        .max()
                        .unwrap_or(0),
                    threads: saved.threads,
                    active: saved.active,
                    backend,
                }
            }
            None => Self {
                threads: HashMap::new(),
                active: String::new(),
                last_id: 0,
                backend,
            },
        };

        if store.threads.is_empty() {
            store.create_thread()?;
        }
        Ok(store)
    }

    /// Allocate a fresh thread, make it active, and persist.
    pub fn create_thread(&mut self) -> Result<String> {
        let id = self.next_id();
        let now = Utc::now();
        let thread = Thread {
            id: id.clone(),
            name: thread_name(now.with_timezone(&Local), Local::now()),
            created_at: now,
            messages: Vec::new(),
        };
        debug!(thread = %id, "created thread");
        self.threads.insert(id.clone(), thread);
        self.active = id.clone();
        self.persist()?;
        Ok(id)
    }

    /// Switch the active pointer. Unknown ids are ignored; the UI only
    /// offers ids it got from `threads_newest_first`.
    pub fn select_thread(&mut self, id: &str) -> Result<()> {
        if self.threads.contains_key(id) {
            self.active = id.to_string();
            self.persist()?;
        }
        Ok(())
    }

    /// Append a completed message to the named thread. A missing thread is
    /// a no-op: nothing is mutated and nothing is written.
    pub fn append_message(&mut self, thread_id: &str, message: Message) -> Result<()> {
        match self.threads.get_mut(thread_id) {
            Some(thread) => {
                thread.messages.push(message);
                self.persist()
            }
            None => {
                warn!(thread = %thread_id, "dropping message for vanished thread");
                Ok(())
            }
        }
    }

    pub fn active_id(&self) -> &str {
        &self.active
    }

    pub fn active_thread(&self) -> Option<&Thread> {
        self.threads.get(&self.active)
    }

    /// Threads ordered by creation time, most recent first.
    pub fn threads_newest_first(&self) -> Vec<&Thread> {
        let mut threads: Vec<&Thread> = self.threads.values().collect();
        threads.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        threads
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    fn persist(&self) -> Result<()> {
        let saved = SavedThreads {
            version: SCHEMA_VERSION,
            active: self.active.clone(),
            threads: self.threads.clone(),
        };
        let raw = serde_json::to_string(&saved)?;
        self.backend.write(THREADS_KEY, &raw)
    }

    /// Millisecond-epoch id, forced strictly increasing within a session
    /// so two quick "new thread" presses never collide.
    fn next_id(&mut self) -> String {
        let now = Utc::now().timestamp_millis();
        self.last_id = now.max(self.last_id + 1);
        self.last_id.to_string()
    }
}

fn thread_name(created: DateTime<Local>, now: DateTime<Local>) -> String {
    let time = created.format("%H:%M");
    let days_ago = now.num_days_from_ce() - created.num_days_from_ce();
    match days_ago {
        0 => format!("Today {}", time),
        1 => format!("Yesterday {}", time),
        _ => format!("{} {}", created.format("%b %-d"), time),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn message(text: &str) -> Message {
        Message {
            id: Utc::now().timestamp_millis().to_string(),
            user_prompt: "prompt".to_string(),
            reply: text.to_string(),
            citations: vec!["c1".to_string()],
            related_questions: Vec::new(),
            images: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn starts_with_one_empty_default_thread() {
        let store = ThreadStore::load(Box::new(MemoryStateStore::default())).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_thread().unwrap().messages.len(), 0);
    }

    #[test]
    fn thread_ids_increase_within_a_session() {
        let mut store = ThreadStore::load(Box::new(MemoryStateStore::default())).unwrap();
        let mut prev: i64 = store.active_id().parse().unwrap();
        for _ in 0..5 {
            let id: i64 = store.create_thread().unwrap().parse().unwrap();
            assert!(id > prev);
            prev = id;
        }
    }

    #[test]
    fn append_touches_only_the_target_thread() {
        let mut store = ThreadStore::load(Box::new(MemoryStateStore::default())).unwrap();
        let first = store.active_id().to_string();
        let second = store.create_thread().unwrap();

        store.append_message(&second, message("hello")).unwrap();

        let threads = store.threads_newest_first();
        let first_thread = threads.iter().find(|t| t.id == first).unwrap();
        let second_thread = threads.iter().find(|t| t.id == second).unwrap();
        assert_eq!(first_thread.messages.len(), 0);
        assert_eq!(second_thread.messages.len(), 1);
        assert_eq!(second_thread.messages[0].reply, "hello");
    }

    #[test]
    fn append_to_vanished_thread_is_a_silent_no_op() {
        let backend = Arc::new(MemoryStateStore::default());
        let mut store = ThreadStore::load(Box::new(backend.clone())).unwrap();
        let before = backend.read(THREADS_KEY).unwrap().unwrap();

        store.append_message("000", message("lost")).unwrap();

        let after = backend.read(THREADS_KEY).unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn failed_call_path_leaves_persisted_bytes_unchanged() {
        // A failed API call never reaches append_message, so the persisted
        // value must be exactly what the last successful mutation wrote.
        let backend = Arc::new(MemoryStateStore::default());
        let mut store = ThreadStore::load(Box::new(backend.clone())).unwrap();
        let active = store.active_id().to_string();
        store.append_message(&active, message("kept")).unwrap();
        let before = backend.read(THREADS_KEY).unwrap().unwrap();

        drop(store);

        let after = backend.read(THREADS_KEY).unwrap().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn persist_then_rehydrate_round_trips_threads() {
        let backend = Arc::new(MemoryStateStore::default());
        let mut store = ThreadStore::load(Box::new(backend.clone())).unwrap();
        let first = store.active_id().to_string();
        store.append_message(&first, message("answer")).unwrap();
        let second = store.create_thread().unwrap();
        let names: Vec<String> = store
            .threads_newest_first()
            .iter()
            .map(|t| t.name.clone())
            .collect();

        let reloaded = ThreadStore::load(Box::new(backend)).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.active_id(), second);
        let reloaded_names: Vec<String> = reloaded
            .threads_newest_first()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(names, reloaded_names);

        let thread = reloaded.threads_newest_first()[1].clone();
        assert_eq!(thread.id, first);
        assert_eq!(thread.messages.len(), 1);
        assert_eq!(thread.messages[0].reply, "answer");
        assert_eq!(thread.messages[0].citations, ["c1"]);
    }

    #[test]
    fn unknown_schema_version_is_rejected() {
        let backend = Arc::new(MemoryStateStore::default());
        backend
            .write(
                THREADS_KEY,
                r#"{"version": 99, "active": "1", "threads": {"1": {"id": "1", "name": "x", "created_at": "2026-01-01T00:00:00Z", "messages": []}}}"#,
            )
            .unwrap();

        let store = ThreadStore::load(Box::new(backend)).unwrap();
        assert_eq!(store.len(), 1);
        assert_ne!(store.active_id(), "1");
        assert_eq!(store.active_thread().unwrap().messages.len(), 0);
    }

    #[test]
    fn flat_legacy_payload_is_rejected() {
        let backend = Arc::new(MemoryStateStore::default());
        backend.write(THREADS_KEY, r#"[{"id": 1}]"#).unwrap();

        let store = ThreadStore::load(Box::new(backend)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.active_thread().unwrap().messages.len(), 0);
    }

    #[test]
    fn dangling_active_pointer_falls_back_to_the_newest_thread() {
        let backend = Arc::new(MemoryStateStore::default());
        backend
            .write(
                THREADS_KEY,
                r#"{"version": 1, "active": "gone", "threads": {
                    "100": {"id": "100", "name": "Today 09:00", "created_at": "2026-01-01T09:00:00Z", "messages": []},
                    "200": {"id": "200", "name": "Today 10:00", "created_at": "2026-01-01T10:00:00Z", "messages": []}}}"#,
            )
            .unwrap();

        let store = ThreadStore::load(Box::new(backend)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.active_id(), "200");
    }

    #[test]
    fn thread_names_bucket_by_day() {
        let now = Local.with_ymd_and_hms(2026, 3, 10, 9, 30, 0).unwrap();
        let today = Local.with_ymd_and_hms(2026, 3, 10, 8, 5, 0).unwrap();
        let yesterday = Local.with_ymd_and_hms(2026, 3, 9, 22, 15, 0).unwrap();
        let older = Local.with_ymd_and_hms(2026, 2, 1, 14, 0, 0).unwrap();

        assert_eq!(thread_name(today, now), "Today 08:05");
        assert_eq!(thread_name(yesterday, now), "Yesterday 22:15");
        assert_eq!(thread_name(older, now), "Feb 1 14:00");
    }

    #[test]
    fn file_backend_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileStateStore::new(dir.path().to_path_buf());
        assert!(backend.read("threads").unwrap().is_none());

        backend.write("threads", "{\"version\":1}").unwrap();
        assert_eq!(
            backend.read("threads").unwrap().as_deref(),
            Some("{\"version\":1}")
        );
    }
}
