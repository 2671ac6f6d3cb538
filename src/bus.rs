//! The bus handle: recovery, topic registry, metadata and shutdown.
//!
//! A [`Bus`] is explicitly constructed with [`Bus::open`] and torn down
//! with [`Bus::shutdown`]; there is no hidden singleton. The topic registry
//! sits behind a single `std::sync::Mutex` taken only on topic-open and
//! shutdown paths -- the publish/subscribe hot paths never touch it.
//!
//! Recovery runs inside `open`, before any topic accepts publishes: every
//! topic listed in `bus.meta.json` is scanned segment by segment, its
//! indices rebuilt, a damaged tail truncated (active segment only), and its
//! id generator seeded past every recovered id.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs::{self, File};
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::BusConfig;
use crate::error::Error;
use crate::id::IdGenerator;
use crate::index::TopicIndex;
use crate::segment::{self, SegmentStore};
use crate::writer::{TopicHandle, spawn_topic_writer};

/// Bus-wide metadata file name, directly under `data_dir`.
const META_FILE: &str = "bus.meta.json";

/// Temp name used for the atomic meta rewrite.
const META_TMP_FILE: &str = "bus.meta.json.tmp";

/// Current metadata format version.
const META_FORMAT_VERSION: u32 = 1;

/// Directory under `data_dir` holding one subdirectory per topic.
const TOPICS_DIR: &str = "topics";

/// Contents of `bus.meta.json`.
#[derive(Debug, Serialize, Deserialize)]
struct BusMeta {
    format_version: u32,
    topics: Vec<String>,
}

impl BusMeta {
    fn empty() -> BusMeta {
        BusMeta {
            format_version: META_FORMAT_VERSION,
            topics: Vec::new(),
        }
    }
}

/// A running topic: its public handle plus the writer task to await at
/// shutdown.
#[derive(Debug)]
struct TopicEntry {
    handle: TopicHandle,
    writer: tokio::task::JoinHandle<()>,
}

#[derive(Debug)]
struct Registry {
    entries: HashMap<String, TopicEntry>,
    meta: BusMeta,
}

#[derive(Debug)]
struct BusInner {
    config: BusConfig,
    registry: Mutex<Registry>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // Writers and subscriptions watch this latch; a bus dropped without
        // an explicit shutdown still terminates them.
        let _ = self.shutdown_tx.send(true);
    }
}

/// Handle to an open bus. Cheap to clone; all clones share one instance.
///
/// Must be used from within a Tokio runtime: opening a topic spawns its
/// writer task.
#[derive(Clone, Debug)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Open the bus at `config.data_dir`, performing recovery for every
    /// known topic before returning.
    ///
    /// # Errors
    ///
    /// Configuration bounds surface as [`Error::LimitExceeded`]; a damaged
    /// meta file as [`Error::InvalidMeta`]; corruption in a sealed segment
    /// as [`Error::UnrecoverableSegment`]; filesystem problems as
    /// [`Error::Io`].
    pub fn open(config: BusConfig) -> Result<Bus, Error> {
        config.validate()?;
        fs::create_dir_all(config.data_dir.join(TOPICS_DIR))?;

        let meta_path = config.data_dir.join(META_FILE);
        let meta = match load_meta(&meta_path)? {
            Some(meta) => meta,
            None => {
                let meta = BusMeta::empty();
                store_meta(&config.data_dir, &meta)?;
                meta
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut entries = HashMap::new();
        for name in &meta.topics {
            let entry = start_topic(name, &config, shutdown_rx.clone())?;
            entries.insert(name.clone(), entry);
        }
        tracing::info!(
            data_dir = %config.data_dir.display(),
            topics = meta.topics.len(),
            "bus opened"
        );

        Ok(Bus {
            inner: Arc::new(BusInner {
                config,
                registry: Mutex::new(Registry { entries, meta }),
                shutdown_tx,
                shutdown_rx,
            }),
        })
    }

    /// Get (or lazily create) a topic and its writer.
    ///
    /// The first open of a new name creates its directory, spawns the
    /// writer task and durably records the topic in `bus.meta.json`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTopic`] / [`Error::LimitExceeded`] for a bad name,
    /// [`Error::Shutdown`] once the bus is closing.
    pub fn topic(&self, name: &str) -> Result<TopicHandle, Error> {
        if *self.inner.shutdown_rx.borrow() {
            return Err(Error::Shutdown);
        }
        validate_topic_name(name, self.inner.config.max_topic_name_bytes)?;

        let mut registry = self.inner.registry.lock().expect("registry mutex poisoned");
        let registry = &mut *registry;
        match registry.entries.entry(name.to_string()) {
            Entry::Occupied(occupied) => Ok(occupied.get().handle.clone()),
            Entry::Vacant(vacant) => {
                let entry = start_topic(name, &self.inner.config, self.inner.shutdown_rx.clone())?;

                // The topic becomes visible only once it is durably listed
                // in the meta file. On a failed write the meta entry is
                // rolled back and the TopicEntry is dropped, which closes
                // its queue and lets the writer task exit on its own; a
                // later open of the same name retries from the directory
                // already on disk.
                if !registry.meta.topics.iter().any(|t| t == name) {
                    registry.meta.topics.push(name.to_string());
                    if let Err(e) = store_meta(&self.inner.config.data_dir, &registry.meta) {
                        registry.meta.topics.pop();
                        return Err(e);
                    }
                }

                let handle = entry.handle.clone();
                vacant.insert(entry);
                Ok(handle)
            }
        }
    }

    /// Shut the bus down: reject new publishes, let every writer drain its
    /// queue, fsync once and exit, and leave subscribers with a terminal
    /// stream. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);

        let entries: Vec<(String, TopicEntry)> = {
            let mut registry = self.inner.registry.lock().expect("registry mutex poisoned");
            registry.entries.drain().collect()
        };

        for (name, entry) in entries {
            drop(entry.handle);
            if entry.writer.await.is_err() {
                tracing::warn!(topic = %name, "writer task panicked during shutdown");
            }
        }
        tracing::info!("bus shut down");
    }
}

/// Recover one topic from disk and spawn its writer.
fn start_topic(
    name: &str,
    config: &BusConfig,
    shutdown: watch::Receiver<bool>,
) -> Result<TopicEntry, Error> {
    let dir = config.data_dir.join(TOPICS_DIR).join(name);
    let mut store = SegmentStore::open(&dir)?;
    let mut index = TopicIndex::new(store.first_segment());
    let mut generator = IdGenerator::new();

    let numbers = store.segment_numbers().to_vec();
    let active = *numbers.last().expect("store always has a segment");

    let mut max_prefix = 0u64;
    let mut last_ts = 0i64;
    let mut recovered = 0usize;

    for number in numbers {
        let scan = segment::scan_segment(&store.path_for(number), number, config.max_payload_bytes)?;
        for (offset, event) in &scan.records {
            index.record_appended(
                event.event_id,
                event.ts_unix_nanos,
                (number, *offset),
                config.timestamp_index_stride,
            );
            max_prefix = max_prefix.max(event.event_id.timestamp_millis());
            last_ts = last_ts.max(event.ts_unix_nanos);
        }
        recovered += scan.records.len();
        index.set_head((number, scan.end));

        if let Some(defect) = scan.defect {
            if number != active {
                return Err(Error::UnrecoverableSegment {
                    segment: number,
                    offset: defect.offset,
                });
            }
            tracing::warn!(
                topic = name,
                segment = number,
                offset = defect.offset,
                detail = %defect.detail,
                "truncating damaged segment tail"
            );
            store.truncate_active(defect.offset)?;
        }
    }

    if recovered > 0 {
        // New ids must sort after every recovered one, wall clock or not.
        generator.seed(max_prefix + 1);
        tracing::info!(topic = name, events = recovered, "recovered topic");
    }

    let (handle, writer) =
        spawn_topic_writer(name, store, index, generator, last_ts, config, shutdown);
    Ok(TopicEntry { handle, writer })
}

/// Names map to directories, so keep them path-neutral.
fn validate_topic_name(name: &str, max_bytes: usize) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::InvalidTopic("name is empty".to_string()));
    }
    if name.len() > max_bytes {
        return Err(Error::LimitExceeded {
            field: "topic",
            len: name.len(),
            max: max_bytes,
        });
    }
    if name.contains(['/', '\\']) || name == "." || name == ".." {
        return Err(Error::InvalidTopic(name.to_string()));
    }
    Ok(())
}

/// Read and validate `bus.meta.json`; `None` when it does not exist yet.
fn load_meta(path: &Path) -> Result<Option<BusMeta>, Error> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let meta: BusMeta =
        serde_json::from_slice(&bytes).map_err(|e| Error::InvalidMeta(e.to_string()))?;
    if meta.format_version != META_FORMAT_VERSION {
        return Err(Error::InvalidMeta(format!(
            "unsupported format version: {}",
            meta.format_version
        )));
    }
    Ok(Some(meta))
}

/// Atomically rewrite `bus.meta.json`: temp file, fsync, rename, fsync dir.
fn store_meta(data_dir: &Path, meta: &BusMeta) -> Result<(), Error> {
    let tmp = data_dir.join(META_TMP_FILE);
    let bytes = serde_json::to_vec_pretty(meta).map_err(|e| Error::InvalidMeta(e.to_string()))?;
    fs::write(&tmp, &bytes)?;
    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, data_dir.join(META_FILE))?;
    File::open(data_dir)?.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn temp_bus() -> (Bus, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let bus = Bus::open(BusConfig::new(dir.path())).expect("open should succeed");
        (bus, dir)
    }

    #[tokio::test]
    async fn open_creates_meta_and_topics_dir() {
        let (bus, dir) = temp_bus();

        assert!(dir.path().join(META_FILE).exists());
        assert!(dir.path().join("topics").is_dir());

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn open_rejects_invalid_config() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut config = BusConfig::new(dir.path());
        config.max_segment_bytes = 1; // below the 1 MiB floor
        let result = Bus::open(config);
        assert!(
            matches!(result, Err(Error::LimitExceeded { .. })),
            "expected LimitExceeded"
        );
    }

    #[tokio::test]
    async fn open_rejects_unknown_meta_version() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        fs::write(
            dir.path().join(META_FILE),
            br#"{"format_version":99,"topics":[]}"#,
        )
        .expect("write meta");

        let result = Bus::open(BusConfig::new(dir.path()));
        assert!(
            matches!(result, Err(Error::InvalidMeta(_))),
            "expected InvalidMeta, got: {result:?}"
        );
    }

    #[tokio::test]
    async fn open_rejects_garbage_meta() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        fs::write(dir.path().join(META_FILE), b"not json at all").expect("write meta");

        let result = Bus::open(BusConfig::new(dir.path()));
        assert!(matches!(result, Err(Error::InvalidMeta(_))));
    }

    #[tokio::test]
    async fn topic_creation_is_recorded_in_meta() {
        let (bus, dir) = temp_bus();

        bus.topic("orders").expect("topic should open");
        bus.topic("audit").expect("topic should open");
        // Re-opening must not duplicate the meta entry.
        bus.topic("orders").expect("topic should reopen");

        let meta = load_meta(&dir.path().join(META_FILE))
            .expect("meta should load")
            .expect("meta should exist");
        assert_eq!(meta.topics, vec!["orders", "audit"]);

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn known_topics_are_recovered_on_reopen() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");

        let id = {
            let bus = Bus::open(BusConfig::new(dir.path())).expect("first open");
            let topic = bus.topic("orders").expect("topic");
            let id = topic
                .publish(Bytes::from_static(b"durable"))
                .await
                .expect("publish");
            bus.shutdown().await;
            id
        };

        let bus = Bus::open(BusConfig::new(dir.path())).expect("reopen");
        let topic = bus.topic("orders").expect("topic after reopen");
        let mut subscription = topic
            .subscribe(
                crate::types::StartFrom::EventId(id),
                crate::types::CursorBound::Inclusive,
            )
            .expect("the recovered id must resolve");
        let item = subscription
            .next()
            .await
            .expect("backlog item")
            .expect("item should be Ok");
        match item {
            crate::types::SubscriptionItem::Event(event) => {
                assert_eq!(event.event_id, id);
                assert_eq!(event.payload, Bytes::from_static(b"durable"));
            }
            other => panic!("expected the recovered event, got: {other:?}"),
        }

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn invalid_topic_names_are_rejected() {
        let (bus, _dir) = temp_bus();

        assert!(matches!(bus.topic(""), Err(Error::InvalidTopic(_))));
        assert!(matches!(bus.topic("a/b"), Err(Error::InvalidTopic(_))));
        assert!(matches!(bus.topic(".."), Err(Error::InvalidTopic(_))));

        let long = "x".repeat(200); // default limit is 128
        assert!(matches!(
            bus.topic(&long),
            Err(Error::LimitExceeded { field: "topic", .. })
        ));

        bus.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_rejects_new_work() {
        let (bus, _dir) = temp_bus();
        let topic = bus.topic("orders").expect("topic");

        bus.shutdown().await;
        bus.shutdown().await; // second call is a no-op

        assert!(matches!(bus.topic("late"), Err(Error::Shutdown)));
        let publish = topic.publish(Bytes::from_static(b"late")).await;
        assert!(matches!(publish, Err(Error::Shutdown)));
    }
}
