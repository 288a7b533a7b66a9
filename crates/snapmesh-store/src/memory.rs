//! In-memory coordination store.
//!
//! Backs single-process clusters and tests. Writes are linearized by one lock,
//! every write gets a new revision, and a bounded history lets a watch resume
//! from a revision observed by an earlier prefix read.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::store::{CoordinationStore, KeyValue, Precondition, WatchEvent, WatchStream};

const HISTORY_LIMIT: usize = 16 * 1024;
const WATCH_CHANNEL_CAPACITY: usize = 4096;

struct Inner {
    data: BTreeMap<String, (String, i64)>,
    revision: i64,
    history: VecDeque<WatchEvent>,
}

/// Coordination store held entirely in memory. Clones share the same data.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    events: broadcast::Sender<WatchEvent>,
}

impl MemoryStore {
    /// Creates an empty store at revision 0.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
            })),
            events,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|e| StoreError::Unavailable {
            msg: e.to_string(),
        })
    }

    fn record(&self, inner: &mut Inner, event: WatchEvent) {
        inner.history.push_back(event.clone());
        if inner.history.len() > HISTORY_LIMIT {
            inner.history.pop_front();
        }
        // no receivers is fine
        let _ = self.events.send(event);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.data.get(key).map(|(value, revision)| KeyValue {
            key: key.to_string(),
            value: value.clone(),
            revision: *revision,
        }))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64), StoreError> {
        let inner = self.lock()?;
        let mut result = Vec::new();
        for (key, (value, revision)) in inner.data.range::<String, _>(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            result.push(KeyValue {
                key: key.clone(),
                value: value.clone(),
                revision: *revision,
            });
        }
        Ok((result, inner.revision))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
    ) -> Result<i64, StoreError> {
        let mut inner = self.lock()?;
        let holds = match (&precondition, inner.data.get(key)) {
            (Precondition::None, _) => true,
            (Precondition::Absent, existing) => existing.is_none(),
            (Precondition::Equals(prev), Some((current, _))) => prev == current,
            (Precondition::Equals(_), None) => false,
        };
        if !holds {
            return Err(StoreError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner
            .data
            .insert(key.to_string(), (value.to_string(), revision));
        let event = WatchEvent::Put(KeyValue {
            key: key.to_string(),
            value: value.to_string(),
            revision,
        });
        self.record(&mut inner, event);
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if inner.data.remove(key).is_none() {
            return Ok(());
        }
        inner.revision += 1;
        let event = WatchEvent::Delete {
            key: key.to_string(),
            revision: inner.revision,
        };
        self.record(&mut inner, event);
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<WatchStream, StoreError> {
        // Subscribe and snapshot the backlog under the same lock so no event
        // falls between the two.
        let (backlog, receiver) = {
            let inner = self.lock()?;
            let receiver = self.events.subscribe();
            let backlog: Vec<WatchEvent> = if start_revision > 0 {
                inner
                    .history
                    .iter()
                    .filter(|e| e.revision() >= start_revision && e.key().starts_with(prefix))
                    .cloned()
                    .collect()
            } else {
                Vec::new()
            };
            (backlog, receiver)
        };

        let prefix = prefix.to_string();
        let live = futures::stream::unfold(
            (receiver, prefix, false),
            |(mut receiver, prefix, failed)| async move {
                if failed {
                    return None;
                }
                loop {
                    match receiver.recv().await {
                        Ok(event) if event.key().starts_with(&prefix) => {
                            return Some((Ok(event), (receiver, prefix, false)));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            let err = StoreError::WatchInterrupted {
                                prefix: prefix.clone(),
                                msg: format!("lagged by {skipped} events"),
                            };
                            return Some((Err(err), (receiver, prefix, true)));
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            },
        );

        Ok(futures::stream::iter(backlog.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }
}
