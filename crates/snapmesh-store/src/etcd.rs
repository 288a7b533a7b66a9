//! etcd-backed coordination store.

use std::collections::VecDeque;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, EventType, GetOptions, Txn, TxnOp, WatchOptions,
    WatchStream as EtcdWatchStream, Watcher,
};
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::store::{CoordinationStore, KeyValue, Precondition, WatchEvent, WatchStream};

/// Coordination store talking to an etcd (or xline) cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connects to the given endpoints.
    pub async fn connect(endpoints: &[String]) -> Result<Self, StoreError> {
        let client = Client::connect(endpoints, None).await?;
        debug!(?endpoints, "connected to etcd");
        Ok(Self { client })
    }

    fn convert(kv: &etcd_client::KeyValue) -> Result<KeyValue, StoreError> {
        Ok(KeyValue {
            key: kv.key_str()?.to_string(),
            value: kv.value_str()?.to_string(),
            revision: kv.mod_revision(),
        })
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>, StoreError> {
        let mut client = self.client.clone();
        let resp = client.get(key, None).await?;
        resp.kvs().first().map(Self::convert).transpose()
    }

    async fn get_prefix(&self, prefix: &str) -> Result<(Vec<KeyValue>, i64), StoreError> {
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await?;
        let revision = resp.header().map_or(0, |h| h.revision());
        let kvs = resp
            .kvs()
            .iter()
            .map(Self::convert)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((kvs, revision))
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        precondition: Precondition,
    ) -> Result<i64, StoreError> {
        let mut client = self.client.clone();
        let compare = match precondition {
            Precondition::None => {
                let resp = client.put(key, value, None).await?;
                return Ok(resp.header().map_or(0, |h| h.revision()));
            }
            Precondition::Absent => Compare::version(key, CompareOp::Equal, 0),
            Precondition::Equals(prev) => Compare::value(key, CompareOp::Equal, prev),
        };

        let txn = Txn::new()
            .when([compare])
            .and_then([TxnOp::put(key, value, None)]);
        let resp = client.txn(txn).await?;
        if !resp.succeeded() {
            return Err(StoreError::PreconditionFailed {
                key: key.to_string(),
            });
        }
        Ok(resp.header().map_or(0, |h| h.revision()))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.delete(key, None).await?;
        Ok(())
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: i64,
    ) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let mut opts = WatchOptions::new().with_prefix();
        if start_revision > 0 {
            opts = opts.with_start_revision(start_revision);
        }
        let (watcher, stream) = client.watch(prefix, Some(opts)).await?;

        let state = WatchState {
            prefix: prefix.to_string(),
            _watcher: watcher,
            stream,
            pending: VecDeque::new(),
            done: false,
        };
        Ok(futures::stream::unfold(state, |mut state| async move {
            let item = state.next_event().await?;
            Some((item, state))
        })
        .boxed())
    }
}

struct WatchState {
    prefix: String,
    // Dropping the watcher cancels the watch.
    _watcher: Watcher,
    stream: EtcdWatchStream,
    pending: VecDeque<WatchEvent>,
    done: bool,
}

impl WatchState {
    async fn next_event(&mut self) -> Option<Result<WatchEvent, StoreError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            if self.done {
                return None;
            }
            let resp = match self.stream.message().await {
                Ok(Some(resp)) => resp,
                Ok(None) => return None,
                Err(e) => {
                    self.done = true;
                    return Some(Err(StoreError::from(e)));
                }
            };
            if resp.canceled() {
                warn!(prefix = %self.prefix, "etcd watch canceled");
                self.done = true;
                return Some(Err(StoreError::WatchInterrupted {
                    prefix: self.prefix.clone(),
                    msg: "canceled by server".to_string(),
                }));
            }
            for event in resp.events() {
                let Some(kv) = event.kv() else { continue };
                let converted = match event.event_type() {
                    EventType::Put => EtcdStore::convert(kv).map(WatchEvent::Put),
                    EventType::Delete => kv.key_str().map_err(StoreError::from).map(|key| {
                        WatchEvent::Delete {
                            key: key.to_string(),
                            revision: kv.mod_revision(),
                        }
                    }),
                };
                match converted {
                    Ok(event) => self.pending.push_back(event),
                    Err(e) => {
                        warn!(prefix = %self.prefix, error = %e, "skipping undecodable watch event")
                    }
                }
            }
        }
    }
}
