//! Cache-aware fetch layer between the workers and the chain.
//!
//! [`FetchService`] is the only component that talks to both the
//! [`ChainReader`] and the [`Cache`]. It partitions lookups into cache hits
//! and misses, coalesces concurrent identical block misses into a single RPC
//! round trip, and writes results back only once they are at or below the
//! published safe head, so a reorg can never leave stale data behind.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy::{
    primitives::{Address, B256, keccak256},
    rpc::types::{Filter, Log},
};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::{
    cache::{Cache, cache_key},
    error::FetchError,
    range::BlockRange,
    rpc::ChainReader,
    types::{BlockInfo, TokenMeta},
};

/// Token metadata is effectively immutable; keep it for a day.
const TOKEN_META_TTL: Duration = Duration::from_secs(24 * 60 * 60);

type FlightTable = Mutex<HashMap<String, broadcast::Sender<Result<BlockInfo, FetchError>>>>;

/// Removes its keys from the flight table when dropped.
///
/// A leader holds one of these across the RPC await; if its future is dropped
/// mid-fetch the entries go with it, the senders close, and parked followers
/// fall through to their direct-fetch path instead of waiting forever.
struct FlightGuard<'a> {
    table: &'a FlightTable,
    keys: Vec<String>,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut table = self.table.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in &self.keys {
            table.remove(key);
        }
    }
}

pub struct FetchService {
    chain: Arc<dyn ChainReader>,
    cache: Arc<dyn Cache>,
    namespace: String,
    safe_head: AtomicU64,
    in_flight: FlightTable,
}

impl FetchService {
    pub fn new(chain: Arc<dyn ChainReader>, cache: Arc<dyn Cache>, namespace: &str) -> Self {
        Self {
            chain,
            cache,
            namespace: namespace.to_owned(),
            safe_head: AtomicU64::new(0),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Published by the coordinator each poll: `latest - confirmation_depth`.
    pub fn set_safe_head(&self, block: u64) {
        self.safe_head.store(block, Ordering::Release);
    }

    #[must_use]
    pub fn safe_head(&self) -> u64 {
        self.safe_head.load(Ordering::Acquire)
    }

    pub async fn latest_block(&self) -> Result<u64, FetchError> {
        self.chain.latest_block().await
    }

    /// Resolves every requested block, from cache where possible.
    ///
    /// A block the node does not have is a [`FetchError::BlockNotFound`]; the
    /// coordinator treats that as running ahead of the head and backs off.
    pub async fn get_blocks(
        &self,
        numbers: &[u64],
    ) -> Result<HashMap<u64, BlockInfo>, FetchError> {
        let mut out = HashMap::with_capacity(numbers.len());
        let mut misses = Vec::new();
        for &number in numbers {
            if out.contains_key(&number) {
                continue;
            }
            let key = cache_key(&self.namespace, "block", number);
            match self.cache_get::<BlockInfo>(&key).await {
                Some(info) => {
                    out.insert(number, info);
                }
                None => misses.push(number),
            }
        }
        if misses.is_empty() {
            return Ok(out);
        }

        // Split misses into blocks this task will fetch (leaders) and blocks
        // another task is already fetching (followers). The guard owns the
        // leader entries until the fan-out hands them off.
        let mut leaders = Vec::new();
        let mut followers = Vec::new();
        let mut guard = FlightGuard { table: &self.in_flight, keys: Vec::new() };
        {
            let mut table = self.in_flight.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for &number in &misses {
                let key = cache_key(&self.namespace, "block", number);
                if let Some(tx) = table.get(&key) {
                    followers.push((number, tx.subscribe()));
                } else {
                    let (tx, _) = broadcast::channel(1);
                    table.insert(key.clone(), tx);
                    guard.keys.push(key);
                    leaders.push(number);
                }
            }
        }

        let fetched = if leaders.is_empty() {
            Ok(HashMap::new())
        } else {
            self.chain.fetch_blocks(&leaders).await
        };

        // Fan the leader's outcome out to the followers and clear the table
        // entries before propagating any error. Draining the guard keeps its
        // drop from touching keys a later leader may have re-registered.
        {
            let mut table = self.in_flight.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            for (&number, key) in leaders.iter().zip(guard.keys.drain(..)) {
                if let Some(tx) = table.remove(&key) {
                    let shared = match &fetched {
                        Ok(map) => map
                            .get(&number)
                            .copied()
                            .ok_or(FetchError::BlockNotFound(number)),
                        Err(err) => Err(err.clone()),
                    };
                    let _ = tx.send(shared);
                }
            }
        }

        let fetched = fetched?;
        let safe_head = self.safe_head();
        for &number in &leaders {
            let info = *fetched.get(&number).ok_or(FetchError::BlockNotFound(number))?;
            if number <= safe_head {
                let key = cache_key(&self.namespace, "block", number);
                self.cache_put(&key, &info, None).await;
            }
            out.insert(number, info);
        }

        for (number, mut rx) in followers {
            match rx.recv().await {
                Ok(result) => {
                    out.insert(number, result?);
                }
                // leader gone without broadcasting; fetch directly
                Err(_) => {
                    let map = self.chain.fetch_blocks(&[number]).await?;
                    let info = *map.get(&number).ok_or(FetchError::BlockNotFound(number))?;
                    out.insert(number, info);
                }
            }
        }
        Ok(out)
    }

    /// Logs for one range under the graph's filter. Whole-range results are
    /// cached only once the range is entirely at or below the safe head; the
    /// filter is part of the key, since a range's log set is only immutable
    /// relative to the filter that selected it.
    pub async fn get_logs(
        &self,
        range: BlockRange,
        filter: &Filter,
    ) -> Result<Vec<Log>, FetchError> {
        let key = cache_key(
            &self.namespace,
            "logs",
            format!("{}:{}:{}", filter_fingerprint(filter), range.start(), range.end()),
        );
        if let Some(logs) = self.cache_get::<Vec<Log>>(&key).await {
            return Ok(logs);
        }
        let logs = self.chain.fetch_logs(range, filter).await?;
        if range.end() <= self.safe_head() {
            self.cache_put(&key, &logs, None).await;
        }
        Ok(logs)
    }

    /// ERC-20 metadata, cached per address with a long TTL.
    pub async fn get_token_metadata(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, TokenMeta>, FetchError> {
        let mut out = HashMap::with_capacity(addresses.len());
        let mut misses = Vec::new();
        for &address in addresses {
            if out.contains_key(&address) {
                continue;
            }
            let key = cache_key(&self.namespace, "token", address);
            match self.cache_get::<TokenMeta>(&key).await {
                Some(meta) => {
                    out.insert(address, meta);
                }
                None => misses.push(address),
            }
        }
        if !misses.is_empty() {
            let fetched = self.chain.fetch_token_metadata(&misses).await?;
            for (address, meta) in fetched {
                let key = cache_key(&self.namespace, "token", address);
                self.cache_put(&key, &meta, Some(TOKEN_META_TTL)).await;
                out.insert(address, meta);
            }
        }
        Ok(out)
    }

    /// The node's current hash for one block, never served from cache.
    /// `None` means the node no longer has the number at all.
    pub async fn canonical_hash(&self, number: u64) -> Result<Option<B256>, FetchError> {
        let map = self.chain.fetch_blocks(&[number]).await?;
        Ok(map.get(&number).map(|info| info.hash))
    }

    /// Canonical hashes for many blocks in one round trip, tolerating
    /// omissions. Used by the reorg ancestor search.
    pub async fn canonical_hashes(
        &self,
        numbers: &[u64],
    ) -> Result<HashMap<u64, B256>, FetchError> {
        let map = self.chain.fetch_blocks(numbers).await?;
        Ok(map.into_iter().map(|(number, info)| (number, info.hash)).collect())
    }

    async fn cache_get<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.cache.get(key).await {
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Some(value),
                Err(err) => {
                    warn!(key, error = %err, "undecodable cache entry, treating as miss");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn cache_put<T: serde::Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(key, error = %err, "unserializable cache value, skipping write");
                return;
            }
        };
        if let Err(err) = self.cache.put(key, bytes, ttl).await {
            warn!(key, error = %err, "cache write failed, skipping");
        } else {
            debug!(key, "cache write");
        }
    }
}

fn filter_fingerprint(filter: &Filter) -> String {
    let encoded = serde_json::to_vec(filter).unwrap_or_default();
    format!("{:x}", keccak256(encoded))
}
