//! Batched JSON-RPC access to the chain.
//!
//! [`BatchClient`] packs block and `eth_call` lookups into wire-level JSON-RPC
//! batches and retries transient failures with exponential backoff before they
//! surface as [`FetchError`]s. The [`ChainReader`] trait is the seam the fetch
//! service and tests program against.

use std::{collections::HashMap, time::Duration};

use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, Bytes},
    providers::{Provider, RootProvider},
    rpc::types::{Block, Filter, Log, TransactionRequest},
    sol,
    sol_types::SolCall,
    transports::{RpcError, TransportErrorKind, http::reqwest::Url},
};
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use tracing::{debug, info};

use crate::{
    error::{FetchError, is_transient_rpc},
    range::BlockRange,
    types::{BlockInfo, TokenMeta},
};

const MAX_RETRIES: usize = 5;
const MIN_RETRY_DELAY: Duration = Duration::from_millis(200);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

sol! {
    function name() external view returns (string);
    function symbol() external view returns (string);
    function decimals() external view returns (uint8);
}

/// Read-only chain access used by the fetch service.
///
/// Absent blocks are reported by omission from the returned map; the caller
/// decides whether an omission is an error.
#[async_trait]
pub trait ChainReader: Send + Sync {
    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<HashMap<u64, BlockInfo>, FetchError>;

    async fn fetch_logs(&self, range: BlockRange, filter: &Filter)
    -> Result<Vec<Log>, FetchError>;

    async fn fetch_token_metadata(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, TokenMeta>, FetchError>;

    async fn latest_block(&self) -> Result<u64, FetchError>;
}

/// [`ChainReader`] over a single HTTP(S) endpoint.
pub struct BatchClient {
    provider: RootProvider,
    rpc_batch_size: usize,
}

impl BatchClient {
    pub fn connect(rpc_url: &str, rpc_batch_size: usize) -> Result<Self, FetchError> {
        let url: Url = rpc_url
            .parse()
            .map_err(|_| FetchError::classify(TransportErrorKind::custom_str("invalid RPC URL")))?;
        Ok(Self { provider: RootProvider::new_http(url), rpc_batch_size })
    }

    fn retry_strategy() -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_max_times(MAX_RETRIES)
            .with_min_delay(MIN_RETRY_DELAY)
            .with_max_delay(MAX_RETRY_DELAY)
    }

    /// Runs `operation` under the shared backoff policy, retrying only
    /// transient failures.
    async fn with_retry<T, F, Fut>(&self, label: &str, operation: F) -> Result<T, FetchError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RpcError<TransportErrorKind>>>,
    {
        operation
            .retry(Self::retry_strategy())
            .when(is_transient_rpc)
            .notify(|err: &RpcError<TransportErrorKind>, dur: Duration| {
                info!(call = label, error = %err, "RPC error, retrying after {:?}", dur);
            })
            .sleep(tokio::time::sleep)
            .await
            .map_err(FetchError::classify)
    }

    async fn fetch_blocks_once(
        &self,
        numbers: &[u64],
    ) -> Result<HashMap<u64, BlockInfo>, RpcError<TransportErrorKind>> {
        let mut out = HashMap::with_capacity(numbers.len());
        for chunk in numbers.chunks(self.rpc_batch_size) {
            let mut batch = alloy::rpc::client::BatchRequest::new(self.provider.client());
            let mut waiters = Vec::with_capacity(chunk.len());
            for &number in chunk {
                let waiter = batch.add_call::<_, Option<Block>>(
                    "eth_getBlockByNumber",
                    &(BlockNumberOrTag::Number(number), false),
                )?;
                waiters.push((number, waiter));
            }
            batch.send().await?;
            for (number, waiter) in waiters {
                if let Some(block) = waiter.await? {
                    out.insert(number, BlockInfo::from(&block));
                } else {
                    debug!(block = number, "requested block absent from node");
                }
            }
        }
        Ok(out)
    }

    async fn fetch_token_metadata_once(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, TokenMeta>, RpcError<TransportErrorKind>> {
        let mut out = HashMap::with_capacity(addresses.len());
        // three eth_calls per token share one wire batch
        let tokens_per_batch = (self.rpc_batch_size / 3).max(1);
        for chunk in addresses.chunks(tokens_per_batch) {
            let mut batch = alloy::rpc::client::BatchRequest::new(self.provider.client());
            let mut waiters = Vec::with_capacity(chunk.len());
            for &address in chunk {
                let name = add_eth_call(&mut batch, address, nameCall {}.abi_encode())?;
                let symbol = add_eth_call(&mut batch, address, symbolCall {}.abi_encode())?;
                let decimals = add_eth_call(&mut batch, address, decimalsCall {}.abi_encode())?;
                waiters.push((address, name, symbol, decimals));
            }
            batch.send().await?;
            for (address, name, symbol, decimals) in waiters {
                // reverts and non-conforming returns degrade to defaults
                let meta = TokenMeta {
                    name: decode_or_default(name.await, |b| nameCall::abi_decode_returns(b)),
                    symbol: decode_or_default(symbol.await, |b| symbolCall::abi_decode_returns(b)),
                    decimals: decode_or_default(decimals.await, |b| {
                        decimalsCall::abi_decode_returns(b)
                    }),
                };
                out.insert(address, meta);
            }
        }
        Ok(out)
    }
}

fn add_eth_call(
    batch: &mut alloy::rpc::client::BatchRequest<'_>,
    address: Address,
    calldata: Vec<u8>,
) -> Result<alloy::rpc::client::Waiter<Bytes>, RpcError<TransportErrorKind>> {
    let request = TransactionRequest::default().to(address).input(Bytes::from(calldata).into());
    batch.add_call("eth_call", &(request, BlockNumberOrTag::Latest))
}

fn decode_or_default<T: Default, E>(
    response: Result<Bytes, RpcError<TransportErrorKind>>,
    decode: impl FnOnce(&[u8]) -> Result<T, E>,
) -> T {
    response.ok().and_then(|bytes| decode(&bytes).ok()).unwrap_or_default()
}

#[async_trait]
impl ChainReader for BatchClient {
    async fn fetch_blocks(&self, numbers: &[u64]) -> Result<HashMap<u64, BlockInfo>, FetchError> {
        self.with_retry("eth_getBlockByNumber", || self.fetch_blocks_once(numbers)).await
    }

    async fn fetch_logs(
        &self,
        range: BlockRange,
        filter: &Filter,
    ) -> Result<Vec<Log>, FetchError> {
        let scoped = filter.clone().from_block(range.start()).to_block(range.end());
        self.with_retry("eth_getLogs", || self.provider.get_logs(&scoped)).await
    }

    async fn fetch_token_metadata(
        &self,
        addresses: &[Address],
    ) -> Result<HashMap<Address, TokenMeta>, FetchError> {
        self.with_retry("eth_call", || self.fetch_token_metadata_once(addresses)).await
    }

    async fn latest_block(&self) -> Result<u64, FetchError> {
        self.with_retry("eth_blockNumber", || self.provider.get_block_number()).await
    }
}
