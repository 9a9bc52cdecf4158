use alloy::{
    primitives::{Address, B256, keccak256},
    rpc::types::{Filter, Log},
};
use async_trait::async_trait;

use crate::{error::FetchError, fetch::FetchService, range::BlockRange};

/// Selects the raw logs one range contributes to the pipeline.
///
/// Implementations must be pure with respect to persistent state and must
/// return logs sorted by `(block_number, log_index)`; the provided
/// [`fetch_logs`](EventFilter::fetch_logs) guarantees the ordering.
#[async_trait]
pub trait EventFilter: Send + Sync {
    /// The base log filter, without block bounds. The fetch layer narrows it
    /// to each range.
    fn filter_spec(&self) -> Filter;

    async fn fetch_logs(
        &self,
        fetch: &FetchService,
        range: BlockRange,
    ) -> Result<Vec<Log>, FetchError> {
        let mut logs = fetch.get_logs(range, &self.filter_spec()).await?;
        sort_logs(&mut logs);
        Ok(logs)
    }
}

/// Sorts by `(block_number, log_index)`. Logs without position metadata
/// (pending logs) sort first and are gap-recorded downstream.
pub(crate) fn sort_logs(logs: &mut [Log]) {
    logs.sort_by_key(|log| (log.block_number.unwrap_or(0), log.log_index.unwrap_or(0)));
}

/// Filter over a contract address list and a `topic0` list.
#[derive(Debug, Clone, Default)]
pub struct AddressTopicFilter {
    addresses: Vec<Address>,
    topics: Vec<B256>,
}

impl AddressTopicFilter {
    /// Matches any of `addresses` emitting any of the `topic0` values. Empty
    /// lists leave the corresponding dimension unconstrained.
    #[must_use]
    pub fn new(addresses: Vec<Address>, topics: Vec<B256>) -> Self {
        Self { addresses, topics }
    }

    /// Builds the topic list from human-readable event signatures such as
    /// `"Transfer(address,address,uint256)"`.
    #[must_use]
    pub fn from_signatures(addresses: Vec<Address>, signatures: &[&str]) -> Self {
        let topics = signatures.iter().map(|sig| keccak256(sig.as_bytes())).collect();
        Self { addresses, topics }
    }
}

#[async_trait]
impl EventFilter for AddressTopicFilter {
    fn filter_spec(&self) -> Filter {
        let mut filter = Filter::new();
        if !self.addresses.is_empty() {
            filter = filter.address(self.addresses.clone());
        }
        if !self.topics.is_empty() {
            filter = filter.event_signature(self.topics.clone());
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::b256;

    use super::*;

    #[test]
    fn signature_hashing_matches_known_topic() {
        let filter = AddressTopicFilter::from_signatures(
            vec![],
            &["Transfer(address,address,uint256)"],
        );
        assert_eq!(
            filter.topics,
            vec![b256!("0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef")]
        );
    }

    #[test]
    fn empty_dimensions_stay_unconstrained() {
        let spec = AddressTopicFilter::default().filter_spec();
        assert!(spec.address.is_empty());
        assert!(spec.topics[0].is_empty());
    }
}
