//! Per-block event log retrieval
//!
//! Reads every event the configured contracts emitted in one block and tags
//! each with its fully-qualified `Contract.Event` name.

use crate::error::{SyncError, SyncResult};
use crate::ledger::{Ledger, RawEvent};
use crate::types::TxHash;
use futures::future::try_join_all;
use serde_json::{Map, Value};
use tracing::debug;

/// An event tagged with the contract it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogEntry {
    pub contract_name: String,
    pub event_name: String,
    /// `contract_name + "." + event_name`
    pub fqn: String,
    pub args: Map<String, Value>,
    pub transaction_hash: TxHash,
    pub log_index: u64,
}

impl EventLogEntry {
    /// Tag a raw ledger event with the name of the contract that emitted it.
    pub fn tag(contract_name: &str, raw: RawEvent) -> Self {
        Self {
            contract_name: contract_name.to_string(),
            fqn: format!("{}.{}", contract_name, raw.event),
            event_name: raw.event,
            args: raw.args,
            transaction_hash: raw.transaction_hash,
            log_index: raw.log_index,
        }
    }
}

/// Fetch every event emitted by `contracts` in exactly `block_number`.
///
/// The per-contract reads run concurrently. If any of them fails the whole
/// fetch fails; no partial result is returned.
pub async fn fetch_block_logs<L>(
    ledger: &L,
    block_number: u64,
    contracts: &[String],
) -> SyncResult<Vec<EventLogEntry>>
where
    L: Ledger + ?Sized,
{
    debug!("Reading event logs for block #{}", block_number);

    let reads = contracts.iter().map(|name| async move {
        let raw = ledger
            .get_logs(name, block_number, block_number)
            .await
            .map_err(|e| SyncError::unavailable(format!("get_logs({})", name), e))?;
        Ok::<_, SyncError>(
            raw.into_iter()
                .map(|event| EventLogEntry::tag(name, event))
                .collect::<Vec<_>>(),
        )
    });

    let per_contract = try_join_all(reads).await?;
    Ok(per_contract.into_iter().flatten().collect())
}

/// Events from `events` that were emitted by transaction `hash`.
pub fn transaction_logs(events: &[EventLogEntry], hash: TxHash) -> Vec<EventLogEntry> {
    events
        .iter()
        .filter(|event| event.transaction_hash == hash)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{tx_hash, MockLedger};
    use serde_json::json;

    #[tokio::test]
    async fn test_fetch_tags_and_concatenates() {
        let ledger = MockLedger::new(&["Factory", "Registry"]);
        ledger.add_event("Factory", 5, "Created", json!({"id": 7}), tx_hash(1));
        ledger.add_event("Registry", 5, "Updated", json!({"id": 3}), tx_hash(2));
        ledger.add_event("Registry", 6, "Updated", json!({"id": 4}), tx_hash(3));

        let events = fetch_block_logs(&ledger, 5, &ledger.contract_names())
            .await
            .unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].fqn, "Factory.Created");
        assert_eq!(events[0].contract_name, "Factory");
        assert_eq!(events[1].fqn, "Registry.Updated");
        assert_eq!(events[1].args["id"], json!(3));
    }

    #[tokio::test]
    async fn test_fetch_fails_if_any_contract_fails() {
        let ledger = MockLedger::new(&["Factory", "Registry"]);
        ledger.add_event("Factory", 5, "Created", json!({"id": 7}), tx_hash(1));
        ledger.fail_logs("Registry");

        let err = fetch_block_logs(&ledger, 5, &ledger.contract_names())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("Registry"));
    }

    #[tokio::test]
    async fn test_empty_block_yields_no_events() {
        let ledger = MockLedger::new(&["Factory"]);
        let events = fetch_block_logs(&ledger, 9, &ledger.contract_names())
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn test_transaction_logs_filters_by_hash() {
        let raw = |n: u64| RawEvent {
            event: "Updated".to_string(),
            args: Map::new(),
            transaction_hash: tx_hash(n),
            log_index: n,
        };
        let events = vec![
            EventLogEntry::tag("Registry", raw(1)),
            EventLogEntry::tag("Registry", raw(2)),
            EventLogEntry::tag("Registry", raw(1)),
        ];
        let logs = transaction_logs(&events, tx_hash(1));
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().all(|e| e.transaction_hash == tx_hash(1)));
    }
}
