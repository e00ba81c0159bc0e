//! Persistence of dynamic members (`spec.md` §4.1.10).
//!
//! Record format: family `/Queue/PersistentMembers`, key = queue name,
//! value = `|`-separated `interface;penalty;paused` tuples, capped at 2048
//! bytes per record (`spec.md` §6).

use tracing::warn;

use crate::error::Result;
use crate::external::PersistentStore;

use super::types::Member;

pub const FAMILY: &str = "/Queue/PersistentMembers";
const MAX_RECORD_BYTES: usize = 2048;

/// Serialize every dynamic member of `members` into the `|`-separated
/// record format. Returns `None` if there are no dynamic members (the
/// caller should delete the record in that case).
pub fn encode(members: &[Member]) -> Option<String> {
    let tuples: Vec<String> = members
        .iter()
        .filter(|m| m.dynamic)
        .map(|m| format!("{};{};{}", m.interface, m.penalty, m.paused as u8))
        .collect();

    if tuples.is_empty() {
        return None;
    }

    let record = tuples.join("|");
    if record.len() > MAX_RECORD_BYTES {
        warn!(
            "persistent member record exceeds {} bytes ({}), truncating",
            MAX_RECORD_BYTES,
            record.len()
        );
        Some(record.chars().take(MAX_RECORD_BYTES).collect())
    } else {
        Some(record)
    }
}

/// Parse a persisted record back into `(interface, penalty, paused)`
/// tuples, skipping malformed entries.
pub fn decode(record: &str) -> Vec<(String, u32, bool)> {
    record
        .split('|')
        .filter_map(|tuple| {
            let mut parts = tuple.splitn(3, ';');
            let interface = parts.next()?.to_string();
            let penalty: u32 = parts.next()?.parse().ok()?;
            let paused: bool = parts.next()? == "1";
            Some((interface, penalty, paused))
        })
        .collect()
}

/// Rewrite (or delete) the persisted record for `queue_name` to reflect its
/// current dynamic members. Called after every add/remove/pause/unpause of
/// a dynamic member (`spec.md` §4.1.10).
pub async fn sync_record(store: &dyn PersistentStore, queue_name: &str, members: &[Member]) -> Result<()> {
    match encode(members) {
        Some(record) => store.put(FAMILY, queue_name, &record).await,
        None => store.delete(FAMILY, queue_name).await,
    }
}

/// Enumerate all persisted records on startup, returning
/// `(queue_name, Vec<(interface, penalty, paused)>)` pairs for replay
/// (`spec.md` §4.1.10). Entries for queues that no longer exist should be
/// deleted by the caller via [`crate::external::PersistentStore::delete`].
pub async fn load_all(store: &dyn PersistentStore) -> Result<Vec<(String, Vec<(String, u32, bool)>)>> {
    let rows = store.enumerate(FAMILY).await?;
    Ok(rows
        .into_iter()
        .map(|(queue_name, record)| (queue_name, decode(&record)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockPersistentStore;

    fn dynamic_member(interface: &str, penalty: u32, paused: bool) -> Member {
        let mut m = Member::new(interface, penalty, true);
        m.paused = paused;
        m
    }

    #[test]
    fn encode_skips_static_members() {
        let members = vec![dynamic_member("SIP/1", 0, false), Member::new("SIP/2", 0, false)];
        assert_eq!(encode(&members), Some("SIP/1;0;0".to_string()));
    }

    #[test]
    fn encode_returns_none_with_no_dynamic_members() {
        let members = vec![Member::new("SIP/1", 0, false)];
        assert_eq!(encode(&members), None);
    }

    #[test]
    fn encode_decode_roundtrips() {
        let members = vec![dynamic_member("SIP/1", 3, false), dynamic_member("SIP/2", 0, true)];
        let record = encode(&members).unwrap();
        let decoded = decode(&record);
        assert_eq!(decoded, vec![("SIP/1".to_string(), 3, false), ("SIP/2".to_string(), 0, true)]);
    }

    #[test]
    fn decode_skips_malformed_tuples() {
        let decoded = decode("SIP/1;notanumber;0|SIP/2;5;1");
        assert_eq!(decoded, vec![("SIP/2".to_string(), 5, true)]);
    }

    #[tokio::test]
    async fn sync_record_deletes_when_no_dynamic_members_remain() {
        let store = MockPersistentStore::new();
        let dynamic = vec![dynamic_member("SIP/1", 0, false)];
        sync_record(&store, "support", &dynamic).await.unwrap();
        assert!(store.get(FAMILY, "support").await.unwrap().is_some());

        sync_record(&store, "support", &[Member::new("SIP/1", 0, false)]).await.unwrap();
        assert!(store.get(FAMILY, "support").await.unwrap().is_none());
    }
}
