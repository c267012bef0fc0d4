//! Pure merge of the three message feeds of a conversation: store
//! snapshots, real-time pushes and optimistic local sends.
//!
//! Every function keeps the list keyed by id, sorted by timestamp then
//! id, and never shrinks a receipt set.

use std::collections::HashMap;

use courier_shared::MessageRecord;

use crate::model::ClientMessage;

/// Order by timestamp, id as tiebreak.
pub fn sort(list: &mut [ClientMessage]) {
    list.sort_by(|a, b| {
        a.record
            .timestamp
            .cmp(&b.record.timestamp)
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

/// Whether `incoming` is the confirmed copy of the optimistic entry
/// `local`.
///
/// The echoed client id decides when present. Without one, an entry that
/// still carries a temporary id matches on sender and content.
pub fn confirms(local: &ClientMessage, incoming: &MessageRecord) -> bool {
    let local = &local.record;
    if local.id == incoming.id || local.conversation_id != incoming.conversation_id {
        return false;
    }
    if let (Some(ours), Some(theirs)) = (local.client_id.as_deref(), incoming.client_id.as_deref())
    {
        return ours == theirs;
    }
    local.is_temporary()
        && local.sender_id == incoming.sender_id
        && local.kind == incoming.kind
        && local.text == incoming.text
        && local.sender_text == incoming.sender_text
}

/// Replace the local copy with the incoming one, keeping the union of
/// both receipt sets.
fn absorb(local: &mut ClientMessage, incoming: MessageRecord) {
    let previous = std::mem::replace(&mut local.record, incoming);
    local.record.merge_receipts(&previous);
    if local.record.client_id.is_none() {
        local.record.client_id = previous.client_id;
    }
    local.failure = None;
}

/// Insert or update one pushed record. Returns `true` if the record was
/// not in the list before, under either its id or an optimistic id.
pub fn upsert(list: &mut Vec<ClientMessage>, incoming: MessageRecord) -> bool {
    let inserted = if let Some(existing) = list.iter_mut().find(|m| m.record.id == incoming.id) {
        absorb(existing, incoming);
        false
    } else if let Some(pending) = list.iter_mut().find(|m| confirms(m, &incoming)) {
        absorb(pending, incoming);
        false
    } else {
        list.push(ClientMessage::new(incoming));
        true
    };
    dedup(list);
    sort(list);
    inserted
}

/// Merge a store snapshot into the local view.
///
/// An empty snapshot while the local view has messages is treated as a
/// subscription hiccup and leaves the view untouched. Otherwise the
/// result is the union by id: snapshot fields win, receipts are unioned,
/// optimistic entries confirmed by the snapshot are folded in and local
/// entries the snapshot does not cover are kept.
pub fn merge_snapshot(local: &[ClientMessage], snapshot: Vec<MessageRecord>) -> Vec<ClientMessage> {
    if snapshot.is_empty() && !local.is_empty() {
        return local.to_vec();
    }

    let mut merged: Vec<ClientMessage> = local.to_vec();
    for record in snapshot {
        upsert_unsorted(&mut merged, record);
    }
    dedup(&mut merged);
    sort(&mut merged);
    merged
}

fn upsert_unsorted(list: &mut Vec<ClientMessage>, incoming: MessageRecord) {
    if let Some(existing) = list.iter_mut().find(|m| m.record.id == incoming.id) {
        absorb(existing, incoming);
    } else if let Some(pending) = list.iter_mut().find(|m| confirms(m, &incoming)) {
        absorb(pending, incoming);
    } else {
        list.push(ClientMessage::new(incoming));
    }
}

/// Point the optimistic entry `local_id` at the id the server assigned.
///
/// When the confirmed copy already arrived by push the optimistic entry
/// is dropped instead, so the message is never listed twice. Returns
/// `false` if neither id is known.
pub fn reconcile_ack(
    list: &mut Vec<ClientMessage>,
    local_id: &str,
    message_id: &str,
    timestamp: chrono::DateTime<chrono::Utc>,
) -> bool {
    let pending = list.iter().position(|m| m.record.id == local_id);
    let confirmed = list.iter().position(|m| m.record.id == message_id);

    match (pending, confirmed) {
        (Some(p), Some(c)) if p != c => {
            let optimistic = list.remove(p);
            let c = if p < c { c - 1 } else { c };
            list[c].record.merge_receipts(&optimistic.record);
            true
        }
        (Some(p), _) => {
            let entry = &mut list[p];
            entry.record.id = message_id.to_string();
            entry.record.timestamp = timestamp;
            entry.failure = None;
            sort(list);
            true
        }
        (None, Some(_)) => true,
        (None, None) => false,
    }
}

/// Collapse entries sharing an id, keeping the union of receipts.
fn dedup(list: &mut Vec<ClientMessage>) {
    let mut seen: HashMap<String, usize> = HashMap::with_capacity(list.len());
    let mut out: Vec<ClientMessage> = Vec::with_capacity(list.len());
    for message in list.drain(..) {
        match seen.get(&message.record.id) {
            Some(&i) => out[i].record.merge_receipts(&message.record),
            None => {
                seen.insert(message.record.id.clone(), out.len());
                out.push(message);
            }
        }
    }
    *list = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use courier_shared::{MessageKind, MessageMetadata, NewMessage, UserId};

    fn record(id: &str, sender: &str, text: &str, ts: i64) -> MessageRecord {
        NewMessage {
            conversation_id: "direct_a_b".into(),
            sender_id: sender.into(),
            kind: MessageKind::Text,
            text: text.into(),
            nonce: None,
            sender_text: None,
            sender_nonce: None,
            reply_to: None,
            metadata: MessageMetadata::default(),
            client_id: None,
            timestamp: Utc.timestamp_millis_opt(ts).unwrap(),
        }
        .into_record(id.into())
    }

    fn optimistic(local_id: &str, text: &str, ts: i64) -> ClientMessage {
        let mut r = record(local_id, "a", text, ts);
        r.client_id = Some(local_id.into());
        ClientMessage::new(r)
    }

    fn ids(list: &[ClientMessage]) -> Vec<&str> {
        list.iter().map(|m| m.id()).collect()
    }

    #[test]
    fn test_empty_snapshot_keeps_local_view() {
        let local: Vec<ClientMessage> = (0..3)
            .map(|i| ClientMessage::new(record(&format!("m{i}"), "b", "x", 1000 + i)))
            .collect();
        let merged = merge_snapshot(&local, Vec::new());
        assert_eq!(merged.len(), 3);
        assert_eq!(merged, local);
    }

    #[test]
    fn test_empty_snapshot_on_empty_view() {
        assert!(merge_snapshot(&[], Vec::new()).is_empty());
    }

    #[test]
    fn test_echo_replaces_optimistic_entry() {
        let mut list = vec![optimistic("local_x", "hi", 1000)];
        let mut echo = record("Y", "a", "hi", 1005);
        echo.client_id = Some("local_x".into());

        assert!(!upsert(&mut list, echo));
        assert_eq!(ids(&list), vec!["Y"]);

        // the ack arrives after the echo
        assert!(reconcile_ack(&mut list, "local_x", "Y", Utc.timestamp_millis_opt(1005).unwrap()));
        assert_eq!(ids(&list), vec!["Y"]);
    }

    #[test]
    fn test_ack_then_echo() {
        let mut list = vec![optimistic("local_x", "hi", 1000)];
        reconcile_ack(&mut list, "local_x", "Y", Utc.timestamp_millis_opt(1001).unwrap());
        assert_eq!(ids(&list), vec!["Y"]);

        let mut echo = record("Y", "a", "hi", 1001);
        echo.delivered.insert(UserId::from("b"));
        upsert(&mut list, echo);
        assert_eq!(ids(&list), vec!["Y"]);
        assert!(list[0].record.delivered.contains(&UserId::from("b")));
        assert_eq!(list[0].record.client_id.as_deref(), Some("local_x"));
    }

    #[test]
    fn test_content_fallback_without_client_id() {
        let mut local = record("local_x", "a", "same body", 1000);
        local.client_id = None;
        let mut list = vec![ClientMessage::new(local)];

        upsert(&mut list, record("other", "b", "same body", 1001));
        assert_eq!(list.len(), 2);

        upsert(&mut list, record("Y", "a", "same body", 1002));
        assert_eq!(ids(&list), vec!["other", "Y"]);
    }

    #[test]
    fn test_snapshot_folds_optimistic_entry() {
        let local = vec![
            ClientMessage::new(record("m1", "b", "old", 900)),
            optimistic("local_x", "hi", 1000),
        ];
        let mut confirmed = record("Y", "a", "hi", 1003);
        confirmed.client_id = Some("local_x".into());

        let merged = merge_snapshot(&local, vec![confirmed]);
        assert_eq!(ids(&merged), vec!["m1", "Y"]);
    }

    #[test]
    fn test_stale_snapshot_never_shrinks_receipts() {
        let mut fresh = record("m1", "a", "x", 1000);
        fresh.mark_read(&UserId::from("b"));
        let local = vec![ClientMessage::new(fresh)];

        let stale = record("m1", "a", "x", 1000);
        let merged = merge_snapshot(&local, vec![stale]);
        assert!(merged[0].record.read.contains(&UserId::from("b")));
        assert!(merged[0].record.delivered.contains(&UserId::from("b")));
    }

    #[test]
    fn test_ordering_by_timestamp_then_id() {
        let mut list = Vec::new();
        upsert(&mut list, record("c", "a", "3", 2000));
        upsert(&mut list, record("b", "a", "2", 1000));
        upsert(&mut list, record("a", "a", "1", 1000));
        assert_eq!(ids(&list), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_reconcile_unknown_ids() {
        let mut list = vec![ClientMessage::new(record("m1", "a", "x", 1))];
        assert!(!reconcile_ack(&mut list, "local_q", "Z", Utc::now()));
        assert_eq!(list.len(), 1);
    }
}
