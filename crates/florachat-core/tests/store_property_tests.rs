//! Property-based tests for message ordering, reconciliation and room membership

use florachat_core::{
    ConfirmedMessage, Draft, HistoryPage, MessageId, MessageStatus, MessageStore, RoomId,
    RoomRegistry, SenderRole, Timestamp, UserId,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn room() -> RoomId {
    RoomId::new("project:1")
}

/// Generate a confirmed message in the test room
fn arb_confirmed() -> impl Strategy<Value = ConfirmedMessage> {
    (1u64..500, 0u64..10_000, "[a-z]{1,12}").prop_map(|(id, at, content)| ConfirmedMessage {
        id: MessageId::new(id),
        correlation_id: None,
        room_id: room(),
        sender_id: UserId::new("other"),
        sender_role: SenderRole::User,
        content,
        created_at: Timestamp::new(at),
        read: false,
    })
}

#[derive(Debug, Clone)]
enum RoomOp {
    Join(u8),
    Leave(u8),
    Switch(u8, u8),
}

fn arb_room_op() -> impl Strategy<Value = RoomOp> {
    prop_oneof![
        (0u8..6).prop_map(RoomOp::Join),
        (0u8..6).prop_map(RoomOp::Leave),
        (0u8..6, 0u8..6).prop_map(|(a, b)| RoomOp::Switch(a, b)),
    ]
}

fn confirmed_keys(store: &mut MessageStore) -> Vec<(Timestamp, MessageId)> {
    store
        .get_snapshot(&room())
        .iter()
        .filter_map(|m| m.order_key())
        .collect()
}

proptest! {
    /// Property: confirmed messages are always ordered by (created_at, id)
    #[test]
    fn confirmed_messages_totally_ordered(
        live in prop::collection::vec(arb_confirmed(), 0..40),
        history in prop::collection::vec(arb_confirmed(), 0..40),
    ) {
        let mut store = MessageStore::new();
        for message in live {
            store.reconcile(message);
        }
        store.merge_history(&room(), HistoryPage { messages: history, next_cursor: None });

        let keys = confirmed_keys(&mut store);
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(&keys, &sorted);
    }

    /// Property: a server id never appears twice
    #[test]
    fn confirmed_ids_unique(messages in prop::collection::vec(arb_confirmed(), 0..60)) {
        let mut store = MessageStore::new();
        for message in messages.iter().cloned().chain(messages.iter().cloned()) {
            store.append(message);
        }
        let ids: Vec<MessageId> = store
            .get_snapshot(&room())
            .iter()
            .filter_map(|m| m.id)
            .collect();
        let unique: BTreeSet<MessageId> = ids.iter().copied().collect();
        prop_assert_eq!(ids.len(), unique.len());
        let expected: BTreeSet<MessageId> = messages.iter().map(|m| m.id).collect();
        prop_assert_eq!(unique, expected);
    }

    /// Property: every echoed send leaves exactly one confirmed entry
    #[test]
    fn pending_then_echo_yields_single_entry(
        contents in prop::collection::vec("[a-z]{1,8}", 1..12),
        noise in prop::collection::vec(arb_confirmed(), 0..12),
        echo_delay in 0u64..20_000,
    ) {
        let mut store = MessageStore::new();
        let sends: Vec<_> = contents
            .iter()
            .map(|content| {
                let draft = Draft::new(room(), UserId::new("me"), SenderRole::Admin, content.clone());
                (store.insert_pending(draft), content.clone())
            })
            .collect();

        for message in noise.iter().cloned() {
            store.append(message);
        }

        let now = Timestamp::now().as_millis();
        for (offset, (correlation_id, content)) in sends.iter().enumerate() {
            store.reconcile(ConfirmedMessage {
                id: MessageId::new(1_000 + offset as u64),
                correlation_id: Some(*correlation_id),
                room_id: room(),
                sender_id: UserId::new("me"),
                sender_role: SenderRole::Admin,
                content: content.clone(),
                created_at: Timestamp::new(now + echo_delay),
                read: false,
            });
        }

        let snapshot = store.get_snapshot(&room());
        for (correlation_id, _) in &sends {
            let matching: Vec<_> = snapshot
                .iter()
                .filter(|m| m.correlation_id == Some(*correlation_id))
                .collect();
            prop_assert_eq!(matching.len(), 1);
            prop_assert_eq!(matching[0].status, MessageStatus::Confirmed);
        }
        prop_assert_eq!(store.pending_count(&room()), 0);
    }

    /// Property: the registry never reports a room joined twice and agrees with a set model
    #[test]
    fn registry_matches_set_model(ops in prop::collection::vec(arb_room_op(), 0..80)) {
        let mut registry = RoomRegistry::new();
        let mut model = BTreeSet::new();
        let name = |n: u8| RoomId::new(format!("room:{}", n));

        for op in ops {
            match op {
                RoomOp::Join(n) => {
                    let outcome = registry.join_room(&name(n));
                    prop_assert_eq!(outcome.needs_frame(), model.insert(n));
                }
                RoomOp::Leave(n) => {
                    registry.leave_room(&name(n));
                    model.remove(&n);
                }
                RoomOp::Switch(from, to) => {
                    registry.switch_room(Some(&name(from)), &name(to));
                    if from != to {
                        model.remove(&from);
                    }
                    model.insert(to);
                }
            }
        }

        let joined = registry.joined_rooms();
        let unique: BTreeSet<&RoomId> = joined.iter().collect();
        prop_assert_eq!(joined.len(), unique.len());
        let expected: BTreeSet<RoomId> = model.into_iter().map(name).collect();
        let actual: BTreeSet<RoomId> = joined.into_iter().collect();
        prop_assert_eq!(actual, expected);
    }
}
