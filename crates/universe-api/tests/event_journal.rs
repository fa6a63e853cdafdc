use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use contracts::{EventScope, EventType, EventsQuery, RecipientReason, MAX_EVENT_PAGE_SIZE};
use serde_json::json;
use universe_api::journal::{append_event, events_since, max_event_id, EventDraft};
use universe_api::SqliteUniverseStore;

fn temp_db_path(tag: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_nanos();
    std::env::temp_dir().join(format!("universe-journal-{tag}-{nanos}.sqlite"))
}

fn draft_for(recipient: &str, sector: i64, index: usize) -> EventDraft {
    EventDraft::sector(
        EventType::GarrisonDeployed,
        sector,
        json!({ "index": index }),
    )
    .recipients(vec![(recipient.to_string(), RecipientReason::Sender)])
}

fn query_for(character_id: &str) -> EventsQuery {
    EventsQuery {
        character_ids: vec![character_id.to_string()],
        ..EventsQuery::default()
    }
}

#[test]
fn cursor_pages_are_ascending_gapless_and_resumable() {
    let store = SqliteUniverseStore::open(temp_db_path("cursor")).expect("open store");
    let conn = store.connection();

    for index in 0..7 {
        append_event(conn, &draft_for("alice", 5, index), 1_000 + index as i64)
            .expect("append");
    }

    let mut query = query_for("alice");
    query.limit = Some(3);

    let first = events_since(conn, &query).expect("first page");
    assert_eq!(first.events.len(), 3);
    assert!(first.has_more);
    assert!(first
        .events
        .windows(2)
        .all(|pair| pair[0].id < pair[1].id), "ids must be strictly ascending");

    query.since_event_id = Some(first.last_event_id);
    let second = events_since(conn, &query).expect("second page");
    assert_eq!(second.events.len(), 3);
    assert!(second.has_more);
    assert!(second.events[0].id > first.last_event_id, "pages must not overlap");

    query.since_event_id = Some(second.last_event_id);
    let third = events_since(conn, &query).expect("third page");
    assert_eq!(third.events.len(), 1);
    assert!(!third.has_more);
    assert_eq!(third.last_event_id, max_event_id(conn).expect("head"));

    query.since_event_id = Some(third.last_event_id);
    let empty = events_since(conn, &query).expect("drained");
    assert!(empty.events.is_empty());
    assert!(!empty.has_more);
    assert_eq!(
        empty.last_event_id, third.last_event_id,
        "an empty page keeps the caller's cursor"
    );
}

#[test]
fn initial_only_reports_the_head_without_history() {
    let store = SqliteUniverseStore::open(temp_db_path("initial")).expect("open store");
    let conn = store.connection();

    for index in 0..4 {
        append_event(conn, &draft_for("alice", 5, index), 1_000).expect("append");
    }

    let page = events_since(
        conn,
        &EventsQuery {
            character_ids: vec!["alice".to_string()],
            initial_only: true,
            ..EventsQuery::default()
        },
    )
    .expect("initial poll");

    assert!(page.events.is_empty());
    assert!(!page.has_more);
    assert_eq!(page.last_event_id, max_event_id(conn).expect("head"));
}

#[test]
fn visibility_filters_by_recipient_corp_ship_and_broadcast() {
    let store = SqliteUniverseStore::open(temp_db_path("visibility")).expect("open store");
    let conn = store.connection();

    append_event(conn, &draft_for("alice", 5, 0), 1_000).expect("alice event");

    let mut corp_event = EventDraft::sector(EventType::CombatStarted, 6, json!({}));
    corp_event.corp_id = Some("corp_axis".to_string());
    append_event(conn, &corp_event, 1_001).expect("corp event");

    let mut ship_event = EventDraft::sector(EventType::ShipDestroyed, 7, json!({}));
    ship_event.ship_id = Some("s9".to_string());
    append_event(conn, &ship_event, 1_002).expect("ship event");

    let mut broadcast = EventDraft::sector(EventType::CombatEnded, 8, json!({}));
    broadcast.scope = EventScope::Broadcast;
    append_event(conn, &broadcast, 1_003).expect("broadcast event");

    // Acting on an event grants nothing; only a recipient row does.
    let actor_only = EventDraft::sector(EventType::GarrisonCollected, 9, json!({})).actor("carol");
    append_event(conn, &actor_only, 1_004).expect("actor event");

    let alice = events_since(conn, &query_for("alice")).expect("alice poll");
    let types: Vec<EventType> = alice.events.iter().map(|event| event.event_type).collect();
    assert_eq!(types, vec![EventType::GarrisonDeployed, EventType::CombatEnded]);

    let stranger = events_since(conn, &query_for("mallory")).expect("stranger poll");
    assert_eq!(
        stranger.events.len(),
        1,
        "a stranger sees only the broadcast"
    );

    let carol = events_since(conn, &query_for("carol")).expect("carol poll");
    let carol_types: Vec<EventType> = carol.events.iter().map(|event| event.event_type).collect();
    assert_eq!(
        carol_types,
        vec![EventType::CombatEnded],
        "the actor is not a recipient unless listed as one"
    );

    let corp = events_since(
        conn,
        &EventsQuery {
            corp_id: Some("corp_axis".to_string()),
            ..EventsQuery::default()
        },
    )
    .expect("corp poll");
    assert!(corp
        .events
        .iter()
        .any(|event| event.event_type == EventType::CombatStarted));

    let by_ship = events_since(
        conn,
        &EventsQuery {
            ship_ids: vec!["s9".to_string()],
            ..EventsQuery::default()
        },
    )
    .expect("ship poll");
    assert!(by_ship
        .events
        .iter()
        .any(|event| event.event_type == EventType::ShipDestroyed));
}

#[test]
fn recipient_reason_is_tagged_for_the_polling_character() {
    let store = SqliteUniverseStore::open(temp_db_path("reason")).expect("open store");
    let conn = store.connection();

    let draft = EventDraft::sector(EventType::GarrisonDeployed, 5, json!({})).recipients(vec![
        ("alice".to_string(), RecipientReason::Sender),
        ("bob".to_string(), RecipientReason::SectorSnapshot),
    ]);
    append_event(conn, &draft, 1_000).expect("append");

    let mut page = events_since(conn, &query_for("bob")).expect("bob poll");
    for event in &mut page.events {
        universe_api::journal::tag_recipient_reason(event, &["bob".to_string()]);
    }
    assert_eq!(page.events.len(), 1);
    assert_eq!(
        page.events[0].recipient_reason,
        Some(RecipientReason::SectorSnapshot)
    );
}

proptest::proptest! {
    #![proptest_config(proptest::prelude::ProptestConfig::with_cases(16))]

    /// Walking the cursor in pages of any size visits every event exactly
    /// once, in id order.
    #[test]
    fn property_1_cursor_walk_partitions_the_journal(
        total in 1_usize..40,
        limit in 1_usize..8,
    ) {
        let store = SqliteUniverseStore::open(temp_db_path("walk")).expect("open store");
        let conn = store.connection();

        for index in 0..total {
            append_event(conn, &draft_for("alice", 5, index), 1_000).expect("append");
        }

        let mut seen = Vec::new();
        let mut cursor = None;
        loop {
            let page = events_since(
                conn,
                &EventsQuery {
                    character_ids: vec!["alice".to_string()],
                    since_event_id: cursor,
                    limit: Some(limit),
                    ..EventsQuery::default()
                },
            )
            .expect("poll");

            for event in &page.events {
                seen.push(event.id);
            }
            if !page.has_more && page.events.is_empty() {
                break;
            }
            cursor = Some(page.last_event_id);
            if !page.has_more {
                break;
            }
        }

        proptest::prop_assert_eq!(seen.len(), total);
        proptest::prop_assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    }
}

#[test]
fn page_size_is_clamped_to_the_hard_cap() {
    let store = SqliteUniverseStore::open(temp_db_path("clamp")).expect("open store");
    let conn = store.connection();

    for index in 0..(MAX_EVENT_PAGE_SIZE + 10) {
        append_event(conn, &draft_for("alice", 5, index), 1_000).expect("append");
    }

    let mut query = query_for("alice");
    query.limit = Some(10_000);
    let page = events_since(conn, &query).expect("poll");
    assert_eq!(page.events.len(), MAX_EVENT_PAGE_SIZE);
    assert!(page.has_more);
}
