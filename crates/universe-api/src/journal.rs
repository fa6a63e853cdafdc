//! Append-only event journal: inserts, recipient fan-out, cursor polling.

use contracts::{
    DomainError, EventRecord, EventScope, EventType, EventsPage, EventsQuery, RecipientReason,
    SectorId, TimestampMs, DEFAULT_EVENT_PAGE_SIZE, MAX_EVENT_PAGE_SIZE,
};
use rusqlite::{params, Connection};
use serde_json::Value;

use crate::persistence::{codec_error, storage_error};

/// Everything an event insert needs; the journal assigns the id.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub event_type: EventType,
    pub scope: EventScope,
    pub payload: Value,
    pub actor_character_id: Option<String>,
    pub sector_id: Option<SectorId>,
    pub corp_id: Option<String>,
    pub task_id: Option<String>,
    pub sender_id: Option<String>,
    pub ship_id: Option<String>,
    pub recipients: Vec<(String, RecipientReason)>,
}

impl EventDraft {
    pub fn sector(event_type: EventType, sector_id: SectorId, payload: Value) -> Self {
        Self {
            event_type,
            scope: EventScope::Sector,
            payload,
            actor_character_id: None,
            sector_id: Some(sector_id),
            corp_id: None,
            task_id: None,
            sender_id: None,
            ship_id: None,
            recipients: Vec::new(),
        }
    }

    pub fn actor(mut self, character_id: impl Into<String>) -> Self {
        self.actor_character_id = Some(character_id.into());
        self
    }

    pub fn recipients(mut self, recipients: Vec<(String, RecipientReason)>) -> Self {
        self.recipients = recipients;
        self
    }
}

/// Inserts the event and its recipient rows, returning the assigned id.
/// Duplicate recipients collapse to the first reason seen.
pub fn append_event(
    conn: &Connection,
    draft: &EventDraft,
    now: TimestampMs,
) -> Result<i64, DomainError> {
    let payload_json = serde_json::to_string(&draft.payload).map_err(codec_error)?;
    conn.execute(
        "INSERT INTO events(event_type, created_at, scope, actor_character_id, sector_id,
            corp_id, task_id, sender_id, ship_id, payload_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            draft.event_type.as_str(),
            now,
            draft.scope.as_str(),
            draft.actor_character_id.as_deref(),
            draft.sector_id,
            draft.corp_id.as_deref(),
            draft.task_id.as_deref(),
            draft.sender_id.as_deref(),
            draft.ship_id.as_deref(),
            payload_json,
        ],
    )
    .map_err(storage_error)?;

    let event_id = conn.last_insert_rowid();

    for (character_id, reason) in &draft.recipients {
        conn.execute(
            "INSERT OR IGNORE INTO event_recipients(event_id, character_id, reason)
             VALUES (?1, ?2, ?3)",
            params![event_id, character_id.as_str(), reason.as_str()],
        )
        .map_err(storage_error)?;
    }

    Ok(event_id)
}

pub fn max_event_id(conn: &Connection) -> Result<i64, DomainError> {
    let id = conn
        .query_row("SELECT MAX(id) FROM events", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .map_err(storage_error)?;
    Ok(id.unwrap_or(0))
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let event_type_raw: String = row.get(1)?;
    let scope_raw: String = row.get(3)?;
    let payload_json: String = row.get(10)?;
    Ok(EventRecord {
        id: row.get(0)?,
        event_type: EventType::parse(&event_type_raw).unwrap_or(EventType::CombatRoundResolved),
        timestamp: row.get(2)?,
        scope: EventScope::parse(&scope_raw).unwrap_or(EventScope::Sector),
        actor_character_id: row.get(4)?,
        sector_id: row.get(5)?,
        corp_id: row.get(6)?,
        task_id: row.get(7)?,
        sender_id: row.get(8)?,
        ship_id: row.get(9)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        recipient_reason: None,
        recipient_ids: Vec::new(),
        recipient_reasons: Vec::new(),
    })
}

/// Cursor poll over the journal. Returns events with `id > since_event_id`
/// visible to the query's identities, ascending, capped at the page limit.
/// `initial_only` skips history and just reports the current head.
pub fn events_since(conn: &Connection, query: &EventsQuery) -> Result<EventsPage, DomainError> {
    let since = query.since_event_id.unwrap_or(0);

    if query.initial_only {
        let head = max_event_id(conn)?;
        return Ok(EventsPage {
            events: Vec::new(),
            last_event_id: head.max(since),
            has_more: false,
        });
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_PAGE_SIZE)
        .clamp(1, MAX_EVENT_PAGE_SIZE);

    let mut stmt = conn
        .prepare(
            "SELECT e.id, e.event_type, e.created_at, e.scope, e.actor_character_id,
                    e.sector_id, e.corp_id, e.task_id, e.sender_id, e.ship_id, e.payload_json,
                    r.character_id, r.reason
             FROM events e
             LEFT JOIN event_recipients r ON r.event_id = e.id
             WHERE e.id > ?1
             ORDER BY e.id ASC",
        )
        .map_err(storage_error)?;

    let rows = stmt
        .query_map(params![since], |row| {
            let event = event_from_row(row)?;
            let recipient: Option<String> = row.get(11)?;
            let reason_raw: Option<String> = row.get(12)?;
            Ok((event, recipient, reason_raw))
        })
        .map_err(storage_error)?;

    // Recipient rows arrive interleaved with their event, so each id's group
    // is assembled first and visibility decided afterwards.
    let mut grouped: Vec<EventRecord> = Vec::new();
    let mut has_more = false;

    for row in rows {
        let (event, recipient, reason_raw) = row.map_err(storage_error)?;
        let reason = reason_raw.as_deref().and_then(RecipientReason::parse);

        match grouped.last_mut() {
            Some(last) if last.id == event.id => {
                if let Some(character_id) = recipient {
                    attach_recipient(last, character_id, reason);
                }
            }
            _ => {
                let mut event = event;
                if let Some(character_id) = recipient {
                    attach_recipient(&mut event, character_id, reason);
                }
                grouped.push(event);
            }
        }
    }

    let mut visible: Vec<EventRecord> = Vec::new();
    for event in grouped {
        if !visible_to(&event, query) {
            continue;
        }
        if visible.len() == limit {
            has_more = true;
            break;
        }
        visible.push(event);
    }

    let last_event_id = visible.last().map(|event| event.id).unwrap_or(since);

    Ok(EventsPage {
        events: visible,
        last_event_id,
        has_more,
    })
}

fn attach_recipient(event: &mut EventRecord, character_id: String, reason: Option<RecipientReason>) {
    if event.recipient_ids.contains(&character_id) {
        return;
    }
    event.recipient_ids.push(character_id);
    if let Some(reason) = reason {
        event.recipient_reasons.push(reason);
    }
}

/// An event is visible when any query identity is a recipient, the corp
/// matches, a ship id matches, or the event is a broadcast.
fn visible_to(event: &EventRecord, query: &EventsQuery) -> bool {
    if event.scope == EventScope::Broadcast {
        return true;
    }

    for character_id in &query.character_ids {
        if event.recipient_ids.iter().any(|id| id == character_id) {
            return true;
        }
    }

    if let Some(corp_id) = query.corp_id.as_deref() {
        if event.corp_id.as_deref() == Some(corp_id) {
            return true;
        }
    }

    for ship_id in &query.ship_ids {
        if event.ship_id.as_deref() == Some(ship_id.as_str()) {
            return true;
        }
    }

    false
}

/// Fills `recipient_reason` for the polling character, when they are one.
pub fn tag_recipient_reason(event: &mut EventRecord, character_ids: &[String]) {
    for (index, recipient_id) in event.recipient_ids.iter().enumerate() {
        if character_ids.iter().any(|id| id == recipient_id) {
            event.recipient_reason = event.recipient_reasons.get(index).copied();
            return;
        }
    }
}
