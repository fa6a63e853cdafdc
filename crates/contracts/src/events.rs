//! Append-only event contracts: journal rows, recipient tags, poll shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{SectorId, TimestampMs};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Direct,
    Sector,
    Broadcast,
}

impl EventScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Sector => "sector",
            Self::Broadcast => "broadcast",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "direct" | "self" => Some(Self::Direct),
            "sector" => Some(Self::Sector),
            "broadcast" => Some(Self::Broadcast),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CombatStarted,
    CombatRoundResolved,
    CombatTollDemanded,
    CombatTollPaid,
    CombatEnded,
    ShipDestroyed,
    SalvageCreated,
    GarrisonDeployed,
    GarrisonCollected,
    GarrisonDestroyed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CombatStarted => "combat.started",
            Self::CombatRoundResolved => "combat.round_resolved",
            Self::CombatTollDemanded => "combat.toll_demanded",
            Self::CombatTollPaid => "combat.toll_paid",
            Self::CombatEnded => "combat.ended",
            Self::ShipDestroyed => "ship.destroyed",
            Self::SalvageCreated => "salvage.created",
            Self::GarrisonDeployed => "garrison.deployed",
            Self::GarrisonCollected => "garrison.collected",
            Self::GarrisonDestroyed => "garrison.destroyed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "combat.started" => Some(Self::CombatStarted),
            "combat.round_resolved" => Some(Self::CombatRoundResolved),
            "combat.toll_demanded" => Some(Self::CombatTollDemanded),
            "combat.toll_paid" => Some(Self::CombatTollPaid),
            "combat.ended" => Some(Self::CombatEnded),
            "ship.destroyed" => Some(Self::ShipDestroyed),
            "salvage.created" => Some(Self::SalvageCreated),
            "garrison.deployed" => Some(Self::GarrisonDeployed),
            "garrison.collected" => Some(Self::GarrisonCollected),
            "garrison.destroyed" => Some(Self::GarrisonDestroyed),
            _ => None,
        }
    }
}

/// Why a character is entitled to see an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecipientReason {
    Sender,
    Recipient,
    SectorSnapshot,
    GarrisonOwner,
    GarrisonCorpMember,
    TaskOwner,
}

impl RecipientReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sender => "sender",
            Self::Recipient => "recipient",
            Self::SectorSnapshot => "sector_snapshot",
            Self::GarrisonOwner => "garrison_owner",
            Self::GarrisonCorpMember => "garrison_corp_member",
            Self::TaskOwner => "task_owner",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "sender" => Some(Self::Sender),
            "recipient" => Some(Self::Recipient),
            "sector_snapshot" => Some(Self::SectorSnapshot),
            "garrison_owner" => Some(Self::GarrisonOwner),
            "garrison_corp_member" => Some(Self::GarrisonCorpMember),
            "task_owner" => Some(Self::TaskOwner),
            _ => None,
        }
    }
}

/// One deduplicated `(event, character)` delivery row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventRecipient {
    pub event_id: i64,
    pub character_id: String,
    pub reason: RecipientReason,
}

/// Append-only journal row. Never mutated after insert; ids are strictly
/// increasing but may have gaps.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub event_type: EventType,
    pub timestamp: TimestampMs,
    pub payload: Value,
    pub scope: EventScope,
    pub actor_character_id: Option<String>,
    pub sector_id: Option<SectorId>,
    pub corp_id: Option<String>,
    pub task_id: Option<String>,
    pub sender_id: Option<String>,
    pub ship_id: Option<String>,
    /// Why the polling character received this event; filled per query.
    #[serde(default)]
    pub recipient_reason: Option<RecipientReason>,
    #[serde(default)]
    pub recipient_ids: Vec<String>,
    #[serde(default)]
    pub recipient_reasons: Vec<RecipientReason>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EventsQuery {
    #[serde(default)]
    pub character_ids: Vec<String>,
    #[serde(default)]
    pub corp_id: Option<String>,
    #[serde(default)]
    pub ship_ids: Vec<String>,
    #[serde(default)]
    pub since_event_id: Option<i64>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Establish a cursor at the current head without back-filling history.
    #[serde(default)]
    pub initial_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsPage {
    pub events: Vec<EventRecord>,
    pub last_event_id: i64,
    pub has_more: bool,
}
