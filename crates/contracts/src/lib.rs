//! v1 cross-boundary contracts for the universe core, persistence, and callers.

pub mod combat;
pub mod error;
pub mod events;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use combat::{
    CombatAction, CombatContext, CombatEncounter, CombatEndReason, CombatEndState,
    CombatantMetadata, CombatantState, CombatantType, RoundLog, TollDemand,
};
pub use error::{DomainError, ErrorKind};
pub use events::{
    EventRecipient, EventRecord, EventScope, EventType, EventsPage, EventsQuery, RecipientReason,
};

pub const SCHEMA_VERSION_V1: &str = "1.0";

/// Hard cap on a single events-poll page; requests above it are clamped.
pub const MAX_EVENT_PAGE_SIZE: usize = 250;
pub const DEFAULT_EVENT_PAGE_SIZE: usize = 100;

pub type SectorId = i64;
pub type TimestampMs = i64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GarrisonMode {
    Offensive,
    Defensive,
    Toll,
}

impl GarrisonMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offensive => "offensive",
            Self::Defensive => "defensive",
            Self::Toll => "toll",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "offensive" => Some(Self::Offensive),
            "defensive" => Some(Self::Defensive),
            "toll" => Some(Self::Toll),
            _ => None,
        }
    }

    /// Only offensive and toll garrisons engage arriving ships on their own.
    pub fn auto_engages(self) -> bool {
        matches!(self, Self::Offensive | Self::Toll)
    }
}

/// One standing fighter deployment per sector. A row with `fighters == 0`
/// must never persist; the store deletes it instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Garrison {
    pub sector_id: SectorId,
    pub owner_id: String,
    pub fighters: i64,
    pub mode: GarrisonMode,
    pub toll_amount: i64,
    pub toll_balance: i64,
    pub deployed_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// The subset of garrison state returned to callers of deploy/collect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GarrisonSummary {
    pub owner_id: String,
    pub fighters: i64,
    pub mode: GarrisonMode,
    pub toll_amount: i64,
    pub toll_balance: i64,
    pub deployed_at: TimestampMs,
}

impl From<&Garrison> for GarrisonSummary {
    fn from(garrison: &Garrison) -> Self {
        Self {
            owner_id: garrison.owner_id.clone(),
            fighters: garrison.fighters,
            mode: garrison.mode,
            toll_amount: garrison.toll_amount,
            toll_balance: garrison.toll_balance,
            deployed_at: garrison.deployed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShipOwnerType {
    Character,
    Corporation,
}

impl ShipOwnerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Corporation => "corporation",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "character" => Some(Self::Character),
            "corporation" => Some(Self::Corporation),
            _ => None,
        }
    }
}

/// A ship row. Corp-owned autopilot ships carry their corporation directly in
/// `owner_corporation_id`; membership resolution never goes through a shared
/// id space.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ship {
    pub ship_id: String,
    pub owner_type: ShipOwnerType,
    pub owner_character_id: Option<String>,
    pub owner_corporation_id: Option<String>,
    pub ship_type: String,
    pub current_sector: SectorId,
    pub in_hyperspace: bool,
    pub current_fighters: i64,
    pub shields: i64,
    pub warp_power: i64,
    pub credits: i64,
    #[serde(default)]
    pub cargo: BTreeMap<String, i64>,
    #[serde(default)]
    pub is_escape_pod: bool,
    /// Ship type before conversion to an escape pod, if any.
    #[serde(default)]
    pub former_ship_type: Option<String>,
    pub updated_at: TimestampMs,
}

impl Ship {
    pub fn has_cargo(&self) -> bool {
        self.cargo.values().any(|quantity| *quantity > 0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CharacterRecord {
    pub character_id: String,
    pub display_name: String,
    pub corporation_id: Option<String>,
    pub active: bool,
}

/// Salvage left behind by a destroyed ship.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SalvageRecord {
    pub salvage_id: String,
    pub sector_id: SectorId,
    pub source_ship_id: String,
    #[serde(default)]
    pub cargo: BTreeMap<String, i64>,
    pub scrap_value: i64,
    pub credits: i64,
    pub created_at: TimestampMs,
}

// ---------------------------------------------------------------------------
// Operation request/response shapes.
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployRequest {
    pub sector_id: SectorId,
    pub character_id: String,
    pub ship_id: String,
    pub quantity: i64,
    pub mode: GarrisonMode,
    #[serde(default)]
    pub toll_amount: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployResponse {
    pub new_ship_fighters: i64,
    pub garrison: GarrisonSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectRequest {
    pub sector_id: SectorId,
    pub character_id: String,
    pub ship_id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectResponse {
    pub new_ship_fighters: i64,
    pub new_ship_credits: i64,
    pub toll_payout: i64,
    pub garrison_owner_id: String,
    pub updated_garrison: Option<GarrisonSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitiateCombatRequest {
    pub character_id: String,
    /// Player acting on behalf of `character_id` (corp-owned ships); defaults
    /// to the character itself.
    #[serde(default)]
    pub actor_character_id: Option<String>,
    #[serde(default)]
    pub admin_override: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitiateCombatResponse {
    pub combat_id: String,
    pub sector_id: SectorId,
    pub round: u32,
}

pub mod serde_u64_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<u64>().map_err(D::Error::custom)
    }
}
