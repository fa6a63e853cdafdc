//! Combat encounter state shared between the engine, the store, and callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{GarrisonMode, SectorId, TimestampMs};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CombatantType {
    Character,
    Garrison,
}

impl CombatantType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Character => "character",
            Self::Garrison => "garrison",
        }
    }
}

/// Type-dependent extras carried alongside a combatant. Garrison entries fill
/// the toll fields; character entries leave them empty.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CombatantMetadata {
    #[serde(default)]
    pub mode: Option<GarrisonMode>,
    #[serde(default)]
    pub toll_amount: Option<i64>,
    #[serde(default)]
    pub toll_balance: Option<i64>,
    #[serde(default)]
    pub corporation_id: Option<String>,
    pub sector_id: SectorId,
}

/// Uniform representation of a ship or garrison inside an encounter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CombatantState {
    pub combatant_id: String,
    pub combatant_type: CombatantType,
    pub display_name: String,
    /// Absent for corp-owned autopilot ships; those carry their corporation
    /// in `metadata.corporation_id` instead.
    pub owner_character_id: Option<String>,
    pub ship_type: Option<String>,
    pub fighters: i64,
    pub is_escape_pod: bool,
    pub metadata: CombatantMetadata,
}

impl CombatantState {
    pub fn effective_corporation(&self) -> Option<&str> {
        self.metadata.corporation_id.as_deref()
    }

    /// A combatant another party may legally target: has fighters, is not an
    /// escape pod.
    pub fn is_targetable(&self) -> bool {
        self.fighters > 0 && !self.is_escape_pod
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CombatAction {
    Attack { target_id: String },
    Defend,
    Flee,
    PayToll,
}

/// Per-encounter bookkeeping of one toll demand.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TollDemand {
    pub owner_id: String,
    pub toll_amount: i64,
    pub toll_balance: i64,
    pub target_id: Option<String>,
    pub paid: bool,
    pub paid_round: Option<u32>,
    pub demand_round: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundLog {
    pub round: u32,
    pub resolved_at: TimestampMs,
    pub summary: String,
    #[serde(default)]
    pub casualties: BTreeMap<String, i64>,
    #[serde(default)]
    pub fled: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CombatEndReason {
    Elimination,
    AllFled,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CombatEndState {
    pub reason: CombatEndReason,
    /// Side key of the last side standing, when one exists.
    pub winner_side: Option<String>,
    pub ended_at: TimestampMs,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CombatContext {
    pub initiator_id: String,
    pub created_at: TimestampMs,
    /// Owner of the garrison that auto-engaged, when combat was not manual.
    #[serde(default)]
    pub garrison_owner_id: Option<String>,
    #[serde(default)]
    pub auto_initiated: bool,
    #[serde(default)]
    pub toll_registry: Vec<TollDemand>,
}

/// One combat encounter; at most one non-ended encounter exists per sector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CombatEncounter {
    pub combat_id: String,
    pub sector_id: SectorId,
    pub round: u32,
    pub deadline: TimestampMs,
    pub participants: BTreeMap<String, CombatantState>,
    #[serde(default)]
    pub pending_actions: BTreeMap<String, CombatAction>,
    #[serde(default)]
    pub logs: Vec<RoundLog>,
    pub context: CombatContext,
    pub awaiting_resolution: bool,
    pub ended: bool,
    #[serde(default)]
    pub end_state: Option<CombatEndState>,
    /// Deterministic seed generated at encounter creation and stored
    /// verbatim; round outcomes derive from it and the round number.
    #[serde(with = "crate::serde_u64_string")]
    pub base_seed: u64,
    /// Optimistic concurrency token, checked on every write.
    pub version: u64,
    pub last_updated: TimestampMs,
}

impl CombatEncounter {
    /// Side key used for termination detection: corporation when one is
    /// resolved, otherwise the owning character stands alone.
    pub fn side_key(combatant: &CombatantState) -> String {
        if let Some(corp) = combatant.effective_corporation() {
            return format!("corp:{corp}");
        }
        match combatant.owner_character_id.as_deref() {
            Some(owner) => format!("char:{owner}"),
            None => format!("unit:{}", combatant.combatant_id),
        }
    }

    /// Distinct sides that still field fighters.
    pub fn sides_with_fighters(&self) -> Vec<String> {
        let mut sides = Vec::new();
        for combatant in self.participants.values() {
            if combatant.fighters <= 0 {
                continue;
            }
            let key = Self::side_key(combatant);
            if !sides.contains(&key) {
                sides.push(key);
            }
        }
        sides
    }
}
