//! Assembles ships and the sector garrison into uniform combatant records,
//! resolving display names and effective corporation membership.

use std::collections::BTreeMap;

use contracts::{
    CombatantMetadata, CombatantState, CombatantType, Garrison, SectorId, Ship, ShipOwnerType,
};

/// Display name and corp membership of a character, as the loader sees them.
#[derive(Debug, Clone)]
pub struct PilotProfile {
    pub character_id: String,
    pub display_name: String,
    pub corporation_id: Option<String>,
}

/// A character's (or corp ship's) corporate affiliation: direct membership
/// wins; corp-owned ships fall back to their recorded corporate owner.
pub fn effective_corporation(
    owner_character_id: Option<&str>,
    ship: Option<&Ship>,
    memberships: &BTreeMap<String, String>,
) -> Option<String> {
    if let Some(character_id) = owner_character_id {
        if let Some(corp) = memberships.get(character_id) {
            return Some(corp.clone());
        }
    }

    match ship {
        Some(ship) if ship.owner_type == ShipOwnerType::Corporation => {
            ship.owner_corporation_id.clone()
        }
        _ => None,
    }
}

/// Builds the combat-eligible set for one sector. Pure over its inputs; the
/// caller re-loads after any mutation rather than reusing a stale snapshot.
#[derive(Debug, Default)]
pub struct CombatantLoader {
    /// character_id -> corporation_id, from the membership table.
    pub memberships: BTreeMap<String, String>,
    /// character_id -> profile, for display names.
    pub profiles: BTreeMap<String, PilotProfile>,
}

impl CombatantLoader {
    pub fn garrison_combatant_id(sector_id: SectorId) -> String {
        format!("garrison:{sector_id}")
    }

    /// Ships present and not in hyperspace, plus the garrison if any.
    pub fn load_combatants(
        &self,
        sector_id: SectorId,
        ships: &[Ship],
        garrison: Option<&Garrison>,
    ) -> Vec<CombatantState> {
        let mut combatants = Vec::new();

        for ship in ships {
            if ship.current_sector != sector_id || ship.in_hyperspace {
                continue;
            }
            combatants.push(self.ship_combatant(ship));
        }

        if let Some(garrison) = garrison {
            combatants.push(self.garrison_combatant(garrison));
        }

        combatants
    }

    pub fn ship_combatant(&self, ship: &Ship) -> CombatantState {
        let owner_character_id = ship.owner_character_id.clone();
        let display_name = owner_character_id
            .as_ref()
            .and_then(|id| self.profiles.get(id))
            .map(|profile| profile.display_name.clone())
            .unwrap_or_else(|| ship.ship_id.clone());

        let corporation_id = effective_corporation(
            owner_character_id.as_deref(),
            Some(ship),
            &self.memberships,
        );

        CombatantState {
            combatant_id: ship.ship_id.clone(),
            combatant_type: CombatantType::Character,
            display_name,
            owner_character_id,
            ship_type: Some(ship.ship_type.clone()),
            fighters: ship.current_fighters,
            is_escape_pod: ship.is_escape_pod,
            metadata: CombatantMetadata {
                mode: None,
                toll_amount: None,
                toll_balance: None,
                corporation_id,
                sector_id: ship.current_sector,
            },
        }
    }

    pub fn garrison_combatant(&self, garrison: &Garrison) -> CombatantState {
        let display_name = self
            .profiles
            .get(&garrison.owner_id)
            .map(|profile| format!("{}'s garrison", profile.display_name))
            .unwrap_or_else(|| format!("garrison in sector {}", garrison.sector_id));

        let corporation_id =
            effective_corporation(Some(&garrison.owner_id), None, &self.memberships);

        CombatantState {
            combatant_id: Self::garrison_combatant_id(garrison.sector_id),
            combatant_type: CombatantType::Garrison,
            display_name,
            owner_character_id: Some(garrison.owner_id.clone()),
            ship_type: None,
            fighters: garrison.fighters,
            is_escape_pod: false,
            metadata: CombatantMetadata {
                mode: Some(garrison.mode),
                toll_amount: Some(garrison.toll_amount),
                toll_balance: Some(garrison.toll_balance),
                corporation_id,
                sector_id: garrison.sector_id,
            },
        }
    }

    /// True when the two combatants belong to different effective
    /// corporations (or either has none).
    pub fn hostile(a: &CombatantState, b: &CombatantState) -> bool {
        match (a.effective_corporation(), b.effective_corporation()) {
            (Some(left), Some(right)) => left != right,
            _ => true,
        }
    }
}
