//! Converts an ended encounter into terminal effects: escape pods, salvage,
//! garrison updates. Pure planning; the store applies the actions.

use std::collections::BTreeMap;

use contracts::{CombatEncounter, CombatantType, SectorId, Ship};

pub fn scrap_value(purchase_price: i64) -> i64 {
    (purchase_price / 1000).max(5)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FinalizeAction {
    ConvertToEscapePod {
        ship_id: String,
        owner_character_id: Option<String>,
    },
    CreateSalvage {
        sector_id: SectorId,
        source_ship_id: String,
        cargo: BTreeMap<String, i64>,
        scrap_value: i64,
        credits: i64,
    },
    SyncShipFighters {
        ship_id: String,
        fighters: i64,
    },
    UpdateGarrison {
        sector_id: SectorId,
        fighters: i64,
        toll_balance: Option<i64>,
    },
    DeleteGarrison {
        sector_id: SectorId,
        owner_id: String,
    },
}

/// Plans terminal effects for every participant of an ended encounter.
///
/// Defeated characters become escape pods; their ship yields salvage unless
/// there is nothing to take. Survivors get their ship fighter counts synced.
/// Garrisons are written back at their remaining strength or deleted outright
/// at zero, together with any toll balance accrued during the encounter.
pub fn plan_finalize(
    encounter: &CombatEncounter,
    ships: &BTreeMap<String, Ship>,
    purchase_prices: &BTreeMap<String, i64>,
) -> Vec<FinalizeAction> {
    let mut actions = Vec::new();

    for combatant in encounter.participants.values() {
        match combatant.combatant_type {
            CombatantType::Character => {
                let Some(ship) = ships.get(&combatant.combatant_id) else {
                    continue;
                };

                if combatant.fighters > 0 {
                    actions.push(FinalizeAction::SyncShipFighters {
                        ship_id: ship.ship_id.clone(),
                        fighters: combatant.fighters,
                    });
                    continue;
                }

                let price = purchase_prices.get(&ship.ship_type).copied().unwrap_or(0);
                let scrap = if price > 0 { scrap_value(price) } else { 0 };
                let cargo = ship
                    .cargo
                    .iter()
                    .filter(|(_, quantity)| **quantity > 0)
                    .map(|(commodity, quantity)| (commodity.clone(), *quantity))
                    .collect::<BTreeMap<_, _>>();

                if !cargo.is_empty() || scrap > 0 || ship.credits > 0 {
                    actions.push(FinalizeAction::CreateSalvage {
                        sector_id: encounter.sector_id,
                        source_ship_id: ship.ship_id.clone(),
                        cargo,
                        scrap_value: scrap,
                        credits: ship.credits,
                    });
                }

                actions.push(FinalizeAction::ConvertToEscapePod {
                    ship_id: ship.ship_id.clone(),
                    owner_character_id: combatant.owner_character_id.clone(),
                });
            }
            CombatantType::Garrison => {
                let owner = combatant
                    .owner_character_id
                    .clone()
                    .unwrap_or_default();
                if combatant.fighters > 0 {
                    let accrued_balance = encounter
                        .context
                        .toll_registry
                        .iter()
                        .find(|demand| Some(demand.owner_id.as_str())
                            == combatant.owner_character_id.as_deref())
                        .map(|demand| demand.toll_balance);
                    actions.push(FinalizeAction::UpdateGarrison {
                        sector_id: encounter.sector_id,
                        fighters: combatant.fighters,
                        toll_balance: accrued_balance,
                    });
                } else {
                    actions.push(FinalizeAction::DeleteGarrison {
                        sector_id: encounter.sector_id,
                        owner_id: owner,
                    });
                }
            }
        }
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{
        CombatContext, CombatantMetadata, CombatantState, GarrisonMode, ShipOwnerType, TollDemand,
    };

    fn combatant(id: &str, kind: CombatantType, owner: &str, fighters: i64) -> CombatantState {
        CombatantState {
            combatant_id: id.to_string(),
            combatant_type: kind,
            display_name: owner.to_string(),
            owner_character_id: Some(owner.to_string()),
            ship_type: matches!(kind, CombatantType::Character).then(|| "freighter".to_string()),
            fighters,
            is_escape_pod: false,
            metadata: CombatantMetadata {
                mode: matches!(kind, CombatantType::Garrison).then_some(GarrisonMode::Toll),
                toll_amount: None,
                toll_balance: None,
                corporation_id: None,
                sector_id: 5,
            },
        }
    }

    fn ship(ship_id: &str, credits: i64, cargo: &[(&str, i64)]) -> Ship {
        Ship {
            ship_id: ship_id.to_string(),
            owner_type: ShipOwnerType::Character,
            owner_character_id: Some("alice".to_string()),
            owner_corporation_id: None,
            ship_type: "freighter".to_string(),
            current_sector: 5,
            in_hyperspace: false,
            current_fighters: 0,
            shields: 10,
            warp_power: 80,
            credits,
            cargo: cargo
                .iter()
                .map(|(commodity, quantity)| (commodity.to_string(), *quantity))
                .collect(),
            is_escape_pod: false,
            former_ship_type: None,
            updated_at: 0,
        }
    }

    fn encounter_with(participants: Vec<CombatantState>) -> CombatEncounter {
        CombatEncounter {
            combat_id: "combat-5-1".to_string(),
            sector_id: 5,
            round: 3,
            deadline: 0,
            participants: participants
                .into_iter()
                .map(|combatant| (combatant.combatant_id.clone(), combatant))
                .collect(),
            pending_actions: BTreeMap::new(),
            logs: Vec::new(),
            context: CombatContext {
                initiator_id: "s1".to_string(),
                created_at: 0,
                garrison_owner_id: None,
                auto_initiated: false,
                toll_registry: Vec::new(),
            },
            awaiting_resolution: false,
            ended: true,
            end_state: None,
            base_seed: 42,
            version: 1,
            last_updated: 0,
        }
    }

    #[test]
    fn scrap_value_floors_at_five() {
        assert_eq!(scrap_value(100), 5);
        assert_eq!(scrap_value(4_999), 5);
        assert_eq!(scrap_value(12_000), 12);
    }

    #[test]
    fn defeated_character_yields_salvage_then_escape_pod() {
        let encounter = encounter_with(vec![
            combatant("s1", CombatantType::Character, "alice", 0),
            combatant("s2", CombatantType::Character, "bob", 8),
        ]);
        let mut ships = BTreeMap::new();
        ships.insert("s1".to_string(), ship("s1", 250, &[("ore", 12)]));
        ships.insert("s2".to_string(), ship("s2", 0, &[]));
        let prices = BTreeMap::from([("freighter".to_string(), 12_000_i64)]);

        let actions = plan_finalize(&encounter, &ships, &prices);

        assert!(actions.iter().any(|action| matches!(
            action,
            FinalizeAction::CreateSalvage { source_ship_id, scrap_value: 12, credits: 250, .. }
                if source_ship_id == "s1"
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            FinalizeAction::ConvertToEscapePod { ship_id, .. } if ship_id == "s1"
        )));
        assert!(actions.iter().any(|action| matches!(
            action,
            FinalizeAction::SyncShipFighters { ship_id, fighters: 8 } if ship_id == "s2"
        )));
    }

    #[test]
    fn nothing_to_salvage_skips_salvage_creation() {
        let encounter = encounter_with(vec![
            combatant("s1", CombatantType::Character, "alice", 0),
            combatant("s2", CombatantType::Character, "bob", 8),
        ]);
        let mut ships = BTreeMap::new();
        ships.insert("s1".to_string(), ship("s1", 0, &[("ore", 0)]));
        ships.insert("s2".to_string(), ship("s2", 0, &[]));
        // Unknown ship type: no purchase price, so no scrap either.
        let prices = BTreeMap::new();

        let actions = plan_finalize(&encounter, &ships, &prices);

        assert!(!actions
            .iter()
            .any(|action| matches!(action, FinalizeAction::CreateSalvage { .. })));
        assert!(actions
            .iter()
            .any(|action| matches!(action, FinalizeAction::ConvertToEscapePod { .. })));
    }

    #[test]
    fn garrison_updates_at_remaining_strength_and_deletes_at_zero() {
        let mut survivor = encounter_with(vec![
            combatant("garrison:5", CombatantType::Garrison, "holder", 9),
            combatant("s2", CombatantType::Character, "bob", 8),
        ]);
        survivor.context.toll_registry.push(TollDemand {
            owner_id: "holder".to_string(),
            toll_amount: 50,
            toll_balance: 170,
            target_id: None,
            paid: true,
            paid_round: Some(1),
            demand_round: 1,
        });
        let ships = BTreeMap::from([("s2".to_string(), ship("s2", 0, &[]))]);

        let actions = plan_finalize(&survivor, &ships, &BTreeMap::new());
        assert!(actions.iter().any(|action| matches!(
            action,
            FinalizeAction::UpdateGarrison { sector_id: 5, fighters: 9, toll_balance: Some(170) }
        )));

        let destroyed = encounter_with(vec![
            combatant("garrison:5", CombatantType::Garrison, "holder", 0),
            combatant("s2", CombatantType::Character, "bob", 8),
        ]);
        let actions = plan_finalize(&destroyed, &ships, &BTreeMap::new());
        assert!(actions.iter().any(|action| matches!(
            action,
            FinalizeAction::DeleteGarrison { sector_id: 5, owner_id } if owner_id == "holder"
        )));
    }
}
