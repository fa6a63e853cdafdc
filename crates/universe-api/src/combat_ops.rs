//! Combat orchestration against the store: initiation, auto-engage on
//! arrival, action intake, round resolution, and terminal effects.

use std::collections::BTreeMap;

use contracts::{
    CombatAction, CombatEncounter, CombatEndReason, CombatantType, DomainError, EventType,
    GarrisonMode, InitiateCombatResponse, RecipientReason, SectorId, TimestampMs,
};
use rusqlite::Transaction;
use serde_json::json;

use universe_core::combat::{CombatEngine, RoundOutcome};
use universe_core::combatant::CombatantLoader;
use universe_core::finalize::{plan_finalize, FinalizeAction};
use universe_core::visibility::compute_event_recipients;

use crate::journal::{append_event, EventDraft};
use crate::persistence;
use crate::ShipCatalog;

pub fn combat_id_for(sector_id: SectorId, base_seed: u64) -> String {
    format!("combat-{sector_id}-{base_seed:08x}")
}

/// Result of one submitted action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub combat_id: String,
    pub round: u32,
    /// All live participants have acted; the round resolved immediately.
    pub resolved: bool,
    pub ended: bool,
}

fn sector_garrison(
    tx: &Transaction<'_>,
    sector_id: SectorId,
) -> Result<Option<contracts::Garrison>, DomainError> {
    Ok(persistence::garrisons_in_sector(tx, sector_id)?.into_iter().next())
}

/// Direct recipients of a combat event: every participant's owner.
fn participant_recipients(encounter: &CombatEncounter) -> Vec<(String, RecipientReason)> {
    encounter
        .participants
        .values()
        .filter_map(|combatant| combatant.owner_character_id.clone())
        .map(|owner| (owner, RecipientReason::Recipient))
        .collect()
}

fn combat_recipients(
    tx: &Transaction<'_>,
    encounter: &CombatEncounter,
) -> Result<Vec<(String, RecipientReason)>, DomainError> {
    let presences = persistence::sector_presences(tx, encounter.sector_id)?;
    let garrison = persistence::garrison_presence(tx, encounter.sector_id)?;
    Ok(compute_event_recipients(
        &participant_recipients(encounter),
        &presences,
        garrison.as_ref(),
        &[],
    ))
}

fn emit_combat_event(
    tx: &Transaction<'_>,
    encounter: &CombatEncounter,
    event_type: EventType,
    payload: serde_json::Value,
    actor: Option<&str>,
    now: TimestampMs,
) -> Result<(), DomainError> {
    let recipients = combat_recipients(tx, encounter)?;
    let mut draft = EventDraft::sector(event_type, encounter.sector_id, payload)
        .recipients(recipients);
    if let Some(actor) = actor {
        draft = draft.actor(actor);
    }
    append_event(tx, &draft, now)?;
    Ok(())
}

/// Manual combat initiation by a character's ship. Joins the sector's live
/// encounter when one exists.
pub fn initiate(
    tx: &Transaction<'_>,
    engine: &CombatEngine,
    character_id: &str,
    sector_id: SectorId,
    base_seed: u64,
    now: TimestampMs,
) -> Result<InitiateCombatResponse, DomainError> {
    let ship = persistence::ship_for_character(tx, character_id)?
        .ok_or_else(|| DomainError::not_found("no ship found for character"))?;
    if ship.current_sector != sector_id {
        return Err(DomainError::conflict("ship left the sector before combat began"));
    }
    if ship.in_hyperspace {
        return Err(DomainError::conflict("ship is mid-jump and cannot initiate combat"));
    }

    let loader = persistence::combatant_loader(tx)?;
    let ships = persistence::ships_in_sector(tx, sector_id)?;
    let garrison = sector_garrison(tx, sector_id)?;
    let combatants = loader.load_combatants(sector_id, &ships, garrison.as_ref());

    let existing = persistence::live_encounter(tx, sector_id)?;
    let joining = existing.is_some();
    let combat_id = existing
        .as_ref()
        .map(|encounter| encounter.combat_id.clone())
        .unwrap_or_else(|| combat_id_for(sector_id, base_seed));

    let mut encounter = engine.initiate_manual(
        combat_id,
        base_seed,
        sector_id,
        &ship.ship_id,
        &combatants,
        existing,
        now,
    )?;
    persistence::save_encounter(tx, &mut encounter)?;

    if !joining {
        emit_combat_event(
            tx,
            &encounter,
            EventType::CombatStarted,
            json!({
                "combat_id": encounter.combat_id,
                "sector_id": sector_id,
                "initiator_id": ship.ship_id,
                "participants": encounter.participants.keys().collect::<Vec<_>>(),
            }),
            Some(character_id),
            now,
        )?;
        tracing::info!(
            combat_id = %encounter.combat_id,
            sector_id,
            initiator = %ship.ship_id,
            "combat started"
        );
    }

    Ok(InitiateCombatResponse {
        combat_id: encounter.combat_id,
        sector_id,
        round: encounter.round,
    })
}

/// Called when a ship finishes a jump into a sector. An offensive or toll
/// garrison hostile to the arrival opens combat; anything else is a no-op.
/// Arrival into a sector already fighting never starts a second encounter.
pub fn notify_sector_arrival(
    tx: &Transaction<'_>,
    engine: &CombatEngine,
    ship_id: &str,
    base_seed: u64,
    now: TimestampMs,
) -> Result<Option<InitiateCombatResponse>, DomainError> {
    let ship = persistence::ship_by_id(tx, ship_id)?
        .ok_or_else(|| DomainError::not_found("ship not found"))?;
    let sector_id = ship.current_sector;

    if persistence::live_encounter(tx, sector_id)?.is_some() {
        return Ok(None);
    }

    let Some(garrison) = sector_garrison(tx, sector_id)? else {
        return Ok(None);
    };
    if !garrison.mode.auto_engages() || garrison.fighters <= 0 {
        return Ok(None);
    }

    let loader = persistence::combatant_loader(tx)?;
    let arriving = loader.ship_combatant(&ship);
    let garrison_combatant = loader.garrison_combatant(&garrison);

    if !arriving.is_targetable() || !CombatantLoader::hostile(&arriving, &garrison_combatant) {
        return Ok(None);
    }

    let combat_id = combat_id_for(sector_id, base_seed);
    let mut encounter = engine.auto_engage(
        combat_id,
        base_seed,
        sector_id,
        &arriving,
        &garrison_combatant,
        now,
    )?;
    persistence::save_encounter(tx, &mut encounter)?;

    emit_combat_event(
        tx,
        &encounter,
        EventType::CombatStarted,
        json!({
            "combat_id": encounter.combat_id,
            "sector_id": sector_id,
            "initiator_id": garrison_combatant.combatant_id,
            "auto_initiated": true,
        }),
        None,
        now,
    )?;

    if garrison.mode == GarrisonMode::Toll {
        emit_combat_event(
            tx,
            &encounter,
            EventType::CombatTollDemanded,
            json!({
                "combat_id": encounter.combat_id,
                "sector_id": sector_id,
                "owner_id": garrison.owner_id,
                "toll_amount": garrison.toll_amount,
                "target_id": arriving.combatant_id,
            }),
            None,
            now,
        )?;
    }

    tracing::info!(
        combat_id = %encounter.combat_id,
        sector_id,
        arriving = %ship_id,
        mode = garrison.mode.as_str(),
        "garrison auto-engaged arriving ship"
    );

    Ok(Some(InitiateCombatResponse {
        combat_id: encounter.combat_id,
        sector_id,
        round: encounter.round,
    }))
}

/// Records one action. Paying a toll is checked against the payer's credits
/// at submission so resolution never has to unwind an unaffordable payment.
pub fn submit_action(
    tx: &Transaction<'_>,
    engine: &CombatEngine,
    catalog: &dyn ShipCatalog,
    sector_id: SectorId,
    combatant_id: &str,
    action: CombatAction,
    now: TimestampMs,
) -> Result<ActionOutcome, DomainError> {
    let mut encounter = persistence::live_encounter(tx, sector_id)?
        .ok_or_else(|| DomainError::not_found("no active combat in this sector"))?;

    if matches!(action, CombatAction::PayToll) {
        let demand_amount = encounter
            .context
            .toll_registry
            .iter()
            .find(|demand| !demand.paid)
            .map(|demand| demand.toll_amount)
            .ok_or_else(|| DomainError::validation("no outstanding toll demand to pay"))?;
        let ship = persistence::ship_by_id(tx, combatant_id)?
            .ok_or_else(|| DomainError::not_found("ship not found"))?;
        if ship.credits < demand_amount {
            return Err(DomainError::validation("insufficient credits to pay the toll")
                .with_context(format!("credits={} toll={demand_amount}", ship.credits)));
        }
    }

    let ready = engine.submit_action(&mut encounter, combatant_id, action, now)?;

    if ready {
        let outcome = resolve_and_apply(tx, engine, catalog, &mut encounter, now)?;
        return Ok(ActionOutcome {
            combat_id: encounter.combat_id,
            round: outcome.round,
            resolved: true,
            ended: outcome.ended,
        });
    }

    let round = encounter.round;
    let combat_id = encounter.combat_id.clone();
    persistence::save_encounter(tx, &mut encounter)?;
    Ok(ActionOutcome {
        combat_id,
        round,
        resolved: false,
        ended: false,
    })
}

/// Resolves the sector's encounter if its round deadline has passed.
pub fn resolve_due_in_sector(
    tx: &Transaction<'_>,
    engine: &CombatEngine,
    catalog: &dyn ShipCatalog,
    sector_id: SectorId,
    now: TimestampMs,
) -> Result<Option<RoundOutcome>, DomainError> {
    let Some(mut encounter) = persistence::live_encounter(tx, sector_id)? else {
        return Ok(None);
    };
    if encounter.deadline > now {
        return Ok(None);
    }
    let outcome = resolve_and_apply(tx, engine, catalog, &mut encounter, now)?;
    Ok(Some(outcome))
}

/// Administrative cancellation. Survivor state still syncs back so fighters
/// lost in earlier rounds stay lost.
pub fn cancel(
    tx: &Transaction<'_>,
    engine: &CombatEngine,
    catalog: &dyn ShipCatalog,
    sector_id: SectorId,
    now: TimestampMs,
) -> Result<(), DomainError> {
    let mut encounter = persistence::live_encounter(tx, sector_id)?
        .ok_or_else(|| DomainError::not_found("no active combat in this sector"))?;

    engine.cancel(&mut encounter, now);
    apply_finalize(tx, catalog, &encounter, now)?;
    emit_combat_event(
        tx,
        &encounter,
        EventType::CombatEnded,
        json!({
            "combat_id": encounter.combat_id,
            "sector_id": sector_id,
            "reason": "cancelled",
        }),
        None,
        now,
    )?;
    persistence::save_encounter(tx, &mut encounter)?;
    Ok(())
}

/// Runs one round and writes every consequence in the same transaction:
/// toll debits, journal entries, and on termination the full finalize plan.
fn resolve_and_apply(
    tx: &Transaction<'_>,
    engine: &CombatEngine,
    catalog: &dyn ShipCatalog,
    encounter: &mut CombatEncounter,
    now: TimestampMs,
) -> Result<RoundOutcome, DomainError> {
    let outcome = engine.resolve_round(encounter, now)?;

    // Fleers are no longer participants, so finalize never sees them; their
    // ship rows take the round losses here.
    for (ship_id, fighters) in &outcome.withdrawn {
        persistence::update_ship_fighters(tx, ship_id, *fighters, now)?;
    }

    for payment in &outcome.toll_payments {
        persistence::adjust_ship_credits(tx, &payment.payer_combatant_id, -payment.amount, now)?;
        emit_combat_event(
            tx,
            encounter,
            EventType::CombatTollPaid,
            json!({
                "combat_id": encounter.combat_id,
                "payer_id": payment.payer_combatant_id,
                "owner_id": payment.garrison_owner_id,
                "amount": payment.amount,
            }),
            payment.payer_character_id.as_deref(),
            now,
        )?;
    }

    emit_combat_event(
        tx,
        encounter,
        EventType::CombatRoundResolved,
        json!({
            "combat_id": encounter.combat_id,
            "round": outcome.round,
            "casualties": outcome.casualties,
            "fled": outcome.fled,
            "defeated": outcome.defeated,
        }),
        None,
        now,
    )?;

    // Unpaid demands whose round just resolved get re-announced.
    for demand in &outcome.demands_presented {
        emit_combat_event(
            tx,
            encounter,
            EventType::CombatTollDemanded,
            json!({
                "combat_id": encounter.combat_id,
                "owner_id": demand.owner_id,
                "toll_amount": demand.toll_amount,
                "demand_round": demand.demand_round,
            }),
            None,
            now,
        )?;
    }

    for combatant_id in &outcome.defeated {
        let Some(combatant) = encounter.participants.get(combatant_id) else {
            continue;
        };
        if combatant.combatant_type != CombatantType::Character {
            continue;
        }
        emit_combat_event(
            tx,
            encounter,
            EventType::ShipDestroyed,
            json!({
                "combat_id": encounter.combat_id,
                "ship_id": combatant_id,
                "owner_character_id": combatant.owner_character_id,
            }),
            None,
            now,
        )?;
    }

    if outcome.ended {
        apply_finalize(tx, catalog, encounter, now)?;
        let reason = encounter
            .end_state
            .as_ref()
            .map(|end| match end.reason {
                CombatEndReason::Elimination => "elimination",
                CombatEndReason::AllFled => "all_fled",
                CombatEndReason::Cancelled => "cancelled",
            })
            .unwrap_or("elimination");
        emit_combat_event(
            tx,
            encounter,
            EventType::CombatEnded,
            json!({
                "combat_id": encounter.combat_id,
                "sector_id": encounter.sector_id,
                "reason": reason,
                "winner_side": encounter.end_state.as_ref().and_then(|end| end.winner_side.clone()),
                "rounds": encounter.logs.len(),
            }),
            None,
            now,
        )?;
        tracing::info!(
            combat_id = %encounter.combat_id,
            sector_id = encounter.sector_id,
            reason,
            "combat ended"
        );
    }

    persistence::save_encounter(tx, encounter)?;
    Ok(outcome)
}

fn apply_finalize(
    tx: &Transaction<'_>,
    catalog: &dyn ShipCatalog,
    encounter: &CombatEncounter,
    now: TimestampMs,
) -> Result<(), DomainError> {
    let mut ships = BTreeMap::new();
    let mut prices = BTreeMap::new();
    for combatant in encounter.participants.values() {
        if combatant.combatant_type != CombatantType::Character {
            continue;
        }
        if let Some(ship) = persistence::ship_by_id(tx, &combatant.combatant_id)? {
            if let Some(price) = catalog.purchase_price(&ship.ship_type) {
                prices.insert(ship.ship_type.clone(), price);
            }
            ships.insert(combatant.combatant_id.clone(), ship);
        }
    }

    for action in plan_finalize(encounter, &ships, &prices) {
        match action {
            FinalizeAction::SyncShipFighters { ship_id, fighters } => {
                persistence::update_ship_fighters(tx, &ship_id, fighters, now)?;
            }
            FinalizeAction::ConvertToEscapePod { ship_id, .. } => {
                persistence::convert_ship_to_escape_pod(tx, &ship_id, now)?;
            }
            FinalizeAction::CreateSalvage {
                sector_id,
                source_ship_id,
                cargo,
                scrap_value,
                credits,
            } => {
                let salvage = contracts::SalvageRecord {
                    salvage_id: format!("salvage-{source_ship_id}-{now}"),
                    sector_id,
                    source_ship_id: source_ship_id.clone(),
                    cargo,
                    scrap_value,
                    credits,
                    created_at: now,
                };
                persistence::insert_salvage(tx, &salvage)?;
                emit_combat_event(
                    tx,
                    encounter,
                    EventType::SalvageCreated,
                    json!({
                        "salvage_id": salvage.salvage_id,
                        "sector_id": sector_id,
                        "source_ship_id": source_ship_id,
                        "scrap_value": scrap_value,
                        "credits": credits,
                    }),
                    None,
                    now,
                )?;
            }
            FinalizeAction::UpdateGarrison {
                sector_id,
                fighters,
                toll_balance,
            } => {
                if let Some(mut garrison) = sector_garrison(tx, sector_id)? {
                    garrison.fighters = fighters;
                    if let Some(balance) = toll_balance {
                        garrison.toll_balance = balance;
                    }
                    garrison.updated_at = now;
                    persistence::update_garrison(tx, &garrison)?;
                }
            }
            FinalizeAction::DeleteGarrison { sector_id, owner_id } => {
                persistence::delete_garrison(tx, sector_id)?;
                emit_combat_event(
                    tx,
                    encounter,
                    EventType::GarrisonDestroyed,
                    json!({
                        "sector_id": sector_id,
                        "owner_id": owner_id,
                    }),
                    None,
                    now,
                )?;
            }
        }
    }

    Ok(())
}
