//! Garrison deployment and collection, run inside a sector lock.

use contracts::{
    CollectRequest, CollectResponse, DeployRequest, DeployResponse, DomainError, EventScope,
    EventType, Garrison, GarrisonMode, GarrisonSummary, RecipientReason, Ship, TimestampMs,
};
use rusqlite::Transaction;
use serde_json::json;

use crate::journal::{append_event, EventDraft};
use crate::persistence;

/// Loads the actor's ship and checks it is physically able to act in the
/// sector: present, not mid-jump, owned by the requesting character.
fn actionable_ship(
    tx: &Transaction<'_>,
    ship_id: &str,
    character_id: &str,
    sector_id: i64,
) -> Result<Ship, DomainError> {
    let ship = persistence::ship_by_id(tx, ship_id)?
        .ok_or_else(|| DomainError::not_found("ship not found"))?;

    if ship.owner_character_id.as_deref() != Some(character_id) {
        return Err(DomainError::authorization("ship is not yours to command"));
    }
    if ship.current_sector != sector_id {
        return Err(DomainError::validation("ship is not in that sector"));
    }
    if ship.in_hyperspace {
        return Err(DomainError::validation("ship is mid-jump"));
    }
    Ok(ship)
}

/// More than one garrison row in a sector means an earlier write bypassed the
/// uniqueness rule; refuse to touch the sector until an operator repairs it.
fn single_garrison(
    tx: &Transaction<'_>,
    sector_id: i64,
) -> Result<Option<Garrison>, DomainError> {
    let mut garrisons = persistence::garrisons_in_sector(tx, sector_id)?;
    if garrisons.len() > 1 {
        return Err(DomainError::conflict(
            "multiple garrisons recorded for this sector; manual repair required",
        )
        .with_context(format!("sector_id={sector_id} rows={}", garrisons.len())));
    }
    Ok(garrisons.pop())
}

pub fn deploy(
    tx: &Transaction<'_>,
    request: &DeployRequest,
    now: TimestampMs,
) -> Result<DeployResponse, DomainError> {
    if request.quantity <= 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }
    if request.toll_amount < 0 {
        return Err(DomainError::validation("toll amount cannot be negative"));
    }

    let ship = actionable_ship(tx, &request.ship_id, &request.character_id, request.sector_id)?;
    if ship.current_fighters < request.quantity {
        return Err(DomainError::validation("not enough fighters aboard")
            .with_context(format!("aboard={}", ship.current_fighters)));
    }

    let memberships = persistence::corp_memberships(tx)?;
    let actor_corp = memberships.get(&request.character_id);

    let garrison = match single_garrison(tx, request.sector_id)? {
        None => {
            let garrison = Garrison {
                sector_id: request.sector_id,
                owner_id: request.character_id.clone(),
                fighters: request.quantity,
                mode: request.mode,
                toll_amount: request.toll_amount,
                toll_balance: 0,
                deployed_at: now,
                updated_at: now,
            };
            persistence::insert_garrison(tx, &garrison)?;
            garrison
        }
        Some(existing) if existing.owner_id == request.character_id => {
            // Reinforcement also retunes mode and toll.
            let mut garrison = existing;
            garrison.fighters += request.quantity;
            garrison.mode = request.mode;
            garrison.toll_amount = request.toll_amount;
            garrison.updated_at = now;
            persistence::update_garrison(tx, &garrison)?;
            garrison
        }
        Some(existing) => {
            let owner_corp = memberships.get(&existing.owner_id);
            let friendly = matches!((actor_corp, owner_corp), (Some(a), Some(b)) if a == b);
            let message = if friendly {
                "friendly garrison already holds this sector; reinforce through the owner"
            } else {
                "hostile garrison present; clear it first"
            };
            return Err(DomainError::conflict(message)
                .with_context(format!("owner_id={}", existing.owner_id)));
        }
    };

    let new_ship_fighters = ship.current_fighters - request.quantity;
    persistence::update_ship_fighters(tx, &ship.ship_id, new_ship_fighters, now)?;

    let recipients = deploy_recipients(tx, request.sector_id, &request.character_id)?;
    append_event(
        tx,
        &EventDraft {
            event_type: EventType::GarrisonDeployed,
            scope: EventScope::Sector,
            payload: json!({
                "sector_id": request.sector_id,
                "owner_id": garrison.owner_id,
                "fighters": garrison.fighters,
                "mode": garrison.mode.as_str(),
                "toll_amount": garrison.toll_amount,
            }),
            actor_character_id: Some(request.character_id.clone()),
            sector_id: Some(request.sector_id),
            corp_id: actor_corp.cloned(),
            task_id: None,
            sender_id: None,
            ship_id: Some(ship.ship_id.clone()),
            recipients,
        },
        now,
    )?;

    tracing::info!(
        sector_id = request.sector_id,
        owner_id = %garrison.owner_id,
        fighters = garrison.fighters,
        mode = garrison.mode.as_str(),
        "garrison deployed"
    );

    Ok(DeployResponse {
        new_ship_fighters,
        garrison: GarrisonSummary::from(&garrison),
    })
}

pub fn collect(
    tx: &Transaction<'_>,
    request: &CollectRequest,
    now: TimestampMs,
) -> Result<CollectResponse, DomainError> {
    if request.quantity <= 0 {
        return Err(DomainError::validation("quantity must be positive"));
    }

    let ship = actionable_ship(tx, &request.ship_id, &request.character_id, request.sector_id)?;

    let garrison = single_garrison(tx, request.sector_id)?;
    let memberships = persistence::corp_memberships(tx)?;
    let actor_corp = memberships.get(&request.character_id);

    // A hostile garrison is reported exactly like an absent one, so probing
    // with collect reveals nothing about enemy deployments.
    let garrison = match garrison {
        Some(garrison) if garrison.owner_id == request.character_id => garrison,
        Some(garrison)
            if matches!(
                (actor_corp, memberships.get(&garrison.owner_id)),
                (Some(a), Some(b)) if a == b
            ) =>
        {
            garrison
        }
        _ => return Err(DomainError::not_found("no friendly garrison found")),
    };

    if garrison.fighters < request.quantity {
        return Err(DomainError::validation("garrison has fewer fighters than requested")
            .with_context(format!("garrisoned={}", garrison.fighters)));
    }

    // Only toll garrisons pay out; a garrison retuned to another mode keeps
    // its banked balance aside until it collects tolls again.
    let toll_payout = if garrison.mode == GarrisonMode::Toll {
        garrison.toll_balance.max(0)
    } else {
        0
    };
    let remaining = garrison.fighters - request.quantity;

    let updated_garrison = if remaining == 0 {
        persistence::delete_garrison(tx, request.sector_id)?;
        None
    } else {
        let mut garrison = garrison.clone();
        garrison.fighters = remaining;
        if garrison.mode == GarrisonMode::Toll {
            garrison.toll_balance = 0;
        }
        garrison.updated_at = now;
        persistence::update_garrison(tx, &garrison)?;
        Some(GarrisonSummary::from(&garrison))
    };

    let new_ship_fighters = ship.current_fighters + request.quantity;
    let new_ship_credits = ship.credits + toll_payout;
    persistence::update_ship_fighters_and_credits(
        tx,
        &ship.ship_id,
        new_ship_fighters,
        new_ship_credits,
        now,
    )?;

    let recipients = deploy_recipients(tx, request.sector_id, &request.character_id)?;
    append_event(
        tx,
        &EventDraft {
            event_type: EventType::GarrisonCollected,
            scope: EventScope::Sector,
            payload: json!({
                "sector_id": request.sector_id,
                "owner_id": garrison.owner_id,
                "collected": request.quantity,
                "remaining": remaining,
                "toll_payout": toll_payout,
            }),
            actor_character_id: Some(request.character_id.clone()),
            sector_id: Some(request.sector_id),
            corp_id: actor_corp.cloned(),
            task_id: None,
            sender_id: None,
            ship_id: Some(ship.ship_id.clone()),
            recipients,
        },
        now,
    )?;

    tracing::info!(
        sector_id = request.sector_id,
        owner_id = %garrison.owner_id,
        collected = request.quantity,
        remaining,
        toll_payout,
        "garrison collected"
    );

    Ok(CollectResponse {
        new_ship_fighters,
        new_ship_credits,
        toll_payout,
        garrison_owner_id: garrison.owner_id,
        updated_garrison,
    })
}

/// Recipients for garrison lifecycle events: the actor plus everyone visible
/// in the sector and the garrison owner's corp.
fn deploy_recipients(
    tx: &Transaction<'_>,
    sector_id: i64,
    actor_character_id: &str,
) -> Result<Vec<(String, RecipientReason)>, DomainError> {
    let presences = persistence::sector_presences(tx, sector_id)?;
    let garrison = persistence::garrison_presence(tx, sector_id)?;
    Ok(universe_core::visibility::compute_event_recipients(
        &[(actor_character_id.to_string(), RecipientReason::Sender)],
        &presences,
        garrison.as_ref(),
        &[],
    ))
}
