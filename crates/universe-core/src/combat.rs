//! Round-based combat resolution. Outcomes derive deterministically from the
//! encounter's stored base seed and the round number, so a replay of the same
//! encounter reproduces identical results.

use std::collections::BTreeMap;

use contracts::{
    CombatAction, CombatContext, CombatEncounter, CombatEndReason, CombatEndState, CombatantState,
    CombatantType, DomainError, GarrisonMode, SectorId, TimestampMs, TollDemand,
};
use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::combatant::CombatantLoader;

#[derive(Debug, Clone)]
pub struct CombatConfig {
    pub round_duration_ms: TimestampMs,
    /// Per-round loss roll, as a percentage of the attacker's committed
    /// fighters.
    pub min_loss_pct: u32,
    pub max_loss_pct: u32,
    pub flee_success_pct: u32,
}

impl Default for CombatConfig {
    fn default() -> Self {
        Self {
            round_duration_ms: 30_000,
            min_loss_pct: 40,
            max_loss_pct: 60,
            flee_success_pct: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TollPayment {
    pub payer_combatant_id: String,
    pub payer_character_id: Option<String>,
    pub garrison_owner_id: String,
    pub amount: i64,
}

/// What one resolved round did, for journaling and ship/garrison mutation.
#[derive(Debug, Clone, Default)]
pub struct RoundOutcome {
    pub round: u32,
    pub casualties: BTreeMap<String, i64>,
    pub fled: Vec<String>,
    /// Remaining fighters of each character combatant that fled this round;
    /// their ship rows sync from this since they leave the encounter here.
    pub withdrawn: BTreeMap<String, i64>,
    pub defeated: Vec<String>,
    pub toll_payments: Vec<TollPayment>,
    /// Unpaid demands whose demand round is the round just resolved.
    pub demands_presented: Vec<TollDemand>,
    pub ended: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CombatEngine {
    config: CombatConfig,
}

impl CombatEngine {
    pub fn new(config: CombatConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CombatConfig {
        &self.config
    }

    /// Manual initiation. Joins the sector's live encounter when one exists;
    /// otherwise creates a new one from the loaded combatants. All
    /// precondition failures reject synchronously, before anything persists.
    pub fn initiate_manual(
        &self,
        combat_id: String,
        base_seed: u64,
        sector_id: SectorId,
        initiator_id: &str,
        combatants: &[CombatantState],
        existing: Option<CombatEncounter>,
        now: TimestampMs,
    ) -> Result<CombatEncounter, DomainError> {
        let initiator = combatants
            .iter()
            .find(|combatant| combatant.combatant_id == initiator_id)
            .ok_or_else(|| {
                DomainError::not_found("combatant not present in sector")
                    .with_context(format!("combatant_id={initiator_id} sector_id={sector_id}"))
            })?;

        if initiator.is_escape_pod {
            return Err(DomainError::validation("escape pods cannot initiate combat"));
        }
        if initiator.fighters < 1 {
            return Err(DomainError::validation(
                "at least one fighter is required to initiate combat",
            ));
        }

        let has_opponent = combatants.iter().any(|candidate| {
            candidate.combatant_id != initiator.combatant_id
                && candidate.is_targetable()
                && CombatantLoader::hostile(initiator, candidate)
        });
        if !has_opponent {
            return Err(DomainError::conflict("no targetable opponent in sector")
                .with_context(format!("sector_id={sector_id}")));
        }

        if let Some(mut encounter) = existing {
            if encounter.ended {
                return Err(DomainError::internal(
                    "ended encounter passed as live combat state",
                ));
            }
            encounter
                .participants
                .entry(initiator.combatant_id.clone())
                .or_insert_with(|| initiator.clone());
            encounter.last_updated = now;
            return Ok(encounter);
        }

        if combatants.len() < 2 {
            return Err(DomainError::conflict(
                "combat requires at least two participants",
            ));
        }

        let participants = combatants
            .iter()
            .map(|combatant| (combatant.combatant_id.clone(), combatant.clone()))
            .collect::<BTreeMap<_, _>>();

        Ok(self.new_encounter(
            combat_id,
            base_seed,
            sector_id,
            participants,
            CombatContext {
                initiator_id: initiator.combatant_id.clone(),
                created_at: now,
                garrison_owner_id: None,
                auto_initiated: false,
                toll_registry: Vec::new(),
            },
            now,
        ))
    }

    /// Garrison auto-engage on sector arrival. Only offensive and toll
    /// garrisons fire; the caller has already verified the arriving character
    /// has no unresolved encounter in this sector.
    pub fn auto_engage(
        &self,
        combat_id: String,
        base_seed: u64,
        sector_id: SectorId,
        arriving: &CombatantState,
        garrison: &CombatantState,
        now: TimestampMs,
    ) -> Result<CombatEncounter, DomainError> {
        if garrison.combatant_type != CombatantType::Garrison {
            return Err(DomainError::internal("auto-engage requires a garrison combatant"));
        }

        let mode = garrison.metadata.mode.unwrap_or(GarrisonMode::Defensive);
        if !mode.auto_engages() {
            return Err(DomainError::conflict("garrison mode does not auto-engage")
                .with_context(format!("mode={}", mode.as_str())));
        }
        if garrison.fighters <= 0 {
            return Err(DomainError::conflict("garrison has no fighters to engage with"));
        }
        if !CombatantLoader::hostile(arriving, garrison) {
            return Err(DomainError::conflict(
                "garrison and arriving ship share a corporation",
            ));
        }
        if !arriving.is_targetable() {
            return Err(DomainError::conflict("arriving ship is not a valid target"));
        }

        let garrison_owner = garrison
            .owner_character_id
            .clone()
            .ok_or_else(|| DomainError::internal("garrison combatant without an owner"))?;

        let mut toll_registry = Vec::new();
        if mode == GarrisonMode::Toll {
            // The demand is presented on the first round.
            toll_registry.push(TollDemand {
                owner_id: garrison_owner.clone(),
                toll_amount: garrison.metadata.toll_amount.unwrap_or(0),
                toll_balance: garrison.metadata.toll_balance.unwrap_or(0),
                target_id: None,
                paid: false,
                paid_round: None,
                demand_round: 1,
            });
        }

        let mut participants = BTreeMap::new();
        participants.insert(arriving.combatant_id.clone(), arriving.clone());
        participants.insert(garrison.combatant_id.clone(), garrison.clone());

        Ok(self.new_encounter(
            combat_id,
            base_seed,
            sector_id,
            participants,
            CombatContext {
                initiator_id: garrison.combatant_id.clone(),
                created_at: now,
                garrison_owner_id: Some(garrison_owner),
                auto_initiated: true,
                toll_registry,
            },
            now,
        ))
    }

    /// Records one combatant's action for the current round. Returns true
    /// when every live participant has acted and the round is ready to
    /// resolve.
    pub fn submit_action(
        &self,
        encounter: &mut CombatEncounter,
        combatant_id: &str,
        action: CombatAction,
        now: TimestampMs,
    ) -> Result<bool, DomainError> {
        if encounter.ended {
            return Err(DomainError::conflict("combat has already ended")
                .with_context(format!("combat_id={}", encounter.combat_id)));
        }

        let combatant = encounter.participants.get(combatant_id).ok_or_else(|| {
            DomainError::not_found("combatant is not part of this encounter")
                .with_context(format!("combatant_id={combatant_id}"))
        })?;
        if combatant.fighters <= 0 {
            return Err(DomainError::conflict("defeated combatants cannot act"));
        }

        if let CombatAction::Attack { target_id } = &action {
            if !encounter.participants.contains_key(target_id) {
                return Err(DomainError::validation("attack target is not in this encounter")
                    .with_context(format!("target_id={target_id}")));
            }
        }

        encounter
            .pending_actions
            .insert(combatant_id.to_string(), action);
        encounter.last_updated = now;

        let ready = encounter
            .participants
            .values()
            .filter(|participant| participant.fighters > 0)
            .all(|participant| {
                encounter
                    .pending_actions
                    .contains_key(&participant.combatant_id)
            });
        if ready {
            encounter.awaiting_resolution = true;
        }

        Ok(ready)
    }

    /// Resolves the current round. Deterministic: the only randomness comes
    /// from a ChaCha stream seeded by `base_seed` and the round number.
    pub fn resolve_round(
        &self,
        encounter: &mut CombatEncounter,
        now: TimestampMs,
    ) -> Result<RoundOutcome, DomainError> {
        if encounter.ended {
            return Err(DomainError::conflict("combat has already ended"));
        }

        let round = encounter.round;
        let mut rng = round_rng(encounter.base_seed, round);

        let fighters_at_start = encounter
            .participants
            .values()
            .map(|combatant| (combatant.combatant_id.clone(), combatant.fighters))
            .collect::<BTreeMap<_, _>>();

        let mut outcome = RoundOutcome {
            round,
            ..RoundOutcome::default()
        };

        // Toll payments settle before any shots are exchanged, so a garrison
        // whose demand is met stands down when defaults are derived below.
        let submitted = encounter.pending_actions.clone();
        for (combatant_id, action) in &submitted {
            if !matches!(action, CombatAction::PayToll) {
                continue;
            }
            let payer_side = encounter
                .participants
                .get(combatant_id)
                .map(CombatEncounter::side_key);
            let Some(payer_side) = payer_side else { continue };

            let payer_character = encounter
                .participants
                .get(combatant_id)
                .and_then(|payer| payer.owner_character_id.clone());

            for demand in encounter.context.toll_registry.iter_mut() {
                if demand.paid {
                    continue;
                }
                let owner_side = encounter
                    .participants
                    .values()
                    .find(|candidate| {
                        candidate.owner_character_id.as_deref() == Some(demand.owner_id.as_str())
                            && candidate.combatant_type == CombatantType::Garrison
                    })
                    .map(CombatEncounter::side_key);
                if owner_side.as_deref() == Some(payer_side.as_str()) {
                    continue;
                }

                demand.paid = true;
                demand.paid_round = Some(round);
                demand.toll_balance += demand.toll_amount;
                demand.target_id = Some(combatant_id.clone());
                outcome.toll_payments.push(TollPayment {
                    payer_combatant_id: combatant_id.clone(),
                    payer_character_id: payer_character.clone(),
                    garrison_owner_id: demand.owner_id.clone(),
                    amount: demand.toll_amount,
                });
                break;
            }
        }

        let actions = self.effective_actions(encounter);

        // Flee attempts resolve next; successful fleers neither deal nor take
        // damage this round.
        let mut fled = Vec::new();
        for (combatant_id, action) in &actions {
            if !matches!(action, CombatAction::Flee) {
                continue;
            }
            if rng.gen_range(0_u32..100) < self.config.flee_success_pct {
                fled.push(combatant_id.clone());
            }
        }

        let mut damage_by_target = BTreeMap::<String, i64>::new();
        for (attacker_id, action) in &actions {
            let CombatAction::Attack { target_id } = action else {
                continue;
            };
            if fled.contains(attacker_id) {
                continue;
            }

            let committed = fighters_at_start.get(attacker_id).copied().unwrap_or(0);
            if committed <= 0 {
                continue;
            }

            let target_id = self.resolve_target(encounter, attacker_id, target_id, &fled);
            let Some(target_id) = target_id else { continue };

            let pct = rng.gen_range(self.config.min_loss_pct..=self.config.max_loss_pct);
            let mut damage = (committed * i64::from(pct) / 100).max(1);
            if matches!(actions.get(&target_id), Some(CombatAction::Defend)) {
                damage = (damage / 2).max(1);
            }
            *damage_by_target.entry(target_id).or_insert(0) += damage;
        }

        for (target_id, damage) in &damage_by_target {
            let Some(target) = encounter.participants.get_mut(target_id) else {
                continue;
            };
            let before = target.fighters;
            target.fighters = (target.fighters - damage).max(0);
            let lost = before - target.fighters;
            if lost > 0 {
                outcome.casualties.insert(target_id.clone(), lost);
            }
            if before > 0 && target.fighters == 0 {
                outcome.defeated.push(target_id.clone());
            }
        }

        for combatant_id in &fled {
            if let Some(removed) = encounter.participants.remove(combatant_id) {
                if removed.combatant_type == CombatantType::Character {
                    outcome.withdrawn.insert(combatant_id.clone(), removed.fighters);
                }
            }
        }
        outcome.fled = fled;

        outcome.demands_presented = encounter
            .context
            .toll_registry
            .iter()
            .filter(|demand| demand.demand_round == round && !demand.paid)
            .cloned()
            .collect();

        let total_losses = outcome.casualties.values().sum::<i64>();
        encounter.logs.push(contracts::RoundLog {
            round,
            resolved_at: now,
            summary: format!(
                "round {round}: {total_losses} fighters lost, {} defeated, {} fled",
                outcome.defeated.len(),
                outcome.fled.len()
            ),
            casualties: outcome.casualties.clone(),
            fled: outcome.fled.clone(),
        });

        tracing::debug!(
            combat_id = %encounter.combat_id,
            round,
            casualties = outcome.casualties.len(),
            fled = outcome.fled.len(),
            "round resolved"
        );

        let sides = encounter.sides_with_fighters();
        if sides.len() <= 1 {
            let reason = if sides.is_empty() && !outcome.fled.is_empty() {
                CombatEndReason::AllFled
            } else {
                CombatEndReason::Elimination
            };
            encounter.ended = true;
            encounter.awaiting_resolution = false;
            encounter.end_state = Some(CombatEndState {
                reason,
                winner_side: sides.into_iter().next(),
                ended_at: now,
            });
            outcome.ended = true;
        } else {
            encounter.round += 1;
            encounter.pending_actions.clear();
            encounter.awaiting_resolution = false;
            encounter.deadline = now + self.config.round_duration_ms;
            // Unpaid demands carry forward so the next round presents them
            // again.
            for demand in encounter.context.toll_registry.iter_mut() {
                if !demand.paid {
                    demand.demand_round = encounter.round;
                }
            }
        }
        encounter.last_updated = now;

        Ok(outcome)
    }

    /// Explicit cancellation, e.g. by an administrator.
    pub fn cancel(&self, encounter: &mut CombatEncounter, now: TimestampMs) {
        if encounter.ended {
            return;
        }
        encounter.ended = true;
        encounter.awaiting_resolution = false;
        encounter.end_state = Some(CombatEndState {
            reason: CombatEndReason::Cancelled,
            winner_side: None,
            ended_at: now,
        });
        encounter.last_updated = now;
    }

    fn new_encounter(
        &self,
        combat_id: String,
        base_seed: u64,
        sector_id: SectorId,
        participants: BTreeMap<String, CombatantState>,
        context: CombatContext,
        now: TimestampMs,
    ) -> CombatEncounter {
        CombatEncounter {
            combat_id,
            sector_id,
            round: 1,
            deadline: now + self.config.round_duration_ms,
            participants,
            pending_actions: BTreeMap::new(),
            logs: Vec::new(),
            context,
            awaiting_resolution: false,
            ended: false,
            end_state: None,
            base_seed,
            version: 0,
            last_updated: now,
        }
    }

    /// Submitted actions plus per-type defaults: characters hold position,
    /// garrisons act according to their mode.
    fn effective_actions(&self, encounter: &CombatEncounter) -> BTreeMap<String, CombatAction> {
        let mut actions = BTreeMap::new();

        for combatant in encounter.participants.values() {
            if combatant.fighters <= 0 {
                continue;
            }
            if let Some(action) = encounter.pending_actions.get(&combatant.combatant_id) {
                actions.insert(combatant.combatant_id.clone(), action.clone());
                continue;
            }
            if combatant.combatant_type == CombatantType::Character {
                actions.insert(combatant.combatant_id.clone(), CombatAction::Defend);
            }
        }

        // Garrison defaults come last so defensive mode can see who attacked.
        for combatant in encounter.participants.values() {
            if combatant.combatant_type != CombatantType::Garrison
                || combatant.fighters <= 0
                || actions.contains_key(&combatant.combatant_id)
            {
                continue;
            }

            let mode = combatant.metadata.mode.unwrap_or(GarrisonMode::Defensive);
            let action = match mode {
                GarrisonMode::Offensive => self
                    .first_hostile_target(encounter, combatant)
                    .map(|target_id| CombatAction::Attack { target_id }),
                GarrisonMode::Toll => {
                    let owner = combatant.owner_character_id.as_deref();
                    let unpaid = encounter
                        .context
                        .toll_registry
                        .iter()
                        .any(|demand| Some(demand.owner_id.as_str()) == owner && !demand.paid);
                    if unpaid {
                        self.first_hostile_target(encounter, combatant)
                            .map(|target_id| CombatAction::Attack { target_id })
                    } else {
                        None
                    }
                }
                GarrisonMode::Defensive => actions
                    .iter()
                    .find(|(_, action)| {
                        matches!(action, CombatAction::Attack { target_id }
                            if *target_id == combatant.combatant_id)
                    })
                    .map(|(attacker_id, _)| CombatAction::Attack {
                        target_id: attacker_id.clone(),
                    }),
            };

            actions.insert(
                combatant.combatant_id.clone(),
                action.unwrap_or(CombatAction::Defend),
            );
        }

        actions
    }

    fn first_hostile_target(
        &self,
        encounter: &CombatEncounter,
        from: &CombatantState,
    ) -> Option<String> {
        encounter
            .participants
            .values()
            .find(|candidate| {
                candidate.combatant_id != from.combatant_id
                    && candidate.is_targetable()
                    && CombatantLoader::hostile(from, candidate)
            })
            .map(|candidate| candidate.combatant_id.clone())
    }

    /// Keeps an explicit target when it is still legal, otherwise retargets
    /// the first hostile combatant.
    fn resolve_target(
        &self,
        encounter: &CombatEncounter,
        attacker_id: &str,
        requested: &str,
        fled: &[String],
    ) -> Option<String> {
        let attacker = encounter.participants.get(attacker_id)?;

        let valid = |candidate: &CombatantState| {
            candidate.combatant_id != attacker_id
                && candidate.is_targetable()
                && !fled.contains(&candidate.combatant_id)
                && CombatantLoader::hostile(attacker, candidate)
        };

        if let Some(target) = encounter.participants.get(requested) {
            if valid(target) {
                return Some(requested.to_string());
            }
        }

        encounter
            .participants
            .values()
            .find(|candidate| valid(candidate))
            .map(|candidate| candidate.combatant_id.clone())
    }
}

/// ChaCha stream for one round; the multiplier spreads consecutive round
/// numbers across the seed space.
pub fn round_rng(base_seed: u64, round: u32) -> ChaCha8Rng {
    let round_salt = u64::from(round).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    ChaCha8Rng::seed_from_u64(base_seed ^ round_salt)
}
