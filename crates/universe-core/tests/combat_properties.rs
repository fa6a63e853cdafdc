use std::collections::BTreeMap;

use contracts::{
    CombatAction, CombatEndReason, CombatantMetadata, CombatantState, CombatantType, ErrorKind,
    GarrisonMode,
};
use proptest::prelude::*;
use universe_core::{CombatConfig, CombatEngine};

fn ship_combatant(id: &str, owner: &str, corp: Option<&str>, fighters: i64) -> CombatantState {
    CombatantState {
        combatant_id: id.to_string(),
        combatant_type: CombatantType::Character,
        display_name: owner.to_string(),
        owner_character_id: Some(owner.to_string()),
        ship_type: Some("freighter".to_string()),
        fighters,
        is_escape_pod: false,
        metadata: CombatantMetadata {
            mode: None,
            toll_amount: None,
            toll_balance: None,
            corporation_id: corp.map(str::to_string),
            sector_id: 5,
        },
    }
}

fn garrison_combatant(owner: &str, corp: Option<&str>, mode: GarrisonMode, fighters: i64) -> CombatantState {
    CombatantState {
        combatant_id: "garrison:5".to_string(),
        combatant_type: CombatantType::Garrison,
        display_name: format!("{owner}'s garrison"),
        owner_character_id: Some(owner.to_string()),
        ship_type: None,
        fighters,
        is_escape_pod: false,
        metadata: CombatantMetadata {
            mode: Some(mode),
            toll_amount: Some(50),
            toll_balance: Some(0),
            corporation_id: corp.map(str::to_string),
            sector_id: 5,
        },
    }
}

fn engine() -> CombatEngine {
    CombatEngine::new(CombatConfig::default())
}

#[test]
fn encounter_is_never_created_with_fewer_than_two_participants() {
    // A lone ship cannot have a targetable opponent.
    let combatants = vec![ship_combatant("s1", "alice", None, 10)];
    let err = engine()
        .initiate_manual("combat-1".to_string(), 7, 5, "s1", &combatants, None, 1_000)
        .expect_err("lone combatant must be rejected");
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[test]
fn initiation_rejects_same_corporation_only_sectors() {
    let combatants = vec![
        ship_combatant("s1", "alice", Some("corp_zenith"), 10),
        ship_combatant("s2", "bob", Some("corp_zenith"), 10),
    ];
    let err = engine()
        .initiate_manual("combat-1".to_string(), 7, 5, "s1", &combatants, None, 1_000)
        .expect_err("corp-mates are not targetable opponents");
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[test]
fn initiation_rejects_fighterless_and_escape_pod_initiators() {
    let opponents = ship_combatant("s2", "bob", None, 10);

    let unarmed = vec![ship_combatant("s1", "alice", None, 0), opponents.clone()];
    let err = engine()
        .initiate_manual("combat-1".to_string(), 7, 5, "s1", &unarmed, None, 1_000)
        .expect_err("zero fighters cannot initiate");
    assert_eq!(err.kind, ErrorKind::Validation);

    let mut pod = ship_combatant("s1", "alice", None, 3);
    pod.is_escape_pod = true;
    let err = engine()
        .initiate_manual(
            "combat-1".to_string(),
            7,
            5,
            "s1",
            &[pod, opponents],
            None,
            1_000,
        )
        .expect_err("escape pods cannot initiate");
    assert_eq!(err.kind, ErrorKind::Validation);
}

#[test]
fn initiator_joins_existing_live_encounter_instead_of_creating() {
    let first_wave = vec![
        ship_combatant("s1", "alice", None, 10),
        ship_combatant("s2", "bob", None, 10),
    ];
    let encounter = engine()
        .initiate_manual(
            "combat-1".to_string(),
            7,
            5,
            "s1",
            &first_wave,
            None,
            1_000,
        )
        .expect("initial encounter");

    let late_arrival = ship_combatant("s3", "carol", None, 6);
    let mut everyone = first_wave;
    everyone.push(late_arrival);

    let joined = engine()
        .initiate_manual(
            "combat-2".to_string(),
            99,
            5,
            "s3",
            &everyone,
            Some(encounter.clone()),
            2_000,
        )
        .expect("join should succeed");

    assert_eq!(joined.combat_id, encounter.combat_id, "no new encounter");
    assert_eq!(joined.base_seed, encounter.base_seed);
    assert!(joined.participants.contains_key("s3"));
    assert_eq!(joined.participants.len(), 3);
}

#[test]
fn defensive_garrisons_never_auto_engage() {
    let arriving = ship_combatant("s1", "alice", None, 10);
    let garrison = garrison_combatant("holder", None, GarrisonMode::Defensive, 30);

    let err = engine()
        .auto_engage("combat-1".to_string(), 7, 5, &arriving, &garrison, 1_000)
        .expect_err("defensive garrisons must not engage");
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[test]
fn friendly_garrisons_never_auto_engage() {
    let arriving = ship_combatant("s1", "alice", Some("corp_axis"), 10);
    let garrison = garrison_combatant("holder", Some("corp_axis"), GarrisonMode::Offensive, 30);

    let err = engine()
        .auto_engage("combat-1".to_string(), 7, 5, &arriving, &garrison, 1_000)
        .expect_err("same corporation must not trigger engagement");
    assert_eq!(err.kind, ErrorKind::Conflict);
}

#[test]
fn toll_auto_engage_prepopulates_the_demand_for_round_one() {
    let arriving = ship_combatant("s1", "alice", None, 10);
    let garrison = garrison_combatant("holder", None, GarrisonMode::Toll, 30);

    let encounter = engine()
        .auto_engage("combat-1".to_string(), 7, 5, &arriving, &garrison, 1_000)
        .expect("toll garrison engages");

    assert!(encounter.context.auto_initiated);
    assert_eq!(encounter.context.garrison_owner_id.as_deref(), Some("holder"));
    assert_eq!(encounter.context.toll_registry.len(), 1);

    let demand = &encounter.context.toll_registry[0];
    assert_eq!(demand.owner_id, "holder");
    assert_eq!(demand.toll_amount, 50);
    assert_eq!(demand.target_id, None);
    assert!(!demand.paid);
    assert_eq!(demand.paid_round, None);
    assert_eq!(demand.demand_round, 1);
}

#[test]
fn round_resolution_is_deterministic_for_a_given_seed_and_round() {
    let combatants = vec![
        ship_combatant("s1", "alice", None, 120),
        ship_combatant("s2", "bob", None, 140),
    ];
    let base = engine()
        .initiate_manual(
            "combat-1".to_string(),
            1234,
            5,
            "s1",
            &combatants,
            None,
            1_000,
        )
        .expect("encounter");

    let mut first = base.clone();
    let mut second = base.clone();
    let engine = engine();

    let outcome_a = engine.resolve_round(&mut first, 2_000).expect("resolve");
    let outcome_b = engine.resolve_round(&mut second, 2_000).expect("resolve");

    assert_eq!(outcome_a.casualties, outcome_b.casualties);
    assert_eq!(first, second, "identical inputs must replay identically");
}

#[test]
fn different_seeds_change_outcomes() {
    let combatants = vec![
        ship_combatant("s1", "alice", None, 1_000),
        ship_combatant("s2", "bob", None, 1_000),
    ];
    let engine = engine();

    let mut casualties = Vec::new();
    for seed in [1_u64, 2, 3, 4, 5, 6, 7, 8] {
        let mut encounter = engine
            .initiate_manual(
                format!("combat-{seed}"),
                seed,
                5,
                "s1",
                &combatants,
                None,
                1_000,
            )
            .expect("encounter");
        encounter
            .pending_actions
            .insert("s1".to_string(), CombatAction::Attack { target_id: "s2".to_string() });
        encounter
            .pending_actions
            .insert("s2".to_string(), CombatAction::Attack { target_id: "s1".to_string() });
        let outcome = engine.resolve_round(&mut encounter, 2_000).expect("resolve");
        casualties.push(outcome.casualties.clone());
    }

    let first = &casualties[0];
    assert!(
        casualties.iter().any(|sample| sample != first),
        "eight distinct seeds should not all roll identical losses"
    );
}

#[test]
fn submitting_all_actions_marks_the_round_awaiting_resolution() {
    let combatants = vec![
        ship_combatant("s1", "alice", None, 10),
        ship_combatant("s2", "bob", None, 10),
    ];
    let engine = engine();
    let mut encounter = engine
        .initiate_manual("combat-1".to_string(), 7, 5, "s1", &combatants, None, 1_000)
        .expect("encounter");

    let ready = engine
        .submit_action(
            &mut encounter,
            "s1",
            CombatAction::Attack { target_id: "s2".to_string() },
            1_100,
        )
        .expect("first action");
    assert!(!ready);
    assert!(!encounter.awaiting_resolution);

    let ready = engine
        .submit_action(&mut encounter, "s2", CombatAction::Defend, 1_200)
        .expect("second action");
    assert!(ready);
    assert!(encounter.awaiting_resolution);
}

#[test]
fn combat_runs_to_elimination_and_names_the_winning_side() {
    let combatants = vec![
        ship_combatant("s1", "alice", Some("corp_zenith"), 300),
        ship_combatant("s2", "bob", Some("corp_axis"), 30),
    ];
    let engine = engine();
    let mut encounter = engine
        .initiate_manual("combat-1".to_string(), 42, 5, "s1", &combatants, None, 1_000)
        .expect("encounter");

    let mut now = 1_000;
    for _ in 0..64 {
        if encounter.ended {
            break;
        }
        encounter.pending_actions.insert(
            "s1".to_string(),
            CombatAction::Attack { target_id: "s2".to_string() },
        );
        encounter.pending_actions.insert(
            "s2".to_string(),
            CombatAction::Attack { target_id: "s1".to_string() },
        );
        now += 1_000;
        engine.resolve_round(&mut encounter, now).expect("resolve");
    }

    assert!(encounter.ended, "lopsided fight must terminate");
    let end_state = encounter.end_state.expect("end state");
    assert_eq!(end_state.reason, CombatEndReason::Elimination);
    assert_eq!(end_state.winner_side.as_deref(), Some("corp:corp_zenith"));
    assert!(encounter.round >= 1);
    assert_eq!(encounter.logs.len(), encounter.round as usize);
}

#[test]
fn successful_flee_removes_the_combatant_without_casualties_for_it() {
    let config = CombatConfig {
        flee_success_pct: 100,
        ..CombatConfig::default()
    };
    let engine = CombatEngine::new(config);
    let combatants = vec![
        ship_combatant("s1", "alice", None, 50),
        ship_combatant("s2", "bob", None, 50),
    ];
    let mut encounter = engine
        .initiate_manual("combat-1".to_string(), 9, 5, "s1", &combatants, None, 1_000)
        .expect("encounter");

    encounter
        .pending_actions
        .insert("s1".to_string(), CombatAction::Flee);
    encounter
        .pending_actions
        .insert("s2".to_string(), CombatAction::Attack { target_id: "s1".to_string() });

    let outcome = engine.resolve_round(&mut encounter, 2_000).expect("resolve");

    assert_eq!(outcome.fled, vec!["s1".to_string()]);
    assert!(!outcome.casualties.contains_key("s1"));
    assert_eq!(outcome.withdrawn.get("s1"), Some(&50));
    assert!(!encounter.participants.contains_key("s1"));
    assert!(encounter.ended, "a single remaining side ends the encounter");
}

#[test]
fn fleeing_reports_the_fleers_remaining_fighters() {
    let config = CombatConfig {
        flee_success_pct: 100,
        ..CombatConfig::default()
    };
    let engine = CombatEngine::new(config);
    let combatants = vec![
        ship_combatant("s1", "alice", None, 100),
        ship_combatant("s2", "bob", None, 100),
    ];
    let mut encounter = engine
        .initiate_manual("combat-1".to_string(), 21, 5, "s1", &combatants, None, 1_000)
        .expect("encounter");

    // Round one: mutual fire, both sides take losses.
    encounter
        .pending_actions
        .insert("s1".to_string(), CombatAction::Attack { target_id: "s2".to_string() });
    encounter
        .pending_actions
        .insert("s2".to_string(), CombatAction::Attack { target_id: "s1".to_string() });
    engine.resolve_round(&mut encounter, 2_000).expect("first round");
    let bob_remaining = encounter.participants["s2"].fighters;
    assert!(bob_remaining < 100, "round one must cost bob fighters");

    // Round two: bob escapes with exactly what is left.
    encounter
        .pending_actions
        .insert("s2".to_string(), CombatAction::Flee);
    let outcome = engine.resolve_round(&mut encounter, 3_000).expect("second round");
    assert_eq!(outcome.fled, vec!["s2".to_string()]);
    assert_eq!(outcome.withdrawn.get("s2"), Some(&bob_remaining));
}

#[test]
fn unpaid_toll_demands_are_reannounced_every_round() {
    let arriving = ship_combatant("s1", "alice", None, 400);
    let garrison = garrison_combatant("holder", None, GarrisonMode::Toll, 400);
    let engine = engine();
    let mut encounter = engine
        .auto_engage("combat-1".to_string(), 7, 5, &arriving, &garrison, 1_000)
        .expect("toll engagement");

    let first = engine.resolve_round(&mut encounter, 2_000).expect("first round");
    assert_eq!(first.demands_presented.len(), 1);
    assert!(!encounter.ended, "both sides survive the opening round");

    let second = engine.resolve_round(&mut encounter, 3_000).expect("second round");
    assert_eq!(second.demands_presented.len(), 1);
    assert_eq!(second.demands_presented[0].demand_round, 2);

    // Paying silences the demand from then on.
    encounter
        .pending_actions
        .insert("s1".to_string(), CombatAction::PayToll);
    let third = engine.resolve_round(&mut encounter, 4_000).expect("third round");
    assert!(third.demands_presented.is_empty());
}

#[test]
fn paying_the_toll_marks_the_demand_and_reports_the_payment() {
    let arriving = ship_combatant("s1", "alice", None, 10);
    let garrison = garrison_combatant("holder", None, GarrisonMode::Toll, 30);
    let engine = engine();

    let mut encounter = engine
        .auto_engage("combat-1".to_string(), 7, 5, &arriving, &garrison, 1_000)
        .expect("toll engagement");

    encounter
        .pending_actions
        .insert("s1".to_string(), CombatAction::PayToll);

    let outcome = engine.resolve_round(&mut encounter, 2_000).expect("resolve");

    assert_eq!(outcome.toll_payments.len(), 1);
    let payment = &outcome.toll_payments[0];
    assert_eq!(payment.garrison_owner_id, "holder");
    assert_eq!(payment.amount, 50);
    assert_eq!(payment.payer_character_id.as_deref(), Some("alice"));

    let demand = &encounter.context.toll_registry[0];
    assert!(demand.paid);
    assert_eq!(demand.paid_round, Some(1));
    assert_eq!(demand.toll_balance, 50);
    assert_eq!(demand.target_id.as_deref(), Some("s1"));
    // Payment settled before shots: nobody attacked the payer by default.
    assert!(outcome.casualties.is_empty());
}

#[test]
fn cancel_terminates_without_a_winner() {
    let combatants = vec![
        ship_combatant("s1", "alice", None, 10),
        ship_combatant("s2", "bob", None, 10),
    ];
    let engine = engine();
    let mut encounter = engine
        .initiate_manual("combat-1".to_string(), 7, 5, "s1", &combatants, None, 1_000)
        .expect("encounter");

    engine.cancel(&mut encounter, 5_000);

    assert!(encounter.ended);
    let end_state = encounter.end_state.clone().expect("end state");
    assert_eq!(end_state.reason, CombatEndReason::Cancelled);
    assert_eq!(end_state.winner_side, None);

    let err = engine
        .resolve_round(&mut encounter, 6_000)
        .expect_err("resolving a cancelled encounter must fail");
    assert_eq!(err.kind, ErrorKind::Conflict);
}

proptest! {
    #[test]
    fn fighters_never_go_negative_and_losses_never_exceed_strength(
        seed in 0_u64..u64::MAX,
        fighters_a in 1_i64..400,
        fighters_b in 1_i64..400,
    ) {
        let combatants = vec![
            ship_combatant("s1", "alice", None, fighters_a),
            ship_combatant("s2", "bob", None, fighters_b),
        ];
        let engine = engine();
        let mut encounter = engine
            .initiate_manual("combat-prop".to_string(), seed, 5, "s1", &combatants, None, 1_000)
            .expect("encounter");

        let starting = BTreeMap::from([
            ("s1".to_string(), fighters_a),
            ("s2".to_string(), fighters_b),
        ]);

        encounter.pending_actions.insert(
            "s1".to_string(),
            CombatAction::Attack { target_id: "s2".to_string() },
        );
        encounter.pending_actions.insert(
            "s2".to_string(),
            CombatAction::Attack { target_id: "s1".to_string() },
        );

        let outcome = engine.resolve_round(&mut encounter, 2_000).expect("resolve");

        for (combatant_id, lost) in &outcome.casualties {
            prop_assert!(*lost >= 1);
            prop_assert!(*lost <= starting[combatant_id]);
        }
        for combatant in encounter.participants.values() {
            prop_assert!(combatant.fighters >= 0);
        }
    }

    #[test]
    fn mutual_attack_always_terminates(
        seed in 0_u64..u64::MAX,
        fighters_a in 1_i64..200,
        fighters_b in 1_i64..200,
    ) {
        let combatants = vec![
            ship_combatant("s1", "alice", None, fighters_a),
            ship_combatant("s2", "bob", None, fighters_b),
        ];
        let engine = engine();
        let mut encounter = engine
            .initiate_manual("combat-prop".to_string(), seed, 5, "s1", &combatants, None, 1_000)
            .expect("encounter");

        let mut now = 1_000;
        for _ in 0..256 {
            if encounter.ended {
                break;
            }
            for id in ["s1", "s2"] {
                if encounter.participants.get(id).map(|c| c.fighters > 0).unwrap_or(false) {
                    let target = if id == "s1" { "s2" } else { "s1" };
                    encounter.pending_actions.insert(
                        id.to_string(),
                        CombatAction::Attack { target_id: target.to_string() },
                    );
                }
            }
            now += 1_000;
            engine.resolve_round(&mut encounter, now).expect("resolve");
        }

        prop_assert!(encounter.ended, "mutual attrition must end within 256 rounds");
    }
}
