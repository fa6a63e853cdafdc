use std::collections::BTreeMap;
use std::env;

use contracts::{
    CharacterRecord, CombatAction, DeployRequest, EventsQuery, GarrisonMode,
    InitiateCombatRequest, Ship, ShipOwnerType,
};
use universe_api::{StaticShipCatalog, UniverseApi};

fn print_usage() {
    println!("universe-cli <command>");
    println!("commands:");
    println!("  init [sector_count]");
    println!("    default sector_count: 1000");
    println!("  seed");
    println!("    creates two rival pilots and a toll garrison in sector 5");
    println!("  deploy <character> <ship> <sector> <quantity> [mode] [toll]");
    println!("  skirmish");
    println!("    runs a combat between the seeded pilots to completion");
    println!("  events <character> [since_id]");
    println!();
    println!("sqlite path comes from UNIVERSE_SQLITE_PATH (default universe.sqlite)");
}

fn sqlite_path() -> String {
    env::var("UNIVERSE_SQLITE_PATH")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| "universe.sqlite".to_string())
}

fn open_api() -> Result<UniverseApi, String> {
    let catalog = StaticShipCatalog::new(BTreeMap::from([
        ("freighter".to_string(), 12_000_i64),
        ("corvette".to_string(), 45_000_i64),
    ]));
    UniverseApi::open(sqlite_path())
        .map(|api| api.with_catalog(Box::new(catalog)))
        .map_err(|err| format!("failed to open universe store: {err}"))
}

fn parse_i64(value: Option<&String>, label: &str) -> Result<i64, String> {
    let raw = value.ok_or_else(|| format!("missing {label}"))?;
    raw.parse::<i64>()
        .map_err(|_| format!("invalid {label}: {raw}"))
}

fn pilot(id: &str, corp: &str) -> CharacterRecord {
    CharacterRecord {
        character_id: id.to_string(),
        display_name: id.to_string(),
        corporation_id: Some(corp.to_string()),
        active: true,
    }
}

fn freighter(ship_id: &str, owner: &str, sector: i64, fighters: i64, credits: i64) -> Ship {
    Ship {
        ship_id: ship_id.to_string(),
        owner_type: ShipOwnerType::Character,
        owner_character_id: Some(owner.to_string()),
        owner_corporation_id: None,
        ship_type: "freighter".to_string(),
        current_sector: sector,
        in_hyperspace: false,
        current_fighters: fighters,
        shields: 100,
        warp_power: 300,
        credits,
        cargo: BTreeMap::new(),
        is_escape_pod: false,
        former_ship_type: None,
        updated_at: 0,
    }
}

fn run_init(args: &[String]) -> Result<(), String> {
    let sector_count = args
        .get(2)
        .map(|value| parse_i64(Some(value), "sector_count"))
        .transpose()?
        .unwrap_or(1_000);

    let mut api = open_api()?;
    api.set_sector_count(sector_count)
        .map_err(|err| format!("init failed: {err}"))?;
    println!("universe initialized: {} sectors, sqlite={}", sector_count, sqlite_path());
    Ok(())
}

fn run_seed() -> Result<(), String> {
    let mut api = open_api()?;
    for (who, corp) in [("vega", "corp_zenith"), ("orion", "corp_axis")] {
        api.register_character(&pilot(who, corp))
            .map_err(|err| format!("seeding {who} failed: {err}"))?;
    }
    api.register_ship(&freighter("vega-1", "vega", 5, 120, 2_000))
        .map_err(|err| format!("seeding vega-1 failed: {err}"))?;
    api.register_ship(&freighter("orion-1", "orion", 5, 80, 2_000))
        .map_err(|err| format!("seeding orion-1 failed: {err}"))?;

    api.deploy_garrison(&DeployRequest {
        sector_id: 5,
        character_id: "orion".to_string(),
        ship_id: "orion-1".to_string(),
        quantity: 20,
        mode: GarrisonMode::Toll,
        toll_amount: 50,
    })
    .map_err(|err| format!("seeding garrison failed: {err}"))?;

    println!("seeded pilots vega and orion in sector 5 with a 50cr toll garrison");
    Ok(())
}

fn run_deploy(args: &[String]) -> Result<(), String> {
    let character_id = args.get(2).cloned().ok_or_else(|| "missing character".to_string())?;
    let ship_id = args.get(3).cloned().ok_or_else(|| "missing ship".to_string())?;
    let sector_id = parse_i64(args.get(4), "sector")?;
    let quantity = parse_i64(args.get(5), "quantity")?;
    let mode = args
        .get(6)
        .map(|raw| GarrisonMode::parse(raw).ok_or_else(|| format!("invalid mode: {raw}")))
        .transpose()?
        .unwrap_or(GarrisonMode::Defensive);
    let toll_amount = args
        .get(7)
        .map(|value| parse_i64(Some(value), "toll"))
        .transpose()?
        .unwrap_or(0);

    let mut api = open_api()?;
    let response = api
        .deploy_garrison(&DeployRequest {
            sector_id,
            character_id,
            ship_id,
            quantity,
            mode,
            toll_amount,
        })
        .map_err(|err| format!("deploy failed: {err}"))?;

    println!(
        "deployed: garrison owner={} fighters={} mode={} ship_fighters={}",
        response.garrison.owner_id,
        response.garrison.fighters,
        response.garrison.mode.as_str(),
        response.new_ship_fighters
    );
    Ok(())
}

fn run_skirmish() -> Result<(), String> {
    // Zero-length rounds so the demo resolves without waiting out deadlines.
    let config = universe_core::combat::CombatConfig {
        round_duration_ms: 0,
        ..universe_core::combat::CombatConfig::default()
    };
    let mut api = open_api()?.with_engine(universe_core::combat::CombatEngine::new(config));

    let started = api
        .initiate_combat(&InitiateCombatRequest {
            character_id: "vega".to_string(),
            actor_character_id: None,
            admin_override: false,
        })
        .map_err(|err| format!("initiation failed: {err}"))?;
    println!(
        "combat {} opened in sector {} at round {}",
        started.combat_id, started.sector_id, started.round
    );

    let mut rounds = 0;
    while rounds < 64 {
        let encounter = api
            .live_encounter(started.sector_id)
            .map_err(|err| format!("state read failed: {err}"))?;
        let Some(encounter) = encounter else { break };

        let target = encounter
            .participants
            .keys()
            .find(|id| *id != "vega-1")
            .cloned()
            .ok_or_else(|| "no opponent left in the encounter".to_string())?;
        let outcome = api
            .submit_combat_action(
                started.sector_id,
                "vega-1",
                CombatAction::Attack { target_id: target },
            )
            .map_err(|err| format!("action failed: {err}"))?;
        if !outcome.resolved {
            api.resolve_due_rounds()
                .map_err(|err| format!("resolution failed: {err}"))?;
        }
        rounds += 1;
    }

    let record = universe_api::persistence::encounter_by_id(
        api.store().connection(),
        &started.combat_id,
    )
    .map_err(|err| format!("state read failed: {err}"))?
    .ok_or_else(|| "encounter record disappeared".to_string())?;

    for log in &record.logs {
        println!("{}", log.summary);
    }
    match &record.end_state {
        Some(end) => println!(
            "combat finished: winner_side={}",
            end.winner_side.as_deref().unwrap_or("none")
        ),
        None => println!("combat still running after {rounds} submitted rounds"),
    }
    Ok(())
}

fn run_events(args: &[String]) -> Result<(), String> {
    let character_id = args.get(2).cloned().ok_or_else(|| "missing character".to_string())?;
    let since_event_id = args
        .get(3)
        .map(|value| parse_i64(Some(value), "since_id"))
        .transpose()?;

    let api = open_api()?;
    let page = api
        .poll_events(&EventsQuery {
            character_ids: vec![character_id],
            since_event_id,
            ..EventsQuery::default()
        })
        .map_err(|err| format!("poll failed: {err}"))?;

    for event in &page.events {
        println!(
            "#{} {} {}",
            event.id,
            event.event_type.as_str(),
            serde_json::to_string(&event.payload).unwrap_or_default()
        );
    }
    println!(
        "last_event_id={} has_more={}",
        page.last_event_id, page.has_more
    );
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let command = args.get(1).map(String::as_str);

    let result = match command {
        Some("init") => run_init(&args),
        Some("seed") => run_seed(),
        Some("deploy") => run_deploy(&args),
        Some("skirmish") => run_skirmish(),
        Some("events") => run_events(&args),
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(err) = result {
        eprintln!("error: {err}");
        print_usage();
        std::process::exit(2);
    }
}
