//! SQLite-backed universe store: schema, row accessors, and the per-sector
//! advisory lock every garrison/ship/combat mutation runs under.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use contracts::{
    CharacterRecord, CombatEncounter, DomainError, Garrison, GarrisonMode, SalvageRecord, SectorId,
    Ship, ShipOwnerType, TimestampMs,
};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use universe_core::combatant::{CombatantLoader, PilotProfile};
use universe_core::visibility::{GarrisonPresence, SectorPresence};

pub(crate) fn storage_error(err: rusqlite::Error) -> DomainError {
    DomainError::internal("datastore operation failed").with_context(err.to_string())
}

pub(crate) fn codec_error(err: serde_json::Error) -> DomainError {
    DomainError::internal("stored payload failed to decode").with_context(err.to_string())
}

/// Per-sector mutual exclusion handles, shared between store instances so
/// in-process callers contending for one sector serialize while callers for
/// different sectors proceed independently. Cross-process serialization comes
/// from the immediate transaction underneath.
#[derive(Debug, Default)]
pub struct SectorLockRegistry {
    inner: Mutex<HashMap<SectorId, Arc<Mutex<()>>>>,
}

impl SectorLockRegistry {
    fn handle(&self, sector_id: SectorId) -> Arc<Mutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.entry(sector_id).or_default().clone()
    }
}

#[derive(Debug)]
pub struct SqliteUniverseStore {
    conn: Connection,
    locks: Arc<SectorLockRegistry>,
}

impl SqliteUniverseStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DomainError> {
        Self::open_with_locks(path, Arc::new(SectorLockRegistry::default()))
    }

    /// Open a connection that shares a lock registry with other store
    /// instances in this process.
    pub fn open_with_locks(
        path: impl AsRef<Path>,
        locks: Arc<SectorLockRegistry>,
    ) -> Result<Self, DomainError> {
        let conn = Connection::open(path).map_err(storage_error)?;
        let mut store = Self { conn, locks };
        store.configure()?;
        store.migrate()?;
        Ok(store)
    }

    pub fn lock_registry(&self) -> Arc<SectorLockRegistry> {
        self.locks.clone()
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Runs `body` inside an exclusive, transaction-scoped lock keyed by
    /// `sector_id`. Failure inside `body` aborts the transaction; rollback
    /// failures are logged and swallowed so the original error propagates.
    pub fn with_sector_lock<T>(
        &mut self,
        sector_id: SectorId,
        body: impl FnOnce(&Transaction<'_>) -> Result<T, DomainError>,
    ) -> Result<T, DomainError> {
        let handle = self.locks.handle(sector_id);
        let _guard = handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tracing::debug!(sector_id, "sector lock acquired");

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(storage_error)?;

        match body(&tx) {
            Ok(value) => {
                tx.commit().map_err(storage_error)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(
                        sector_id,
                        error = %rollback_err,
                        "rollback failed after aborted sector transaction"
                    );
                }
                Err(err)
            }
        }
    }

    fn configure(&mut self) -> Result<(), DomainError> {
        self.conn
            .pragma_update(None, "journal_mode", "WAL")
            .map_err(storage_error)?;
        self.conn
            .pragma_update(None, "foreign_keys", "ON")
            .map_err(storage_error)?;
        self.conn
            .pragma_update(None, "busy_timeout", 5_000)
            .map_err(storage_error)?;
        Ok(())
    }

    fn migrate(&mut self) -> Result<(), DomainError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    name TEXT NOT NULL,
                    applied_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS universe (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS characters (
                    character_id TEXT PRIMARY KEY,
                    display_name TEXT NOT NULL,
                    corporation_id TEXT,
                    active INTEGER NOT NULL DEFAULT 1
                );

                CREATE TABLE IF NOT EXISTS corp_members (
                    corporation_id TEXT NOT NULL,
                    character_id TEXT NOT NULL,
                    active INTEGER NOT NULL DEFAULT 1,
                    PRIMARY KEY (corporation_id, character_id)
                );

                CREATE TABLE IF NOT EXISTS ships (
                    ship_id TEXT PRIMARY KEY,
                    owner_type TEXT NOT NULL,
                    owner_character_id TEXT,
                    owner_corporation_id TEXT,
                    ship_type TEXT NOT NULL,
                    current_sector INTEGER NOT NULL,
                    in_hyperspace INTEGER NOT NULL DEFAULT 0,
                    current_fighters INTEGER NOT NULL DEFAULT 0,
                    shields INTEGER NOT NULL DEFAULT 0,
                    warp_power INTEGER NOT NULL DEFAULT 0,
                    credits INTEGER NOT NULL DEFAULT 0,
                    cargo_json TEXT NOT NULL DEFAULT '{}',
                    is_escape_pod INTEGER NOT NULL DEFAULT 0,
                    former_ship_type TEXT,
                    updated_at INTEGER NOT NULL DEFAULT 0
                );

                CREATE INDEX IF NOT EXISTS idx_ships_sector ON ships(current_sector);
                CREATE INDEX IF NOT EXISTS idx_ships_owner ON ships(owner_character_id);

                CREATE TABLE IF NOT EXISTS garrisons (
                    sector_id INTEGER NOT NULL,
                    owner_id TEXT NOT NULL,
                    fighters INTEGER NOT NULL,
                    mode TEXT NOT NULL,
                    toll_amount INTEGER NOT NULL DEFAULT 0,
                    toll_balance INTEGER NOT NULL DEFAULT 0,
                    deployed_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_garrisons_sector ON garrisons(sector_id);

                CREATE TABLE IF NOT EXISTS combat_encounters (
                    combat_id TEXT PRIMARY KEY,
                    sector_id INTEGER NOT NULL,
                    ended INTEGER NOT NULL DEFAULT 0,
                    version INTEGER NOT NULL DEFAULT 1,
                    deadline INTEGER NOT NULL,
                    payload_json TEXT NOT NULL,
                    updated_at INTEGER NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_combat_live_sector
                    ON combat_encounters(sector_id) WHERE ended = 0;

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_type TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    scope TEXT NOT NULL,
                    actor_character_id TEXT,
                    sector_id INTEGER,
                    corp_id TEXT,
                    task_id TEXT,
                    sender_id TEXT,
                    ship_id TEXT,
                    payload_json TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_events_sector ON events(sector_id, id);
                CREATE INDEX IF NOT EXISTS idx_events_corp ON events(corp_id, id);

                CREATE TABLE IF NOT EXISTS event_recipients (
                    event_id INTEGER NOT NULL,
                    character_id TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    PRIMARY KEY (event_id, character_id)
                );

                CREATE INDEX IF NOT EXISTS idx_event_recipients_character
                    ON event_recipients(character_id, event_id);

                CREATE TABLE IF NOT EXISTS salvage (
                    salvage_id TEXT PRIMARY KEY,
                    sector_id INTEGER NOT NULL,
                    source_ship_id TEXT NOT NULL,
                    cargo_json TEXT NOT NULL DEFAULT '{}',
                    scrap_value INTEGER NOT NULL,
                    credits INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                ",
            )
            .map_err(storage_error)?;

        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, name, applied_at)
                 VALUES(1, 'initial_v1', '0')",
                [],
            )
            .map_err(storage_error)?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Universe metadata
// ---------------------------------------------------------------------------

pub const DEFAULT_SECTOR_COUNT: i64 = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniverseMetadata {
    pub sector_count: i64,
}

pub fn universe_metadata(conn: &Connection) -> Result<UniverseMetadata, DomainError> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM universe WHERE key = 'sector_count'",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(storage_error)?;

    let sector_count = raw
        .and_then(|value| value.parse::<i64>().ok())
        .unwrap_or(DEFAULT_SECTOR_COUNT);

    Ok(UniverseMetadata { sector_count })
}

pub fn set_sector_count(conn: &Connection, sector_count: i64) -> Result<(), DomainError> {
    conn.execute(
        "INSERT INTO universe(key, value) VALUES('sector_count', ?1)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![sector_count.to_string()],
    )
    .map_err(storage_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Characters and corporation membership
// ---------------------------------------------------------------------------

pub fn upsert_character(conn: &Connection, character: &CharacterRecord) -> Result<(), DomainError> {
    conn.execute(
        "INSERT INTO characters(character_id, display_name, corporation_id, active)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(character_id) DO UPDATE SET
            display_name = excluded.display_name,
            corporation_id = excluded.corporation_id,
            active = excluded.active",
        params![
            character.character_id.as_str(),
            character.display_name.as_str(),
            character.corporation_id.as_deref(),
            i64::from(character.active),
        ],
    )
    .map_err(storage_error)?;

    if let Some(corp_id) = character.corporation_id.as_deref() {
        conn.execute(
            "INSERT INTO corp_members(corporation_id, character_id, active)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(corporation_id, character_id) DO UPDATE SET active = excluded.active",
            params![
                corp_id,
                character.character_id.as_str(),
                i64::from(character.active)
            ],
        )
        .map_err(storage_error)?;
    }

    Ok(())
}

pub fn character_by_id(
    conn: &Connection,
    character_id: &str,
) -> Result<Option<CharacterRecord>, DomainError> {
    conn.query_row(
        "SELECT character_id, display_name, corporation_id, active
         FROM characters WHERE character_id = ?1",
        params![character_id],
        |row| {
            Ok(CharacterRecord {
                character_id: row.get(0)?,
                display_name: row.get(1)?,
                corporation_id: row.get(2)?,
                active: row.get::<_, i64>(3)? != 0,
            })
        },
    )
    .optional()
    .map_err(storage_error)
}

/// Active membership map: character_id -> corporation_id.
pub fn corp_memberships(conn: &Connection) -> Result<BTreeMap<String, String>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT character_id, corporation_id FROM corp_members WHERE active = 1
             ORDER BY character_id",
        )
        .map_err(storage_error)?;

    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(storage_error)?;

    let mut memberships = BTreeMap::new();
    for row in rows {
        let (character_id, corporation_id) = row.map_err(storage_error)?;
        memberships.insert(character_id, corporation_id);
    }
    Ok(memberships)
}

pub fn active_corp_members(
    conn: &Connection,
    corporation_id: &str,
) -> Result<Vec<String>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT character_id FROM corp_members
             WHERE corporation_id = ?1 AND active = 1
             ORDER BY character_id",
        )
        .map_err(storage_error)?;

    let rows = stmt
        .query_map(params![corporation_id], |row| row.get::<_, String>(0))
        .map_err(storage_error)?;

    let mut members = Vec::new();
    for row in rows {
        members.push(row.map_err(storage_error)?);
    }
    Ok(members)
}

/// Builds the combatant loader's view of names and memberships.
pub fn combatant_loader(conn: &Connection) -> Result<CombatantLoader, DomainError> {
    let memberships = corp_memberships(conn)?;

    let mut stmt = conn
        .prepare("SELECT character_id, display_name, corporation_id FROM characters")
        .map_err(storage_error)?;
    let rows = stmt
        .query_map([], |row| {
            Ok(PilotProfile {
                character_id: row.get(0)?,
                display_name: row.get(1)?,
                corporation_id: row.get(2)?,
            })
        })
        .map_err(storage_error)?;

    let mut profiles = BTreeMap::new();
    for row in rows {
        let profile = row.map_err(storage_error)?;
        profiles.insert(profile.character_id.clone(), profile);
    }

    Ok(CombatantLoader {
        memberships,
        profiles,
    })
}

// ---------------------------------------------------------------------------
// Ships
// ---------------------------------------------------------------------------

fn ship_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ship> {
    let owner_type_raw: String = row.get(1)?;
    let owner_type = ShipOwnerType::parse(&owner_type_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown owner_type: {owner_type_raw}").into(),
        )
    })?;
    let cargo_json: String = row.get(12)?;
    Ok(Ship {
        ship_id: row.get(0)?,
        owner_type,
        owner_character_id: row.get(2)?,
        owner_corporation_id: row.get(3)?,
        ship_type: row.get(4)?,
        current_sector: row.get(5)?,
        in_hyperspace: row.get::<_, i64>(6)? != 0,
        current_fighters: row.get(7)?,
        shields: row.get(8)?,
        warp_power: row.get(9)?,
        credits: row.get(10)?,
        is_escape_pod: row.get::<_, i64>(11)? != 0,
        cargo: serde_json::from_str(&cargo_json).unwrap_or_default(),
        former_ship_type: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

const SHIP_COLUMNS: &str = "ship_id, owner_type, owner_character_id, owner_corporation_id, \
    ship_type, current_sector, in_hyperspace, current_fighters, shields, warp_power, credits, \
    is_escape_pod, cargo_json, former_ship_type, updated_at";

pub fn upsert_ship(conn: &Connection, ship: &Ship) -> Result<(), DomainError> {
    let cargo_json = serde_json::to_string(&ship.cargo).map_err(codec_error)?;
    conn.execute(
        "INSERT INTO ships(ship_id, owner_type, owner_character_id, owner_corporation_id,
            ship_type, current_sector, in_hyperspace, current_fighters, shields, warp_power,
            credits, cargo_json, is_escape_pod, former_ship_type, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(ship_id) DO UPDATE SET
            owner_type = excluded.owner_type,
            owner_character_id = excluded.owner_character_id,
            owner_corporation_id = excluded.owner_corporation_id,
            ship_type = excluded.ship_type,
            current_sector = excluded.current_sector,
            in_hyperspace = excluded.in_hyperspace,
            current_fighters = excluded.current_fighters,
            shields = excluded.shields,
            warp_power = excluded.warp_power,
            credits = excluded.credits,
            cargo_json = excluded.cargo_json,
            is_escape_pod = excluded.is_escape_pod,
            former_ship_type = excluded.former_ship_type,
            updated_at = excluded.updated_at",
        params![
            ship.ship_id.as_str(),
            ship.owner_type.as_str(),
            ship.owner_character_id.as_deref(),
            ship.owner_corporation_id.as_deref(),
            ship.ship_type.as_str(),
            ship.current_sector,
            i64::from(ship.in_hyperspace),
            ship.current_fighters,
            ship.shields,
            ship.warp_power,
            ship.credits,
            cargo_json,
            i64::from(ship.is_escape_pod),
            ship.former_ship_type.as_deref(),
            ship.updated_at,
        ],
    )
    .map_err(storage_error)?;
    Ok(())
}

pub fn ship_by_id(conn: &Connection, ship_id: &str) -> Result<Option<Ship>, DomainError> {
    conn.query_row(
        &format!("SELECT {SHIP_COLUMNS} FROM ships WHERE ship_id = ?1"),
        params![ship_id],
        ship_from_row,
    )
    .optional()
    .map_err(storage_error)
}

/// First non-pod ship owned by the character, if any.
pub fn ship_for_character(
    conn: &Connection,
    character_id: &str,
) -> Result<Option<Ship>, DomainError> {
    conn.query_row(
        &format!(
            "SELECT {SHIP_COLUMNS} FROM ships
             WHERE owner_character_id = ?1 AND is_escape_pod = 0
             ORDER BY ship_id LIMIT 1"
        ),
        params![character_id],
        ship_from_row,
    )
    .optional()
    .map_err(storage_error)
}

pub fn ships_in_sector(conn: &Connection, sector_id: SectorId) -> Result<Vec<Ship>, DomainError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SHIP_COLUMNS} FROM ships WHERE current_sector = ?1 ORDER BY ship_id"
        ))
        .map_err(storage_error)?;

    let rows = stmt
        .query_map(params![sector_id], ship_from_row)
        .map_err(storage_error)?;

    let mut ships = Vec::new();
    for row in rows {
        ships.push(row.map_err(storage_error)?);
    }
    Ok(ships)
}

pub fn update_ship_fighters(
    conn: &Connection,
    ship_id: &str,
    fighters: i64,
    now: TimestampMs,
) -> Result<(), DomainError> {
    conn.execute(
        "UPDATE ships SET current_fighters = ?2, updated_at = ?3 WHERE ship_id = ?1",
        params![ship_id, fighters, now],
    )
    .map_err(storage_error)?;
    Ok(())
}

pub fn update_ship_fighters_and_credits(
    conn: &Connection,
    ship_id: &str,
    fighters: i64,
    credits: i64,
    now: TimestampMs,
) -> Result<(), DomainError> {
    conn.execute(
        "UPDATE ships SET current_fighters = ?2, credits = ?3, updated_at = ?4
         WHERE ship_id = ?1",
        params![ship_id, fighters, credits, now],
    )
    .map_err(storage_error)?;
    Ok(())
}

pub fn adjust_ship_credits(
    conn: &Connection,
    ship_id: &str,
    delta: i64,
    now: TimestampMs,
) -> Result<(), DomainError> {
    conn.execute(
        "UPDATE ships SET credits = credits + ?2, updated_at = ?3 WHERE ship_id = ?1",
        params![ship_id, delta, now],
    )
    .map_err(storage_error)?;
    Ok(())
}

pub const ESCAPE_POD_SHIP_TYPE: &str = "escape_pod";

/// Terminal defeat state: everything stripped, identity retained.
pub fn convert_ship_to_escape_pod(
    conn: &Connection,
    ship_id: &str,
    now: TimestampMs,
) -> Result<(), DomainError> {
    conn.execute(
        "UPDATE ships SET
            former_ship_type = ship_type,
            ship_type = ?2,
            is_escape_pod = 1,
            current_fighters = 0,
            shields = 0,
            warp_power = 0,
            credits = 0,
            cargo_json = '{}',
            updated_at = ?3
         WHERE ship_id = ?1",
        params![ship_id, ESCAPE_POD_SHIP_TYPE, now],
    )
    .map_err(storage_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Garrisons
// ---------------------------------------------------------------------------

fn garrison_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Garrison> {
    let mode_raw: String = row.get(3)?;
    let mode = GarrisonMode::parse(&mode_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown garrison mode: {mode_raw}").into(),
        )
    })?;
    Ok(Garrison {
        sector_id: row.get(0)?,
        owner_id: row.get(1)?,
        fighters: row.get(2)?,
        mode,
        toll_amount: row.get(4)?,
        toll_balance: row.get(5)?,
        deployed_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

/// All garrison rows for a sector. More than one is a data-integrity fault
/// the caller must surface, never guess around.
pub fn garrisons_in_sector(
    conn: &Connection,
    sector_id: SectorId,
) -> Result<Vec<Garrison>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT sector_id, owner_id, fighters, mode, toll_amount, toll_balance,
                    deployed_at, updated_at
             FROM garrisons WHERE sector_id = ?1 ORDER BY owner_id",
        )
        .map_err(storage_error)?;

    let rows = stmt
        .query_map(params![sector_id], garrison_from_row)
        .map_err(storage_error)?;

    let mut garrisons = Vec::new();
    for row in rows {
        garrisons.push(row.map_err(storage_error)?);
    }
    Ok(garrisons)
}

pub fn insert_garrison(conn: &Connection, garrison: &Garrison) -> Result<(), DomainError> {
    conn.execute(
        "INSERT INTO garrisons(sector_id, owner_id, fighters, mode, toll_amount, toll_balance,
            deployed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            garrison.sector_id,
            garrison.owner_id.as_str(),
            garrison.fighters,
            garrison.mode.as_str(),
            garrison.toll_amount,
            garrison.toll_balance,
            garrison.deployed_at,
            garrison.updated_at,
        ],
    )
    .map_err(storage_error)?;
    Ok(())
}

pub fn update_garrison(conn: &Connection, garrison: &Garrison) -> Result<(), DomainError> {
    conn.execute(
        "UPDATE garrisons SET fighters = ?3, mode = ?4, toll_amount = ?5, toll_balance = ?6,
            updated_at = ?7
         WHERE sector_id = ?1 AND owner_id = ?2",
        params![
            garrison.sector_id,
            garrison.owner_id.as_str(),
            garrison.fighters,
            garrison.mode.as_str(),
            garrison.toll_amount,
            garrison.toll_balance,
            garrison.updated_at,
        ],
    )
    .map_err(storage_error)?;
    Ok(())
}

pub fn delete_garrison(conn: &Connection, sector_id: SectorId) -> Result<(), DomainError> {
    conn.execute(
        "DELETE FROM garrisons WHERE sector_id = ?1",
        params![sector_id],
    )
    .map_err(storage_error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Combat encounters
// ---------------------------------------------------------------------------

pub fn live_encounter(
    conn: &Connection,
    sector_id: SectorId,
) -> Result<Option<CombatEncounter>, DomainError> {
    let row: Option<(String, u64)> = conn
        .query_row(
            "SELECT payload_json, version FROM combat_encounters
             WHERE sector_id = ?1 AND ended = 0",
            params![sector_id],
            |row| Ok((row.get(0)?, row.get::<_, u64>(1)?)),
        )
        .optional()
        .map_err(storage_error)?;

    match row {
        Some((payload, version)) => {
            let mut encounter: CombatEncounter =
                serde_json::from_str(&payload).map_err(codec_error)?;
            encounter.version = version;
            Ok(Some(encounter))
        }
        None => Ok(None),
    }
}

/// Persists an encounter under optimistic concurrency: `version == 0` means a
/// fresh insert; anything else must match the stored version or the write is
/// rejected with Conflict. On success the in-memory version advances.
pub fn save_encounter(
    conn: &Connection,
    encounter: &mut CombatEncounter,
) -> Result<(), DomainError> {
    if encounter.version == 0 {
        encounter.version = 1;
        let payload = serde_json::to_string(encounter).map_err(codec_error)?;
        conn.execute(
            "INSERT INTO combat_encounters(combat_id, sector_id, ended, version, deadline,
                payload_json, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6)",
            params![
                encounter.combat_id.as_str(),
                encounter.sector_id,
                i64::from(encounter.ended),
                encounter.deadline,
                payload,
                encounter.last_updated,
            ],
        )
        .map_err(|err| match err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                DomainError::conflict("a live combat encounter already exists in this sector")
                    .with_context(format!("sector_id={}", encounter.sector_id))
            }
            other => storage_error(other),
        })?;
        return Ok(());
    }

    let expected = encounter.version;
    encounter.version += 1;
    let payload = serde_json::to_string(encounter).map_err(codec_error)?;
    let changed = conn
        .execute(
            "UPDATE combat_encounters
             SET payload_json = ?3, version = ?4, ended = ?5, deadline = ?6, updated_at = ?7
             WHERE combat_id = ?1 AND version = ?2",
            params![
                encounter.combat_id.as_str(),
                expected,
                payload,
                encounter.version,
                i64::from(encounter.ended),
                encounter.deadline,
                encounter.last_updated,
            ],
        )
        .map_err(storage_error)?;

    if changed == 0 {
        encounter.version = expected;
        return Err(
            DomainError::conflict("combat state was modified concurrently").with_context(format!(
                "combat_id={} expected_version={expected}",
                encounter.combat_id
            )),
        );
    }

    Ok(())
}

pub fn encounter_by_id(
    conn: &Connection,
    combat_id: &str,
) -> Result<Option<CombatEncounter>, DomainError> {
    let row: Option<(String, u64)> = conn
        .query_row(
            "SELECT payload_json, version FROM combat_encounters WHERE combat_id = ?1",
            params![combat_id],
            |row| Ok((row.get(0)?, row.get::<_, u64>(1)?)),
        )
        .optional()
        .map_err(storage_error)?;

    match row {
        Some((payload, version)) => {
            let mut encounter: CombatEncounter =
                serde_json::from_str(&payload).map_err(codec_error)?;
            encounter.version = version;
            Ok(Some(encounter))
        }
        None => Ok(None),
    }
}

/// Live encounters whose round deadline has passed.
pub fn due_encounters(
    conn: &Connection,
    now: TimestampMs,
) -> Result<Vec<(SectorId, String)>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT sector_id, combat_id FROM combat_encounters
             WHERE ended = 0 AND deadline <= ?1 ORDER BY deadline ASC",
        )
        .map_err(storage_error)?;

    let rows = stmt
        .query_map(params![now], |row| {
            Ok((row.get::<_, SectorId>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(storage_error)?;

    let mut due = Vec::new();
    for row in rows {
        due.push(row.map_err(storage_error)?);
    }
    Ok(due)
}

// ---------------------------------------------------------------------------
// Salvage
// ---------------------------------------------------------------------------

pub fn insert_salvage(conn: &Connection, salvage: &SalvageRecord) -> Result<(), DomainError> {
    let cargo_json = serde_json::to_string(&salvage.cargo).map_err(codec_error)?;
    conn.execute(
        "INSERT INTO salvage(salvage_id, sector_id, source_ship_id, cargo_json, scrap_value,
            credits, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            salvage.salvage_id.as_str(),
            salvage.sector_id,
            salvage.source_ship_id.as_str(),
            cargo_json,
            salvage.scrap_value,
            salvage.credits,
            salvage.created_at,
        ],
    )
    .map_err(storage_error)?;
    Ok(())
}

pub fn salvage_in_sector(
    conn: &Connection,
    sector_id: SectorId,
) -> Result<Vec<SalvageRecord>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT salvage_id, sector_id, source_ship_id, cargo_json, scrap_value, credits,
                    created_at
             FROM salvage WHERE sector_id = ?1 ORDER BY created_at ASC",
        )
        .map_err(storage_error)?;

    let rows = stmt
        .query_map(params![sector_id], |row| {
            let cargo_json: String = row.get(3)?;
            Ok(SalvageRecord {
                salvage_id: row.get(0)?,
                sector_id: row.get(1)?,
                source_ship_id: row.get(2)?,
                cargo: serde_json::from_str(&cargo_json).unwrap_or_default(),
                scrap_value: row.get(4)?,
                credits: row.get(5)?,
                created_at: row.get(6)?,
            })
        })
        .map_err(storage_error)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.map_err(storage_error)?);
    }
    Ok(entries)
}

// ---------------------------------------------------------------------------
// Visibility inputs
// ---------------------------------------------------------------------------

/// Ship owners present in a sector, with their hyperspace flag.
pub fn sector_presences(
    conn: &Connection,
    sector_id: SectorId,
) -> Result<Vec<SectorPresence>, DomainError> {
    let mut stmt = conn
        .prepare(
            "SELECT DISTINCT owner_character_id, in_hyperspace FROM ships
             WHERE current_sector = ?1 AND owner_character_id IS NOT NULL
             ORDER BY owner_character_id",
        )
        .map_err(storage_error)?;

    let rows = stmt
        .query_map(params![sector_id], |row| {
            Ok(SectorPresence {
                character_id: row.get(0)?,
                in_hyperspace: row.get::<_, i64>(1)? != 0,
            })
        })
        .map_err(storage_error)?;

    let mut presences = Vec::new();
    for row in rows {
        presences.push(row.map_err(storage_error)?);
    }
    Ok(presences)
}

/// Garrison owner plus their active corp-mates, for recipient computation.
pub fn garrison_presence(
    conn: &Connection,
    sector_id: SectorId,
) -> Result<Option<GarrisonPresence>, DomainError> {
    let garrisons = garrisons_in_sector(conn, sector_id)?;
    let Some(garrison) = garrisons.first() else {
        return Ok(None);
    };

    let memberships = corp_memberships(conn)?;
    let corp_member_ids = match memberships.get(&garrison.owner_id) {
        Some(corp_id) => active_corp_members(conn, corp_id)?,
        None => Vec::new(),
    };

    Ok(Some(GarrisonPresence {
        owner_id: garrison.owner_id.clone(),
        corp_member_ids,
    }))
}
