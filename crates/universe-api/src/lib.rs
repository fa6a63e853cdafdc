//! Persistence-backed API over the universe core: garrison mutations, combat
//! lifecycle, and event polling, with every write serialized per sector.

pub mod combat_ops;
pub mod garrison;
pub mod journal;
pub mod persistence;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use contracts::{
    CollectRequest, CollectResponse, CombatAction, CombatEncounter, DeployRequest, DeployResponse,
    DomainError, EventsPage, EventsQuery, GarrisonMode, InitiateCombatRequest,
    InitiateCombatResponse, SectorId,
};
use universe_core::clock::{Clock, SystemClock, TtlCache};
use universe_core::combat::CombatEngine;

pub use combat_ops::ActionOutcome;
pub use persistence::{SectorLockRegistry, SqliteUniverseStore, UniverseMetadata};

/// Decides whether `actor_character_id` may act as `character_id`.
pub trait ActorAuthorizer: Send + Sync {
    fn authorize_actor(
        &self,
        actor_character_id: &str,
        character_id: &str,
        admin_override: bool,
    ) -> Result<(), DomainError>;
}

/// Characters act only as themselves unless the caller carries an admin
/// override.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfOnlyAuthorizer;

impl ActorAuthorizer for SelfOnlyAuthorizer {
    fn authorize_actor(
        &self,
        actor_character_id: &str,
        character_id: &str,
        admin_override: bool,
    ) -> Result<(), DomainError> {
        if admin_override || actor_character_id == character_id {
            return Ok(());
        }
        Err(DomainError::authorization("cannot act on behalf of another character")
            .with_context(format!("actor={actor_character_id} character={character_id}")))
    }
}

pub trait RateLimiter: Send + Sync {
    fn check(&self, character_id: &str, operation: &str) -> Result<(), DomainError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl RateLimiter for Unlimited {
    fn check(&self, _character_id: &str, _operation: &str) -> Result<(), DomainError> {
        Ok(())
    }
}

/// Purchase prices by ship type, used to price salvage from destroyed ships.
pub trait ShipCatalog: Send + Sync {
    fn purchase_price(&self, ship_type: &str) -> Option<i64>;
}

#[derive(Debug, Default, Clone)]
pub struct StaticShipCatalog {
    prices: BTreeMap<String, i64>,
}

impl StaticShipCatalog {
    pub fn new(prices: BTreeMap<String, i64>) -> Self {
        Self { prices }
    }
}

impl ShipCatalog for StaticShipCatalog {
    fn purchase_price(&self, ship_type: &str) -> Option<i64> {
        self.prices.get(ship_type).copied()
    }
}

const METADATA_TTL_MS: i64 = 60_000;

pub struct UniverseApi {
    store: SqliteUniverseStore,
    engine: CombatEngine,
    clock: Arc<dyn Clock>,
    authorizer: Box<dyn ActorAuthorizer>,
    rate_limiter: Box<dyn RateLimiter>,
    catalog: Box<dyn ShipCatalog>,
    metadata_cache: TtlCache<UniverseMetadata>,
}

impl UniverseApi {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DomainError> {
        Ok(Self::with_store(SqliteUniverseStore::open(path)?))
    }

    pub fn with_store(store: SqliteUniverseStore) -> Self {
        Self {
            store,
            engine: CombatEngine::default(),
            clock: Arc::new(SystemClock),
            authorizer: Box::new(SelfOnlyAuthorizer),
            rate_limiter: Box::new(Unlimited),
            catalog: Box::new(StaticShipCatalog::default()),
            metadata_cache: TtlCache::new(METADATA_TTL_MS),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_engine(mut self, engine: CombatEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Box<dyn ActorAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Box<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_catalog(mut self, catalog: Box<dyn ShipCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn store(&self) -> &SqliteUniverseStore {
        &self.store
    }

    // -- universe metadata --------------------------------------------------

    pub fn sector_count(&self) -> Result<i64, DomainError> {
        let metadata = self.metadata_cache.get_or_load(self.clock.as_ref(), || {
            persistence::universe_metadata(self.store.connection())
        })?;
        Ok(metadata.sector_count)
    }

    pub fn set_sector_count(&mut self, sector_count: i64) -> Result<(), DomainError> {
        if sector_count <= 0 {
            return Err(DomainError::validation("sector count must be positive"));
        }
        persistence::set_sector_count(self.store.connection(), sector_count)?;
        self.metadata_cache.invalidate();
        Ok(())
    }

    fn validate_sector(&self, sector_id: SectorId) -> Result<(), DomainError> {
        let count = self.sector_count()?;
        if sector_id < 1 || sector_id > count {
            return Err(DomainError::validation("sector does not exist")
                .with_context(format!("sector_id={sector_id} sector_count={count}")));
        }
        Ok(())
    }

    // -- seeding ------------------------------------------------------------

    pub fn register_character(
        &mut self,
        character: &contracts::CharacterRecord,
    ) -> Result<(), DomainError> {
        persistence::upsert_character(self.store.connection(), character)
    }

    pub fn register_ship(&mut self, ship: &contracts::Ship) -> Result<(), DomainError> {
        persistence::upsert_ship(self.store.connection(), ship)
    }

    // -- garrisons ----------------------------------------------------------

    pub fn deploy_garrison(&mut self, request: &DeployRequest) -> Result<DeployResponse, DomainError> {
        self.rate_limiter.check(&request.character_id, "garrison.deploy")?;
        self.validate_sector(request.sector_id)?;
        if request.mode == GarrisonMode::Toll && request.toll_amount <= 0 {
            return Err(DomainError::validation("toll garrisons require a toll amount"));
        }
        let now = self.clock.now_ms();
        self.store
            .with_sector_lock(request.sector_id, |tx| garrison::deploy(tx, request, now))
    }

    pub fn collect_garrison(
        &mut self,
        request: &CollectRequest,
    ) -> Result<CollectResponse, DomainError> {
        self.rate_limiter.check(&request.character_id, "garrison.collect")?;
        self.validate_sector(request.sector_id)?;
        let now = self.clock.now_ms();
        self.store
            .with_sector_lock(request.sector_id, |tx| garrison::collect(tx, request, now))
    }

    // -- combat -------------------------------------------------------------

    pub fn initiate_combat(
        &mut self,
        request: &InitiateCombatRequest,
    ) -> Result<InitiateCombatResponse, DomainError> {
        let actor = request
            .actor_character_id
            .as_deref()
            .unwrap_or(&request.character_id);
        self.authorizer
            .authorize_actor(actor, &request.character_id, request.admin_override)?;
        self.rate_limiter.check(actor, "combat.initiate")?;

        let ship = persistence::ship_for_character(self.store.connection(), &request.character_id)?
            .ok_or_else(|| DomainError::not_found("no ship found for character"))?;
        let sector_id = ship.current_sector;

        let now = self.clock.now_ms();
        let base_seed = rand::random::<u64>();
        let engine = &self.engine;
        self.store.with_sector_lock(sector_id, |tx| {
            combat_ops::initiate(tx, engine, &request.character_id, sector_id, base_seed, now)
        })
    }

    /// Jump completion hook. Opens combat when a hostile offensive or toll
    /// garrison holds the destination sector.
    pub fn notify_sector_arrival(
        &mut self,
        ship_id: &str,
    ) -> Result<Option<InitiateCombatResponse>, DomainError> {
        let ship = persistence::ship_by_id(self.store.connection(), ship_id)?
            .ok_or_else(|| DomainError::not_found("ship not found"))?;
        let sector_id = ship.current_sector;

        let now = self.clock.now_ms();
        let base_seed = rand::random::<u64>();
        let engine = &self.engine;
        self.store.with_sector_lock(sector_id, |tx| {
            combat_ops::notify_sector_arrival(tx, engine, ship_id, base_seed, now)
        })
    }

    pub fn submit_combat_action(
        &mut self,
        sector_id: SectorId,
        combatant_id: &str,
        action: CombatAction,
    ) -> Result<ActionOutcome, DomainError> {
        let now = self.clock.now_ms();
        let engine = &self.engine;
        let catalog = self.catalog.as_ref();
        self.store.with_sector_lock(sector_id, |tx| {
            combat_ops::submit_action(tx, engine, catalog, sector_id, combatant_id, action, now)
        })
    }

    /// Resolves every encounter whose round deadline has passed. Returns the
    /// number of rounds resolved.
    pub fn resolve_due_rounds(&mut self) -> Result<usize, DomainError> {
        let now = self.clock.now_ms();
        let due = persistence::due_encounters(self.store.connection(), now)?;

        let mut resolved = 0;
        for (sector_id, _) in due {
            let engine = &self.engine;
            let catalog = self.catalog.as_ref();
            let outcome = self.store.with_sector_lock(sector_id, |tx| {
                combat_ops::resolve_due_in_sector(tx, engine, catalog, sector_id, now)
            })?;
            if outcome.is_some() {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    pub fn cancel_combat(&mut self, sector_id: SectorId) -> Result<(), DomainError> {
        let now = self.clock.now_ms();
        let engine = &self.engine;
        let catalog = self.catalog.as_ref();
        self.store.with_sector_lock(sector_id, |tx| {
            combat_ops::cancel(tx, engine, catalog, sector_id, now)
        })
    }

    pub fn live_encounter(
        &self,
        sector_id: SectorId,
    ) -> Result<Option<CombatEncounter>, DomainError> {
        persistence::live_encounter(self.store.connection(), sector_id)
    }

    // -- events -------------------------------------------------------------

    pub fn poll_events(&self, query: &EventsQuery) -> Result<EventsPage, DomainError> {
        let mut page = journal::events_since(self.store.connection(), query)?;
        for event in &mut page.events {
            journal::tag_recipient_reason(event, &query.character_ids);
        }
        Ok(page)
    }

    pub fn max_event_id(&self) -> Result<i64, DomainError> {
        journal::max_event_id(self.store.connection())
    }
}
