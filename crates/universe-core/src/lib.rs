//! Pure simulation logic for the sector combat and garrison core: combatant
//! assembly, the combat resolution state machine, finalization planning, and
//! event visibility. Nothing in this crate performs I/O; the store and facade
//! live in `universe-api`.

pub mod clock;
pub mod combat;
pub mod combatant;
pub mod finalize;
pub mod visibility;

pub use clock::{Clock, ManualClock, SystemClock, TtlCache};
pub use combat::{CombatConfig, CombatEngine, RoundOutcome, TollPayment};
pub use combatant::{effective_corporation, CombatantLoader, PilotProfile};
pub use finalize::{plan_finalize, scrap_value, FinalizeAction};
pub use visibility::{compute_event_recipients, GarrisonPresence, SectorPresence};
