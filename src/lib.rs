//! AFT Engine - Advanced Funds Transfer for gaming machines
//!
//! Game lock negotiation, host registration, transfer-on/off orchestration
//! and crash recovery on top of an exclusive transaction coordinator.
//!
//! # Modules
//!
//! - [`config`] - YAML configuration (`AppConfig`, `AftSettings`)
//! - [`logging`] - tracing subscriber setup
//! - [`money`] - Three-bucket credit amounts
//! - [`events`] - Fire-and-forget domain event bus
//! - [`store`] - Persistence with atomic units of work
//! - [`coordinator`] - Exclusive transaction handle coordinator
//! - [`aft`] - The AFT subsystem
//! - [`sim`] - In-process collaborators for simulation and tests

pub mod config;
pub mod coordinator;
pub mod events;
pub mod logging;
pub mod money;
pub mod store;

pub mod aft;
pub mod sim;

// Convenient re-exports at crate root
pub use aft::{AftCollaborators, AftEngine, AftError};
pub use config::{AftSettings, AppConfig};
pub use coordinator::{LocalCoordinator, TransactionCoordinator};
pub use events::{AftEvent, EventBus};
pub use money::TransferAmounts;
pub use store::{FileStore, MemoryStore, Store};
