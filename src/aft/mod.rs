//! Advanced Funds Transfer (AFT)
//!
//! Moves credits between a gaming machine and a host system while the
//! machine holds the exclusive transaction handle.
//!
//! # Architecture
//!
//! ```text
//!   host command ──▶ AftEngine ──rules──▶ TransferContext ──▶ Orchestrator<Off|On>
//!                        │                   (persist)             │
//!                        ├── GameLock ◀────── handle ──────────────┤
//!                        ├── RegistrationStateMachine              ▼
//!                        └── HostCashOutProvider ──▶ HardCashOutLock   wallet
//! ```
//!
//! # Safety Invariants
//!
//! 1. **Persist-Before-Report**: the current transfer is durably stored before
//!    the host can observe a pending, failed or completed status
//! 2. **One Handle**: the subsystem holds at most one exclusive transaction
//!    handle; every bank-mutating step runs under it
//! 3. **Outside The Mutex**: callbacks that may re-enter another component
//!    (coordinator, host, listeners) run after the owner's lock is dropped

pub mod context;
pub mod engine;
pub mod error;
pub mod hard_cashout;
pub mod history;
pub mod host_cashout;
pub mod lock;
pub mod meters;
pub mod notifier;
pub mod orchestrator;
pub mod ports;
pub mod registration;
pub mod transfer_off;
pub mod transfer_on;
pub mod types;

// Re-exports for convenience
pub use context::TransferContext;
pub use engine::{AftCollaborators, AftEngine};
pub use error::AftError;
pub use hard_cashout::HardCashOutLock;
pub use host_cashout::{HostCashOutOutcome, HostCashOutProvider};
pub use lock::{GameLock, LockState};
pub use registration::{RegistrationCode, RegistrationState, RegistrationStateMachine};
pub use transfer_off::TransferOffOrchestrator;
pub use transfer_on::TransferOnOrchestrator;
pub use types::{TransferCode, TransferData, TransferStatus, TransferType};
