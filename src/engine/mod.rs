//! Coordination core: claiming, executing, heartbeating, and the session
//! lifecycle that ties them together.

pub mod claim;
pub mod execute;
pub mod heartbeat;
pub mod ledger;
pub mod session;

pub use claim::{ClaimCoordinator, ClaimOutcome};
pub use execute::{ExecutionEngine, ExecutionReport};
pub use heartbeat::LivenessPublisher;
pub use ledger::DedupLedger;
pub use session::{Phase, SessionConfig, SessionManager};
