//! The dBFT consensus core: per-round context, message handlers, timer
//! discipline, view-change and recovery protocols.
//!
//! The service drives a bounded validator set through successive rounds that
//! each commit exactly one block at a monotonically increasing height,
//! tolerating `f = (n - 1) / 3` Byzantine participants. Two departures from
//! classic PBFT: a dual-primary (priority + fallback) proposal scheme within
//! a single view, and view change with peer-assisted recovery.

pub mod config;
pub mod context;
pub mod error;
pub mod external;
pub mod recovery;
pub mod service;
pub mod timer;
pub mod validator;

pub use config::DbftConfig;
pub use context::{ConsensusContext, ContextSnapshot};
pub use error::{ConsensusError, ConsensusResult};
pub use external::{
    run_service, Clock, ConsensusInput, MempoolAccess, ServiceOutput, SystemClock,
    TransactionVerifier, Verdict,
};
pub use recovery::RecoveryLog;
pub use service::ConsensusService;
pub use timer::Timer;
pub use validator::{PrimarySelector, Role, ValidatorSet};
