//! nrtgnss core: the building blocks of a near-real-time GNSS pipeline.
//!
//! - Time keys (daily / hourly / quarter-hourly) and path templates
//! - Provider catalog and per-protocol transports (HTTP(S), FTP, SFTP, SCP)
//! - Acquisition engine with retry, provider fallback and circuit breaking
//! - Generic lifecycle ledger (SQLite) for every expected unit
//! - Stacking scheduler for the sliding window of normal-equation files
//! - Coordinate consensus with iterative sigma-clipping, and its position
//!   archive / output files

pub mod acquisition;
pub mod archive;
pub mod catalog;
pub mod circuit_breaker;
pub mod compress;
pub mod consensus;
pub mod ledger;
pub mod stacking;
pub mod template;
pub mod timekey;
pub mod transport;

pub use acquisition::{
    AcquisitionConfig, AcquisitionEngine, AcquisitionOutcome, AcquisitionTask, RetryPolicy, TaskError,
};
pub use archive::{ArchiveError, CoordinateOutput, PositionArchive};
pub use catalog::{ArtifactKind, CatalogError, Protocol, ProviderCatalog, ProviderDescriptor};
pub use circuit_breaker::CircuitBreaker;
pub use consensus::{
    consensus, ConsensusParams, ConsensusReport, ConsensusResult, RejectionReason, StationPositionSample,
    StationRejection,
};
pub use ledger::{Category, Ledger, LedgerEntry, LedgerError, LedgerStatistics, LedgerStatus, WaitingFilter};
pub use stacking::{StackingConfig, StackingError, StackingScheduler, StackingScheme, StackingSummary};
pub use timekey::{Granularity, TimeKey, TimeKeyError};
pub use transport::{Transport, TransportError, TransportRegistry};
