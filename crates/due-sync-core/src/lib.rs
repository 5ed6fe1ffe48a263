//! Domain model shared by the DUE sync crates: records and their
//! classification, typed registry payloads and their flattening, the error
//! taxonomy, configuration, and the storage contract.

pub mod cancel;
pub mod clock;
pub mod config;
pub mod detector;
pub mod error;
pub mod normalize;
pub mod payload;
pub mod record;
pub mod storage;
pub mod timestamp;

pub use cancel::CancellationToken;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Credentials, SyncConfig};
pub use detector::{ChangeDetector, CheckOutcome, Classification, RefreshPlan};
pub use error::{OverageOrigin, SyncError};
pub use normalize::{normalize, NormalizedRecordSet, Row, RowSet, Table};
pub use payload::{DuePayload, SubResources};
pub use record::{ExternalRef, RecordId, RecordLink, RecordStatus, StoredRecord};
pub use storage::{CandidateFilter, StorageSink};
