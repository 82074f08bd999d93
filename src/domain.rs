//! Domain module - core types of the execution engine
//!
//! Everything here is plain data plus invariant-preserving methods; the
//! stateful services live in their own modules.

pub mod account;
pub mod credential;
pub mod error;
pub mod events;
pub mod job;
pub mod manifest;
pub mod proxy;
pub mod study;

pub use account::{Account, AccountCheckout, AccountPool, AccountStatus, AccountUsage, CheckoutRequest};
pub use credential::{Credential, CredentialBase, CredentialRef, CredentialType};
pub use error::{EngineError, ErrorCode};
pub use events::StudyEvent;
pub use job::{CellKey, Evidence, Job, JobResult, JobStatus, ResponseData, RetryState};
pub use manifest::{
    EvidenceLevel, ExecutionOrder, ManifestIssue, ManifestRegistries, ManifestValidation,
    ManifestWarning, ProxyType, SessionIsolation, StudyManifest, ValidatedManifest,
    validate_manifest,
};
pub use proxy::{ProxyConfig, ProxyHealth, ProxyHealthStatus, ProxyProtocol, ProxySession};
pub use study::{
    DeadlineStatus, IllegalTransition, Study, StudyCosts, StudyProgress, StudyRunSummary,
    StudyStatus,
};
