pub mod api;
pub mod blob_store;
pub mod canonical;
pub mod config;
pub mod corpus;
pub mod decision;
pub mod error;
pub mod evidence;
pub mod fetcher;
pub mod fingerprint;
pub mod mmr_store;
pub mod pipeline;
pub mod recorder;
pub mod signer;

pub use config::{Config, DecisionPolicy, FetchConfig, FingerprintConfig};
pub use corpus::{CorpusIndex, Work, WorkId};
pub use decision::{Decision, DecisionEngine, MatchKind};
pub use error::{CanonicalizationError, CorpusError, DetectError, FetchError, PersistenceError, RegisterError};
pub use evidence::{DetectionReport, DetectionResult, EvidenceCapture};
pub use fetcher::{FetchedContent, Fetcher, PageLoader, PageSource};
pub use pipeline::{ContentSource, DetectOptions, Detector};
pub use recorder::EvidenceRecorder;
