//! Diagnosis: profile resolution, check fan-out, structural signals, causal
//! rules, weighted scoring and the TTL cache.

pub mod aggregator;
pub mod cache;
pub mod causal;
pub mod profile;
pub mod signals;

pub use aggregator::{weighted_score, DiagnosisAggregator};
pub use cache::{CacheStats, DiagnosisCache};
pub use causal::{diagnose_cause, RemedyTemplates};
pub use profile::{ProfileDefinition, ProfileTable, ResolvedProfile};
pub use signals::{SignalCollector, StructuralSignals};
