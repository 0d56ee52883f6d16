// Token lifecycle module
// Credential source, cache and change detection

mod cache;
mod detector;
mod source;
mod types;

pub use crate::store::PersistCompletion;
pub use cache::TokenCache;
pub use detector::{CandidateSender, ChangeDetector, PollResult};
pub use source::{CredentialSource, FileCredentialSource};
pub use types::{
    mask, non_empty, CacheEntry, CacheSource, Candidate, CandidateOrigin, CredentialEvent,
    CredentialTarget,
};
