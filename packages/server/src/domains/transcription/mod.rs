//! Transcription jobs: lifecycle models, the durable store, and the
//! transcript artifact format.

mod job;
mod store;
pub mod transcript;

pub use job::{
    apply_transition, bound_error_message, message_hash, CasOutcome, ErrorLog, Job, JobStatus,
    NewErrorLog, NewJob, NewResult, TranscriptionResult, TransitionPatch,
};
pub use store::{JobStore, PgJobStore};
