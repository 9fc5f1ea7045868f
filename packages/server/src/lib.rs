// Scribe - async transcription service core
//
// Durable job pipeline for audio/video transcription: uploads are accepted
// over HTTP, queued on a Postgres-backed broker, and processed by workers
// that borrow speech models from a bounded pool. Every state transition is
// recorded in a hash-chained audit log.

pub mod common;
pub mod config;
pub mod domains;
pub mod kernel;
pub mod server;

pub use config::Config;
