// Shared plumbing used by every component.

pub mod logging;
pub mod pii;
