//! Library surface for the `nsh` binary, split out so integration tests
//! under `tests/` can drive [`orchestrator::run`] against in-process fakes
//! without spawning the real process.

pub mod log;
pub mod orchestrator;
pub mod signal;
pub mod upload_lock;
