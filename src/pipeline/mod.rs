//! The staged pipeline.
//!
//! ## Data Flow
//!
//! ```text
//! scrape ──▶ describe ──▶ synthesize_prompt ──▶ build_config ──▶ generate_model
//! (page)     (vision)     (text)                (text + JSON)    (submit/poll/download)
//! ```
//!
//! 1. [`stages`] fingerprints each stage's inputs and parses generator output
//!    into typed stage results
//! 2. [`job`] drives the remote job lifecycle: submit, poll with a deadline,
//!    download artifacts atomically
//! 3. [`orchestrator`] sequences the stages and consults the checkpoint store
//!    before each one

pub mod job;
pub mod orchestrator;
pub mod stages;

pub use job::{JobController, PollSettings};
pub use orchestrator::Pipeline;
