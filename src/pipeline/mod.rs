//! File-trigger dispatch pipeline.
//!
//! Every trigger file flows through:
//! 1. `DispatchPipeline::scan()` — directory listing, suffix filter, dedup
//! 2. `TriggerDebouncer` — settle delay anchored to first sighting
//! 3. `DispatchPipeline::process()` — recipient from file name, body from content
//! 4. `Mailer::send()` — on a spawned task, outcome posted back to the loop
//! 5. `DispatchPipeline::finalize()` — delete on delivery, leave in place otherwise
//!
//! **No retry path exists.** A failed file stays put until someone rewrites it.

pub mod dispatch;
pub mod types;

pub use dispatch::DispatchPipeline;
pub use types::{DispatchEvent, PipelineEvent, RequestState, SendOutcome, WatchRequest};
