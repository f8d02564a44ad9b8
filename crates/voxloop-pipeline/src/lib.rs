//! Session orchestration — sequences transcription, reply generation,
//! segmentation, and synthesis into one ordered event stream per turn.

pub mod orchestrator;

pub use orchestrator::{EventSink, LlmSettings, Orchestrator, TurnState};
