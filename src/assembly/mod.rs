pub mod allocator;
pub mod gap_filler;
pub mod history;
pub mod sampler;
pub mod types;
pub mod weight;

pub use allocator::{Allocation, AllocationPlan, LearnerSignals, PoolAllocator, WeakTopicPolicy};
pub use gap_filler::{ContentGapFiller, GenerationError, GenerationSeed, QuestionGenerator};
pub use history::{HistoryTracker, LearnerHistory};
pub use types::*;
