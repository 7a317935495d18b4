//! Handlers for each job type.

mod analysis;
mod follow_up;
mod normalize;

pub use analysis::AnalysisHandler;
pub use follow_up::{FollowUpHandler, NO_FOLLOW_UP_NOTES};
pub use normalize::NormalizeHandler;
