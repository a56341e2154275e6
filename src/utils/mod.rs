//! Small helpers shared by the image model and the embedding engine.

mod math;

pub use math::{align_up, align_up_u64};
