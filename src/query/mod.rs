pub mod descriptor;
pub mod engine;
pub mod resolver;

pub use descriptor::{Query, DEFAULT_MAX_LIMIT};
pub use engine::{Engine, QueryFailure, RecordStream};
pub use resolver::{EmbedPlan, EmbedResolver};
