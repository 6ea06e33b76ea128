pub mod common;
pub mod user_context;
pub mod version;
pub mod workflow;

pub use common::*;
pub use user_context::*;
pub use version::*;
pub use workflow::*;
