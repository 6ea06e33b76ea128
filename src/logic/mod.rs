pub mod completion;
pub mod error;
pub mod lock_sweep;
pub mod stage;
pub mod staging;

pub use completion::*;
pub use error::*;
pub use lock_sweep::*;
pub use staging::*;
