pub mod message;
pub mod project;

pub use message::*;
pub use project::*;
