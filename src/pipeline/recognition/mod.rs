pub mod types;
pub mod engines;
pub mod registry;
pub mod fanout;

pub use types::*;
pub use engines::*;
pub use registry::*;
pub use fanout::*;
