pub mod identity;
pub mod machine;
pub mod runner;
pub mod transport;

pub use identity::*;
pub use machine::*;
pub use runner::*;
pub use transport::*;
