pub mod compose;
pub mod display;
pub mod encoder;
pub mod error;
pub mod health;
pub mod ledger;
pub mod memory;
pub mod pushkey;
pub mod store;
pub mod types;

pub use compose::*;
pub use display::*;
pub use encoder::*;
pub use error::*;
pub use health::*;
pub use ledger::*;
pub use memory::*;
pub use pushkey::*;
pub use store::*;
pub use types::*;
