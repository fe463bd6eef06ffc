pub mod models;
pub mod error;
pub mod payloads;
pub mod utils;

pub use models::*;
pub use error::*;
pub use payloads::*;
pub use utils::*;
