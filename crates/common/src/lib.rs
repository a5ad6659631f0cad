pub mod error;
pub mod hash;
pub mod model;
pub mod proto;

pub use error::CosmosError;
pub use hash::sha256_hex;
pub use model::*;
