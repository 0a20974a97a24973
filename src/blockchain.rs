// Chain management split by responsibility: block structure, consensus parameters,
// account state, stateless/stateful validation and the chain itself.

pub mod block;
pub mod chain;
pub mod params;
pub mod state;
pub mod validation;

pub use block::*;
pub use chain::*;
pub use params::*;
pub use state::*;
pub use validation::*;

pub use crate::crypto::Sha256Hash;
