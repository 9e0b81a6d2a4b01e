pub mod config;
pub mod model;
pub mod potential;
pub mod protocol;
pub mod species;
pub mod xyz;

pub use config::{ConfigError, KuspConfig};
pub use model::{Evaluation, ModelError, RemoteModel};
pub use potential::LennardJones;
pub use species::{SpeciesError, SpeciesTable};
