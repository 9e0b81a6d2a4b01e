//! Host-facing evaluation wrapper.
//!
//! [`RemoteModel`] is what a simulation host holds on to: it knows which species the remote
//! model supports and how far its influence reaches, and it turns one call to
//! [`compute`](RemoteModel::compute) into one protocol exchange. Failures are returned to the
//! caller as they are; the wrapper never retries and never fills in energies or forces on its own.
//!
//! # Example
//! ```no_run
//! use kusp::{KuspConfig, RemoteModel};
//!
//! let config = KuspConfig::load_default(None).unwrap();
//! let model = RemoteModel::from_config(&config).unwrap();
//!
//! let eval = model
//!     .compute_symbols(&["He", "He"], &[0.0, 0.0, 0.0, 3.0, 0.0, 0.0], &[1, 1])
//!     .unwrap();
//! println!("{} {:?}", eval.energy, eval.forces);
//! ```
use std::sync::{Mutex, MutexGuard};

use log::{debug, warn};
use thiserror::Error;

use crate::{
    config::KuspConfig,
    protocol::{ConnectionManager, Endpoint, FrameError, RequestFrame, ReusePolicy, TransportError},
    species::{SpeciesError, SpeciesTable},
};

#[derive(Debug, Error)]
pub enum ModelError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Species(#[from] SpeciesError),
}

/// Result of one evaluation step.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub energy: f64,
    /// `x, y, z` per particle, in request order.
    pub forces: Vec<f64>,
}

/// A model evaluated by a remote server.
///
/// Calls from several threads are serialized so that only one request is ever in flight on the
/// underlying connection.
#[derive(Debug)]
pub struct RemoteModel {
    species: SpeciesTable,
    influence_distance: f64,
    manager: Mutex<ConnectionManager>,
}

impl RemoteModel {
    pub fn new(
        endpoint: Endpoint,
        policy: ReusePolicy,
        species: SpeciesTable,
        influence_distance: f64,
    ) -> Self {
        Self {
            species,
            influence_distance,
            manager: Mutex::new(ConnectionManager::new(endpoint, policy)),
        }
    }

    pub fn from_config(config: &KuspConfig) -> Result<Self, ModelError> {
        let species = SpeciesTable::new(config.model.species.iter().cloned())?;
        Ok(Self::new(
            config.endpoint(),
            config.server.connection,
            species,
            config.model.influence_distance,
        ))
    }

    pub fn species(&self) -> &SpeciesTable {
        &self.species
    }

    pub fn influence_distance(&self) -> f64 {
        self.influence_distance
    }

    /// Opens the connection now rather than on the first evaluation.
    pub fn connect(&self) -> Result<(), ModelError> {
        self.manager().connect()?;
        Ok(())
    }

    /// Evaluates one configuration.
    ///
    /// `coordinates` holds `x, y, z` for every particle; `species` and `contributing` hold one
    /// entry per particle.
    pub fn compute(
        &self,
        species: &[i32],
        coordinates: &[f64],
        contributing: &[i32],
    ) -> Result<Evaluation, ModelError> {
        let frame = RequestFrame::from_flat(species, coordinates, contributing)?;
        if let Some(&code) = species.iter().find(|c| self.species.symbol(**c).is_none()) {
            debug!("species code {code} outside the configured table");
        }

        let resp = self.manager().evaluate(&frame)?;
        Ok(Evaluation {
            energy: resp.energy,
            forces: resp.flat_forces(),
        })
    }

    /// Like [`compute`](Self::compute), mapping chemical symbols through the species table.
    pub fn compute_symbols<S: AsRef<str>>(
        &self,
        symbols: &[S],
        coordinates: &[f64],
        contributing: &[i32],
    ) -> Result<Evaluation, ModelError> {
        let codes = self.species.codes(symbols)?;
        self.compute(&codes, coordinates, contributing)
    }

    pub fn close(&self) {
        self.manager().close();
    }

    fn manager(&self) -> MutexGuard<'_, ConnectionManager> {
        self.manager.lock().unwrap_or_else(|poisoned| {
            warn!("evaluation panicked mid-step; resetting connection");
            let mut manager = poisoned.into_inner();
            manager.close();
            manager
        })
    }
}
