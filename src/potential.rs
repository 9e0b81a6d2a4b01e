//! Reference Lennard-Jones potential served by `kusp_server`.
use log::trace;

use crate::protocol::{Potential, PotentialError, RequestFrame, ResponseFrame};

/// Default well depth, in eV, for helium.
pub const HELIUM_EPSILON: f64 = 0.00088;
/// Default zero-crossing distance, in Å, for helium.
pub const HELIUM_SIGMA: f64 = 2.551;

/// 12-6 Lennard-Jones pair potential shared by every species.
///
/// Each contributing particle owns half of the energy of every pair it takes part in. Forces are
/// reported for all particles, so neighbours that do not contribute still receive the reaction
/// of the pairs they are part of.
#[derive(Debug, Clone, PartialEq)]
pub struct LennardJones {
    pub epsilon: f64,
    pub sigma: f64,
    n_species: usize,
}

impl LennardJones {
    pub fn new(epsilon: f64, sigma: f64, n_species: usize) -> Self {
        Self {
            epsilon,
            sigma,
            n_species,
        }
    }

    pub fn helium() -> Self {
        Self::new(HELIUM_EPSILON, HELIUM_SIGMA, 1)
    }

    /// Pair energy and its radial derivative at distance `r`.
    fn pair(&self, r: f64) -> (f64, f64) {
        let sr6 = (self.sigma / r).powi(6);
        let sr12 = sr6 * sr6;
        let phi = 4.0 * self.epsilon * (sr12 - sr6);
        let dphi = -24.0 * self.epsilon * (2.0 * sr12 - sr6) / r;
        (phi, dphi)
    }
}

impl Default for LennardJones {
    fn default() -> Self {
        Self::helium()
    }
}

impl Potential for LennardJones {
    fn compute(&self, frame: &RequestFrame) -> Result<ResponseFrame, PotentialError> {
        if let Some(&code) = frame
            .species()
            .iter()
            .find(|c| usize::try_from(**c).map_or(true, |c| c >= self.n_species))
        {
            return Err(PotentialError::UnknownSpecies(code));
        }

        let positions = frame.coordinates();
        let mut energy = 0.0;
        let mut forces = vec![[0.0; 3]; positions.len()];

        for (i, xi) in positions.iter().enumerate() {
            if frame.contributing()[i] == 0 {
                continue;
            }
            for (j, xj) in positions.iter().enumerate() {
                if i == j {
                    continue;
                }
                let d = [xj[0] - xi[0], xj[1] - xi[1], xj[2] - xi[2]];
                let r = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt();
                if r == 0.0 {
                    return Err(PotentialError::Failed(format!(
                        "particles {i} and {j} overlap"
                    )));
                }

                let (phi, dphi) = self.pair(r);
                energy += 0.5 * phi;
                for k in 0..3 {
                    let f = 0.5 * dphi * d[k] / r;
                    forces[i][k] += f;
                    forces[j][k] -= f;
                }
            }
        }

        trace!("lennard-jones: {} particles, energy {energy}", positions.len());
        Ok(ResponseFrame::new(energy, forces))
    }
}
