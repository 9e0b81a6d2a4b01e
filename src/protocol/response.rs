use bincode::{
    Encode,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};

use super::{WireConfig, response_len};

/// Energy and forces returned for one request.
///
/// Forces are ordered like the particles of the request, non-contributing particles included.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseFrame {
    pub energy: f64,
    pub forces: Vec<[f64; 3]>,
}

impl ResponseFrame {
    pub fn new(energy: f64, forces: Vec<[f64; 3]>) -> Self {
        Self { energy, forces }
    }

    pub fn n_atoms(&self) -> usize {
        self.forces.len()
    }

    /// Decodes a complete response buffer for a request of `n_atoms` particles.
    pub(crate) fn decode(
        n_atoms: usize,
        bytes: &[u8],
        config: WireConfig,
    ) -> Result<Self, DecodeError> {
        if bytes.len() != response_len(n_atoms) {
            return Err(DecodeError::OtherString(format!(
                "response holds {} bytes, expected {} for {n_atoms} particles",
                bytes.len(),
                response_len(n_atoms)
            )));
        }

        let mut reader = bytes;
        let energy: f64 = bincode::decode_from_std_read(&mut reader, config)?;

        let mut forces = Vec::with_capacity(n_atoms);
        for _ in 0..n_atoms {
            let fx: f64 = bincode::decode_from_std_read(&mut reader, config)?;
            let fy: f64 = bincode::decode_from_std_read(&mut reader, config)?;
            let fz: f64 = bincode::decode_from_std_read(&mut reader, config)?;
            forces.push([fx, fy, fz]);
        }

        Ok(Self { energy, forces })
    }

    /// Forces flattened to `x, y, z` per particle.
    pub fn flat_forces(&self) -> Vec<f64> {
        self.forces.iter().flatten().copied().collect()
    }
}

impl Encode for ResponseFrame {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        self.energy.encode(encoder)?;
        for [fx, fy, fz] in &self.forces {
            fx.encode(encoder)?;
            fy.encode(encoder)?;
            fz.encode(encoder)?;
        }
        Ok(())
    }
}
