use bincode::{
    Encode,
    enc::Encoder,
    error::{DecodeError, EncodeError},
};
use thiserror::Error;

use super::{INT_SIZE_TAG, WireConfig, request_payload_len};

/// Reasons a request frame cannot be built from host arrays.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error(
        "array lengths disagree: {species} species, {coordinates} coordinates, {contributing} contributing flags"
    )]
    LengthMismatch {
        species: usize,
        coordinates: usize,
        contributing: usize,
    },

    #[error("coordinate array length {0} is not a multiple of 3")]
    RaggedCoordinates(usize),

    #[error("contributing flag of particle {index} is {value}, expected 0 or 1")]
    InvalidContributing { index: usize, value: i32 },

    #[error("species code of particle {index} is negative ({code})")]
    InvalidSpecies { index: usize, code: i32 },

    #[error("{0} particles do not fit in a 32-bit atom count")]
    TooManyAtoms(usize),
}

/// One atomic configuration sent to the remote model.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    species: Vec<i32>,
    coordinates: Vec<[f64; 3]>,
    contributing: Vec<i32>,
}

impl RequestFrame {
    pub fn new(
        species: Vec<i32>,
        coordinates: Vec<[f64; 3]>,
        contributing: Vec<i32>,
    ) -> Result<Self, FrameError> {
        let n_atoms = species.len();
        if coordinates.len() != n_atoms || contributing.len() != n_atoms {
            return Err(FrameError::LengthMismatch {
                species: n_atoms,
                coordinates: coordinates.len(),
                contributing: contributing.len(),
            });
        }
        if i32::try_from(n_atoms).is_err() {
            return Err(FrameError::TooManyAtoms(n_atoms));
        }
        if let Some((index, &code)) = species.iter().enumerate().find(|(_, c)| **c < 0) {
            return Err(FrameError::InvalidSpecies { index, code });
        }
        if let Some((index, &value)) = contributing
            .iter()
            .enumerate()
            .find(|(_, v)| !matches!(**v, 0 | 1))
        {
            return Err(FrameError::InvalidContributing { index, value });
        }

        Ok(Self {
            species,
            coordinates,
            contributing,
        })
    }

    /// Builds a frame from the flat arrays a simulation host hands out.
    pub fn from_flat(
        species: &[i32],
        coordinates: &[f64],
        contributing: &[i32],
    ) -> Result<Self, FrameError> {
        if coordinates.len() % 3 != 0 {
            return Err(FrameError::RaggedCoordinates(coordinates.len()));
        }
        let coordinates = coordinates
            .chunks_exact(3)
            .map(|c| [c[0], c[1], c[2]])
            .collect();

        Self::new(species.to_vec(), coordinates, contributing.to_vec())
    }

    pub fn n_atoms(&self) -> usize {
        self.species.len()
    }

    pub fn species(&self) -> &[i32] {
        &self.species
    }

    pub fn coordinates(&self) -> &[[f64; 3]] {
        &self.coordinates
    }

    pub fn contributing(&self) -> &[i32] {
        &self.contributing
    }

    /// The species, coordinates and contributing blocks packed back to back.
    pub(crate) fn payload(&self, config: WireConfig) -> Result<Vec<u8>, EncodeError> {
        let mut buf = Vec::with_capacity(request_payload_len(self.n_atoms()));
        bincode::encode_into_std_write(Payload(self), &mut buf, config)?;
        Ok(buf)
    }

    /// Rebuilds a frame from a payload block already read off the wire.
    pub(crate) fn decode_payload(
        n_atoms: usize,
        mut payload: &[u8],
        config: WireConfig,
    ) -> Result<Self, DecodeError> {
        let mut species: Vec<i32> = Vec::with_capacity(n_atoms);
        for _ in 0..n_atoms {
            species.push(bincode::decode_from_std_read(&mut payload, config)?);
        }

        let mut coordinates = Vec::with_capacity(n_atoms);
        for _ in 0..n_atoms {
            let x: f64 = bincode::decode_from_std_read(&mut payload, config)?;
            let y: f64 = bincode::decode_from_std_read(&mut payload, config)?;
            let z: f64 = bincode::decode_from_std_read(&mut payload, config)?;
            coordinates.push([x, y, z]);
        }

        let mut contributing: Vec<i32> = Vec::with_capacity(n_atoms);
        for _ in 0..n_atoms {
            contributing.push(bincode::decode_from_std_read(&mut payload, config)?);
        }

        Ok(Self {
            species,
            coordinates,
            contributing,
        })
    }
}

/// The full frame: both header words followed by the payload.
impl Encode for RequestFrame {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        INT_SIZE_TAG.encode(encoder)?;
        (self.n_atoms() as i32).encode(encoder)?;
        Payload(self).encode(encoder)
    }
}

/// Body of a request without the two leading header words.
struct Payload<'a>(&'a RequestFrame);

impl Encode for Payload<'_> {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        for code in &self.0.species {
            code.encode(encoder)?;
        }
        for [x, y, z] in &self.0.coordinates {
            x.encode(encoder)?;
            y.encode(encoder)?;
            z.encode(encoder)?;
        }
        for flag in &self.0.contributing {
            flag.encode(encoder)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{WORD_SIZE, wire_config};

    use super::*;

    fn two_atoms() -> RequestFrame {
        RequestFrame::new(
            vec![0, 1],
            vec![[0.1, 0.1, 0.1], [2.0, -0.2, 0.0]],
            vec![1, 1],
        )
        .unwrap()
    }

    #[test]
    fn payload_blocks_are_not_interleaved() {
        let frame = two_atoms();
        let payload = frame.payload(wire_config()).unwrap();
        assert_eq!(payload.len(), request_payload_len(2));

        let mut expected = Vec::new();
        expected.extend_from_slice(&0i32.to_ne_bytes());
        expected.extend_from_slice(&1i32.to_ne_bytes());
        for v in [0.1f64, 0.1, 0.1, 2.0, -0.2, 0.0] {
            expected.extend_from_slice(&v.to_ne_bytes());
        }
        expected.extend_from_slice(&1i32.to_ne_bytes());
        expected.extend_from_slice(&1i32.to_ne_bytes());

        assert_eq!(payload, expected);
    }

    #[test]
    fn full_frame_starts_with_header_words() {
        let frame = two_atoms();
        let bytes = bincode::encode_to_vec(&frame, wire_config()).unwrap();

        assert_eq!(&bytes[..WORD_SIZE], &4i32.to_ne_bytes());
        assert_eq!(&bytes[WORD_SIZE..2 * WORD_SIZE], &2i32.to_ne_bytes());
        assert_eq!(&bytes[2 * WORD_SIZE..], frame.payload(wire_config()).unwrap());
    }

    #[test]
    fn decode_payload_restores_frame() {
        let frame = two_atoms();
        let payload = frame.payload(wire_config()).unwrap();

        let decoded = RequestFrame::decode_payload(2, &payload, wire_config()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn empty_frame_has_empty_payload() {
        let frame = RequestFrame::new(vec![], vec![], vec![]).unwrap();
        assert_eq!(frame.n_atoms(), 0);
        assert!(frame.payload(wire_config()).unwrap().is_empty());
    }

    #[test]
    fn from_flat_groups_coordinates_by_atom() {
        let frame =
            RequestFrame::from_flat(&[0, 1], &[0.1, 0.1, 0.1, 2.0, -0.2, 0.0], &[1, 0]).unwrap();
        assert_eq!(frame.coordinates(), &[[0.1, 0.1, 0.1], [2.0, -0.2, 0.0]]);
        assert_eq!(frame.contributing(), &[1, 0]);
    }

    #[test]
    fn rejects_mismatched_lengths() {
        let err = RequestFrame::new(vec![0, 1], vec![[0.0; 3]], vec![1, 1]).unwrap_err();
        assert_eq!(
            err,
            FrameError::LengthMismatch {
                species: 2,
                coordinates: 1,
                contributing: 2
            }
        );
    }

    #[test]
    fn rejects_ragged_coordinates() {
        let err = RequestFrame::from_flat(&[0], &[0.0, 1.0], &[1]).unwrap_err();
        assert_eq!(err, FrameError::RaggedCoordinates(2));
    }

    #[test]
    #[should_panic(expected = "InvalidContributing")]
    fn rejects_non_binary_flags() {
        RequestFrame::new(vec![0, 0], vec![[0.0; 3]; 2], vec![1, 2]).unwrap();
    }

    #[test]
    #[should_panic(expected = "InvalidSpecies")]
    fn rejects_negative_species() {
        RequestFrame::new(vec![-1], vec![[0.0; 3]], vec![1]).unwrap();
    }
}
