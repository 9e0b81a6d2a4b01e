//! Minimal reader for `.xyz` particle files used by `kusp_eval`.
use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    num::ParseFloatError,
    path::Path,
};

use thiserror::Error;

const MAX_RESERVED: usize = 1024;

#[derive(Debug, Error)]
pub enum XyzError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid XYZ format: {0}")]
    Parse(String),

    #[error("invalid floating point number: {0}")]
    FloatParse(#[from] ParseFloatError),
}

/// Particles read from an `.xyz` file, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Particles {
    pub symbols: Vec<String>,
    /// `x, y, z` per particle.
    pub coordinates: Vec<f64>,
}

impl Particles {
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

pub fn load_xyz(path: &Path) -> Result<Particles, XyzError> {
    let file = File::open(path)?;
    read_xyz(BufReader::new(file))
}

/// Reads a count line, a comment line and then one `symbol x y z` line per particle.
pub fn read_xyz<R: BufRead>(reader: R) -> Result<Particles, XyzError> {
    let mut lines = reader.lines();

    let count: usize = lines
        .next()
        .ok_or_else(|| XyzError::Parse("missing number of particles".to_string()))??
        .trim()
        .parse()
        .map_err(|_| XyzError::Parse("invalid number of particles".to_string()))?;

    lines
        .next()
        .ok_or_else(|| XyzError::Parse("missing comment line".to_string()))??;

    // the count line is untrusted; only reserve a bounded amount up front
    let reserve = count.min(MAX_RESERVED);
    let mut particles = Particles {
        symbols: Vec::with_capacity(reserve),
        coordinates: Vec::with_capacity(3 * reserve),
    };

    for (index, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        // extended xyz may carry extra columns after the position
        let parts = line.split_whitespace().collect::<Vec<_>>();
        if parts.len() < 4 {
            return Err(XyzError::Parse(format!(
                "invalid particle on line {}: {line}",
                index + 3
            )));
        }

        particles.symbols.push(parts[0].to_string());
        for value in &parts[1..4] {
            particles.coordinates.push(value.parse()?);
        }
    }

    if particles.len() != count {
        return Err(XyzError::Parse(format!(
            "expected {count} particles, found {}",
            particles.len()
        )));
    }

    Ok(particles)
}
