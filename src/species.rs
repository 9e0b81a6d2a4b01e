use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpeciesError {
    #[error("species '{0}' is listed more than once")]
    Duplicate(String),

    #[error("species '{0}' is not supported by the model")]
    Unknown(String),

    #[error("species list is empty")]
    Empty,
}

/// Ordered chemical symbols; a symbol's position is its species code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeciesTable {
    symbols: Vec<String>,
    codes: HashMap<String, i32>,
}

impl SpeciesTable {
    pub fn new<I, S>(symbols: I) -> Result<Self, SpeciesError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let symbols = symbols.into_iter().map(Into::into).collect::<Vec<String>>();
        if symbols.is_empty() {
            return Err(SpeciesError::Empty);
        }

        let mut codes = HashMap::with_capacity(symbols.len());
        for (code, symbol) in symbols.iter().enumerate() {
            if codes.insert(symbol.clone(), code as i32).is_some() {
                return Err(SpeciesError::Duplicate(symbol.clone()));
            }
        }

        Ok(Self { symbols, codes })
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn code(&self, symbol: &str) -> Option<i32> {
        self.codes.get(symbol).copied()
    }

    pub fn symbol(&self, code: i32) -> Option<&str> {
        usize::try_from(code)
            .ok()
            .and_then(|i| self.symbols.get(i))
            .map(String::as_str)
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    /// Maps every symbol to its code, failing on the first unsupported one.
    pub fn codes<S: AsRef<str>>(&self, symbols: &[S]) -> Result<Vec<i32>, SpeciesError> {
        symbols
            .iter()
            .map(|s| {
                let s = s.as_ref();
                self.code(s)
                    .ok_or_else(|| SpeciesError::Unknown(s.to_string()))
            })
            .collect()
    }
}
