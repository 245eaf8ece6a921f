use log::warn;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Longest key name a FITS card can carry.
pub const MAX_KEY_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("stats file {} does not exist", .0.display())]
    NotFound(PathBuf),
    #[error("reading stats file")]
    Io(#[from] io::Error),
    #[error("line {line}: expected 2 columns, found {found}")]
    ColumnCount { line: usize, found: usize },
    #[error("line {line}: {token:?} is not a number")]
    InvalidValue { line: usize, token: String },
}

/// Non-fatal problem noticed while building a [`StatsTable`].
#[derive(Debug, Clone, PartialEq)]
pub enum StatsWarning {
    /// Key was longer than eight characters and got cut down.
    Truncated { original: String, key: String },
    /// Key already present; the later value was ignored.
    Duplicate { key: String, line: usize },
}

/// Calibration values keyed by upper-case card name, in ascending key order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsTable {
    entries: BTreeMap<String, f64>,
    warnings: Vec<StatsWarning>,
}

impl StatsTable {
    /// Parse the stats file at `path`.
    pub fn from_path(path: &Path) -> Result<Self, StatsError> {
        Self::from_reader(open(path)?)
    }

    /// Parse the stats file at `path`, keeping the entries read before the
    /// first malformed line. Only a file that cannot be opened is an `Err`.
    pub fn from_path_prefix(path: &Path) -> Result<(Self, Option<StatsError>), StatsError> {
        Ok(Self::read_prefix(open(path)?))
    }

    /// Parse `<KEY> <NUMBER>` lines. Blank lines and `#` comments are skipped;
    /// the first malformed line stops parsing.
    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self, StatsError> {
        match Self::read_prefix(reader) {
            (table, None) => Ok(table),
            (_, Some(e)) => Err(e),
        }
    }

    /// Parse up to the first malformed line and return the table built so far
    /// together with the error that stopped it, if any.
    pub fn read_prefix<R: BufRead>(reader: R) -> (Self, Option<StatsError>) {
        let mut table = StatsTable::default();
        for (idx, line) in reader.lines().enumerate() {
            let parsed = line
                .map_err(StatsError::from)
                .and_then(|line| table.push_line(idx + 1, &line));
            if let Err(e) = parsed {
                return (table, Some(e));
            }
        }
        (table, None)
    }

    fn push_line(&mut self, lineno: usize, line: &str) -> Result<(), StatsError> {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return Ok(());
        }

        let tokens: Vec<&str> = trimmed.split_whitespace().collect();
        let [name, value] = tokens.as_slice() else {
            return Err(StatsError::ColumnCount {
                line: lineno,
                found: tokens.len(),
            });
        };
        // cfitsio cannot format NaN or infinities
        let value: f64 = value
            .parse()
            .ok()
            .filter(|v: &f64| v.is_finite())
            .ok_or_else(|| StatsError::InvalidValue {
                line: lineno,
                token: value.to_string(),
            })?;

        let mut key = name.to_ascii_uppercase();
        if key.chars().count() > MAX_KEY_LEN {
            let original = key.clone();
            key = key.chars().take(MAX_KEY_LEN).collect();
            warn!("card {original} is too long, trimmed to {key}");
            self.warnings.push(StatsWarning::Truncated {
                original,
                key: key.clone(),
            });
        }

        if self.entries.contains_key(&key) {
            warn!("card {key} is repeated on line {lineno}, keeping the first value");
            self.warnings.push(StatsWarning::Duplicate { key, line: lineno });
        } else {
            self.entries.insert(key, value);
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn warnings(&self) -> &[StatsWarning] {
        &self.warnings
    }
}

fn open(path: &Path) -> Result<BufReader<File>, StatsError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => StatsError::NotFound(path.to_path_buf()),
        _ => StatsError::Io(e),
    })?;
    Ok(BufReader::new(file))
}
