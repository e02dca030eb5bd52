use std::fs;
use std::path::Path;

/// Maps a class index to a human readable label.
pub trait LabelSource: Send + Sync {
    fn lookup(&self, index: usize) -> Option<&str>;
}

/// Labels read from a text file with one label per line, line `n` naming class `n`.
///
/// Synset lines such as `n01440764 tench, Tinca tinca` have the leading id
/// stripped. Blank lines keep their slot and resolve to no label.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LabelTable {
    labels: Vec<String>,
}

impl LabelTable {
    pub fn from_lines(text: &str) -> Self {
        let labels = text
            .lines()
            .map(|line| strip_synset_id(line.trim()).to_string())
            .collect();

        LabelTable { labels }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LabelError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| LabelError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let table = Self::from_lines(&text);
        if table.is_empty() {
            return Err(LabelError::Empty(path.display().to_string()));
        }

        log::info!("loaded {} labels from '{}'", table.len(), path.display());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// True when no line names a class.
    pub fn is_empty(&self) -> bool {
        self.labels.iter().all(String::is_empty)
    }
}

impl LabelSource for LabelTable {
    fn lookup(&self, index: usize) -> Option<&str> {
        self.labels
            .get(index)
            .map(String::as_str)
            .filter(|label| !label.is_empty())
    }
}

/// Label source without data; every lookup misses and callers fall back to
/// `class <index>`.
#[derive(Clone, Copy, Debug, Default)]
pub struct IndexLabels;

impl LabelSource for IndexLabels {
    fn lookup(&self, _index: usize) -> Option<&str> {
        None
    }
}

fn strip_synset_id(line: &str) -> &str {
    match line.split_once(' ') {
        Some((id, rest))
            if id.len() == 9
                && id.starts_with('n')
                && id[1..].chars().all(|c| c.is_ascii_digit()) =>
        {
            rest.trim_start()
        }
        _ => line,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LabelError {
    #[error("unable to read labels from '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("label file '{0}' contains no labels")]
    Empty(String),
}
