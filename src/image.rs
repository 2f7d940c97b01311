use std::fs;
use std::num::ParseIntError;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("program image is empty")]
    Empty,

    #[error("field {index} ({field:?}) is not an integer")]
    InvalidField {
        index: usize,
        field: String,
        #[source]
        source: ParseIntError,
    },

    #[error("failed to read program image")]
    Io(#[from] std::io::Error),
}

/// Parse a comma-separated program image such as `1,0,0,3,99`.
///
/// Whitespace around fields and a trailing newline are accepted. A trailing
/// comma is not.
pub fn parse(text: &str) -> Result<Vec<i64>, ImageError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ImageError::Empty);
    }
    text.split(',')
        .enumerate()
        .map(|(index, field)| {
            let field = field.trim();
            field.parse::<i64>().map_err(|source| ImageError::InvalidField {
                index,
                field: field.to_string(),
                source,
            })
        })
        .collect()
}

/// Read and parse a program image file.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<i64>, ImageError> {
    parse(&fs::read_to_string(path)?)
}

/// Render an image in the same comma-separated form [`parse`] accepts.
pub fn format(image: &[i64]) -> String {
    image
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
