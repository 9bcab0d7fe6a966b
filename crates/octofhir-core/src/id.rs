use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("ID must not be empty")]
    Empty,
    #[error("ID '{0}' exceeds 64 characters")]
    TooLong(String),
    #[error("ID '{0}' contains characters outside [A-Za-z0-9-.]")]
    InvalidCharacters(String),
}

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-\.]+$").expect("static id regex"))
}

/// Generate a server-assigned logical id.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Validate a logical id against the FHIR `id` datatype rules.
pub fn validate_id(id: &str) -> Result<(), IdError> {
    if id.is_empty() {
        return Err(IdError::Empty);
    }
    if id.len() > 64 {
        return Err(IdError::TooLong(id.to_string()));
    }
    if !id_pattern().is_match(id) {
        return Err(IdError::InvalidCharacters(id.to_string()));
    }
    Ok(())
}
