//! Error taxonomy surfaced to users.
//!
//! Most code propagates `anyhow::Error`; the variants here are attached at
//! the points where the category matters (bad input, a failing upstream
//! service, missing configuration) so the HTTP layer can downcast and pick
//! a status code instead of matching on message text.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelfError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{service} request failed: {message}")]
    ExternalService { service: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl ShelfError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn external(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcasts_through_anyhow() {
        let err: anyhow::Error = ShelfError::external("openlibrary", "503").into();
        let err = err.context("enriching 'Dune'");
        match err.downcast_ref::<ShelfError>() {
            Some(ShelfError::ExternalService { service, .. }) => assert_eq!(service, "openlibrary"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn display_includes_category() {
        assert_eq!(
            ShelfError::config("GEMINI_API_KEY not set").to_string(),
            "configuration error: GEMINI_API_KEY not set"
        );
    }
}
