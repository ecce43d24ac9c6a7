//! Document generator collaborator contract.
//!
//! The executor hands transcripts to an implementation of
//! [`DocumentGenerator`] to produce clinical notes, referrals and letters.
//! Prompt construction and model selection live outside this crate; the
//! contract fixes only the call shape and the error mapping.

use crate::error::ApiError;
use async_trait::async_trait;

/// Default conditions hint used when a referral is generated without an
/// operator-supplied focus.
pub const DEFAULT_REFERRAL_CONDITIONS: &str =
    "Based on the clinical findings in the SOAP note";

/// Default recipient type for letters generated in the background.
pub const DEFAULT_LETTER_RECIPIENT: &str = "other";

/// Errors from a document generator.
#[derive(Debug, thiserror::Error)]
pub enum GeneratorError {
    /// The underlying AI call failed. Retryable per the API taxonomy.
    #[error("Generator API error: {0}")]
    Api(#[from] ApiError),

    /// The generator produced unusable output (e.g. empty). Not retryable.
    #[error("Generator returned invalid output: {0}")]
    Invalid(String),
}

impl GeneratorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            GeneratorError::Api(err) => err.is_retryable(),
            GeneratorError::Invalid(_) => false,
        }
    }
}

/// Produces downstream AI artifacts from transcribed consultations.
#[async_trait]
pub trait DocumentGenerator: Send + Sync {
    /// Generate a SOAP note from a transcript, with optional consultation
    /// context injected into the prompt.
    async fn generate_soap(&self, transcript: &str, context: &str)
        -> Result<String, GeneratorError>;

    /// Generate a referral paragraph from a SOAP note.
    async fn generate_referral(
        &self,
        soap_note: &str,
        conditions_hint: &str,
    ) -> Result<String, GeneratorError>;

    /// Generate a letter from source text (SOAP note preferred over raw
    /// transcript).
    async fn generate_letter(
        &self,
        content: &str,
        recipient_type: &str,
        specs: &str,
    ) -> Result<String, GeneratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_retryability_follows_api_taxonomy() {
        let retryable = GeneratorError::Api(ApiError::ServiceUnavailable("down".into()));
        assert!(retryable.is_retryable());

        let auth = GeneratorError::Api(ApiError::Authentication("bad key".into()));
        assert!(!auth.is_retryable());

        let invalid = GeneratorError::Invalid("empty".into());
        assert!(!invalid.is_retryable());
    }
}
