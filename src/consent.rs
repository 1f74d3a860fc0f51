//! Capture consent
//!
//! Recording never starts without an explicit grant. Display capture defers
//! to the platform permission prompt; the synthetic pattern source is always
//! grantable.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::capture::SourceKind;

/// Proof that capture was approved for one recording session.
///
/// Not `Clone` on purpose: a token is consumed when a pipeline is built, so a
/// single grant can never back two recordings.
#[derive(Debug)]
pub struct ConsentToken {
    session_id: Uuid,
    source: SourceKind,
    granted_at: DateTime<Utc>,
}

impl ConsentToken {
    pub(crate) fn grant(source: SourceKind) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            source,
            granted_at: Utc::now(),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn source(&self) -> SourceKind {
        self.source
    }

    pub fn granted_at(&self) -> DateTime<Utc> {
        self.granted_at
    }
}

#[derive(Debug, Error)]
pub enum ConsentError {
    #[error("screen capture consent was denied")]
    Denied,
    #[error("screen capture unavailable: {0}")]
    Unsupported(String),
}

/// Cheap preflight: could this source kind possibly be granted here?
pub fn supported(kind: SourceKind) -> bool {
    match kind {
        SourceKind::Pattern => true,
        #[cfg(feature = "scap")]
        SourceKind::Display => scap::is_supported(),
        #[cfg(not(feature = "scap"))]
        SourceKind::Display => false,
    }
}

/// Ask for capture consent, prompting the user when the platform requires it.
pub async fn request_consent(kind: SourceKind) -> Result<ConsentToken, ConsentError> {
    match kind {
        SourceKind::Pattern => {
            debug!("pattern source needs no permission prompt");
            Ok(ConsentToken::grant(kind))
        }
        SourceKind::Display => request_display_consent().await,
    }
}

#[cfg(feature = "scap")]
async fn request_display_consent() -> Result<ConsentToken, ConsentError> {
    // The permission prompt can block on user interaction.
    let granted = tokio::task::spawn_blocking(|| {
        if !scap::is_supported() {
            return Err(ConsentError::Unsupported(
                "platform not supported by the capture backend".to_string(),
            ));
        }
        if scap::has_permission() {
            return Ok(true);
        }
        debug!("requesting screen capture permission");
        Ok(scap::request_permission())
    })
    .await
    .map_err(|e| ConsentError::Unsupported(format!("consent task failed: {e}")))??;

    if granted {
        Ok(ConsentToken::grant(SourceKind::Display))
    } else {
        Err(ConsentError::Denied)
    }
}

#[cfg(not(feature = "scap"))]
async fn request_display_consent() -> Result<ConsentToken, ConsentError> {
    Err(ConsentError::Unsupported(
        "built without the scap capture backend".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pattern_source_is_always_granted() {
        let token = request_consent(SourceKind::Pattern).await.unwrap();
        assert_eq!(token.source(), SourceKind::Pattern);
    }

    #[test]
    fn each_grant_names_a_distinct_session() {
        let a = ConsentToken::grant(SourceKind::Pattern);
        let b = ConsentToken::grant(SourceKind::Pattern);
        assert_ne!(a.session_id(), b.session_id());
    }

    #[cfg(not(feature = "scap"))]
    #[tokio::test]
    async fn display_consent_requires_the_capture_backend() {
        let err = request_consent(SourceKind::Display).await.unwrap_err();
        assert!(matches!(err, ConsentError::Unsupported(_)));
    }
}
