use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::models::AuthSource;
use crate::types::SubjectId;
use crate::utils::security::generate_token;

const DEV_TICKET_PREFIX: &str = "dev-ticket:";

/// Result of exchanging a login code with the game platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformLogin {
    pub subject_id: SubjectId,
    pub platform_id: String,
    pub ticket: String,
    pub display_name: Option<String>,
    pub auth_source: AuthSource,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("login code rejected")]
    Rejected,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchanges a one-time login code for a platform identity.
    async fn exchange(&self, code: &str) -> Result<PlatformLogin, IdentityError>;

    /// Whether a previously issued platform ticket is still honored.
    async fn validate_ticket(&self, ticket: &str) -> Result<bool, IdentityError>;
}

/// Deterministic provider for local development: any code logs in as a
/// subject derived from the code itself.
pub struct DevIdentityProvider;

#[async_trait]
impl IdentityProvider for DevIdentityProvider {
    async fn exchange(&self, code: &str) -> Result<PlatformLogin, IdentityError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(IdentityError::Rejected);
        }
        let digest = hex::encode(Sha256::digest(code.as_bytes()));
        Ok(PlatformLogin {
            subject_id: SubjectId::new(format!("dev-{}", &digest[..16])),
            platform_id: digest[16..32].to_ascii_uppercase(),
            ticket: format!("{}{}", DEV_TICKET_PREFIX, generate_token()),
            display_name: Some(code.chars().take(32).collect()),
            auth_source: AuthSource::PlatformDev,
        })
    }

    async fn validate_ticket(&self, ticket: &str) -> Result<bool, IdentityError> {
        Ok(ticket.starts_with(DEV_TICKET_PREFIX))
    }
}

/// Stand-in when no provider is configured: every login is refused.
pub struct DisabledIdentityProvider;

#[async_trait]
impl IdentityProvider for DisabledIdentityProvider {
    async fn exchange(&self, _code: &str) -> Result<PlatformLogin, IdentityError> {
        Err(IdentityError::Unavailable(
            "no identity provider configured".to_string(),
        ))
    }

    async fn validate_ticket(&self, _ticket: &str) -> Result<bool, IdentityError> {
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dev_provider_is_deterministic_per_code() {
        let provider = DevIdentityProvider;
        let a = provider.exchange("alice").await.unwrap();
        let b = provider.exchange("alice").await.unwrap();
        let c = provider.exchange("bob").await.unwrap();

        assert_eq!(a.subject_id, b.subject_id);
        assert_ne!(a.subject_id, c.subject_id);
        assert_ne!(a.ticket, b.ticket);
        assert_eq!(a.auth_source, AuthSource::PlatformDev);
        assert!(provider.validate_ticket(&a.ticket).await.unwrap());
        assert!(!provider.validate_ticket("forged").await.unwrap());
    }

    #[tokio::test]
    async fn dev_provider_rejects_blank_codes() {
        assert!(matches!(
            DevIdentityProvider.exchange("  ").await,
            Err(IdentityError::Rejected)
        ));
    }

    #[tokio::test]
    async fn disabled_provider_refuses_everything() {
        assert!(matches!(
            DisabledIdentityProvider.exchange("code").await,
            Err(IdentityError::Unavailable(_))
        ));
        assert!(!DisabledIdentityProvider
            .validate_ticket("dev-ticket:x")
            .await
            .unwrap());
    }
}
