use async_trait::async_trait;

use super::domain::{Actor, OrganizationId};

/// Identity facts fetched fresh from the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    pub email_verified: bool,
    pub organization_ids: Vec<OrganizationId>,
}

impl VerifiedIdentity {
    pub fn belongs_to(&self, organization_id: OrganizationId) -> bool {
        self.organization_ids.contains(&organization_id)
    }
}

/// Collaborator re-checking a session against the identity provider.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, actor: &Actor) -> Result<VerifiedIdentity, IdentityError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider unreachable: {0}")]
    Unreachable(String),
    #[error("identity session expired")]
    SessionExpired,
}

/// Verifier that trusts the claims carried by the session itself.
#[derive(Debug, Default, Clone)]
pub struct SessionClaimsVerifier;

#[async_trait]
impl IdentityVerifier for SessionClaimsVerifier {
    async fn verify(&self, actor: &Actor) -> Result<VerifiedIdentity, IdentityError> {
        Ok(VerifiedIdentity {
            email_verified: actor.email_verified,
            organization_ids: actor.organization_ids.clone(),
        })
    }
}
