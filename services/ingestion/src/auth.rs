//! Caller authentication and organization isolation.
//!
//! `dev` mode synthesizes a fixed actor; `bearer` mode forwards the token
//! to the org-identity verifier and maps its claims.  Entities are
//! org-scoped: a caller may only touch rows whose `orgId` matches, with a
//! SYSTEM bypass for internal work.

use axum::http::HeaderMap;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{AuthConfig, AuthMode};
use crate::http::response::{HttpResponse, forbidden, unauthorized};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    /// Internal caller; bypasses org isolation.
    System,
    User {
        user_id: String,
        org_id: String,
        name: String,
    },
}

impl Actor {
    pub fn can_access_org(&self, org_id: &str) -> bool {
        match self {
            Actor::System => true,
            Actor::User { org_id: own, .. } => own == org_id,
        }
    }

    pub fn org_id(&self) -> Option<&str> {
        match self {
            Actor::System => None,
            Actor::User { org_id, .. } => Some(org_id),
        }
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// `403` unless the actor may touch the entity's org.
pub fn ensure_org(actor: &Actor, org_id: &str) -> Result<(), HttpResponse> {
    if actor.can_access_org(org_id) {
        Ok(())
    } else {
        Err(forbidden("organization mismatch"))
    }
}

/// Claims returned by the org-identity verifier.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VerifiedClaims {
    user_id: String,
    org_id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    aud: Option<String>,
}

/// External collaborator: the org-identity verifier.  Only its interface is
/// reproduced here — token in, claims out.
pub struct IdentityVerifier {
    http: reqwest::Client,
    issuer: String,
    audience: Option<String>,
}

impl IdentityVerifier {
    pub fn new(issuer: String, audience: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            issuer,
            audience,
        }
    }

    pub async fn verify(&self, token: &str) -> Option<Actor> {
        let url = format!("{}/v1/verify", self.issuer.trim_end_matches('/'));
        let response = match self.http.get(&url).bearer_auth(token).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "identity verifier unreachable");
                return None;
            }
        };
        if !response.status().is_success() {
            return None;
        }
        let claims: VerifiedClaims = response.json().await.ok()?;
        if let Some(expected) = &self.audience {
            if claims.aud.as_deref() != Some(expected.as_str()) {
                debug!(aud = ?claims.aud, "token audience mismatch");
                return None;
            }
        }
        Some(Actor::User {
            user_id: claims.user_id,
            org_id: claims.org_id,
            name: claims.name.unwrap_or_default(),
        })
    }
}

pub enum AuthGate {
    Dev { actor: Actor },
    Bearer { verifier: IdentityVerifier },
}

impl AuthGate {
    pub fn from_config(auth: &AuthConfig) -> Self {
        match auth.mode {
            AuthMode::Dev => AuthGate::Dev {
                actor: Actor::User {
                    user_id: auth.dev_user_id.clone(),
                    org_id: auth.dev_org_id.clone(),
                    name: auth.dev_user_name.clone(),
                },
            },
            AuthMode::Bearer => {
                let issuer = auth.issuer.clone().unwrap_or_default();
                if issuer.is_empty() {
                    warn!("bearer auth enabled without ORG_IDENTITY_ISSUER; all tokens will fail");
                }
                AuthGate::Bearer {
                    verifier: IdentityVerifier::new(issuer, auth.audience.clone()),
                }
            }
        }
    }

    /// Resolve the caller or produce the 401 response.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Actor, HttpResponse> {
        match self {
            AuthGate::Dev { actor } => Ok(actor.clone()),
            AuthGate::Bearer { verifier } => {
                let token = headers
                    .get(axum::http::header::AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(extract_bearer)
                    .ok_or_else(|| unauthorized("missing bearer token"))?;
                verifier
                    .verify(token)
                    .await
                    .ok_or_else(|| unauthorized("invalid token"))
            }
        }
    }
}
