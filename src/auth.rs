//! Connection authentication.
//!
//! The authenticator only enforces that a handshake carries a well-shaped
//! credential; deciding whether the credential is valid is delegated to a
//! [`SessionVerifier`].

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use serde::{Deserialize, Serialize};

use crate::utils::jwt;

pub const MAX_CREDENTIAL_LEN: usize = 4096;
pub const SESSION_COOKIE: &str = "session";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    User,
    Dj,
    ClubOwner,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User      => "USER",
            Role::Dj        => "DJ",
            Role::ClubOwner => "CLUB_OWNER",
            Role::Admin     => "ADMIN",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER"       => Ok(Role::User),
            "DJ"         => Ok(Role::Dj),
            "CLUB_OWNER" => Ok(Role::ClubOwner),
            "ADMIN"      => Ok(Role::Admin),
            other        => Err(format!("unknown role {other:?}")),
        }
    }
}

/// Who is on the other end of a connection. Fixed once the handshake succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: String,
    pub name:    String,
    pub role:    Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar:  Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self { user_id: user_id.into(), name: name.into(), role, avatar: None }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("no session credential in handshake")]
    MissingCredential,

    #[error("malformed session credential")]
    Malformed,

    #[error("session rejected: {0}")]
    Rejected(String),
}

/// External collaborator that knows how credentials are encoded.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Verifies HS256 session tokens issued by the web application.
pub struct JwtVerifier {
    secret: String,
}

impl JwtVerifier {
    pub fn new(secret: impl Into<String>) -> Self {
        Self { secret: secret.into() }
    }
}

#[async_trait]
impl SessionVerifier for JwtVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        jwt::verify(credential, &self.secret)
            .map(Identity::from)
            .map_err(|e| AuthError::Rejected(e.to_string()))
    }
}

/* ---------------- handshake ---------------- */

/// Raw credential material pulled off an upgrade request.
#[derive(Debug, Default, Clone)]
pub struct Handshake {
    pub bearer:      Option<String>,
    pub query_token: Option<String>,
    pub cookie:      Option<String>,
}

impl Handshake {
    pub fn from_parts(headers: &HeaderMap, query_token: Option<String>) -> Self {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_string());

        let cookie = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|kv| kv.trim().split_once('='))
            .find(|(k, _)| *k == SESSION_COOKIE)
            .map(|(_, v)| v.to_string());

        Self { bearer, query_token, cookie }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self { bearer: Some(token.into()), ..Self::default() }
    }

    /// Header first, then query string, then cookie. Blank values are skipped.
    fn credential(&self) -> Option<&str> {
        [&self.bearer, &self.query_token, &self.cookie]
            .into_iter()
            .filter_map(|c| c.as_deref())
            .find(|c| !c.is_empty())
    }
}

#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn SessionVerifier>,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn SessionVerifier>) -> Self {
        Self { verifier }
    }

    pub async fn authenticate(&self, hs: &Handshake) -> Result<Identity, AuthError> {
        let cred = hs.credential().ok_or(AuthError::MissingCredential)?;
        if cred.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        if cred.len() > MAX_CREDENTIAL_LEN || cred.chars().any(char::is_whitespace) {
            return Err(AuthError::Malformed);
        }
        let who = self.verifier.verify(cred).await?;
        if who.user_id.is_empty() {
            return Err(AuthError::Rejected("identity without user id".into()));
        }
        Ok(who)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn jwt_auth() -> Authenticator {
        Authenticator::new(Arc::new(JwtVerifier::new("test-secret")))
    }

    #[test]
    fn bearer_beats_query_and_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; session=zzz"));
        let hs = Handshake::from_parts(&headers, Some("qqq".into()));
        assert_eq!(hs.credential(), Some("abc"));

        let hs = Handshake::from_parts(&HeaderMap::new(), Some("qqq".into()));
        assert_eq!(hs.credential(), Some("qqq"));
    }

    #[test]
    fn session_cookie_is_found() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; session=zzz"));
        let hs = Handshake::from_parts(&headers, None);
        assert_eq!(hs.credential(), Some("zzz"));
    }

    #[test]
    fn blank_bearer_falls_through_to_query_and_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        headers.insert(header::COOKIE, HeaderValue::from_static("session=zzz"));
        assert_eq!(Handshake::from_parts(&headers, Some("qqq".into())).credential(), Some("qqq"));
        assert_eq!(Handshake::from_parts(&headers, Some(String::new())).credential(), Some("zzz"));
    }

    #[tokio::test]
    async fn blank_bearer_does_not_mask_a_valid_query_token() {
        let who = Identity::new("u9", "Kai", Role::User);
        let hs = Handshake {
            bearer: Some(String::new()),
            query_token: Some(jwt::sign(&who, "test-secret").unwrap()),
            cookie: None,
        };
        assert_eq!(jwt_auth().authenticate(&hs).await, Ok(who));
    }

    #[tokio::test]
    async fn missing_or_malformed_credential_is_refused() {
        let auth = jwt_auth();
        assert_eq!(
            auth.authenticate(&Handshake::default()).await,
            Err(AuthError::MissingCredential)
        );
        assert_eq!(
            auth.authenticate(&Handshake::bearer("has space")).await,
            Err(AuthError::Malformed)
        );
    }

    #[tokio::test]
    async fn valid_token_yields_identity() {
        let who = Identity::new("u7", "Nico", Role::ClubOwner);
        let token = jwt::sign(&who, "test-secret").unwrap();
        let got = jwt_auth().authenticate(&Handshake::bearer(token)).await.unwrap();
        assert_eq!(got, who);
    }

    #[tokio::test]
    async fn forged_token_is_rejected() {
        let who = Identity::new("u7", "Nico", Role::Admin);
        let token = jwt::sign(&who, "wrong-secret").unwrap();
        let res = jwt_auth().authenticate(&Handshake::bearer(token)).await;
        assert!(matches!(res, Err(AuthError::Rejected(_))));
    }
}
