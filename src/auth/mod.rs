//! Authentication module
//!
//! The proxy consumes an authenticator that produces a user identity;
//! authentication backends themselves live outside this crate. The
//! header-based implementation covers the common front-proxy deployment
//! where a trusted gateway injects identity headers.

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::authz::UserInfo;

/// User header consumed by [`HeaderAuthenticator`].
pub const USER_HEADER: &str = "x-remote-user";
/// UID header consumed by [`HeaderAuthenticator`].
pub const UID_HEADER: &str = "x-remote-uid";
/// Group header consumed by [`HeaderAuthenticator`]; repeatable.
pub const GROUP_HEADER: &str = "x-remote-group";
/// Prefix for extra-attribute headers consumed by [`HeaderAuthenticator`].
pub const EXTRA_HEADER_PREFIX: &str = "x-remote-extra-";

/// Authentication errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("missing authentication")]
    MissingAuth,

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
}

/// Authentication request context
#[derive(Debug)]
pub struct AuthRequest {
    pub headers: BTreeMap<String, Vec<String>>,
    pub method: String,
    pub path: String,
}

/// Authenticator trait
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate a request, producing the user identity.
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserInfo, AuthError>;
}

/// Authenticator that trusts identity headers set by a front proxy.
///
/// Reads `X-Remote-User`, `X-Remote-Uid`, repeated `X-Remote-Group` headers
/// and `X-Remote-Extra-*` attributes.
pub struct HeaderAuthenticator;

#[async_trait]
impl Authenticator for HeaderAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<UserInfo, AuthError> {
        let name = request
            .headers
            .get(USER_HEADER)
            .and_then(|values| values.first())
            .cloned()
            .ok_or(AuthError::MissingAuth)?;
        if name.is_empty() {
            return Err(AuthError::InvalidIdentity("empty user name".into()));
        }

        let uid = request
            .headers
            .get(UID_HEADER)
            .and_then(|values| values.first())
            .cloned()
            .unwrap_or_default();
        let groups = request
            .headers
            .get(GROUP_HEADER)
            .cloned()
            .unwrap_or_default();

        let mut extra = BTreeMap::new();
        for (header, values) in &request.headers {
            if let Some(key) = header.strip_prefix(EXTRA_HEADER_PREFIX) {
                extra.insert(key.to_string(), values.clone());
            }
        }

        Ok(UserInfo {
            name,
            uid,
            groups,
            extra,
        })
    }
}

/// Authenticator that assigns every request a fixed identity. Useful for
/// development and tests.
pub struct StaticAuthenticator {
    user: UserInfo,
}

impl StaticAuthenticator {
    pub fn new(user: UserInfo) -> Self {
        Self { user }
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, _request: &AuthRequest) -> Result<UserInfo, AuthError> {
        Ok(self.user.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(headers: &[(&str, &str)]) -> AuthRequest {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            map.entry((*name).to_string())
                .or_default()
                .push((*value).to_string());
        }
        AuthRequest {
            headers: map,
            method: "GET".into(),
            path: "/api/v1/pods".into(),
        }
    }

    #[tokio::test]
    async fn test_header_authenticator_reads_identity() {
        let auth = HeaderAuthenticator;
        let user = auth
            .authenticate(&request(&[
                ("x-remote-user", "alice"),
                ("x-remote-group", "dev"),
                ("x-remote-group", "ops"),
                ("x-remote-extra-scopes", "admin"),
            ]))
            .await
            .unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(user.groups, vec!["dev", "ops"]);
        assert_eq!(user.extra.get("scopes").unwrap(), &vec!["admin".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_user_header() {
        let auth = HeaderAuthenticator;
        let result = auth.authenticate(&request(&[])).await;
        assert!(matches!(result, Err(AuthError::MissingAuth)));
    }

    #[tokio::test]
    async fn test_static_authenticator() {
        let auth = StaticAuthenticator::new(UserInfo {
            name: "dev".into(),
            ..Default::default()
        });
        let user = auth.authenticate(&request(&[])).await.unwrap();
        assert_eq!(user.name, "dev");
    }
}
