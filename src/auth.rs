/// Bearer credentials: extracted from incoming requests on the proxy side and
/// attached to outgoing requests on the session side.
use axum::http::{HeaderMap, header};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use subtle::ConstantTimeEq;
use uuid::Uuid;

/// An API key compared in constant time, so that validating a bearer token
/// does not leak how much of it matched.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl PartialEq for ApiKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ApiKey {}

impl Hash for ApiKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

pub type KeySet = HashSet<ApiKey>;

/// Returns the token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Whether the request is allowed through.
///
/// A bearer token is always required. When `keys` is set the token must also
/// be one of them.
pub fn is_authorized(keys: Option<&KeySet>, headers: &HeaderMap) -> bool {
    match (bearer_token(headers), keys) {
        (None, _) => false,
        (Some(_), None) => true,
        (Some(token), Some(keys)) => keys.contains(&ApiKey::from(token)),
    }
}

/// The signed-in user of a chat session and the credential sent upstream.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub user_id: Uuid,
    pub bearer: String,
}

impl Credentials {
    pub fn new(user_id: Uuid, bearer: impl Into<String>) -> Self {
        Self {
            user_id,
            bearer: bearer.into(),
        }
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.bearer)
    }
}
