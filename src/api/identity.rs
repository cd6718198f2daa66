//! Caller Identity
//!
//! The identity provider sits in front of this service and forwards who the
//! caller is in request headers. Unidentified callers are keyed by address.

use std::collections::HashMap;
use std::convert::Infallible;

use async_trait::async_trait;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use crate::error::AppError;

const USER_ID_HEADER: &str = "x-user-id";
const USER_ROLE_HEADER: &str = "x-user-role";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Privilege level of a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    User,
    Anonymous,
}

impl Role {
    fn from_header(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "admin" => Self::Admin,
            _ => Self::User,
        }
    }
}

/// Who is calling: `{id, role}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
        }
    }

    pub fn anonymous() -> Self {
        Self::new("anonymous", Role::Anonymous)
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Rejects callers without the admin role.
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Forbidden("Admin role required".to_string()))
        }
    }

    /// `x-user-id`/`x-user-role`, else the first `x-forwarded-for` hop, else anonymous.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        if let Some(id) = header(USER_ID_HEADER) {
            let role = header(USER_ROLE_HEADER)
                .map(Role::from_header)
                .unwrap_or(Role::User);
            return Self::new(id, role);
        }

        header(FORWARDED_FOR_HEADER)
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(|ip| Self::new(ip, Role::Anonymous))
            .unwrap_or_else(Self::anonymous)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self::from_headers(&parts.headers))
    }
}

// == Credential Verification ==
/// Checks login credentials; returns the authenticated identity.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> Option<Identity>;
}

/// Fixed set of accounts.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    accounts: HashMap<String, (String, Role)>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_account(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        role: Role,
    ) -> Self {
        self.accounts
            .insert(username.into(), (password.into(), role));
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, username: &str, password: &str) -> Option<Identity> {
        self.accounts
            .get(username)
            .filter(|(expected, _)| expected == password)
            .map(|(_, role)| Identity::new(username, *role))
    }
}
