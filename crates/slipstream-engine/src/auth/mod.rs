// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Authentication and authorization gate.
//!
//! One shared routine guards every RPC: extract the bearer token, validate
//! it according to the configured mode, derive a [`Principal`], and check the
//! principal's roles against the method's permission class. Unary and
//! streaming handlers both call [`AuthGate::authorize`] before doing any
//! work; the routine is async because OIDC validation may refresh the JWKS.

pub mod oidc;

pub use self::oidc::{OidcConfig, OidcVerifier};

use subtle::ConstantTimeEq;
use tonic::Status;
use tonic::metadata::MetadataMap;
use uuid::Uuid;

/// Methods that bypass the gate entirely.
const EXEMPT_METHODS: &[&str] = &["Health", "GetServerInfo", "WaitForCleanup"];

/// Roles granting read and write access.
const WRITE_ROLES: &[&str] = &["owner", "admin", "editor", "service_account"];

/// Roles granting read-only access.
const READ_ROLES: &[&str] = &["viewer"];

/// Permission class required by a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Observation only.
    Read,
    /// Mutation.
    Write,
    /// No role requirement beyond a valid token.
    None,
}

/// Map a full method name (`/package.Service/Method`) to its required
/// permission class. Unknown methods fail closed to write.
pub fn required_permission(full_method: &str) -> Permission {
    match method_name(full_method) {
        "Health" | "GetServerInfo" | "WaitForCleanup" => Permission::None,
        "ListRuns" | "GetRun" | "StreamLogs" => Permission::Read,
        "CreateRun" | "CancelRun" | "AddLog" | "UpsertRunStep" => Permission::Write,
        _ => Permission::Write,
    }
}

/// True when the method skips authentication entirely.
pub fn is_exempt(full_method: &str) -> bool {
    EXEMPT_METHODS.contains(&method_name(full_method))
}

fn method_name(full_method: &str) -> &str {
    full_method.rsplit('/').next().unwrap_or(full_method)
}

/// Authenticated caller derived from a validated token. Immutable once
/// produced.
#[derive(Debug, Clone)]
pub struct Principal {
    /// Token subject.
    pub subject: String,
    /// Email claim, when present.
    pub email: Option<String>,
    /// Preferred username claim, when present.
    pub username: Option<String>,
    /// Organization the caller belongs to. Service accounts may omit it.
    pub org_id: Option<Uuid>,
    /// Role names.
    pub roles: Vec<String>,
    /// Free-form scopes.
    pub scopes: Vec<String>,
}

impl Principal {
    /// Synthetic principal for the static-token mode.
    pub fn token() -> Self {
        Self {
            subject: "token".to_string(),
            email: None,
            username: None,
            org_id: None,
            roles: vec!["owner".to_string()],
            scopes: Vec::new(),
        }
    }

    /// Synthetic principal when authentication is disabled or the method is
    /// exempt.
    pub fn anonymous() -> Self {
        Self {
            subject: "anonymous".to_string(),
            email: None,
            username: None,
            org_id: None,
            roles: vec!["owner".to_string()],
            scopes: Vec::new(),
        }
    }

    /// True when the caller is the workflow service's callback identity.
    pub fn is_service_account(&self) -> bool {
        self.roles.iter().any(|r| r == "service_account")
    }

    /// Initiator label persisted on runs: username, else email, else
    /// subject, else `unknown`.
    pub fn initiator(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| {
                if self.subject.is_empty() {
                    "unknown".to_string()
                } else {
                    self.subject.clone()
                }
            })
    }

    /// Check this principal's roles against a permission class. Missing
    /// roles fail closed.
    pub fn can(&self, permission: Permission) -> bool {
        match permission {
            Permission::None => true,
            Permission::Write => self
                .roles
                .iter()
                .any(|role| WRITE_ROLES.contains(&role.as_str())),
            Permission::Read => self.roles.iter().any(|role| {
                WRITE_ROLES.contains(&role.as_str()) || READ_ROLES.contains(&role.as_str())
            }),
        }
    }
}

/// Configured authentication mode.
pub enum AuthMode {
    /// No authentication: every call passes with an anonymous principal.
    Disabled,
    /// Static bearer token, constant-time compared.
    Token {
        /// The shared secret.
        secret: String,
    },
    /// OIDC bearer tokens validated against the issuer's JWKS.
    Oidc(OidcVerifier),
}

/// The per-call authentication and authorization gate.
pub struct AuthGate {
    mode: AuthMode,
}

impl AuthGate {
    /// Gate with authentication disabled.
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
        }
    }

    /// Gate validating a static token.
    pub fn token(secret: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Token {
                secret: secret.into(),
            },
        }
    }

    /// Gate validating OIDC tokens.
    pub fn oidc(verifier: OidcVerifier) -> Self {
        Self {
            mode: AuthMode::Oidc(verifier),
        }
    }

    /// True when callers must present a token.
    pub fn enabled(&self) -> bool {
        !matches!(self.mode, AuthMode::Disabled)
    }

    /// Wire form of the mode for `GetServerInfo`.
    pub fn auth_type(&self) -> &'static str {
        match self.mode {
            AuthMode::Disabled => "none",
            AuthMode::Token { .. } => "token",
            AuthMode::Oidc(_) => "oidc",
        }
    }

    /// The OIDC configuration, in OIDC mode.
    pub fn oidc_config(&self) -> Option<&OidcConfig> {
        match &self.mode {
            AuthMode::Oidc(verifier) => Some(verifier.config()),
            _ => None,
        }
    }

    /// The shared authorization routine.
    ///
    /// Returns the principal to inject into the call, or the gRPC status to
    /// fail the call with.
    pub async fn authorize(
        &self,
        metadata: &MetadataMap,
        full_method: &str,
    ) -> Result<Principal, Status> {
        if let AuthMode::Disabled = self.mode {
            return Ok(Principal::anonymous());
        }
        if is_exempt(full_method) {
            return Ok(Principal::anonymous());
        }

        let token = bearer_token(metadata)?;

        let principal = match &self.mode {
            AuthMode::Disabled => unreachable!("handled above"),
            AuthMode::Token { secret } => {
                let matches: bool = token.as_bytes().ct_eq(secret.as_bytes()).into();
                if !matches {
                    return Err(Status::permission_denied("invalid token"));
                }
                Principal::token()
            }
            AuthMode::Oidc(verifier) => verifier
                .verify(token)
                .await
                .map_err(|err| Status::permission_denied(err.to_string()))?,
        };

        let required = required_permission(full_method);
        if !principal.can(required) {
            return Err(Status::permission_denied(format!(
                "role does not grant {} access",
                match required {
                    Permission::Read => "read",
                    Permission::Write => "write",
                    Permission::None => "any",
                }
            )));
        }

        Ok(principal)
    }
}

/// Extract the bearer token from the `authorization` header.
fn bearer_token(metadata: &MetadataMap) -> Result<&str, Status> {
    let value = metadata
        .get("authorization")
        .ok_or_else(|| Status::unauthenticated("missing authorization header"))?;

    let value = value
        .to_str()
        .map_err(|_| Status::unauthenticated("malformed authorization header"))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| Status::unauthenticated("authorization header must use the Bearer scheme"))?
        .trim();

    if token.is_empty() {
        return Err(Status::unauthenticated("empty bearer token"));
    }

    Ok(token)
}
