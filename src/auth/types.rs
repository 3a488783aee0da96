//! Authentication user types.

use crate::db::User;
use crate::jwt::AccessClaims;

/// Identity resolved by the access gate.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    /// Stored user record, without secret fields
    pub user: User,
    /// Claims from the access token
    pub claims: AccessClaims,
}
