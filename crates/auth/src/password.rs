//! Password hashing seam.

use crate::error::AuthError;
use crate::user::PasswordHash;

/// Hashes and verifies passwords.
///
/// The algorithm (argon2, bcrypt, ...) and password policy belong to the
/// implementation; the use cases only ever see [`PasswordHash`] values.
pub trait PasswordHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<PasswordHash, AuthError>;

    fn verify(&self, password: &str, hash: &PasswordHash) -> bool;
}
