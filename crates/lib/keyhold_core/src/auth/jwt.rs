//! JWT access token signing and verification.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Header, Validation, decode, decode_header, encode};
use tracing::debug;

use super::AuthError;
use crate::models::auth::AccessClaims;
use crate::secrets::SigningMaterial;

/// Sign `claims` with `key`. The header carries the key id.
pub fn encode_access_token(
    claims: &AccessClaims,
    key: &SigningMaterial,
) -> Result<String, AuthError> {
    let mut header = Header::new(key.algorithm);
    header.kid = Some(key.kid.clone());
    encode(&header, claims, &key.encoding)
        .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))
}

/// Verify a JWT access token against the given verification keys.
///
/// The key is picked by the header `kid`; a token signed by a key that is not
/// in `keys` is malformed. Expiry is checked with `leeway_secs` of clock skew.
pub fn decode_access_token(
    token: &str,
    keys: &[SigningMaterial],
    issuer: &str,
    leeway_secs: u64,
) -> Result<AccessClaims, AuthError> {
    let header = decode_header(token).map_err(|_| AuthError::TokenMalformed)?;
    let kid = header.kid.ok_or(AuthError::TokenMalformed)?;
    let key = keys.iter().find(|k| k.kid == kid).ok_or_else(|| {
        debug!(kid = %kid, "access token signed with unknown key");
        AuthError::TokenMalformed
    })?;

    let mut validation = Validation::new(key.algorithm);
    validation.leeway = leeway_secs;
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);

    let claims = decode::<AccessClaims>(token, &key.decoding, &validation)
        .map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::TokenMalformed,
        })?
        .claims;

    if claims.expire_at <= claims.issued_at {
        return Err(AuthError::TokenMalformed);
    }
    Ok(claims)
}
