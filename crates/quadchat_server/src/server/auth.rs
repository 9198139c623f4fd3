#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use quadchat_domain::time::unix_secs_now;
use quadchat_domain::{AuthenticatedIdentity, ChatError, UserId};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::secret::SecretString;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub email: String,
	pub exp: u64,
}

/// Verifies and issues `v1.<payload>.<sig>` HMAC tokens.
///
/// Access and refresh tokens are keyed with separate secrets, so a refresh
/// token can never be replayed as an access token or vice versa.
#[derive(Clone)]
pub struct TokenVerifier {
	access_secret: SecretString,
	refresh_secret: SecretString,
	access_token_ttl: Duration,
}

impl TokenVerifier {
	pub fn new(access_secret: SecretString, refresh_secret: SecretString, access_token_ttl: Duration) -> Self {
		Self {
			access_secret,
			refresh_secret,
			access_token_ttl,
		}
	}

	/// Verify a handshake access token and produce the caller's identity.
	pub fn verify_access(&self, token: &str) -> Result<AuthenticatedIdentity, ChatError> {
		let claims = verify_hmac_token(token, self.access_secret.expose())?;
		identity_from_claims(&claims)
	}

	/// Verify a refresh token. The subject check against the caller happens
	/// at the event handler, not here.
	pub fn verify_refresh(&self, token: &str) -> Result<AuthClaims, ChatError> {
		verify_hmac_token(token, self.refresh_secret.expose())
	}

	/// Mint a fresh short-lived access token for the given identity.
	pub fn issue_access(&self, user_id: UserId, email: &str) -> Result<String, ChatError> {
		let claims = AuthClaims {
			sub: user_id.to_string(),
			email: email.to_string(),
			exp: unix_secs_now() + self.access_token_ttl.as_secs(),
		};
		issue_hmac_token(&claims, self.access_secret.expose())
	}
}

fn identity_from_claims(claims: &AuthClaims) -> Result<AuthenticatedIdentity, ChatError> {
	let user_id = UserId::parse(&claims.sub)
		.map_err(|err| ChatError::Unauthenticated(format!("bad token subject: {err}")))?;
	if claims.email.trim().is_empty() {
		return Err(ChatError::Unauthenticated("token carries no email claim".to_string()));
	}

	Ok(AuthenticatedIdentity {
		user_id,
		email: claims.email.clone(),
	})
}

/// Check format, signature and expiry, in that order. An expired token with a
/// valid signature is `TokenExpired` so clients can run their refresh flow; a
/// bad signature is a hard `Unauthenticated`.
pub fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, ChatError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(ChatError::Unauthenticated("invalid token format".to_string()));
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD
		.decode(payload_b64)
		.map_err(|_| ChatError::Unauthenticated("invalid token payload encoding".to_string()))?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD
		.decode(sig_b64)
		.map_err(|_| ChatError::Unauthenticated("invalid token signature encoding".to_string()))?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(ChatError::Unauthenticated("invalid token signature".to_string()));
	}

	let claims: AuthClaims = serde_json::from_slice(&payload)
		.map_err(|_| ChatError::Unauthenticated("malformed token claims".to_string()))?;
	if claims.exp <= unix_secs_now() {
		return Err(ChatError::TokenExpired);
	}

	Ok(claims)
}

pub fn issue_hmac_token(claims: &AuthClaims, secret: &str) -> Result<String, ChatError> {
	let payload = serde_json::to_vec(claims).map_err(|err| ChatError::Storage(format!("encode token claims: {err}")))?;
	let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	fn verifier() -> TokenVerifier {
		TokenVerifier::new(
			SecretString::new("access-secret"),
			SecretString::new("refresh-secret"),
			Duration::from_secs(900),
		)
	}

	#[test]
	fn issued_access_token_verifies() {
		let v = verifier();
		let user = UserId::new_v4();

		let token = v.issue_access(user, "student@campus.edu").unwrap();
		let identity = v.verify_access(&token).unwrap();

		assert_eq!(identity.user_id, user);
		assert_eq!(identity.email, "student@campus.edu");
	}

	#[test]
	fn expired_tokens_are_distinguished_from_invalid() {
		let claims = AuthClaims {
			sub: UserId::new_v4().to_string(),
			email: "late@campus.edu".to_string(),
			exp: unix_secs_now() - 10,
		};
		let token = issue_hmac_token(&claims, "access-secret").unwrap();

		let err = verifier().verify_access(&token).unwrap_err();
		assert_eq!(err, ChatError::TokenExpired);

		let err = verifier().verify_access("v1.garbage.sig").unwrap_err();
		assert_eq!(err.code(), "unauthenticated");
	}

	#[test]
	fn tampered_signature_is_rejected() {
		let v = verifier();
		let token = v.issue_access(UserId::new_v4(), "x@campus.edu").unwrap();
		let mut parts: Vec<&str> = token.split('.').collect();
		let flipped = if parts[2].starts_with('A') { "B" } else { "A" }.to_string() + &parts[2][1..];
		parts[2] = &flipped;

		let err = v.verify_access(&parts.join(".")).unwrap_err();
		assert_eq!(err.code(), "unauthenticated");
	}

	#[test]
	fn access_and_refresh_secrets_do_not_cross() {
		let v = verifier();
		let access = v.issue_access(UserId::new_v4(), "x@campus.edu").unwrap();

		// an access token is not a valid refresh token
		let err = v.verify_refresh(&access).unwrap_err();
		assert_eq!(err.code(), "unauthenticated");

		let claims = AuthClaims {
			sub: UserId::new_v4().to_string(),
			email: "x@campus.edu".to_string(),
			exp: unix_secs_now() + 3600,
		};
		let refresh = issue_hmac_token(&claims, "refresh-secret").unwrap();
		assert!(v.verify_refresh(&refresh).is_ok());
		assert!(v.verify_access(&refresh).is_err());
	}

	#[test]
	fn format_violations_are_unauthenticated() {
		let v = verifier();
		for bad in ["", "v2.a.b", "v1.only-two", "v1.a.b.c.d"] {
			let err = v.verify_access(bad).unwrap_err();
			assert_eq!(err.code(), "unauthenticated", "token: {bad:?}");
		}
	}
}
