#![forbid(unsafe_code)]

use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use huddle_domain::{SecretString, UserId};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("missing auth token")]
	MissingToken,
	#[error("invalid token format")]
	InvalidFormat,
	#[error("invalid token signature")]
	InvalidSignature,
	#[error("malformed token claims: {0}")]
	MalformedClaims(String),
	#[error("token expired")]
	Expired,
	#[error("token subject does not match claimed identity")]
	IdentityMismatch,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthClaims {
	sub: String,
	exp: u64,
}

/// Verifies the identity claimed on join.
///
/// With an HMAC secret configured, joins require a `v1.<payload>.<sig>`
/// stateless token whose `sub` matches the claimed user id. Without one the
/// claimed identity is trusted at face value, matching the original system's
/// behavior; that mode is a known gap, kept behind configuration.
#[derive(Debug, Clone, Default)]
pub struct IdentityVerifier {
	hmac_secret: Option<SecretString>,
}

impl IdentityVerifier {
	pub fn new(hmac_secret: Option<SecretString>) -> Self {
		Self { hmac_secret }
	}

	/// Trust-on-join verifier with no token requirement.
	#[allow(dead_code)]
	pub fn permissive() -> Self {
		Self::default()
	}

	pub fn requires_token(&self) -> bool {
		self.hmac_secret.is_some()
	}

	/// Resolve the identity a join may bind. Returns the verified identity,
	/// which is always the claimed one when verification passes.
	pub fn verify_join(&self, claimed: &UserId, token: &str) -> Result<UserId, AuthError> {
		let Some(secret) = self.hmac_secret.as_ref() else {
			return Ok(claimed.clone());
		};

		let token = token.trim();
		if token.is_empty() {
			return Err(AuthError::MissingToken);
		}

		let claims = verify_hmac_token(token, secret.expose())?;
		if claims.sub != claimed.as_str() {
			return Err(AuthError::IdentityMismatch);
		}

		Ok(claimed.clone())
	}
}

fn verify_hmac_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::InvalidFormat);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::InvalidFormat)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::InvalidFormat)?;

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::InvalidSignature);
	}

	let claims: AuthClaims =
		serde_json::from_slice(&payload).map_err(|e| AuthError::MalformedClaims(e.to_string()))?;
	let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
	if claims.exp <= now {
		return Err(AuthError::Expired);
	}

	Ok(claims)
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
