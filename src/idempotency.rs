//! Idempotency keys for financially sensitive create calls.
//!
//! A POST to one of the [`IDEMPOTENT_CREATE_SUFFIXES`] gets an
//! `x-idempotency-key` header. The key is generated once per logical call and sent
//! unchanged on every retry, so the API can recognize replays.

use http::Method;
use rand::RngCore;
use std::fmt;

/// Header carrying the idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

/// Path suffixes of create endpoints that move money or issue instruments.
pub const IDEMPOTENT_CREATE_SUFFIXES: &[&str] = &[
    "/transfers/create",
    "/batch_transfers/create",
    "/issuing/cards/create",
    "/issuing/cardholders/create",
    "/beneficiaries/create",
    "/fx/conversions/create",
    "/linked_accounts/create",
    "/pa/payment_links/create",
    "/pa/payment_intents/create",
    "/pa/refunds/create",
    "/deposits/create",
    "/global_accounts/create",
];

/// 16 random bytes, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns `true` if a call with this method and path must carry an idempotency key.
///
/// Query string and fragment are ignored. The suffix must match exactly, so
/// decorated endpoints such as `/transfers/create-preview` do not qualify.
///
/// # Examples
///
/// ```
/// use upcall::idempotency::requires_idempotency_key;
/// use http::Method;
///
/// assert!(requires_idempotency_key(&Method::POST, "/api/v1/transfers/create"));
/// assert!(requires_idempotency_key(&Method::POST, "/api/v1/transfers/create?dry=false"));
/// assert!(!requires_idempotency_key(&Method::POST, "/api/v1/transfers/create-preview"));
/// assert!(!requires_idempotency_key(&Method::GET, "/api/v1/transfers/create"));
/// ```
pub fn requires_idempotency_key(method: &Method, path: &str) -> bool {
    if *method != Method::POST {
        return false;
    }
    let path = strip_query(path);
    IDEMPOTENT_CREATE_SUFFIXES
        .iter()
        .any(|suffix| path.ends_with(suffix))
}

/// Generates a key when the call requires one.
pub fn key_for(method: &Method, path: &str) -> Option<IdempotencyKey> {
    requires_idempotency_key(method, path).then(IdempotencyKey::generate)
}

fn strip_query(path: &str) -> &str {
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}
