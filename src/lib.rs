//! # upcall - a resilient HTTP client core
//!
//! upcall turns a rate-limited, token-authenticated REST API into a predictable
//! call surface. Every call goes through the same pipeline:
//!
//! 1. a bearer token is obtained or reused ([`token`])
//! 2. the circuit breaker may reject the call outright ([`circuit_breaker`])
//! 3. mutating calls to sensitive create endpoints get an idempotency key ([`idempotency`])
//! 4. the request is sent and retried according to the [`retry`] policy
//! 5. the outcome is recorded back into the breaker
//!
//! ## Quick Start
//!
//! ```no_run
//! use upcall::{Client, Context, Credentials};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct CreateBeneficiary {
//!     nickname: String,
//! }
//!
//! #[derive(Deserialize)]
//! struct Beneficiary {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), upcall::Error> {
//!     let client = Client::builder()
//!         .base_url("https://api.example.com")?
//!         .credentials(Credentials::new("my-client-id", "my-api-key"))
//!         .timeout(Duration::from_secs(30))
//!         .build()?;
//!
//!     // Cancelling ctx (or letting it time out) stops the call, retries included.
//!     let ctx = Context::new().with_timeout(Duration::from_secs(120));
//!
//!     let created = client
//!         .post::<_, Beneficiary>(
//!             &ctx,
//!             "/api/v1/beneficiaries/create",
//!             &CreateBeneficiary { nickname: "Alice".to_string() },
//!         )
//!         .await?;
//!     println!("Created {} after {} attempt(s)", created.data.id, created.attempts);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Retries
//!
//! | Response | GET / HEAD / OPTIONS | POST / PUT / PATCH / DELETE |
//! |---|---|---|
//! | 429 | up to 3 retries | up to 3 retries |
//! | 5xx | 1 retry | returned as-is |
//! | other | returned as-is | returned as-is |
//!
//! A `Retry-After` header on a 429 is honored (seconds or HTTP-date); otherwise the
//! wait grows exponentially with jitter. Request bodies are serialized once and
//! replayed byte-for-byte.
//!
//! ## Error Handling
//!
//! ```no_run
//! use upcall::{Client, Context, Error};
//!
//! # async fn example(client: Client) {
//! let ctx = Context::new();
//! match client.get::<serde_json::Value>(&ctx, "/api/v1/transfers").await {
//!     Ok(response) => println!("{:?}", response.data),
//!     Err(Error::CircuitOpen { retry_in, .. }) => eprintln!("API down, retry in {:?}", retry_in),
//!     Err(Error::Authentication { message, .. }) => eprintln!("login failed: {}", message),
//!     Err(Error::Api { status, error }) => eprintln!("{}: {}", status, error),
//!     Err(e) if e.is_cancellation() => eprintln!("cancelled"),
//!     Err(e) => eprintln!("{}", e),
//! }
//! # }
//! ```

pub mod circuit_breaker;
mod client;
mod context;
mod error;
pub mod idempotency;
pub mod metadata;
mod response;
pub mod retry;
pub mod retry_after;
pub mod token;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use client::{Client, ClientBuilder, TransportConfig, API_VERSION_HEADER, DEFAULT_API_VERSION};
pub use context::Context;
pub use error::{ApiError, Error, ErrorDetails, FieldError, Result};
pub use idempotency::{IdempotencyKey, IDEMPOTENCY_KEY_HEADER};
pub use metadata::RequestMetadata;
pub use response::{RawResponse, Response};
pub use retry::{Backoff, RetryPolicy};
pub use token::Credentials;
