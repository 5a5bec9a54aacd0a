pub mod cache;
pub mod client;
pub mod error;
pub mod pagination;

pub use cache::{CachedResponse, ResponseCache};
pub use client::{ApiClient, BackoffPolicy, Sleeper, TokioSleeper};
pub use error::ApiError;
pub use pagination::{Page, fetch_all};
