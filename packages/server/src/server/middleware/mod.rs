mod api_key;
mod rate_limit;

pub use api_key::{require_api_key, ApiKeyValidator};
pub use rate_limit::{RateLimited, RateLimiter};
