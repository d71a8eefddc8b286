pub mod error;
pub mod http;
pub mod phone;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod signature;
pub mod token_cache;
pub mod types;
