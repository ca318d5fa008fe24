pub mod admission; // request admission gate (origin, bypass, quota)
pub mod config;
pub mod cors; // cross-origin response headers
pub mod endpoints; // API endpoints
pub mod error; // error handling
pub mod gateway_util; // utilities for gateway
pub mod origin; // origin validation policy
pub mod quota; // per-client usage tracking against the quota store
