//! Network side of the interceptor: request/response values and the fetcher
//! that talks to origin servers.

mod client;
#[cfg(test)]
pub mod mock;
mod types;

pub use client::{Fetcher, HttpFetcher};
pub use types::{Request, RequestKey, RequestMode, Response, ResponseType};
