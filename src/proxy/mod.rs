//! Proxy server implementations and destination filtering.

pub mod http;
pub mod matcher;
pub mod relay;
pub mod socks5;

pub use http::HttpProxy;
pub use matcher::{FilterDecision, HostFilter, HostPattern};
pub use socks5::Socks5Proxy;
