pub mod http;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use http::HttpBackend;
pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
