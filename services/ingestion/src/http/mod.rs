pub mod meta;
pub mod reports;
pub mod response;
pub mod sessions;
pub mod sse;
