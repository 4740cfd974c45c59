//! Library crate for edge-scan-rs exposing the scanning engine modules.
pub mod diagnostics;
pub mod enrich;
pub mod fragment;
pub mod probe;
pub mod ranges;
pub mod resolvers;
pub mod scanner;
pub mod server;
pub mod types;
pub mod update;
