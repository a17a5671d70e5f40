pub mod accounting;
pub mod app;
pub mod config;
pub mod convert;
pub mod domain;
pub mod error;
pub mod intake;
pub mod metadata;
pub mod output;
pub mod store;
