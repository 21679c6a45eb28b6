pub mod chunker;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod media;
pub mod model;
pub mod outbox;
pub mod receiver;
pub mod signer;
pub mod store;
pub mod translate;
