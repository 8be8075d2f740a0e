pub mod budget;
pub mod cache;
pub mod cancel;
pub mod cipher;
pub mod content;
pub mod error;
pub mod keyring;
pub mod labels;
pub mod lifecycle;
pub mod models;
pub mod service;
pub mod store;
