//! A storage-backed X.509 certificate authority engine: CA lifecycle,
//! role-governed issuance, revocation with CRLs, tidy and ACME account
//! management behind a path router and an HTTP front end.

pub mod acme;
pub mod api;
pub mod authoring;
pub mod backend;
pub mod certutil;
pub mod config;
pub mod counter;
pub mod creation;
pub mod error;
pub mod fields;
pub mod handlers;
pub mod metrics;
pub mod revocation;
pub mod role;
pub mod storage;
pub mod tidy;

pub use backend::Backend;
pub use config::Config;
pub use error::{PkiError, Result};
pub use handlers::{handle_request, Operation, Request, Response};
