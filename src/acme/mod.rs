//! ACME error taxonomy and the persisted account state behind the
//! management endpoints.

pub mod accounts;
pub mod errors;

pub use accounts::{
    list_account_key_ids, read_account, update_account_status, AccountStatus, AcmeAccount,
    AcmeOrder, EabBinding, OrderStatus,
};
pub use errors::{translate_error, AcmeError, AcmeErrorType, ProblemDocument};
