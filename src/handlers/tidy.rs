use super::{Request, Response};
use crate::backend::Backend;
use crate::error::Result;
use crate::tidy::{start_tidy, TidyConfig, TIDY_FIELDS};
use std::sync::Arc;

/// Starts a background tidy; progress is reported by `tidy-status`.
pub async fn tidy(backend: &Arc<Backend>, req: &Request) -> Result<Response> {
    let data = req.fields(TIDY_FIELDS)?;
    let config = TidyConfig::default().merge(&data)?;
    start_tidy(backend.clone(), config)?;
    Ok(Response::empty()
        .with_status(202)
        .with_warning("Tidy operation successfully started. Any information from the operation will be printed to the server logs."))
}

pub async fn tidy_status(backend: &Arc<Backend>) -> Result<Response> {
    Ok(Response::data(backend.tidy().status(backend)))
}

pub async fn tidy_cancel(backend: &Arc<Backend>) -> Result<Response> {
    if !backend.tidy().cancel() {
        return Ok(Response::empty()
            .with_warning("Tidy operation cannot be cancelled as none is currently running."));
    }
    Ok(Response::data(backend.tidy().status(backend)))
}
