use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    /// The object changed since it was read; the caller must re-run its whole pass.
    #[error("conflict writing {key}: object was modified concurrently")]
    Conflict { key: String },

    #[error("{key} already exists")]
    AlreadyExists { key: String },

    #[error("maximum pipeline count limit exceeded")]
    MaxPipelinesExceeded,

    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

fn find_in_chain(err: &anyhow::Error, pred: impl Fn(&ControllerError) -> bool) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ControllerError>())
        .any(pred)
}

pub fn is_conflict(err: &anyhow::Error) -> bool {
    find_in_chain(err, |e| matches!(e, ControllerError::Conflict { .. }))
}

pub fn is_already_exists(err: &anyhow::Error) -> bool {
    find_in_chain(err, |e| matches!(e, ControllerError::AlreadyExists { .. }))
}

pub fn is_max_pipelines_exceeded(err: &anyhow::Error) -> bool {
    find_in_chain(err, |e| matches!(e, ControllerError::MaxPipelinesExceeded))
}

/// Attach a status-update failure to an earlier error without hiding either of them.
///
/// The earlier error stays the root of the chain so callers can still match on it.
pub fn merge_status_error(err: Option<anyhow::Error>, status_err: anyhow::Error) -> anyhow::Error {
    match err {
        Some(err) => err.context(format!("failed while updating status: {status_err:#}")),
        None => status_err.context("failed to update status"),
    }
}
