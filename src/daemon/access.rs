//! Access policies consulted before a command handler runs

use crate::daemon::response::ApiError;
use crate::daemon::ucrednet::Ucred;

/// Decides whether a peer may use a command.
///
/// `ucred` is `None` when the connection carries no usable identity, so
/// policies requiring one must deny in that case.
pub trait AccessPolicy: Send + Sync {
    fn evaluate(&self, ucred: Option<&Ucred>, allow_interaction: bool) -> Result<(), ApiError>;
}

/// Anyone, with or without identity
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess;

impl AccessPolicy for OpenAccess {
    fn evaluate(&self, _ucred: Option<&Ucred>, _allow_interaction: bool) -> Result<(), ApiError> {
        Ok(())
    }
}

/// Only peers running as uid 0
#[derive(Debug, Clone, Copy, Default)]
pub struct RootAccess;

impl AccessPolicy for RootAccess {
    fn evaluate(&self, ucred: Option<&Ucred>, _allow_interaction: bool) -> Result<(), ApiError> {
        match ucred {
            Some(ucred) if ucred.uid == 0 => Ok(()),
            _ => Err(ApiError::forbidden("access denied")),
        }
    }
}

/// Policy backed by a closure
pub struct PolicyFn<F>(pub F);

impl<F> AccessPolicy for PolicyFn<F>
where
    F: Fn(Option<&Ucred>, bool) -> Result<(), ApiError> + Send + Sync,
{
    fn evaluate(&self, ucred: Option<&Ucred>, allow_interaction: bool) -> Result<(), ApiError> {
        (self.0)(ucred, allow_interaction)
    }
}
