//! Default route table: the change endpoints

use crate::daemon::access::{OpenAccess, RootAccess};
use crate::daemon::command::{Command, Request};
use crate::daemon::response::{sync_response, ApiError, Response};
use crate::daemon::Daemon;
use serde::Deserialize;
use tracing::info;

const CHANGES_PATH: &str = "/v1/changes";
const CHANGE_PREFIX: &str = "/v1/changes/";

pub fn default_commands() -> Vec<Command> {
    vec![
        Command::exact(CHANGES_PATH)
            .on_get(get_changes)
            .with_read_access(OpenAccess),
        Command::prefix(CHANGE_PREFIX)
            .on_get(get_change)
            .with_read_access(OpenAccess)
            .on_post(post_change)
            .with_write_access(RootAccess),
    ]
}

fn change_id(req: &Request) -> &str {
    req.path.strip_prefix(CHANGE_PREFIX).unwrap_or_default()
}

fn get_changes(daemon: &Daemon, _req: &Request) -> Response {
    let st = daemon.state().lock();
    sync_response(st.changes())
}

fn get_change(daemon: &Daemon, req: &Request) -> Response {
    let id = change_id(req);
    let st = daemon.state().lock();
    match st.change(id) {
        Some(chg) => sync_response(chg),
        None => ApiError::not_found(format!("cannot find change with id {id:?}")).into(),
    }
}

#[derive(Debug, Deserialize)]
struct ChangeAction {
    action: String,
}

fn post_change(daemon: &Daemon, req: &Request) -> Response {
    let id = change_id(req);
    let action: ChangeAction = match req.json() {
        Ok(action) => action,
        Err(err) => return err.into(),
    };

    let mut st = daemon.state().lock();
    let Some(chg) = st.change_mut(id) else {
        return ApiError::not_found(format!("cannot find change with id {id:?}")).into();
    };
    if action.action != "abort" {
        return ApiError::bad_request(format!(
            "change action {:?} is unsupported",
            action.action
        ))
        .into();
    }
    if !chg.abort() {
        return ApiError::bad_request(format!("cannot abort change {id} with nothing pending"))
            .into();
    }
    info!(id, "Change aborted");
    sync_response(&*chg)
}
