//! Routes, handlers and the access gate in front of them

use crate::daemon::access::AccessPolicy;
use crate::daemon::response::{ApiError, Response};
use crate::daemon::ucrednet::ConnectionInfo;
use crate::daemon::Daemon;
use hyper::body::Bytes;
use hyper::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Header through which a client agrees to interactive authorization
pub const ALLOW_INTERACTION_HEADER: &str = "X-Allow-Interaction";

/// A fully read request, bound to the connection it arrived on
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub connection: Option<Arc<ConnectionInfo>>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: None,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            connection: None,
        }
    }

    pub fn with_connection(mut self, connection: Arc<ConnectionInfo>) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        if let Ok(value) = value.parse() {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_slice(&self.body)
            .map_err(|err| ApiError::bad_request(format!("cannot decode request body: {err}")))
    }
}

pub type ResponseFn = Arc<dyn Fn(&Daemon, &Request) -> Response + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Exact(String),
    /// Every path starting with the prefix
    Prefix(String),
}

pub struct Command {
    route: Route,
    get: Option<ResponseFn>,
    put: Option<ResponseFn>,
    post: Option<ResponseFn>,
    read_access: Option<Arc<dyn AccessPolicy>>,
    write_access: Option<Arc<dyn AccessPolicy>>,
}

impl Command {
    fn with_route(route: Route) -> Self {
        Self {
            route,
            get: None,
            put: None,
            post: None,
            read_access: None,
            write_access: None,
        }
    }

    pub fn exact(path: impl Into<String>) -> Self {
        Self::with_route(Route::Exact(path.into()))
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self::with_route(Route::Prefix(prefix.into()))
    }

    pub fn on_get<F>(mut self, f: F) -> Self
    where
        F: Fn(&Daemon, &Request) -> Response + Send + Sync + 'static,
    {
        self.get = Some(Arc::new(f));
        self
    }

    pub fn on_put<F>(mut self, f: F) -> Self
    where
        F: Fn(&Daemon, &Request) -> Response + Send + Sync + 'static,
    {
        self.put = Some(Arc::new(f));
        self
    }

    pub fn on_post<F>(mut self, f: F) -> Self
    where
        F: Fn(&Daemon, &Request) -> Response + Send + Sync + 'static,
    {
        self.post = Some(Arc::new(f));
        self
    }

    /// Policy for GET
    pub fn with_read_access(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.read_access = Some(Arc::new(policy));
        self
    }

    /// Policy for PUT and POST
    pub fn with_write_access(mut self, policy: impl AccessPolicy + 'static) -> Self {
        self.write_access = Some(Arc::new(policy));
        self
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn matches(&self, path: &str) -> bool {
        match &self.route {
            Route::Exact(exact) => path == exact,
            Route::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }

    /// Check access and run the handler for the request's method.
    ///
    /// Panics if the request is not bound to a connection.
    pub fn run(&self, daemon: &Daemon, req: &Request) -> Response {
        let Some(conn) = &req.connection else {
            panic!("no connection associated with request");
        };
        let ucred = conn.ucred().ok();

        let (handler, policy) = if req.method == Method::GET {
            (self.get.as_ref(), self.read_access.as_ref())
        } else if req.method == Method::PUT {
            (self.put.as_ref(), self.write_access.as_ref())
        } else if req.method == Method::POST {
            (self.post.as_ref(), self.write_access.as_ref())
        } else {
            (None, None)
        };

        let method = req.method.as_str();
        let Some(handler) = handler else {
            return ApiError::method_not_allowed(format!("method {method:?} not allowed")).into();
        };
        let Some(policy) = policy else {
            return ApiError::internal(format!("no access checker for method {method:?}")).into();
        };

        let allow_interaction = match req.headers.get(ALLOW_INTERACTION_HEADER) {
            None => false,
            Some(value) => {
                let parsed = value.to_str().ok().and_then(parse_bool);
                if parsed.is_none() {
                    warn!(
                        header = ALLOW_INTERACTION_HEADER,
                        value = ?value,
                        "error parsing header"
                    );
                }
                parsed.unwrap_or(false)
            }
        };

        if let Err(err) = policy.evaluate(ucred.as_ref(), allow_interaction) {
            return err.into();
        }
        handler(daemon, req)
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("route", &self.route)
            .field("get", &self.get.is_some())
            .field("put", &self.put.is_some())
            .field("post", &self.post.is_some())
            .finish_non_exhaustive()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
