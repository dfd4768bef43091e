//! Request routing.
//!
//! A [`Router`] resolves an [`Identifier`] to a registered value through
//! three indexes, tried in order:
//!
//! 1. numeric command IDs (zero means absent);
//! 2. `service + path` for RPC requests that carry no HTTP method;
//! 3. `method + path`: exact paths first, then the prefix tree of
//!    parameterised templates, for the request's method and then for
//!    [`Method::Any`].
//!
//! When nothing matches, the fallback set with [`Router::set_no_route`] is
//! used, or [`RouterError::NoRoute`] is returned.

mod tree;

use std::collections::HashMap;

use log::debug;
use thiserror::Error;
use tree::Node;

use crate::packet::{Identifier, Method, Params};

/// Errors produced while registering or resolving routes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum RouterError {
    /// A route with the same key was already registered.
    #[error("route {0} was already registered")]
    DuplicateRoute(String),
    /// A template binds a different name at a position another template
    /// already uses.
    #[error("route {0} conflicts with an existing template")]
    Conflict(String),
    /// A template is malformed, such as an unnamed parameter or a wildcard
    /// that is not the last segment.
    #[error("invalid route template {0}")]
    InvalidPattern(String),
    /// Command ID zero cannot be registered.
    #[error("command id 0 is reserved")]
    ReservedCommand,
    /// Nothing matched the request.
    #[error("no route for {0}")]
    NoRoute(String),
}

/// Key a route is registered under.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// Numeric command ID.
    Command(u32),
    /// RPC service and path.
    Service { service: String, path: String },
    /// HTTP method and path template.
    Path { method: Method, template: String },
}

impl RouteKey {
    /// Key for command `cmd_id`.
    #[must_use]
    pub fn command(cmd_id: u32) -> Self { Self::Command(cmd_id) }

    /// Key for `path` on `service`. An empty service matches requests that
    /// name none.
    #[must_use]
    pub fn service(service: impl Into<String>, path: impl Into<String>) -> Self {
        Self::Service {
            service: service.into(),
            path: normalize(&path.into()),
        }
    }

    /// Key for `template` under `method`.
    #[must_use]
    pub fn path(method: Method, template: impl Into<String>) -> Self {
        Self::Path {
            method,
            template: normalize(&template.into()),
        }
    }
}

/// Value and parameters produced by a successful resolution.
#[derive(Clone, Debug)]
pub struct Match<T> {
    pub value: T,
    pub params: Params,
}

/// Route index over values of type `T`.
#[derive(Debug)]
pub struct Router<T> {
    commands: HashMap<u32, T>,
    services: HashMap<(String, String), T>,
    statics: HashMap<(Method, String), T>,
    trees: HashMap<Method, Node<T>>,
    no_route: Option<T>,
    len: usize,
}

impl<T> Default for Router<T> {
    fn default() -> Self {
        Self {
            commands: HashMap::new(),
            services: HashMap::new(),
            statics: HashMap::new(),
            trees: HashMap::new(),
            no_route: None,
            len: 0,
        }
    }
}

impl<T: Clone> Router<T> {
    /// Empty router.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Register `value` under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::DuplicateRoute`] for a key already present,
    /// [`RouterError::Conflict`] or [`RouterError::InvalidPattern`] for a
    /// template the prefix tree cannot hold, and
    /// [`RouterError::ReservedCommand`] for command ID zero.
    pub fn insert(&mut self, key: RouteKey, value: T) -> Result<(), RouterError> {
        match key {
            RouteKey::Command(0) => return Err(RouterError::ReservedCommand),
            RouteKey::Command(cmd_id) => {
                if self.commands.contains_key(&cmd_id) {
                    return Err(RouterError::DuplicateRoute(format!("cmd {cmd_id}")));
                }
                self.commands.insert(cmd_id, value);
                debug!("route registered: cmd {cmd_id}");
            }
            RouteKey::Service { service, path } => {
                let key = (service, path);
                if self.services.contains_key(&key) {
                    return Err(RouterError::DuplicateRoute(format!("{}{}", key.0, key.1)));
                }
                debug!("route registered: service={:?}, path={}", key.0, key.1);
                self.services.insert(key, value);
            }
            RouteKey::Path { method, template } if tree::is_dynamic(&template) => {
                let segs = tree::parse(&template)?;
                self.trees.entry(method).or_default().insert(&template, &segs, value)?;
                debug!("route registered: {method} {template}");
            }
            RouteKey::Path { method, template } => {
                if self.statics.contains_key(&(method, template.clone())) {
                    return Err(RouterError::DuplicateRoute(format!("[{method}]{template}")));
                }
                debug!("route registered: {method} {template}");
                self.statics.insert((method, template), value);
            }
        }
        self.len += 1;
        Ok(())
    }

    /// Value used when nothing else matches.
    pub fn set_no_route(&mut self, value: T) { self.no_route = Some(value); }

    /// Number of registered routes, excluding the fallback.
    #[must_use]
    pub fn len(&self) -> usize { self.len }

    /// Whether no route is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len == 0 }

    /// Resolve `ident` to a registered value.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::NoRoute`] when nothing matches and no fallback
    /// is set.
    pub fn resolve(&self, ident: &Identifier) -> Result<Match<T>, RouterError> {
        if let Some(value) = self.lookup(ident) {
            return Ok(value);
        }
        self.no_route
            .clone()
            .map(|value| Match {
                value,
                params: Params::default(),
            })
            .ok_or_else(|| RouterError::NoRoute(describe(ident)))
    }

    fn lookup(&self, ident: &Identifier) -> Option<Match<T>> {
        let found = |value: &T| Match {
            value: value.clone(),
            params: Params::default(),
        };
        if ident.cmd_id != 0
            && let Some(value) = self.commands.get(&ident.cmd_id)
        {
            return Some(found(value));
        }
        let path = normalize(ident.path());
        if ident.method.is_none()
            && let Some(value) = self.services.get(&(ident.service.clone(), path.clone()))
        {
            return Some(found(value));
        }
        let methods = match ident.method {
            Some(Method::Any) | None => vec![Method::Any],
            Some(method) => vec![method, Method::Any],
        };
        methods.into_iter().find_map(|method| self.lookup_path(method, &path))
    }

    fn lookup_path(&self, method: Method, path: &str) -> Option<Match<T>> {
        if let Some(value) = self.statics.get(&(method, path.to_owned())) {
            return Some(Match {
                value: value.clone(),
                params: Params::default(),
            });
        }
        let node = self.trees.get(&method)?;
        let segs: Vec<&str> = tree::segments(path).collect();
        let mut bound = Vec::new();
        let value = node.find(&segs, &mut bound)?;
        let mut params = Params::default();
        for (name, value) in bound {
            params.push(name, value);
        }
        Some(Match { value, params })
    }
}

fn describe(ident: &Identifier) -> String {
    match (ident.cmd_id, ident.method) {
        (0, Some(method)) => format!("{method} {}", ident.path()),
        (0, None) if ident.service.is_empty() => ident.path().to_owned(),
        (0, None) => format!("{}{}", ident.service, ident.path()),
        (cmd_id, _) => format!("cmd {cmd_id}"),
    }
}

/// Route paths compare without trailing slashes. RPC method names such as
/// `onPing` keep their bare form.
fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}
