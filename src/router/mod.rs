//! Request routing: a segment trie mapping `(method, path)` to handlers.
//!
//! Patterns are split on `/` into non-empty segments, each classified as:
//!
//! | Segment   | Kind     | Example pattern      | Example match              | Captured params                 |
//! |-----------|----------|----------------------|----------------------------|---------------------------------|
//! | `users`   | literal  | `/users`             | `/users`                   | *(none)*                        |
//! | `:id`     | param    | `/users/:id`         | `/users/42`                | `id → "42"`                     |
//! | `*`       | wildcard | `/files/*`           | `/files/docs/readme.txt`   | `* → "docs/readme.txt"`         |
//!
//! Leading, trailing and repeated slashes are ignored on both patterns and
//! incoming paths, so `/users/`, `//users` and `/users` are equivalent.
//!
//! At every level the literal child is tried first, then the param child, then
//! the wildcard child. There is no backtracking: once a branch is taken, a dead
//! end further down fails the whole match. A wildcard is greedy and binds the
//! remaining path (one or more segments, joined with `/`) under the key `"*"`;
//! it never matches an empty remainder.
//!
//! Registering the same `(method, pattern)` twice replaces the earlier handler.
//!
//! A `Router` is built with `&mut self` registration calls and then served
//! through `&self` only, so once it has been handed to a [`Pipeline`] (or
//! wrapped in an `Arc`) its topology is frozen and lookups need no locking.
//!
//! [`Pipeline`]: crate::middleware::Pipeline

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::debug;

use crate::error::DispatchError;
use crate::handler::{BoxFuture, BoxHandler, Handler, boxed};
use crate::http::PathParams;
use crate::{Method, Request, Response};

/// The parameter key a wildcard segment binds.
pub const WILDCARD_KEY: &str = "*";

/// Errors rejected at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("wildcard `*` must be the last segment of `{pattern}`")]
    WildcardNotTerminal { pattern: String },

    #[error("parameter segment in `{pattern}` has no name")]
    EmptyParamName { pattern: String },

    #[error("parameter `:{requested}` conflicts with existing `:{existing}` at the same position")]
    ConflictingParam { existing: String, requested: String },
}

/// A successful lookup: the handler registered for the method plus the
/// parameters bound along the way.
#[derive(Clone)]
pub struct RouteMatch {
    pub handler: BoxHandler,
    pub params: PathParams,
}

impl std::fmt::Debug for RouteMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteMatch")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

// Classification of one pattern segment.
enum SegmentKind<'a> {
    Literal(&'a str),
    Param(&'a str),
    Wildcard,
}

fn classify(segment: &str) -> SegmentKind<'_> {
    if segment == WILDCARD_KEY {
        SegmentKind::Wildcard
    } else if let Some(name) = segment.strip_prefix(':') {
        SegmentKind::Param(name)
    } else {
        SegmentKind::Literal(segment)
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

// One level of the trie. A node owns any number of literal children keyed by
// exact segment text, at most one param child and at most one wildcard child.
#[derive(Default)]
struct RouteNode {
    segment: String,
    param_name: Option<String>,
    is_wildcard: bool,
    handlers: BTreeMap<Method, BoxHandler>,
    children: HashMap<String, RouteNode>,
    param_child: Option<Box<RouteNode>>,
    wildcard_child: Option<Box<RouteNode>>,
}

impl RouteNode {
    fn literal(segment: &str) -> Self {
        Self {
            segment: segment.to_owned(),
            ..Self::default()
        }
    }

    fn param(name: &str) -> Self {
        Self {
            segment: format!(":{name}"),
            param_name: Some(name.to_owned()),
            ..Self::default()
        }
    }

    fn wildcard() -> Self {
        Self {
            segment: WILDCARD_KEY.to_owned(),
            is_wildcard: true,
            ..Self::default()
        }
    }

    fn allowed(&self) -> Vec<Method> {
        self.handlers.keys().cloned().collect()
    }
}

/// Radix-tree HTTP router.
///
/// # Examples
///
/// ```rust
/// use switchyard::{Method, Request, Response, Router, StatusCode};
///
/// let mut router = Router::new();
/// router.get("/ping", |_req: Request| async { Response::new(StatusCode::Ok) }).unwrap();
/// router.get("/users/:id", |req: Request| async move {
///     let id = req.param("id").unwrap_or("unknown").to_owned();
///     Response::new(StatusCode::Ok).body(id)
/// }).unwrap();
///
/// let hit = router.match_route(&Method::Get, "/users/42").unwrap();
/// assert_eq!(hit.params.get("id"), Some("42"));
/// ```
pub struct Router {
    root: RouteNode,
    len: usize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Create a new, empty `Router` with no registered routes.
    pub fn new() -> Self {
        Self {
            root: RouteNode::literal(""),
            len: 0,
        }
    }

    /// Register `handler` for `method` on `pattern`.
    ///
    /// Re-registering an existing `(method, pattern)` pair replaces its handler;
    /// the last registration wins.
    ///
    /// # Errors
    ///
    /// - [`PatternError::WildcardNotTerminal`]: `*` appears before the last segment.
    /// - [`PatternError::EmptyParamName`]: a bare `:` segment.
    /// - [`PatternError::ConflictingParam`]: a different param name was already
    ///   registered at the same position.
    pub fn add_route(
        &mut self,
        method: impl Into<Method>,
        pattern: &str,
        handler: impl Handler,
    ) -> Result<&mut Self, PatternError> {
        let method = method.into();
        let parts: Vec<&str> = segments(pattern).collect();
        let mut node = &mut self.root;

        for (i, segment) in parts.iter().enumerate() {
            node = match classify(segment) {
                SegmentKind::Literal(text) => node
                    .children
                    .entry(text.to_owned())
                    .or_insert_with(|| RouteNode::literal(text)),
                SegmentKind::Param(name) => {
                    if name.is_empty() {
                        return Err(PatternError::EmptyParamName {
                            pattern: pattern.to_owned(),
                        });
                    }
                    let existing = node
                        .param_child
                        .as_ref()
                        .and_then(|child| child.param_name.as_deref());
                    if let Some(existing) = existing.filter(|existing| *existing != name) {
                        return Err(PatternError::ConflictingParam {
                            existing: existing.to_owned(),
                            requested: name.to_owned(),
                        });
                    }
                    &mut **node
                        .param_child
                        .get_or_insert_with(|| Box::new(RouteNode::param(name)))
                }
                SegmentKind::Wildcard => {
                    if i + 1 != parts.len() {
                        return Err(PatternError::WildcardNotTerminal {
                            pattern: pattern.to_owned(),
                        });
                    }
                    &mut **node
                        .wildcard_child
                        .get_or_insert_with(|| Box::new(RouteNode::wildcard()))
                }
            };
        }

        if node.handlers.insert(method.clone(), boxed(handler)).is_some() {
            debug!(%method, pattern, "route handler replaced");
        } else {
            self.len += 1;
            debug!(%method, pattern, segment = %node.segment, wildcard = node.is_wildcard, "route registered");
        }
        Ok(self)
    }

    /// Register a handler for `GET` requests matching `path`.
    pub fn get(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, PatternError> {
        self.add_route(Method::Get, path, handler)
    }

    /// Register a handler for `POST` requests matching `path`.
    pub fn post(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, PatternError> {
        self.add_route(Method::Post, path, handler)
    }

    /// Register a handler for `PUT` requests matching `path`.
    pub fn put(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, PatternError> {
        self.add_route(Method::Put, path, handler)
    }

    /// Register a handler for `DELETE` requests matching `path`.
    pub fn delete(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, PatternError> {
        self.add_route(Method::Delete, path, handler)
    }

    /// Register a handler for `OPTIONS` requests matching `path`.
    pub fn options(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, PatternError> {
        self.add_route(Method::Options, path, handler)
    }

    /// Register a handler for `PATCH` requests matching `path`.
    pub fn patch(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, PatternError> {
        self.add_route(Method::Patch, path, handler)
    }

    /// Register a handler for `HEAD` requests matching `path`.
    pub fn head(&mut self, path: &str, handler: impl Handler) -> Result<&mut Self, PatternError> {
        self.add_route(Method::Head, path, handler)
    }

    /// Return the number of distinct `(method, pattern)` registrations.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Return `true` if no routes have been registered.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Look up the handler for `method` on `path`.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::RouteNotFound`]: no node matches the path, or the
    ///   matching node has no handlers at all.
    /// - [`DispatchError::MethodNotAllowed`]: the path matches but `method` is
    ///   not registered there; `allowed` lists the methods that are.
    pub fn match_route(&self, method: &Method, path: &str) -> Result<RouteMatch, DispatchError> {
        let parts: Vec<&str> = segments(path).collect();
        let mut node = &self.root;
        let mut params = PathParams::new();
        let not_found = || DispatchError::RouteNotFound {
            path: path.to_owned(),
        };

        let mut i = 0;
        while i < parts.len() {
            let segment = parts[i];
            if let Some(child) = node.children.get(segment) {
                node = child;
            } else if let Some(child) = node.param_child.as_deref() {
                if let Some(name) = &child.param_name {
                    params.insert(name.as_str(), segment);
                }
                node = child;
            } else if let Some(child) = node.wildcard_child.as_deref() {
                params.insert(WILDCARD_KEY, parts[i..].join("/"));
                node = child;
                break;
            } else {
                return Err(not_found());
            }
            i += 1;
        }

        if node.handlers.is_empty() {
            return Err(not_found());
        }

        match node.handlers.get(method) {
            Some(handler) => Ok(RouteMatch {
                handler: handler.clone(),
                params,
            }),
            None => Err(DispatchError::MethodNotAllowed {
                allowed: node.allowed(),
            }),
        }
    }

    /// Dispatch `request` to its matching handler.
    ///
    /// Misses become `404 Not Found` or `405 Method Not Allowed` (with an
    /// `Allow` header) responses.
    pub async fn route(&self, request: Request) -> Response {
        self.call(request).await
    }
}

impl Handler for Router {
    fn call(&self, mut request: Request) -> BoxFuture<Response> {
        match self.match_route(request.method(), request.path()) {
            Ok(RouteMatch { handler, params }) => {
                request.set_params(params);
                handler.call(request)
            }
            Err(err) => {
                debug!(method = %request.method(), path = request.path(), error = %err, "route miss");
                Box::pin(std::future::ready(err.into_response()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StatusCode;

    fn make_request(method: &str, path: &str) -> Request {
        let raw = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
        let (req, _) = Request::parse(raw.as_bytes()).unwrap();
        req
    }

    fn tagged(tag: &'static str) -> impl Handler {
        move |_req: Request| async move { Response::new(StatusCode::Ok).body(tag) }
    }

    async fn tag_of(router: &Router, method: &str, path: &str) -> String {
        router.route(make_request(method, path)).await.text()
    }

    // ── registration ──────────────────────────────────────────────────────────

    #[test]
    fn router_starts_empty() {
        let router = Router::new();
        assert!(router.is_empty());
        assert_eq!(router.len(), 0);
    }

    #[test]
    fn router_len_counts_distinct_registrations() {
        let mut router = Router::new();
        router.get("/a", tagged("a")).unwrap();
        router.post("/a", tagged("a")).unwrap();
        router.get("/a/", tagged("again")).unwrap();
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn wildcard_must_be_last() {
        let mut router = Router::new();
        let err = router.get("/files/*/meta", tagged("x")).err();
        assert!(matches!(err, Some(PatternError::WildcardNotTerminal { .. })));
    }

    #[test]
    fn empty_param_name_rejected() {
        let mut router = Router::new();
        let err = router.get("/users/:", tagged("x")).err();
        assert!(matches!(err, Some(PatternError::EmptyParamName { .. })));
    }

    #[test]
    fn conflicting_param_names_rejected() {
        let mut router = Router::new();
        router.get("/users/:id", tagged("x")).unwrap();
        let err = router.get("/users/:uid/posts", tagged("y")).err();
        assert_eq!(
            err,
            Some(PatternError::ConflictingParam {
                existing: "id".into(),
                requested: "uid".into()
            })
        );
        // The same name at the same position is fine.
        router.get("/users/:id/posts", tagged("z")).unwrap();
    }

    // ── matching ──────────────────────────────────────────────────────────────

    #[test]
    fn param_binding() {
        let mut router = Router::new();
        router.get("/users/:id", tagged("user")).unwrap();
        let hit = router.match_route(&Method::Get, "/users/42").unwrap();
        assert_eq!(hit.params.get("id"), Some("42"));
        assert_eq!(hit.params.len(), 1);
    }

    #[test]
    fn multi_param_binding() {
        let mut router = Router::new();
        router.get("/users/:id/posts/:post_id", tagged("post")).unwrap();
        let hit = router.match_route(&Method::Get, "/users/7/posts/99").unwrap();
        assert_eq!(hit.params.get("id"), Some("7"));
        assert_eq!(hit.params.get("post_id"), Some("99"));
    }

    #[test]
    fn slashes_are_normalized() {
        let mut router = Router::new();
        router.get("users//list/", tagged("list")).unwrap();
        assert!(router.match_route(&Method::Get, "/users/list").is_ok());
        assert!(router.match_route(&Method::Get, "//users/list//").is_ok());
    }

    #[test]
    fn root_route() {
        let mut router = Router::new();
        router.get("/", tagged("root")).unwrap();
        assert!(router.match_route(&Method::Get, "/").is_ok());
        assert!(router.match_route(&Method::Get, "").is_ok());
        assert!(matches!(
            router.match_route(&Method::Get, "/other"),
            Err(DispatchError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn wildcard_captures_remaining_path() {
        let mut router = Router::new();
        router.get("/files/*", tagged("files")).unwrap();
        let hit = router
            .match_route(&Method::Get, "/files/docs/2024/readme.txt")
            .unwrap();
        assert_eq!(hit.params.get("*"), Some("docs/2024/readme.txt"));

        let hit = router.match_route(&Method::Get, "/files/a").unwrap();
        assert_eq!(hit.params.get("*"), Some("a"));
    }

    #[test]
    fn wildcard_needs_at_least_one_segment() {
        let mut router = Router::new();
        router.get("/files/*", tagged("files")).unwrap();
        assert!(matches!(
            router.match_route(&Method::Get, "/files"),
            Err(DispatchError::RouteNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn literal_beats_param_beats_wildcard() {
        let mut router = Router::new();
        router.get("/users/me", tagged("literal")).unwrap();
        router.get("/users/:id", tagged("param")).unwrap();
        router.get("/users/*", tagged("wildcard")).unwrap();

        router.get("/assets/*", tagged("assets")).unwrap();

        assert_eq!(tag_of(&router, "GET", "/users/me").await, "literal");
        assert_eq!(tag_of(&router, "GET", "/users/42").await, "param");
        assert_eq!(tag_of(&router, "GET", "/assets/css/site.css").await, "assets");

        // `42` commits to the param child, which has no children; the wildcard
        // sibling is not retried.
        assert!(matches!(
            router.match_route(&Method::Get, "/users/42/avatar"),
            Err(DispatchError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn no_backtracking_after_literal_dead_end() {
        let mut router = Router::new();
        router.get("/a/b/c", tagged("literal")).unwrap();
        router.get("/a/:x/d", tagged("param")).unwrap();
        // `b` takes the literal branch, which has no `d` child; the param branch
        // is not retried.
        assert!(matches!(
            router.match_route(&Method::Get, "/a/b/d"),
            Err(DispatchError::RouteNotFound { .. })
        ));
        assert!(router.match_route(&Method::Get, "/a/z/d").is_ok());
    }

    #[test]
    fn intermediate_node_without_handlers_is_not_found() {
        let mut router = Router::new();
        router.get("/api/v1/users", tagged("users")).unwrap();
        assert!(matches!(
            router.match_route(&Method::Get, "/api/v1"),
            Err(DispatchError::RouteNotFound { .. })
        ));
    }

    #[test]
    fn wrong_method_reports_allowed_set() {
        let mut router = Router::new();
        router.post("/items", tagged("create")).unwrap();
        router.get("/items", tagged("list")).unwrap();
        router.add_route("purge", "/items", tagged("purge")).unwrap();

        match router.match_route(&Method::Delete, "/items") {
            Err(DispatchError::MethodNotAllowed { allowed }) => assert_eq!(
                allowed,
                vec![Method::Get, Method::Post, Method::Custom("PURGE".into())]
            ),
            other => panic!("expected MethodNotAllowed, got {other:?}"),
        }
    }

    #[test]
    fn methods_are_case_insensitive() {
        let mut router = Router::new();
        router.add_route("get", "/x", tagged("x")).unwrap();
        assert!(router.match_route(&Method::Get, "/x").is_ok());
    }

    // ── dispatch ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn router_empty_returns_404() {
        let router = Router::new();
        let res = router.route(make_request("GET", "/")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn router_get_matches() {
        let mut router = Router::new();
        router.get("/hello", tagged("hello")).unwrap();
        let res = router.route(make_request("GET", "/hello")).await;
        assert_eq!(res.status(), StatusCode::Ok);
    }

    #[tokio::test]
    async fn router_wrong_method_returns_405_with_allow() {
        let mut router = Router::new();
        router.get("/hello", tagged("hello")).unwrap();
        router.put("/hello", tagged("hello")).unwrap();
        let res = router.route(make_request("POST", "/hello")).await;
        assert_eq!(res.status(), StatusCode::MethodNotAllowed);
        assert_eq!(res.headers().get("allow"), Some("GET, PUT"));
    }

    #[tokio::test]
    async fn router_unregistered_path_returns_404() {
        let mut router = Router::new();
        router.get("/hello", tagged("hello")).unwrap();
        let res = router.route(make_request("GET", "/world")).await;
        assert_eq!(res.status(), StatusCode::NotFound);
    }

    #[tokio::test]
    async fn re_registration_replaces_handler() {
        let mut router = Router::new();
        router.get("/path", tagged("first")).unwrap();
        router.get("/path", tagged("second")).unwrap();
        assert_eq!(tag_of(&router, "GET", "/path").await, "second");
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn every_registered_pair_resolves_to_its_last_handler() {
        let mut router = Router::new();
        let table = [
            ("GET", "/", "root"),
            ("GET", "/users", "list"),
            ("POST", "/users", "create"),
            ("GET", "/users/:id", "show"),
            ("DELETE", "/users/:id", "destroy"),
            ("GET", "/users/:id/posts/:post", "post"),
            ("GET", "/static/*", "static"),
        ];
        for (method, path, tag) in table {
            router.add_route(method, path, tagged("stale")).unwrap();
            router.add_route(method, path, tagged(tag)).unwrap();
        }

        let probes = [
            ("GET", "/", "root"),
            ("GET", "/users", "list"),
            ("POST", "/users", "create"),
            ("GET", "/users/1", "show"),
            ("DELETE", "/users/1", "destroy"),
            ("GET", "/users/1/posts/2", "post"),
            ("GET", "/static/css/site.css", "static"),
        ];
        for (method, path, tag) in probes {
            assert_eq!(tag_of(&router, method, path).await, tag, "{method} {path}");
        }
    }

    #[tokio::test]
    async fn handler_receives_params() {
        let mut router = Router::new();
        router
            .get("/users/:id", |req: Request| async move {
                let id = req.param("id").unwrap_or("").to_owned();
                Response::new(StatusCode::Ok).body(id)
            })
            .unwrap();
        assert_eq!(tag_of(&router, "GET", "/users/42").await, "42");
    }

    #[tokio::test]
    async fn router_method_variants_registered() {
        let mut router = Router::new();
        router.put("/r", tagged("put")).unwrap();
        router.delete("/r", tagged("delete")).unwrap();
        router.patch("/r", tagged("patch")).unwrap();
        router.options("/r", tagged("options")).unwrap();
        router.head("/r", tagged("head")).unwrap();
        assert_eq!(router.len(), 5);
        for method in ["PUT", "DELETE", "PATCH", "OPTIONS", "HEAD"] {
            assert_eq!(tag_of(&router, method, "/r").await, method.to_lowercase());
        }
    }
}
