//! Routing table compilation and lookup
//!
//! [`compile`] is a pure function of the backend set: it reads each backend's
//! routing labels, merges routers that share a name into one pool, orders the
//! routes by specificity and returns an immutable [`RoutingTable`]. The
//! [`RouteCompiler`] task recompiles on every registry change and publishes
//! the result through [`SharedRoutes`], an atomic pointer swap. Requests load
//! the current table once and keep that snapshot until they finish.

use crate::certmanager::CertManager;
use crate::config::Config;
use crate::labels::{middleware_name, parse_labels, parse_rule, MiddlewareSpec, Rule, RouterSpec};
use crate::loadbalancer::{BackendPool, PoolMember};
use crate::registry::{Backend, BackendSet};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Inputs to [`compile`] besides the backends
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub label_prefix: String,
    pub exposed_by_default: bool,
    /// Synthesise `Host(<name>.<domain>)` for backends without a rule
    pub default_rule_domain: Option<String>,
    /// Known entry points and whether they terminate TLS
    pub entrypoints: BTreeMap<String, bool>,
}

impl CompileOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            label_prefix: config.providers.label_prefix.clone(),
            exposed_by_default: config.providers.exposed_by_default,
            default_rule_domain: config.providers.default_rule_domain.clone(),
            entrypoints: config
                .entrypoints
                .iter()
                .map(|(name, ep)| (name.clone(), ep.tls))
                .collect(),
        }
    }
}

/// A middleware attached to a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Middleware {
    pub name: String,
    #[serde(skip)]
    pub spec: MiddlewareSpec,
}

/// One compiled route
#[derive(Debug)]
pub struct Route {
    pub name: String,
    pub rule: Rule,
    pub entrypoints: Vec<String>,
    pub tls: bool,
    /// Set when the route's exact hostnames are ACME-managed
    pub cert_resolver: Option<String>,
    pub priority: i64,
    pub middlewares: Vec<Middleware>,
    pub pool: BackendPool,
    /// Declaration order of the backend that first defined the route
    pub seq: u64,
}

impl Route {
    /// Whether the route is served on this entry point
    pub fn serves(&self, entrypoint: &str, is_tls: bool) -> bool {
        self.tls == is_tls && (self.entrypoints.is_empty() || self.entrypoints.iter().any(|e| e == entrypoint))
    }

    /// Match a normalized host and a request path
    pub fn matches(&self, host: &str, path: &str) -> bool {
        let host_ok = self.rule.hosts.is_empty() || self.rule.hosts.iter().any(|h| h.matches(host));
        host_ok && self.rule.path.as_ref().map_or(true, |p| p.matches(path))
    }

    fn host_specificity(&self) -> (u8, usize) {
        self.rule
            .hosts
            .iter()
            .map(|h| h.specificity())
            .max()
            .unwrap_or((0, 0))
    }

    fn path_specificity(&self) -> (usize, u8) {
        self.rule
            .path
            .as_ref()
            .map(|p| p.specificity())
            .unwrap_or((0, 0))
    }

    /// Exact hostnames this route asks certificates for
    pub fn managed_hostnames(&self) -> impl Iterator<Item = &str> {
        self.rule
            .hosts
            .iter()
            .filter(|_| self.tls && self.cert_resolver.is_some())
            .filter_map(|h| h.exact())
    }
}

/// An ambiguity found while compiling; resolved by ordering, never fatal
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteCompileConflict {
    /// Router or middleware name as declared
    pub name: String,
    /// Backend whose declaration lost
    pub backend: String,
    /// The route or definition that kept the name
    pub kept: String,
    pub reason: String,
}

/// An immutable, ordered set of routes
#[derive(Debug, Default)]
pub struct RoutingTable {
    pub generation: u64,
    pub routes: Vec<Route>,
    pub conflicts: Vec<RouteCompileConflict>,
}

impl RoutingTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// First route in tie-break order serving this request
    pub fn find(&self, entrypoint: &str, is_tls: bool, host: &str, path: &str) -> Option<&Route> {
        self.routes
            .iter()
            .find(|r| r.serves(entrypoint, is_tls) && r.matches(host, path))
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.name == name)
    }

    /// Hostnames the certificate manager should hold certificates for
    pub fn tls_hostnames(&self) -> BTreeSet<String> {
        self.routes
            .iter()
            .flat_map(|r| r.managed_hostnames())
            .map(String::from)
            .collect()
    }

    pub fn references_backend(&self, id: &str) -> bool {
        self.routes.iter().any(|r| r.pool.contains(id))
    }
}

/// Normalize a Host header or authority: lowercase, port removed
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    let host = if let Some(rest) = raw.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else if raw.matches(':').count() == 1 {
        raw.split(':').next().unwrap_or(raw)
    } else {
        raw
    };
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Router definition after rule parsing; equality decides whether two
/// backends declaring the same router share a pool
#[derive(Debug, Clone, PartialEq, Eq)]
struct RouterDef {
    rule: Rule,
    entrypoints: Vec<String>,
    tls: bool,
    cert_resolver: Option<String>,
    priority: i64,
    middlewares: Vec<String>,
}

impl RouterDef {
    fn from_spec(spec: &RouterSpec, rule: Rule) -> Self {
        let mut entrypoints = spec.entrypoints.clone();
        entrypoints.sort();
        entrypoints.dedup();
        Self {
            rule,
            entrypoints,
            tls: spec.tls || spec.cert_resolver.is_some(),
            cert_resolver: spec.cert_resolver.clone(),
            priority: spec.priority,
            middlewares: spec
                .middlewares
                .iter()
                .map(|m| middleware_name(m).to_string())
                .collect(),
        }
    }
}

struct PendingRoute<'a> {
    name: String,
    def: RouterDef,
    members: Vec<&'a Backend>,
    seq: u64,
}

/// Compile the backend set into a routing table
pub fn compile(backends: &BackendSet, options: &CompileOptions, generation: u64) -> RoutingTable {
    let mut ordered: Vec<&Backend> = backends.values().collect();
    ordered.sort_by(|a, b| (a.seq, &a.id).cmp(&(b.seq, &b.id)));

    let mut conflicts = Vec::new();
    let mut middlewares: BTreeMap<String, (MiddlewareSpec, String)> = BTreeMap::new();
    let mut pending: Vec<PendingRoute> = Vec::new();

    for backend in ordered {
        let labels = parse_labels(&backend.labels, &options.label_prefix);
        if !labels.is_enabled(options.exposed_by_default) {
            continue;
        }

        for (name, spec) in &labels.middlewares {
            match middlewares.get(name) {
                None => {
                    middlewares.insert(name.clone(), (spec.clone(), backend.id.clone()));
                }
                Some((existing, owner)) if existing != spec => conflicts.push(RouteCompileConflict {
                    name: name.clone(),
                    backend: backend.id.clone(),
                    kept: owner.clone(),
                    reason: "middleware defined differently by an earlier backend".to_string(),
                }),
                Some(_) => {}
            }
        }

        let mut routers = labels.routers;
        if routers.is_empty() && options.default_rule_domain.is_some() {
            routers.insert(backend.name.clone(), RouterSpec::default());
        }

        for (name, spec) in routers {
            let rule = match router_rule(&spec, backend, options) {
                Some(Ok(rule)) => rule,
                Some(Err(e)) => {
                    warn!(backend = %backend.id, router = %name, error = %e, "Ignoring router with invalid rule");
                    continue;
                }
                None => {
                    warn!(backend = %backend.id, router = %name, "Ignoring router without a rule");
                    continue;
                }
            };
            for ep in &spec.entrypoints {
                if !options.entrypoints.is_empty() && !options.entrypoints.contains_key(ep) {
                    warn!(backend = %backend.id, router = %name, entrypoint = %ep, "Router references an unknown entry point");
                }
            }
            let def = RouterDef::from_spec(&spec, rule);

            match pending.iter_mut().find(|p| p.name == name) {
                None => pending.push(PendingRoute {
                    name,
                    def,
                    members: vec![backend],
                    seq: backend.seq,
                }),
                Some(existing) if existing.def == def => existing.members.push(backend),
                Some(existing) => {
                    let split = format!("{}#{}", name, backend.id);
                    conflicts.push(RouteCompileConflict {
                        name: name.clone(),
                        backend: backend.id.clone(),
                        kept: existing.name.clone(),
                        reason: format!("router redefined; compiled separately as '{}'", split),
                    });
                    pending.push(PendingRoute {
                        name: split,
                        def,
                        members: vec![backend],
                        seq: backend.seq,
                    });
                }
            }
        }
    }

    let mut routes: Vec<Route> = pending
        .into_iter()
        .map(|p| {
            let resolved = p
                .def
                .middlewares
                .iter()
                .filter_map(|m| match middlewares.get(m) {
                    Some((spec, _)) => Some(Middleware {
                        name: m.clone(),
                        spec: spec.clone(),
                    }),
                    None => {
                        warn!(router = %p.name, middleware = %m, "Router references an unknown middleware");
                        None
                    }
                })
                .collect();
            Route {
                name: p.name,
                rule: p.def.rule,
                entrypoints: p.def.entrypoints,
                tls: p.def.tls,
                cert_resolver: p.def.cert_resolver,
                priority: p.def.priority,
                middlewares: resolved,
                pool: BackendPool::new(p.members.into_iter().map(PoolMember::from).collect()),
                seq: p.seq,
            }
        })
        .collect();

    routes.sort_by(|a, b| {
        let key = |r: &Route| {
            (
                Reverse(r.priority),
                Reverse(r.path_specificity()),
                Reverse(r.host_specificity()),
                r.seq,
            )
        };
        key(a).cmp(&key(b)).then_with(|| a.name.cmp(&b.name))
    });

    for (i, later) in routes.iter().enumerate() {
        if let Some(earlier) = routes[..i]
            .iter()
            .find(|r| r.rule == later.rule && r.tls == later.tls && r.entrypoints == later.entrypoints)
        {
            conflicts.push(RouteCompileConflict {
                name: later.name.clone(),
                backend: later
                    .pool
                    .members()
                    .first()
                    .map(|m| m.id.clone())
                    .unwrap_or_default(),
                kept: earlier.name.clone(),
                reason: "identical matcher; shadowed by an earlier route".to_string(),
            });
        }
    }

    RoutingTable {
        generation,
        routes,
        conflicts,
    }
}

fn router_rule(
    spec: &RouterSpec,
    backend: &Backend,
    options: &CompileOptions,
) -> Option<Result<Rule, crate::labels::RuleError>> {
    match (&spec.rule, &options.default_rule_domain) {
        (Some(rule), _) => Some(parse_rule(rule)),
        (None, Some(domain)) => Some(Rule::host(&format!("{}.{}", backend.name, domain))),
        (None, None) => None,
    }
}

/// The active routing table, swapped atomically
#[derive(Clone)]
pub struct SharedRoutes {
    inner: Arc<ArcSwap<RoutingTable>>,
}

impl SharedRoutes {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(RoutingTable::empty())),
        }
    }

    /// Snapshot for the duration of one request
    pub fn load(&self) -> Arc<RoutingTable> {
        self.inner.load_full()
    }

    pub fn store(&self, table: RoutingTable) -> Arc<RoutingTable> {
        let table = Arc::new(table);
        self.inner.store(Arc::clone(&table));
        table
    }

    pub fn generation(&self) -> u64 {
        self.inner.load().generation
    }
}

impl Default for SharedRoutes {
    fn default() -> Self {
        Self::new()
    }
}

/// Recompiles the routing table whenever the backend set changes
pub struct RouteCompiler {
    options: CompileOptions,
    routes: SharedRoutes,
    backends_rx: watch::Receiver<Arc<BackendSet>>,
    certs: Option<Arc<CertManager>>,
}

impl RouteCompiler {
    pub fn new(
        options: CompileOptions,
        routes: SharedRoutes,
        backends_rx: watch::Receiver<Arc<BackendSet>>,
        certs: Option<Arc<CertManager>>,
    ) -> Self {
        Self {
            options,
            routes,
            backends_rx,
            certs,
        }
    }

    /// Compile and publish the next generation
    pub fn rebuild(&self, backends: &BackendSet) -> Arc<RoutingTable> {
        let generation = self.routes.generation() + 1;
        let table = compile(backends, &self.options, generation);

        for conflict in &table.conflicts {
            warn!(
                name = %conflict.name,
                backend = %conflict.backend,
                kept = %conflict.kept,
                reason = %conflict.reason,
                "Route compile conflict"
            );
        }

        let table = self.routes.store(table);
        info!(
            generation,
            routes = table.routes.len(),
            backends = backends.len(),
            "Routing table published"
        );

        if let Some(certs) = &self.certs {
            certs.sync_hostnames(table.tls_hostnames());
        }
        table
    }

    pub fn spawn(mut self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = self.backends_rx.changed() => {
                        if changed.is_err() {
                            debug!("Registry closed, route compiler stopping");
                            break;
                        }
                        let backends = Arc::clone(&self.backends_rx.borrow_and_update());
                        self.rebuild(&backends);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
