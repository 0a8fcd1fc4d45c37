//! Routing labels attached to backends
//!
//! Backends carry their routing configuration as flat `key=value` labels, the
//! way containers do:
//!
//! ```text
//! traefik.enable=true
//! traefik.http.routers.api.rule=Host(`api.example.com`) && PathPrefix(`/v1`)
//! traefik.http.routers.api.entrypoints=websecure
//! traefik.http.routers.api.tls.certresolver=default
//! traefik.http.services.api.loadbalancer.server.port=8080
//! traefik.http.middlewares.api-strip.stripprefix.prefixes=/v1
//! ```
//!
//! The prefix (`traefik` above) is configurable. Unknown keys are ignored.

use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use tracing::warn;

/// Errors from parsing a router rule
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("rule is empty")]
    Empty,
    #[error("unknown matcher '{0}'")]
    UnknownMatcher(String),
    #[error("operator '{0}' is not supported")]
    UnsupportedOperator(String),
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("a rule may contain at most one Path or PathPrefix matcher")]
    DuplicatePath,
    #[error("invalid host '{0}'")]
    InvalidHost(String),
    #[error("path '{0}' must start with '/'")]
    InvalidPath(String),
}

/// A host matcher
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostPattern {
    /// Exact host, lowercase
    Exact(String),
    /// `*.suffix`, stored without the `*.`; matches exactly one extra label
    Wildcard(String),
}

impl HostPattern {
    pub fn parse(raw: &str) -> Result<Self, RuleError> {
        let host = raw.trim().to_ascii_lowercase();
        let (wildcard, name) = match host.strip_prefix("*.") {
            Some(rest) => (true, rest.to_string()),
            None => (false, host.clone()),
        };

        let valid = !name.is_empty()
            && name.len() <= 253
            && !name.starts_with('.')
            && !name.ends_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid {
            return Err(RuleError::InvalidHost(raw.to_string()));
        }

        Ok(if wildcard {
            HostPattern::Wildcard(name)
        } else {
            HostPattern::Exact(name)
        })
    }

    /// Match an already-normalized (lowercase, port stripped) host
    pub fn matches(&self, host: &str) -> bool {
        match self {
            HostPattern::Exact(h) => h == host,
            HostPattern::Wildcard(suffix) => {
                if host.len() <= suffix.len() + 1 || !host.ends_with(suffix.as_str()) {
                    return false;
                }
                let head = &host[..host.len() - suffix.len()];
                match head.strip_suffix('.') {
                    Some(label) => !label.is_empty() && !label.contains('.'),
                    None => false,
                }
            }
        }
    }

    /// Ordering weight: exact beats wildcard, longer beats shorter
    pub fn specificity(&self) -> (u8, usize) {
        match self {
            HostPattern::Exact(h) => (2, h.len()),
            HostPattern::Wildcard(s) => (1, s.len()),
        }
    }

    pub fn exact(&self) -> Option<&str> {
        match self {
            HostPattern::Exact(h) => Some(h),
            HostPattern::Wildcard(_) => None,
        }
    }
}

impl fmt::Display for HostPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPattern::Exact(h) => write!(f, "{}", h),
            HostPattern::Wildcard(s) => write!(f, "*.{}", s),
        }
    }
}

/// A path matcher
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PathMatch {
    /// Matches the path and anything below it on a segment boundary
    Prefix(String),
    /// Matches this path only
    Exact(String),
}

impl PathMatch {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(p) => path == p,
            PathMatch::Prefix(prefix) => {
                if path == prefix || prefix == "/" {
                    return true;
                }
                if !path.starts_with(prefix.as_str()) {
                    return false;
                }
                // /api matches /api/users but not /apikeys
                prefix.ends_with('/') || path.as_bytes().get(prefix.len()) == Some(&b'/')
            }
        }
    }

    /// Ordering weight: longer paths first, exact before prefix of equal length.
    /// `PathPrefix(/)` weighs the same as no path at all.
    pub fn specificity(&self) -> (usize, u8) {
        match self {
            PathMatch::Prefix(p) if p == "/" => (0, 0),
            PathMatch::Exact(p) => (p.len(), 1),
            PathMatch::Prefix(p) => (p.len(), 0),
        }
    }
}

/// A parsed router rule: any of `hosts` (empty = any host) and an optional path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rule {
    pub hosts: Vec<HostPattern>,
    pub path: Option<PathMatch>,
}

impl Rule {
    pub fn host(host: &str) -> Result<Self, RuleError> {
        Ok(Self {
            hosts: vec![HostPattern::parse(host)?],
            path: None,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut terms = Vec::new();
        if !self.hosts.is_empty() {
            let hosts: Vec<String> = self.hosts.iter().map(|h| format!("`{}`", h)).collect();
            terms.push(format!("Host({})", hosts.join(", ")));
        }
        match &self.path {
            Some(PathMatch::Prefix(p)) => terms.push(format!("PathPrefix(`{}`)", p)),
            Some(PathMatch::Exact(p)) => terms.push(format!("Path(`{}`)", p)),
            None => {}
        }
        write!(f, "{}", terms.join(" && "))
    }
}

/// Parse a rule such as ``Host(`a.example.com`, `b.example.com`) && PathPrefix(`/api`)``
pub fn parse_rule(input: &str) -> Result<Rule, RuleError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(RuleError::Empty);
    }

    let mut hosts = Vec::new();
    let mut path = None;

    for term in split_terms(input)? {
        let (name, args) = parse_term(term)?;
        match name.to_ascii_lowercase().as_str() {
            "host" => {
                for arg in &args {
                    hosts.push(HostPattern::parse(arg)?);
                }
            }
            "pathprefix" | "path" => {
                if path.is_some() {
                    return Err(RuleError::DuplicatePath);
                }
                if args.len() != 1 {
                    return Err(RuleError::Syntax(format!(
                        "{} takes exactly one argument",
                        name
                    )));
                }
                let value = args[0].clone();
                if !value.starts_with('/') {
                    return Err(RuleError::InvalidPath(value));
                }
                path = Some(if name.eq_ignore_ascii_case("pathprefix") {
                    PathMatch::Prefix(value)
                } else {
                    PathMatch::Exact(value)
                });
            }
            _ => return Err(RuleError::UnknownMatcher(name.to_string())),
        }
    }

    Ok(Rule { hosts, path })
}

/// Split on top-level `&&`, refusing `||`
fn split_terms(input: &str) -> Result<Vec<&str>, RuleError> {
    let bytes = input.as_bytes();
    let mut terms = Vec::new();
    let mut quote: Option<u8> = None;
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'`' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(RuleError::Syntax("unbalanced ')'".to_string()));
                }
            }
            b'&' | b'|' if depth == 0 => {
                if bytes.get(i + 1) != Some(&b) {
                    return Err(RuleError::Syntax(format!("stray '{}'", b as char)));
                }
                if b == b'|' {
                    return Err(RuleError::UnsupportedOperator("||".to_string()));
                }
                terms.push(input[start..i].trim());
                i += 2;
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }

    if quote.is_some() {
        return Err(RuleError::Syntax("unterminated string".to_string()));
    }
    if depth != 0 {
        return Err(RuleError::Syntax("unbalanced '('".to_string()));
    }
    terms.push(input[start..].trim());

    if terms.iter().any(|t| t.is_empty()) {
        return Err(RuleError::Syntax("empty term".to_string()));
    }
    Ok(terms)
}

/// Parse `Name(`arg`, "arg")` into its name and arguments
fn parse_term(term: &str) -> Result<(&str, Vec<String>), RuleError> {
    let open = term
        .find('(')
        .ok_or_else(|| RuleError::Syntax(format!("expected '(' in '{}'", term)))?;
    if !term.ends_with(')') {
        return Err(RuleError::Syntax(format!("expected ')' at end of '{}'", term)));
    }
    let name = term[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(RuleError::UnknownMatcher(name.to_string()));
    }

    let inner = &term[open + 1..term.len() - 1];
    let mut args = Vec::new();
    let mut chars = inner.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let q = match chars.next() {
            Some(c @ ('`' | '"')) => c,
            Some(c) => {
                return Err(RuleError::Syntax(format!(
                    "expected quoted argument in {}(), found '{}'",
                    name, c
                )))
            }
            None => break,
        };
        let mut value = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == q {
                closed = true;
                break;
            }
            value.push(c);
        }
        if !closed {
            return Err(RuleError::Syntax("unterminated string".to_string()));
        }
        args.push(value);

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.next() {
            Some(',') => continue,
            None => break,
            Some(c) => {
                return Err(RuleError::Syntax(format!(
                    "expected ',' between arguments, found '{}'",
                    c
                )))
            }
        }
    }

    if args.is_empty() {
        return Err(RuleError::Syntax(format!("{}() needs an argument", name)));
    }
    Ok((name, args))
}

/// Router definition read from labels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterSpec {
    pub rule: Option<String>,
    pub entrypoints: Vec<String>,
    pub tls: bool,
    pub cert_resolver: Option<String>,
    pub priority: i64,
    pub middlewares: Vec<String>,
    pub service: Option<String>,
}

/// Service definition read from labels
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceSpec {
    pub port: Option<u16>,
}

/// Middleware definition read from labels
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareSpec {
    StripPrefix { prefixes: Vec<String> },
    RedirectScheme { scheme: String, permanent: bool },
}

/// Everything a backend's labels say about routing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingLabels {
    pub enabled: Option<bool>,
    pub routers: BTreeMap<String, RouterSpec>,
    pub services: BTreeMap<String, ServiceSpec>,
    pub middlewares: BTreeMap<String, MiddlewareSpec>,
}

impl RoutingLabels {
    /// Whether the backend participates in routing
    pub fn is_enabled(&self, exposed_by_default: bool) -> bool {
        self.enabled.unwrap_or(exposed_by_default)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Middleware names may carry a provider qualifier (`name@docker`)
pub fn middleware_name(reference: &str) -> &str {
    reference.split('@').next().unwrap_or(reference)
}

/// Read routing labels under `prefix`
pub fn parse_labels<'a, I>(labels: I, prefix: &str) -> RoutingLabels
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let mut parsed = RoutingLabels::default();
    let mut strip: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut redirect: BTreeMap<String, (Option<String>, bool)> = BTreeMap::new();

    for (key, value) in labels {
        let Some(rest) = key
            .strip_prefix(prefix)
            .and_then(|r| r.strip_prefix('.'))
        else {
            continue;
        };
        let parts: Vec<&str> = rest.split('.').collect();

        match parts.as_slice() {
            ["enable"] => parsed.enabled = parse_bool(value),
            ["http", "routers", name, field @ ..] => {
                let router = parsed.routers.entry(name.to_string()).or_default();
                match field {
                    ["rule"] => router.rule = Some(value.trim().to_string()),
                    ["entrypoints"] => router.entrypoints = split_list(value),
                    ["tls"] => router.tls = parse_bool(value).unwrap_or(false),
                    ["tls", "certresolver"] => {
                        router.cert_resolver = Some(value.trim().to_string())
                    }
                    ["priority"] => match value.trim().parse() {
                        Ok(p) => router.priority = p,
                        Err(_) => warn!(label = %key, value = %value, "Ignoring invalid router priority"),
                    },
                    ["middlewares"] => router.middlewares = split_list(value),
                    ["service"] => router.service = Some(value.trim().to_string()),
                    _ => {}
                }
            }
            ["http", "services", name, "loadbalancer", "server", "port"] => {
                let service = parsed.services.entry(name.to_string()).or_default();
                match value.trim().parse::<u16>() {
                    Ok(port) if port > 0 => service.port = Some(port),
                    _ => warn!(label = %key, value = %value, "Ignoring invalid service port"),
                }
            }
            ["http", "middlewares", name, "stripprefix", "prefixes"] => {
                strip.insert(name.to_string(), split_list(value));
            }
            ["http", "middlewares", name, "redirectscheme", "scheme"] => {
                redirect.entry(name.to_string()).or_default().0 = Some(value.trim().to_string());
            }
            ["http", "middlewares", name, "redirectscheme", "permanent"] => {
                redirect.entry(name.to_string()).or_default().1 =
                    parse_bool(value).unwrap_or(false);
            }
            _ => {}
        }
    }

    for (name, prefixes) in strip {
        parsed
            .middlewares
            .insert(name, MiddlewareSpec::StripPrefix { prefixes });
    }
    for (name, (scheme, permanent)) in redirect {
        match scheme {
            Some(scheme) => {
                parsed
                    .middlewares
                    .insert(name, MiddlewareSpec::RedirectScheme { scheme, permanent });
            }
            None => warn!(middleware = %name, "redirectscheme middleware without a scheme, ignoring"),
        }
    }

    parsed
}

/// Port declared by `<prefix>.http.services.<any>.loadbalancer.server.port`
///
/// With several services the alphabetically first one wins.
pub fn service_port<'a, I>(labels: I, prefix: &str) -> Option<u16>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    parse_labels(labels, prefix)
        .services
        .values()
        .find_map(|s| s.port)
}
