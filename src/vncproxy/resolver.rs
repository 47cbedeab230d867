use std::{collections::BTreeMap, collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use axum::{
    extract::Query,
    http::{HeaderMap, Uri, header},
};

use crate::vncproxy::config;

/// Backend used when nothing else is configured.
pub const DEFAULT_TARGET: &str = ":5901";

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("missing {0:?} query parameter")]
    MissingToken(String),
    #[error("unknown token")]
    UnknownToken,
    #[error("{0}")]
    Rejected(String),
}

/// The parts of the upgrade request a resolver may look at.
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client: Option<SocketAddr>,
}

impl ResolveRequest {
    pub fn query_param(&self, name: &str) -> Option<String> {
        let Query(mut params) = Query::<HashMap<String, String>>::try_from_uri(&self.uri).ok()?;
        params.remove(name)
    }

    /// The `Origin` header browsers attach to WebSocket upgrades.
    pub fn origin(&self) -> Option<&str> {
        self.headers.get(header::ORIGIN)?.to_str().ok()
    }
}

/// Maps an inbound request to a backend `host:port`.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, req: &ResolveRequest) -> Result<String, ResolveError>;
}

#[async_trait]
impl<F> Resolver for F
where
    F: Fn(&ResolveRequest) -> Result<String, ResolveError> + Send + Sync,
{
    async fn resolve(&self, req: &ResolveRequest) -> Result<String, ResolveError> {
        self(req)
    }
}

pub type SharedResolver = Arc<dyn Resolver>;

/// Always resolves to the same backend.
#[derive(Debug, Clone)]
pub struct FixedResolver {
    target: String,
}

impl FixedResolver {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }
}

impl Default for FixedResolver {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET)
    }
}

#[async_trait]
impl Resolver for FixedResolver {
    async fn resolve(&self, _req: &ResolveRequest) -> Result<String, ResolveError> {
        Ok(self.target.clone())
    }
}

/// Picks the backend by looking up a query parameter in a token table.
#[derive(Debug, Clone)]
pub struct TokenResolver {
    param: String,
    targets: BTreeMap<String, String>,
}

impl TokenResolver {
    pub fn new(param: impl Into<String>, targets: BTreeMap<String, String>) -> Self {
        Self {
            param: param.into(),
            targets,
        }
    }
}

#[async_trait]
impl Resolver for TokenResolver {
    async fn resolve(&self, req: &ResolveRequest) -> Result<String, ResolveError> {
        let token = req
            .query_param(&self.param)
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| ResolveError::MissingToken(self.param.clone()))?;
        self.targets
            .get(token.trim())
            .cloned()
            .ok_or(ResolveError::UnknownToken)
    }
}

/// Rejects requests whose `Origin` is not allow-listed, then defers to `inner`.
pub struct OriginFilter {
    allowed: Vec<String>,
    inner: SharedResolver,
}

impl OriginFilter {
    pub fn new(allowed: Vec<String>, inner: SharedResolver) -> Self {
        Self { allowed, inner }
    }
}

#[async_trait]
impl Resolver for OriginFilter {
    async fn resolve(&self, req: &ResolveRequest) -> Result<String, ResolveError> {
        let origin = req.origin().unwrap_or_default();
        if !self.allowed.iter().any(|a| a.eq_ignore_ascii_case(origin)) {
            return Err(ResolveError::Rejected(format!(
                "origin {origin:?} is not allowed"
            )));
        }
        self.inner.resolve(req).await
    }
}

pub fn from_config(cfg: &config::ResolverConfig) -> SharedResolver {
    let base: SharedResolver = if cfg.targets.is_empty() {
        Arc::new(FixedResolver::new(cfg.default_target.clone()))
    } else {
        Arc::new(TokenResolver::new(
            cfg.token_param.clone(),
            cfg.targets.clone(),
        ))
    };
    if cfg.allowed_origins.is_empty() {
        base
    } else {
        Arc::new(OriginFilter::new(cfg.allowed_origins.clone(), base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(uri: &str) -> ResolveRequest {
        ResolveRequest {
            uri: uri.parse().unwrap(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fixed_resolver_defaults_to_5901() {
        let r = FixedResolver::default();
        assert_eq!(r.resolve(&req("/ws")).await.unwrap(), ":5901");
    }

    #[tokio::test]
    async fn token_resolver_looks_up_query_param() {
        let mut targets = BTreeMap::new();
        targets.insert("desk1".to_string(), "10.0.0.5:5900".to_string());
        let r = TokenResolver::new("token", targets);

        assert_eq!(
            r.resolve(&req("/ws?token=desk1")).await.unwrap(),
            "10.0.0.5:5900"
        );
        assert!(matches!(
            r.resolve(&req("/ws?token=nope")).await,
            Err(ResolveError::UnknownToken)
        ));
        assert!(matches!(
            r.resolve(&req("/ws")).await,
            Err(ResolveError::MissingToken(_))
        ));
    }

    #[tokio::test]
    async fn closures_are_resolvers() {
        let r: SharedResolver = Arc::new(|req: &ResolveRequest| {
            req.query_param("host")
                .map(|h| format!("{h}:5900"))
                .ok_or_else(|| ResolveError::Rejected("no host".into()))
        });
        assert_eq!(
            r.resolve(&req("/ws?host=vnc.local")).await.unwrap(),
            "vnc.local:5900"
        );
        assert!(r.resolve(&req("/ws")).await.is_err());
    }

    #[tokio::test]
    async fn origin_filter_checks_the_origin_header() {
        let r = OriginFilter::new(
            vec!["https://desk.example.com".into()],
            Arc::new(FixedResolver::default()),
        );

        let mut allowed = req("/ws");
        allowed.headers.insert(
            header::ORIGIN,
            "https://DESK.example.com".parse().unwrap(),
        );
        assert_eq!(r.resolve(&allowed).await.unwrap(), ":5901");

        let mut foreign = req("/ws");
        foreign
            .headers
            .insert(header::ORIGIN, "https://evil.example".parse().unwrap());
        assert!(matches!(
            r.resolve(&foreign).await,
            Err(ResolveError::Rejected(_))
        ));

        assert!(matches!(
            r.resolve(&req("/ws")).await,
            Err(ResolveError::Rejected(_))
        ));
    }

    #[tokio::test]
    async fn from_config_picks_resolver_kind() {
        let mut cfg = config::ResolverConfig::default();
        let r = from_config(&cfg);
        assert_eq!(r.resolve(&req("/ws")).await.unwrap(), ":5901");

        cfg.targets.insert("a".into(), "127.0.0.1:5900".into());
        let r = from_config(&cfg);
        assert_eq!(
            r.resolve(&req("/ws?token=a")).await.unwrap(),
            "127.0.0.1:5900"
        );

        cfg.allowed_origins.push("http://localhost:6080".into());
        let r = from_config(&cfg);
        assert!(matches!(
            r.resolve(&req("/ws?token=a")).await,
            Err(ResolveError::Rejected(_))
        ));
    }
}
