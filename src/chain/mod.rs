//! Ordered chain of handler links.
//!
//! # Responsibilities
//! - `Filter`: one link contributed by a driver or by a service
//! - `Next`: the remainder of the chain, handed to each link
//! - `FilterChain`: an immutable, shareable sequence of links
//!
//! # Design Decisions
//! - Execution is sequential per request; a link runs the rest of the chain
//!   by calling `next.run(ctx)` and short-circuits by not calling it
//! - Links only see `&mut dyn EoContext`, so they can shape the outcome
//!   through a finish handler but cannot write the response themselves

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::context::{ContextError, EoContext, ProxyError};
use crate::upstream::BalanceError;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("{filter} rejected the request: {reason}")]
    Rejected { filter: String, reason: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Balance(#[from] BalanceError),

    #[error("upstream failed after {attempts} attempt(s): {source}")]
    Upstream {
        attempts: usize,
        #[source]
        source: ProxyError,
    },
}

/// One link in a chain.
#[async_trait]
pub trait Filter: Send + Sync {
    async fn do_filter(&self, ctx: &mut dyn EoContext, next: Next<'_>) -> Result<(), ChainError>;
}

/// The links after the current one.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    filters: &'a [Arc<dyn Filter>],
}

impl<'a> Next<'a> {
    pub fn new(filters: &'a [Arc<dyn Filter>]) -> Self {
        Self { filters }
    }

    /// Run the remaining links. An exhausted chain is a no-op.
    pub async fn run(self, ctx: &mut dyn EoContext) -> Result<(), ChainError> {
        match self.filters.split_first() {
            Some((first, rest)) => first.do_filter(ctx, Next { filters: rest }).await,
            None => Ok(()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.filters.len()
    }
}

/// An ordered, immutable list of links.
#[derive(Clone)]
pub struct FilterChain {
    filters: Arc<[Arc<dyn Filter>]>,
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl FilterChain {
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self {
            filters: filters.into(),
        }
    }

    /// A new chain with `tail` after the current links.
    pub fn append(&self, tail: impl IntoIterator<Item = Arc<dyn Filter>>) -> Self {
        let mut filters: Vec<Arc<dyn Filter>> = self.filters.iter().cloned().collect();
        filters.extend(tail);
        Self::new(filters)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every link in order against `ctx`.
    pub async fn chain(&self, ctx: &mut dyn EoContext) -> Result<(), ChainError> {
        Next::new(&self.filters).run(ctx).await
    }
}

#[async_trait]
impl Filter for FilterChain {
    /// A nested chain runs its own links, then continues with the outer ones.
    async fn do_filter(&self, ctx: &mut dyn EoContext, next: Next<'_>) -> Result<(), ChainError> {
        self.chain(ctx).await?;
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextState, HttpContext, RequestReader, UpstreamClient};
    use axum::http::{HeaderMap, Method, Uri, Version};
    use bytes::Bytes;
    use std::sync::Mutex;

    struct Mark {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        stop: bool,
    }

    #[async_trait]
    impl Filter for Mark {
        async fn do_filter(&self, ctx: &mut dyn EoContext, next: Next<'_>) -> Result<(), ChainError> {
            self.log.lock().unwrap().push(self.name);
            ctx.set_label(self.name, "seen");
            if self.stop {
                return Ok(());
            }
            next.run(ctx).await
        }
    }

    fn context() -> HttpContext {
        let reader = RequestReader::new(
            Method::GET,
            Uri::from_static("/"),
            Version::HTTP_11,
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:1000".parse().unwrap(),
            false,
        );
        HttpContext::new(ContextState::new(
            80,
            reader,
            Arc::new(UpstreamClient::new().unwrap()),
        ))
    }

    fn mark(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, stop: bool) -> Arc<dyn Filter> {
        Arc::new(Mark {
            name,
            log: log.clone(),
            stop,
        })
    }

    #[tokio::test]
    async fn test_links_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![mark("a", &log, false), mark("b", &log, false)])
            .append([mark("c", &log, false)]);
        let mut ctx = context();

        chain.chain(&mut ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(ctx.label("c"), Some("seen"));
    }

    #[tokio::test]
    async fn test_short_circuit_skips_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = FilterChain::new(vec![
            mark("a", &log, false),
            mark("b", &log, true),
            mark("c", &log, false),
        ]);
        let mut ctx = context();

        chain.chain(&mut ctx).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(ctx.label("c"), None);
    }

    #[tokio::test]
    async fn test_nested_chain_continues_outer() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner: Arc<dyn Filter> = Arc::new(FilterChain::new(vec![mark("x", &log, false)]));
        let outer = FilterChain::new(vec![mark("a", &log, false), inner, mark("b", &log, false)]);

        outer.chain(&mut context()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "x", "b"]);
    }

    #[tokio::test]
    async fn test_empty_chain_is_noop() {
        assert!(FilterChain::default().chain(&mut context()).await.is_ok());
    }
}
