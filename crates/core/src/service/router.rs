/// Port routing for hidden services
///
/// Routes are registered with a port specifier: `*` matches every port,
/// `<n>` a single port and `<a>-<b>` the inclusive range between `a` and
/// `b`. When several routes match, the one with the greatest weight wins;
/// among equal weights the earliest registration wins.

use crate::stream::OverlayStream;
use futures::future::{BoxFuture, FutureExt};
use std::fmt;
use std::future::Future;
use std::io;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::debug;
use veilport_common::VeilPortError;

/// Ports matched by a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRange {
    Any,
    Exact(u16),
    Range { min: u16, max: u16 },
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortRange::Any => true,
            PortRange::Exact(p) => p == port,
            PortRange::Range { min, max } => (min..=max).contains(&port),
        }
    }

    /// Specificity used to rank overlapping routes
    pub fn weight(&self) -> u32 {
        match *self {
            PortRange::Any => 0,
            PortRange::Exact(_) => 1,
            PortRange::Range { min, max } => u32::from(max - min) + 1,
        }
    }
}

fn parse_port(spec: &str, part: &str) -> Result<u16, RouteError> {
    if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RouteError::InvalidPortRange(spec.to_string()));
    }
    part.parse()
        .map_err(|_| RouteError::InvalidPortRange(spec.to_string()))
}

impl FromStr for PortRange {
    type Err = RouteError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        if spec == "*" {
            return Ok(PortRange::Any);
        }

        let parts: Vec<&str> = spec.split('-').collect();
        match parts.as_slice() {
            [port] => Ok(PortRange::Exact(parse_port(spec, port)?)),
            [a, b] => {
                let a = parse_port(spec, a)?;
                let b = parse_port(spec, b)?;
                Ok(PortRange::Range {
                    min: a.min(b),
                    max: a.max(b),
                })
            }
            _ => Err(RouteError::InvalidPortRange(spec.to_string())),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRange::Any => f.write_str("*"),
            PortRange::Exact(port) => write!(f, "{}", port),
            PortRange::Range { min, max } => write!(f, "{}-{}", min, max),
        }
    }
}

pub type StreamCallback = Arc<dyn Fn(OverlayStream) -> BoxFuture<'static, ()> + Send + Sync>;

/// What happens to a routed stream
#[derive(Clone)]
pub enum RouteHandler {
    /// Pipe the stream to a local TCP listener
    Forward(String),
    /// Hand the stream to user code
    Callback(StreamCallback),
}

impl RouteHandler {
    pub fn forward(target: impl Into<String>) -> Self {
        RouteHandler::Forward(target.into())
    }

    pub fn callback<F, Fut>(handler: F) -> Self
    where
        F: Fn(OverlayStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        RouteHandler::Callback(Arc::new(move |stream| handler(stream).boxed()))
    }

    /// Run the handler on `stream` until it is done with it
    pub async fn dispatch(&self, mut stream: OverlayStream) -> io::Result<()> {
        match self {
            RouteHandler::Forward(target) => {
                let mut local = TcpStream::connect(target.as_str()).await?;
                let (sent, received) =
                    tokio::io::copy_bidirectional(&mut stream, &mut local).await?;
                debug!(sent, received, "forward to {} finished", target);
                Ok(())
            }
            RouteHandler::Callback(callback) => {
                callback(stream).await;
                Ok(())
            }
        }
    }
}

impl fmt::Debug for RouteHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteHandler::Forward(target) => f.debug_tuple("Forward").field(target).finish(),
            RouteHandler::Callback(_) => f.write_str("Callback(..)"),
        }
    }
}

/// A registered route
#[derive(Debug, Clone)]
pub struct PortRouteEntry {
    specifier: String,
    range: PortRange,
    handler: RouteHandler,
}

impl PortRouteEntry {
    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn weight(&self) -> u32 {
        self.range.weight()
    }

    pub fn handler(&self) -> &RouteHandler {
        &self.handler
    }
}

/// Routing table from destination ports to handlers
#[derive(Debug, Clone, Default)]
pub struct PortRouter {
    routes: Vec<PortRouteEntry>,
}

impl PortRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, specifier: &str, handler: RouteHandler) -> Result<(), RouteError> {
        let range = specifier.parse()?;
        self.routes.push(PortRouteEntry {
            specifier: specifier.to_string(),
            range,
            handler,
        });
        Ok(())
    }

    pub fn with_route(mut self, specifier: &str, handler: RouteHandler) -> Result<Self, RouteError> {
        self.register(specifier, handler)?;
        Ok(self)
    }

    pub fn resolve(&self, port: u16) -> Option<&RouteHandler> {
        self.resolve_entry(port).map(PortRouteEntry::handler)
    }

    pub fn resolve_entry(&self, port: u16) -> Option<&PortRouteEntry> {
        let mut best: Option<&PortRouteEntry> = None;
        for entry in self.routes.iter().filter(|e| e.range.contains(port)) {
            match best {
                Some(current) if entry.weight() <= current.weight() => {}
                _ => best = Some(entry),
            }
        }
        best
    }

    pub fn routes(&self) -> &[PortRouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Invalid port range: {0:?}")]
    InvalidPortRange(String),
}

impl From<RouteError> for VeilPortError {
    fn from(err: RouteError) -> Self {
        VeilPortError::Validation(err.to_string())
    }
}
