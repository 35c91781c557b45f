/// Dispatcher hooks for rendezvous, stream requests and accepted streams

use crate::overlay::{RendezvousRequest, StreamRequest};
use crate::stream::OverlayStream;
use std::fmt;
use std::sync::Arc;

/// Hooks consulted by the hidden service dispatcher
///
/// Returning `false` from `on_rendezvous` rejects the session; returning
/// `false` from `on_stream_request` leaves the stream request unanswered.
/// `on_stream` sees every accepted stream before it is routed.
pub trait ServiceCallbacks: Send + Sync {
    fn on_rendezvous(&self, _request: &dyn RendezvousRequest) -> bool {
        true
    }

    fn on_stream_request(&self, _request: &dyn StreamRequest) -> bool {
        true
    }

    fn on_stream(&self, _stream: &mut OverlayStream) {}
}

/// Accept every rendezvous and stream
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl ServiceCallbacks for AcceptAll {}

type RendezvousHook = Arc<dyn Fn(&dyn RendezvousRequest) -> bool + Send + Sync>;
type StreamRequestHook = Arc<dyn Fn(&dyn StreamRequest) -> bool + Send + Sync>;
type StreamHook = Arc<dyn Fn(&mut OverlayStream) + Send + Sync>;

/// Callbacks assembled from closures; unset hooks keep the defaults
#[derive(Clone, Default)]
pub struct CallbackSet {
    rendezvous: Option<RendezvousHook>,
    stream_request: Option<StreamRequestHook>,
    stream: Option<StreamHook>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_rendezvous<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn RendezvousRequest) -> bool + Send + Sync + 'static,
    {
        self.rendezvous = Some(Arc::new(hook));
        self
    }

    pub fn on_stream_request<F>(mut self, hook: F) -> Self
    where
        F: Fn(&dyn StreamRequest) -> bool + Send + Sync + 'static,
    {
        self.stream_request = Some(Arc::new(hook));
        self
    }

    pub fn on_stream<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut OverlayStream) + Send + Sync + 'static,
    {
        self.stream = Some(Arc::new(hook));
        self
    }
}

impl ServiceCallbacks for CallbackSet {
    fn on_rendezvous(&self, request: &dyn RendezvousRequest) -> bool {
        self.rendezvous.as_ref().map_or(true, |hook| hook(request))
    }

    fn on_stream_request(&self, request: &dyn StreamRequest) -> bool {
        self.stream_request
            .as_ref()
            .map_or(true, |hook| hook(request))
    }

    fn on_stream(&self, stream: &mut OverlayStream) {
        if let Some(hook) = &self.stream {
            hook(stream);
        }
    }
}

impl fmt::Debug for CallbackSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSet")
            .field("on_rendezvous", &self.rendezvous.is_some())
            .field("on_stream_request", &self.stream_request.is_some())
            .field("on_stream", &self.stream.is_some())
            .finish()
    }
}
