mod forwarder;
mod handler;
mod stream;

pub use forwarder::{
    ATTEMPTS_EXHAUSTED_MESSAGE, Forwarder, InboundRequest, POOL_EXHAUSTED_MESSAGE, RetryPolicy,
};
pub use handler::{ProxyState, handle_proxy};
