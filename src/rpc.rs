//! The RPC seam and an in-process network behind it.
//!
//! Delivery is unreliable on request: endpoints can be detached (a partition
//! or a crash, as seen by everyone else) and a loss probability can be set
//! that drops requests and replies independently. Every call serializes its
//! arguments and reply through the wire codec even though delivery never
//! leaves the process, so codec agreement is exercised on every message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use tokio::time::sleep;

use crate::error::Error;
use crate::{wire, Result};

/// Outbound side of the seam. Peers and clerks hold one of these; the log
/// engine never learns what is behind it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn call(&self, to: &str, method: &str, body: Bytes) -> Result<Bytes>;
}

/// Inbound side: one per server object, dispatching on method name.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    async fn dispatch(&self, method: &str, body: Bytes) -> Result<Bytes>;
}

/// Typed call helper over the untyped seam.
pub async fn call<A, R>(transport: &dyn Transport, to: &str, method: &str, args: &A) -> Result<R>
where
    A: Serialize + Sync,
    R: DeserializeOwned,
{
    let body = wire::encode(args)?;
    let reply = transport.call(to, method, body).await?;
    wire::decode(&reply)
}

#[derive(Clone, Default)]
pub struct Network {
    inner: Arc<NetInner>,
}

#[derive(Default)]
struct NetInner {
    services: DashMap<String, Arc<dyn Service>>,
    detached: DashMap<String, ()>,
    loss: parking_lot::Mutex<f64>,
}

impl Network {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces, after a restart) the service behind `name`
    /// and attaches the endpoint.
    pub fn register(&self, name: &str, service: Arc<dyn Service>) {
        self.inner.services.insert(name.to_string(), service);
        self.inner.detached.remove(name);
    }

    /// Detaches or reattaches an endpoint. A detached endpoint neither
    /// receives calls nor gets its own calls through.
    pub fn set_attached(&self, name: &str, attached: bool) {
        if attached {
            self.inner.detached.remove(name);
        } else {
            self.inner.detached.insert(name.to_string(), ());
        }
    }

    /// Probability in `[0, 1)` that any request or reply is dropped.
    pub fn set_loss(&self, loss: f64) {
        *self.inner.loss.lock() = loss;
    }

    /// A transport whose calls originate from `from`; they fail while that
    /// endpoint is detached.
    pub fn handle(&self, from: &str) -> Arc<dyn Transport> {
        Arc::new(NetHandle {
            net: self.clone(),
            from: Some(from.to_string()),
        })
    }

    /// A transport for clerks, unaffected by server-side detachment.
    pub fn client_handle(&self) -> Arc<dyn Transport> {
        Arc::new(NetHandle {
            net: self.clone(),
            from: None,
        })
    }

    fn attached(&self, name: &str) -> bool {
        !self.inner.detached.contains_key(name)
    }

    async fn deliver(&self, from: Option<&str>, to: &str, method: &str, body: Bytes) -> Result<Bytes> {
        if let Some(from) = from {
            if !self.attached(from) {
                return Err(Error::Unreachable(from.to_string()));
            }
        }

        let loss = *self.inner.loss.lock();
        if loss > 0.0 {
            // Jittered delivery also reorders concurrent messages.
            let delay = rand::thread_rng().gen_range(0..=27);
            sleep(Duration::from_millis(delay)).await;
            if rand::thread_rng().gen_bool(loss) {
                return Err(Error::Dropped(to.to_string()));
            }
        }

        if !self.attached(to) {
            return Err(Error::Unreachable(to.to_string()));
        }
        let service = self
            .inner
            .services
            .get(to)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::Unreachable(to.to_string()))?;

        let reply = service.dispatch(method, body).await?;

        // The request may have executed and still look lost to the caller.
        if loss > 0.0 && rand::thread_rng().gen_bool(loss) {
            return Err(Error::Dropped(to.to_string()));
        }
        if let Some(from) = from {
            if !self.attached(from) {
                return Err(Error::Unreachable(from.to_string()));
            }
        }
        Ok(reply)
    }
}

struct NetHandle {
    net: Network,
    from: Option<String>,
}

#[async_trait]
impl Transport for NetHandle {
    async fn call(&self, to: &str, method: &str, body: Bytes) -> Result<Bytes> {
        self.net.deliver(self.from.as_deref(), to, method, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Service for Echo {
        async fn dispatch(&self, method: &str, body: Bytes) -> Result<Bytes> {
            match method {
                "Echo.Echo" => Ok(body),
                other => Err(Error::UnknownMethod(other.to_string())),
            }
        }
    }

    #[test]
    fn detached_endpoints_are_unreachable() {
        tokio_test::block_on(async {
            let net = Network::new();
            net.register("echo", Arc::new(Echo));
            let t = net.client_handle();

            let reply = t.call("echo", "Echo.Echo", Bytes::from_static(b"hi")).await;
            assert_eq!(&reply.unwrap()[..], b"hi");

            net.set_attached("echo", false);
            assert!(t.call("echo", "Echo.Echo", Bytes::new()).await.is_err());

            net.set_attached("echo", true);
            assert!(t.call("echo", "Echo.Echo", Bytes::new()).await.is_ok());
        });
    }

    #[test]
    fn unknown_methods_are_rejected() {
        tokio_test::block_on(async {
            let net = Network::new();
            net.register("echo", Arc::new(Echo));
            let t = net.client_handle();
            assert!(t.call("echo", "Echo.Nope", Bytes::new()).await.is_err());
        });
    }
}
