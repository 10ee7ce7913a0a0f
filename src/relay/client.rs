//! Display-side end of the relay.

use serde_json::Value;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use crate::relay::protocol::{self, Request};
use crate::relay::routes::{GetRoute, PostRoute};
use crate::relay::supervisor::{BoxReader, BoxWriter};
use crate::relay::RelayError;

/// Duplex channel to the host.
///
/// Every method takes `&self`; a `get` holds the read half from sending its request
/// until its reply arrives, so concurrent `get`s from several timers are answered in
/// order and never see each other's replies. `post` only needs the write half.
pub struct Relay {
    reader: Mutex<BoxReader>,
    writer: Mutex<BoxWriter>,
}

impl Relay {
    /// Relay over an arbitrary byte stream pair.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
        }
    }

    /// Relay over this process's stdin/stdout, as used by the display child.
    pub fn stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Send a request and wait for its single reply.
    pub async fn get_raw(&self, route: &str, args: Vec<Value>) -> Result<Value, RelayError> {
        let mut reader = self.reader.lock().await;
        {
            let mut writer = self.writer.lock().await;
            protocol::send(&mut *writer, &Request::new(route, args)).await?;
        }
        trace!(route, "Awaiting reply");
        protocol::recv(&mut *reader).await
    }

    /// Send a request without waiting for anything back.
    pub async fn post_raw(&self, route: &str, args: Vec<Value>) -> Result<(), RelayError> {
        let mut writer = self.writer.lock().await;
        protocol::send(&mut *writer, &Request::new(route, args)).await
    }

    /// Typed `get`.
    pub async fn get<R: GetRoute>(&self, args: R::Args) -> Result<R::Reply, RelayError> {
        let value = self
            .get_raw(R::NAME, protocol::encode_args(&args)?)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Typed `post`.
    pub async fn post<R: PostRoute>(&self, args: R::Args) -> Result<(), RelayError> {
        self.post_raw(R::NAME, protocol::encode_args(&args)?).await
    }

    /// Issue `get` every `period` and hand each reply to `on_reply`.
    ///
    /// Returns `Ok` once the host closes the channel; any other error ends polling and
    /// is returned.
    pub async fn poll<R, F>(
        &self,
        period: Duration,
        args: R::Args,
        mut on_reply: F,
    ) -> Result<(), RelayError>
    where
        R: GetRoute,
        R::Args: Clone,
        F: FnMut(R::Reply),
    {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.get::<R>(args.clone()).await {
                Ok(reply) => on_reply(reply),
                Err(e) if e.is_disconnect() => {
                    debug!(route = R::NAME, "Polling stopped, host closed the channel");
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::routes::{Contrast, StagePosition};
    use serde_json::json;
    use std::sync::Arc;

    /// Answers `count` requests with `[route, args]`, then hangs up.
    async fn echo_host(stream: tokio::io::DuplexStream, count: usize) {
        let (mut rx, mut tx) = tokio::io::split(stream);
        for _ in 0..count {
            let Request(route, args, _) = protocol::recv(&mut rx).await.unwrap();
            protocol::send(&mut tx, &json!([route, args])).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_typed_get_encodes_arguments() {
        let (host, display) = tokio::io::duplex(1024);
        let (rx, tx) = tokio::io::split(display);
        let relay = Relay::new(rx, tx);

        let (mut host_rx, mut host_tx) = tokio::io::split(host);
        let server = tokio::spawn(async move {
            let request: Request = protocol::recv(&mut host_rx).await.unwrap();
            assert_eq!(request, Request::new("contrast", vec![json!(2)]));
            protocol::send(&mut host_tx, &json!([10, 900])).await.unwrap();
        });

        let limits = relay.get::<Contrast>((2,)).await.unwrap();
        assert_eq!(limits, Some((10, 900)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_gets_keep_replies_paired() {
        let (host, display) = tokio::io::duplex(4096);
        let (rx, tx) = tokio::io::split(display);
        let relay = Arc::new(Relay::new(rx, tx));
        let server = tokio::spawn(echo_host(host, 20));

        let mut tasks = Vec::new();
        for i in 0..20 {
            let relay = relay.clone();
            tasks.push(tokio::spawn(async move {
                let reply = relay.get_raw("echo", vec![json!(i)]).await.unwrap();
                assert_eq!(reply, json!(["echo", [i]]));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_poll_stops_when_host_closes() {
        let (host, display) = tokio::io::duplex(1024);
        let (rx, tx) = tokio::io::split(display);
        let relay = Relay::new(rx, tx);

        let (mut host_rx, mut host_tx) = tokio::io::split(host);
        let server = tokio::spawn(async move {
            for i in 0..3 {
                let _: Request = protocol::recv(&mut host_rx).await.unwrap();
                protocol::send(&mut host_tx, &json!([i as f64, 0.0]))
                    .await
                    .unwrap();
            }
        });

        let mut seen = Vec::new();
        relay
            .poll::<StagePosition, _>(Duration::from_millis(1), (), |xy| seen.push(xy))
            .await
            .unwrap();
        assert_eq!(seen, vec![(0.0, 0.0), (1.0, 0.0), (2.0, 0.0)]);
        server.await.unwrap();
    }
}
