//! TLS terminate-and-relay loop
//!
//! Each inbound connection is SNI-routed: the ClientHello names the
//! destination host, the handshake completes with a leaf minted for that
//! host, and a second TLS session is opened to the true upstream. Bytes are
//! copied bidirectionally; the upstream→client direction is teed into the
//! frame tap under the connection's host, so the orchestrator observes only
//! the submission's response stream and never side connections the
//! intercepted page opens.
//!
//! A mint or handshake failure tears down that one connection only. An
//! upstream failure additionally publishes `Aborted` so a registered tap
//! can fail its retrieval channel instead of hanging.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{LazyConfigAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::tap::{StreamFrame, TapRegistry};
use crate::tls::{self, LeafCache};

const RELAY_BUF: usize = 16 * 1024;

/// Accepts intercepted connections and relays them to the real upstream.
pub struct Interceptor {
    cache: Arc<LeafCache>,
    tap: Arc<TapRegistry>,
    connector: TlsConnector,
    upstream_port: u16,
    /// Test hook: route every connection to this address instead of the
    /// SNI-derived upstream.
    upstream_override: Option<String>,
}

impl Interceptor {
    pub fn new(cache: Arc<LeafCache>, tap: Arc<TapRegistry>, connector: TlsConnector) -> Self {
        Self {
            cache,
            tap,
            connector,
            upstream_port: 443,
            upstream_override: None,
        }
    }

    #[cfg(test)]
    fn with_upstream_override(mut self, addr: String) -> Self {
        self.upstream_override = Some(addr);
        self
    }

    /// Accept loop. Per-connection failures are logged and absorbed.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        info!(addr = %listener.local_addr()?, "interception proxy listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(stream).await {
                    debug!(peer = %peer, error = %e, "intercepted connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let start = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream)
            .await
            .map_err(|e| Error::Tls(format!("reading client hello: {e}")))?;

        let Some(host) = start.client_hello().server_name().map(str::to_string) else {
            warn!("client sent no SNI, dropping connection");
            return Err(Error::Tls("missing SNI".into()));
        };

        let config = tls::server_config(self.cache.clone(), Some(host.clone()));
        let client_tls = start
            .into_stream(config)
            .await
            .map_err(|e| Error::Tls(format!("client handshake for {host}: {e}")))?;

        let upstream_addr = match &self.upstream_override {
            Some(addr) => addr.clone(),
            None => format!("{host}:{}", self.upstream_port),
        };
        let upstream = match TcpStream::connect(&upstream_addr).await {
            Ok(s) => s,
            Err(e) => {
                self.tap.publish(&host, StreamFrame::Aborted).await;
                return Err(Error::Upstream {
                    addr: upstream_addr,
                    message: e.to_string(),
                });
            }
        };

        let upstream_tls = match self
            .connector
            .connect(tls::server_name(&host)?, upstream)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                self.tap.publish(&host, StreamFrame::Aborted).await;
                return Err(Error::Tls(format!("upstream handshake for {host}: {e}")));
            }
        };

        debug!(host, "relay established");
        metrics::counter!("intercept_connections_total").increment(1);
        self.relay(&host, client_tls, upstream_tls).await
    }

    /// Copy bytes both ways until either side closes, teeing the decrypted
    /// upstream→client direction into the tap under the connection's host.
    async fn relay<C, U>(&self, host: &str, client: C, upstream: U) -> Result<()>
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
        U: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut upstream_rd, mut upstream_wr) = tokio::io::split(upstream);
        let mut client_buf = vec![0u8; RELAY_BUF];
        let mut upstream_buf = vec![0u8; RELAY_BUF];

        loop {
            tokio::select! {
                read = client_rd.read(&mut client_buf) => match read {
                    Ok(0) => {
                        // Client hung up before the upstream finished; a
                        // registered tap must fail instead of waiting out
                        // the escalation timers.
                        self.tap.publish(host, StreamFrame::Aborted).await;
                        break;
                    }
                    Ok(n) => {
                        if let Err(e) = upstream_wr.write_all(&client_buf[..n]).await {
                            self.tap.publish(host, StreamFrame::Aborted).await;
                            return Err(e.into());
                        }
                    }
                    Err(e) => {
                        self.tap.publish(host, StreamFrame::Aborted).await;
                        return Err(e.into());
                    }
                },
                read = upstream_rd.read(&mut upstream_buf) => match read {
                    Ok(0) => {
                        self.tap.publish(host, StreamFrame::Closed).await;
                        break;
                    }
                    Ok(n) => {
                        self.tap
                            .publish(host, StreamFrame::Data(Bytes::copy_from_slice(&upstream_buf[..n])))
                            .await;
                        if let Err(e) = client_wr.write_all(&upstream_buf[..n]).await {
                            return Err(e.into());
                        }
                    }
                    Err(e) => {
                        self.tap.publish(host, StreamFrame::Aborted).await;
                        return Err(e.into());
                    }
                },
            }
        }
        Ok(())
    }
}
