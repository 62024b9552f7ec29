//! Connection splicer.
//!
//! One accept task per listener; accepted connections are funneled through
//! a single channel, keyed by the local address they arrived on, so the
//! event loop can route each to its configured upstream. Every connection
//! ensures the server is online, obtains a tunneled stream, and splices
//! bytes both ways until either side closes.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::autoscaler::{Autoscaler, AutoscalerLoop};
use crate::config::{Config, UpstreamOpts};
use crate::error::AutoscalerError;
use crate::hcloud::HcloudClient;
use crate::procs::Procs;
use crate::stream::ByteStream;

/// How long one connection may spend obtaining its tunneled upstream.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// What the splicer needs from the lifecycle controller.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn ensure_online(&self) -> Result<(), AutoscalerError>;
    async fn get_connection(
        &self,
        upstream: &UpstreamOpts,
    ) -> Result<Box<dyn ByteStream>, AutoscalerError>;
    async fn shutdown(&self) -> Result<(), AutoscalerError>;
    async fn kill(&self);
}

#[async_trait]
impl Connector for Autoscaler {
    async fn ensure_online(&self) -> Result<(), AutoscalerError> {
        Autoscaler::ensure_online(self).await
    }

    async fn get_connection(
        &self,
        upstream: &UpstreamOpts,
    ) -> Result<Box<dyn ByteStream>, AutoscalerError> {
        Ok(Box::new(Autoscaler::get_connection(self, upstream).await?))
    }

    async fn shutdown(&self) -> Result<(), AutoscalerError> {
        Autoscaler::shutdown(self).await
    }

    async fn kill(&self) {
        Autoscaler::kill(self).await
    }
}

struct NewConnection {
    addr: String,
    stream: TcpStream,
    peer: SocketAddr,
}

#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

struct Inner {
    connector: Arc<dyn Connector>,
    listen_addr: HashMap<String, UpstreamOpts>,
    procs: Procs,
    /// Tracks listener and handler tasks so `stop` can drain them. The
    /// controller loop is not tracked; it is joined through `shutdown`.
    tracker: TaskTracker,
    cancel: CancellationToken,
    controller: Mutex<Option<AutoscalerLoop>>,
}

impl Proxy {
    /// Build the full proxy: cloud client, controller and side-cars.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let provider = Arc::new(
            HcloudClient::new(
                &config.autoscaler.hcloud_token,
                &config.autoscaler.server_type,
                &config.autoscaler.server_image,
                config.autoscaler.server_location.as_deref(),
            )
            .await?,
        );
        let (autoscaler, controller) = Autoscaler::new(&config.autoscaler, provider)?;
        let procs = Procs::new(&config.procs);
        Ok(Self::assemble(
            Arc::new(autoscaler),
            Some(controller),
            config.listen_addr,
            procs,
        ))
    }

    /// Wire a proxy around an existing connector. Used by tests.
    pub fn with_connector(
        connector: Arc<dyn Connector>,
        listen_addr: HashMap<String, UpstreamOpts>,
        procs: Procs,
    ) -> Self {
        Self::assemble(connector, None, listen_addr, procs)
    }

    fn assemble(
        connector: Arc<dyn Connector>,
        controller: Option<AutoscalerLoop>,
        listen_addr: HashMap<String, UpstreamOpts>,
        procs: Procs,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                listen_addr,
                procs,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                controller: Mutex::new(controller),
            }),
        }
    }

    /// Listen and splice until [`stop`] or [`kill`] is called. Blocking;
    /// run it in its own task.
    ///
    /// [`stop`]: Proxy::stop
    /// [`kill`]: Proxy::kill
    pub async fn start(&self) {
        info!("Starting proxy");
        let inner = &self.inner;

        if let Some(controller) = inner.controller.lock().unwrap().take() {
            tokio::spawn(controller.run());
        }

        let (conn_tx, mut conn_rx) = mpsc::channel::<NewConnection>(1);
        for addr in inner.listen_addr.keys() {
            inner.tracker.spawn(accept_incoming(
                addr.clone(),
                conn_tx.clone(),
                inner.cancel.clone(),
            ));
        }
        drop(conn_tx);

        inner.procs.run();

        // The event loop itself counts towards the drain in `stop`, so a
        // connection caught mid-ensure is never orphaned by teardown.
        let event_loop = async {
            loop {
                tokio::select! {
                    conn = conn_rx.recv() => {
                        let Some(conn) = conn else { break };
                        // Serialised with accepts on purpose: a cold server
                        // takes a while, and every queued connection needs
                        // it online anyway.
                        if let Err(e) = inner.connector.ensure_online().await {
                            error!(remote_addr = %conn.peer, error = %e, "Autoscaler ensure online failed");
                            continue;
                        }
                        let Some(upstream) = inner.listen_addr.get(&conn.addr).cloned() else {
                            continue;
                        };
                        let connector = inner.connector.clone();
                        inner.tracker.spawn(handle_request(connector, conn, upstream));
                    }
                    _ = inner.cancel.cancelled() => break,
                }
            }
        };
        inner.tracker.track_future(event_loop).await;
    }

    /// Graceful stop: no new accepts, in-flight splices drained, side-cars
    /// signalled, then the controller torn down.
    pub async fn stop(&self) {
        debug!("Stopping proxy...");
        self.inner.cancel.cancel();

        debug!("Stopping procs");
        self.inner.procs.shutdown().await;

        debug!("Waiting for all requests to finish");
        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        debug!("Shutting down autoscaler");
        if let Err(e) = self.inner.connector.shutdown().await {
            error!(error = %e, "Failed to shut down autoscaler");
        }

        debug!("Done");
    }

    /// Forceful stop: side-cars killed, server deleted, nothing drained.
    pub async fn kill(&self) {
        debug!("Killing proxy...");
        self.inner.cancel.cancel();
        self.inner.procs.kill();
        self.inner.connector.kill().await;
        debug!("Done");
    }
}

async fn accept_incoming(
    addr: String,
    conns: mpsc::Sender<NewConnection>,
    cancel: CancellationToken,
) {
    debug!(addr = %addr, "Setting up listener at addr");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Error listening to addr");
            return;
        }
    };
    info!(addr = %addr, "Listening at addr");

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer)) => {
                    debug!(remote_addr = %peer, "Accepted request");
                    let conn = NewConnection { addr: addr.clone(), stream, peer };
                    if conns.send(conn).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error accepting incoming request");
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        }
    }
}

async fn handle_request(connector: Arc<dyn Connector>, conn: NewConnection, upstream: UpstreamOpts) {
    let peer = conn.peer;
    debug!(remote_addr = %peer, "Handling request");

    let upstream_stream = match tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        connector.get_connection(&upstream),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(remote_addr = %peer, error = %e, "Failed to connect to autoscaler upstream");
            return;
        }
        Err(_) => {
            error!(remote_addr = %peer, "Timed out connecting to autoscaler upstream");
            return;
        }
    };

    splice(conn.stream, upstream_stream).await;
    debug!(remote_addr = %peer, "Request handled");
}

/// Copy both directions; return on the first direction to finish. Both
/// sides are dropped, and thereby closed, before returning.
async fn splice(client: impl ByteStream + 'static, upstream: Box<dyn ByteStream>) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    // Capacity 2: both copiers can signal without anyone listening.
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(2);

    let up = {
        let stop = stop_tx.clone();
        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut client_read, &mut upstream_write).await;
            let _ = stop.try_send(());
        })
    };
    let down = tokio::spawn(async move {
        let _ = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = stop_tx.try_send(());
    });

    let _ = stop_rx.recv().await;
    up.abort();
    down.abort();
}
