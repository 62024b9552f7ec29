//! Lifecycle controller.
//!
//! One owner task serialises every state transition: callers reach it only
//! through request channels carrying reply channels, so "at most one
//! server", "tick never interleaves with ensure" and "failed deletes retry
//! next tick" all fall out of the single-owner design rather than from
//! locking.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{AutoscalerOpts, UpstreamOpts};
use crate::error::AutoscalerError;
use crate::hcloud::{Server, ServerProvider};
use crate::probe::ProbeSpec;
use crate::secrets;
use crate::ssh::{SshClient, TunnelStream};
use crate::stream::{spawn_watchdog, NotifyingStream};
use crate::template;

/// How often the owner task re-evaluates scale-down.
const TICK_PERIOD: Duration = Duration::from_secs(120);

/// Probe shape after creating a server: boot takes a while.
const CREATE_PROBE: ProbeSpec =
    ProbeSpec::new(6, Duration::from_secs(4), Duration::from_secs(5));
/// Probe shape for the optional through-tunnel readiness check.
const TUNNEL_PROBE: ProbeSpec = ProbeSpec::without_timeout(6, Duration::from_secs(5));
/// Probe shape when a server already exists and just needs confirming.
const RECHECK_PROBE: ProbeSpec =
    ProbeSpec::new(2, Duration::from_secs(2), Duration::from_secs(1));

const SSH_PORT: u16 = 22;

type Reply = oneshot::Sender<Result<(), AutoscalerError>>;

/// Thread-safe handle to the controller. Cheap to clone; all operations
/// rendezvous with the owner task.
#[derive(Clone)]
pub struct Autoscaler {
    c_up: mpsc::Sender<Reply>,
    c_shutdown: mpsc::Sender<Reply>,
    addr_rx: watch::Receiver<Option<Ipv4Addr>>,
    ssh: Arc<SshClient>,
    connection_timeout: Duration,
    ssh_port: u16,
}

impl Autoscaler {
    /// Generate key material, render the cloud-init payload and wire up the
    /// controller. The returned [`AutoscalerLoop`] must be spawned; the
    /// handle's operations block until it runs.
    pub fn new(
        opts: &AutoscalerOpts,
        provider: Arc<dyn ServerProvider>,
    ) -> anyhow::Result<(Self, AutoscalerLoop)> {
        let ssh =
            Arc::new(SshClient::generate().context("failed to generate ssh key material")?);

        let mut variables = opts.cloud_init_variables.clone();
        if let Some(path) = &opts.cloud_init_variables_from {
            variables.extend(secrets::load_variables_file(path)?);
        }
        let user_data = template::render_cloud_init(
            &opts.cloud_init_template,
            &variables,
            ssh.remote_private_pem(),
            ssh.remote_public_key(),
            &ssh.authorized_key()?,
        )
        .context("failed to render cloud-init user data")?;

        let server_name = format!("{}-{}", opts.server_name_prefix, random_suffix(6));
        info!(server = %server_name, "Autoscaler configured");

        let (up_tx, up_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let (addr_tx, addr_rx) = watch::channel(None);

        let handle = Self {
            c_up: up_tx,
            c_shutdown: shutdown_tx,
            addr_rx,
            ssh: ssh.clone(),
            connection_timeout: opts.connection_timeout,
            ssh_port: SSH_PORT,
        };
        let owner = AutoscalerLoop {
            provider,
            ssh,
            server_name,
            user_data,
            server: None,
            last_interaction: Instant::now(),
            scaledown_after: opts.scaledown_after,
            tick_period: TICK_PERIOD,
            create_probe: CREATE_PROBE,
            tunnel_probe: TUNNEL_PROBE,
            recheck_probe: RECHECK_PROBE,
            ssh_port: SSH_PORT,
            wait_for: opts.wait_for.clone(),
            c_up: up_rx,
            c_shutdown: shutdown_rx,
            addr_tx,
        };
        Ok((handle, owner))
    }

    /// Make sure a server exists and is reachable, stamping the interaction
    /// clock. Idempotent; safe to call from any task.
    pub async fn ensure_online(&self) -> Result<(), AutoscalerError> {
        let (tx, rx) = oneshot::channel();
        self.c_up
            .send(tx)
            .await
            .map_err(|_| AutoscalerError::Stopped)?;
        rx.await.map_err(|_| AutoscalerError::Stopped)?
    }

    /// Open a fresh SSH session to the current server and dial `upstream`
    /// through it. The returned stream is guarded by a watchdog that
    /// force-closes it after `connection_timeout`.
    ///
    /// Callers must have just succeeded in [`ensure_online`] for the same
    /// logical request; this does not itself ensure the server exists, and
    /// it reads the server address without consulting the owner task.
    ///
    /// [`ensure_online`]: Autoscaler::ensure_online
    pub async fn get_connection(
        &self,
        upstream: &UpstreamOpts,
    ) -> Result<NotifyingStream<TunnelStream>, AutoscalerError> {
        let ip = (*self.addr_rx.borrow()).ok_or(AutoscalerError::NoServer)?;

        let session = self.ssh.connect(SocketAddr::from((ip, self.ssh_port))).await?;
        let tunneled = session.dial(upstream).await?;

        let (stream, closed, close) = NotifyingStream::new(tunneled);
        spawn_watchdog(self.connection_timeout, close, closed, async move {
            session.disconnect().await;
        });
        Ok(stream)
    }

    /// Delete the server and stop the owner loop. Blocks until teardown
    /// completes. Calling it on an already-stopped controller is a no-op.
    pub async fn shutdown(&self) -> Result<(), AutoscalerError> {
        let (tx, rx) = oneshot::channel();
        if self.c_shutdown.send(tx).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Forceful variant of [`shutdown`]: same teardown, failures are only
    /// logged.
    ///
    /// [`shutdown`]: Autoscaler::shutdown
    pub async fn kill(&self) {
        if let Err(e) = self.shutdown().await {
            error!(error = %e, "Failed to shut down autoscaler");
        }
    }
}

/// The owner task. Sole writer of the server record and interaction clock.
pub struct AutoscalerLoop {
    provider: Arc<dyn ServerProvider>,
    ssh: Arc<SshClient>,
    server_name: String,
    user_data: String,
    server: Option<Server>,
    last_interaction: Instant,
    scaledown_after: Duration,
    tick_period: Duration,
    create_probe: ProbeSpec,
    tunnel_probe: ProbeSpec,
    recheck_probe: ProbeSpec,
    ssh_port: u16,
    wait_for: Option<UpstreamOpts>,
    c_up: mpsc::Receiver<Reply>,
    c_shutdown: mpsc::Receiver<Reply>,
    addr_tx: watch::Sender<Option<Ipv4Addr>>,
}

impl AutoscalerLoop {
    /// Run the controller until shutdown. Spawn this in its own task.
    pub async fn run(mut self) {
        info!("Starting autoscaler");

        let mut tick = interval_at(Instant::now() + self.tick_period, self.tick_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(reply) = self.c_up.recv() => {
                    let result = self.ensure_online().await;
                    if let Err(e) = &result {
                        error!(error = %e, "Failed ensure online");
                    }
                    let _ = reply.send(result);
                }
                _ = tick.tick() => {
                    if let Err(e) = self.evaluate_scaledown().await {
                        error!(error = %e, "Failed evaluate scaledown");
                    }
                }
                Some(reply) = self.c_shutdown.recv() => {
                    let _ = reply.send(self.delete_server().await);
                    break;
                }
            }
        }

        debug!("Autoscaler stopped");
    }

    async fn ensure_online(&mut self) -> Result<(), AutoscalerError> {
        debug!("Making sure server is online");
        self.last_interaction = Instant::now();

        match &self.server {
            None => {
                info!("No server online, will be created");
                let server = self
                    .provider
                    .create_server(&self.server_name, &self.user_data)
                    .await?;
                let ssh_addr = format!("{}:{}", server.ipv4, self.ssh_port);
                self.addr_tx.send_replace(Some(server.ipv4));
                self.server = Some(server);

                // A probe failure past this point leaves the record in
                // place: a transient blip must not trigger teardown, and
                // the next tick will reassess.
                info!("Waiting for ping");
                self.create_probe.run_tcp(&ssh_addr).await?;

                if let Some(wait_for) = self.wait_for.clone() {
                    self.ping_wait_for(&wait_for).await?;
                }
            }
            Some(server) => {
                let ssh_addr = format!("{}:{}", server.ipv4, self.ssh_port);
                self.recheck_probe.run_tcp(&ssh_addr).await?;
            }
        }
        Ok(())
    }

    /// Through-tunnel readiness probe for the configured upstream. The
    /// probe result itself is advisory: a service that is still starting
    /// does not fail ensure-online, only an unusable SSH session does.
    async fn ping_wait_for(&self, wait_for: &UpstreamOpts) -> Result<(), AutoscalerError> {
        info!(addr = %wait_for.addr, "Pinging wait_for");
        let ip = self.server.as_ref().expect("caller checked").ipv4;
        let session = self.ssh.connect(SocketAddr::from((ip, self.ssh_port))).await?;
        if let Err(e) = self
            .tunnel_probe
            .run_with(&wait_for.addr, || session.dial(wait_for))
            .await
        {
            warn!(error = %e, "wait_for upstream did not become reachable");
        }
        session.disconnect().await;
        Ok(())
    }

    async fn evaluate_scaledown(&mut self) -> Result<(), AutoscalerError> {
        if self.server.is_none() {
            return Ok(());
        }

        let since_last_interaction = self.last_interaction.elapsed();
        debug!(
            time_since_last_interaction = ?since_last_interaction,
            "Evaluating scaledown"
        );
        if since_last_interaction <= self.scaledown_after {
            return Ok(());
        }

        self.delete_server().await
    }

    async fn delete_server(&mut self) -> Result<(), AutoscalerError> {
        let Some(server) = &self.server else {
            return Ok(());
        };

        self.provider
            .delete_server(server.id)
            .await
            .map_err(AutoscalerError::Teardown)?;

        // Cleared only on success; a failed delete is retried next tick.
        self.server = None;
        self.addr_tx.send_replace(None);
        Ok(())
    }
}

fn random_suffix(len: usize) -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}
