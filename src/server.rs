//! Process-level wiring: bootstraps tracing, opens the journal, starts the
//! director's role loop and the trimmer, and accepts client/peer
//! connections until a shutdown signal arrives.
//!
//! One `Server` per process, owning everything else.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Mode};
use crate::dispatcher::Dispatcher;
use crate::director::{Director, DirectorConfig};
use crate::journal::{Journal, RocksJournal};
use crate::network::{RaftTalker, TcpTalker};
use crate::protocol::RespCodec;
use crate::shutdown::ShutdownHandle;
use crate::statemachine::KvStateMachine;
use crate::trimmer::{Trimmer, TrimmerConfig};
use crate::types::NodeId;

pub struct Server {
    listen_addr: String,
    director: Arc<Director>,
    trimmer: Arc<Trimmer>,
    dispatcher: Arc<Dispatcher>,
    shutdown: ShutdownHandle,
}

impl Server {
    /// Install the `EnvFilter`-backed subscriber, matching `config.trace`.
    /// Must be called exactly once per process, before anything logs.
    pub fn install_tracing(config: &Config) {
        let filter = EnvFilter::try_new(config.trace.as_filter()).unwrap_or_else(|_| EnvFilter::new("info"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    }

    pub fn bootstrap(config: Config) -> anyhow::Result<Self> {
        if config.mode != Mode::Raft {
            anyhow::bail!("server.rs only drives raft mode; standalone/bulkload are separate entrypoints");
        }
        let listen_addr = config.myself.clone().context("myself is required in raft mode")?;
        let me = NodeId(listen_addr.clone());

        let journal: Arc<dyn Journal> = Arc::new(
            RocksJournal::open(&config.database, "quarkraft")
                .context("opening the raft journal")?,
        );

        let talker: Arc<dyn RaftTalker> = Arc::new(TcpTalker::new("quarkraft".to_string()));
        let trimmer = Trimmer::new(
            journal.clone(),
            TrimmerConfig { keep_at_least: 10_000, interval: Duration::from_secs(30) },
        );
        let state_machine = Arc::new(KvStateMachine::new());

        let director = Director::new(
            me.clone(),
            journal.clone(),
            talker,
            trimmer.clone(),
            state_machine.clone(),
            DirectorConfig {
                election_timeout_low: Duration::from_millis(150),
                election_timeout_high: Duration::from_millis(300),
                heartbeat_interval: Duration::from_millis(50),
                rpc_timeout: Duration::from_millis(100),
                resilver_timeout: Duration::from_secs(30),
            },
        );

        let dispatcher = Arc::new(Dispatcher::new(
            me,
            "quarkraft".to_string(),
            director.clone(),
            journal,
            state_machine,
        ));

        Ok(Self { listen_addr, director, trimmer, dispatcher, shutdown: ShutdownHandle::new() })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Runs the director's role loop, the trimmer, and the accept loop
    /// until a shutdown is requested (SIGINT/SIGTERM, or
    /// [`ShutdownHandle::request_stop`] called from elsewhere).
    pub async fn run(self) -> anyhow::Result<()> {
        let director_task = tokio::spawn(self.director.clone().run());
        let trimmer_task = self.trimmer.clone().spawn(self.shutdown.clone());

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("binding to {}", self.listen_addr))?;
        tracing::info!(addr = %self.listen_addr, "listening");

        let accept_result = self.accept_loop(listener).await;

        self.shutdown.request_stop();
        director_task.abort();
        let _ = trimmer_task.await;

        accept_result
    }

    async fn accept_loop(&self, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer) = accepted.context("accepting a connection")?;
                    let dispatcher = self.dispatcher.clone();
                    tokio::spawn(async move {
                        if let Err(err) = serve_connection(socket, dispatcher).await {
                            tracing::debug!(%peer, %err, "connection closed");
                        }
                    });
                }
                _ = wait_for_termination() => {
                    tracing::info!("shutdown signal received");
                    return Ok(());
                }
                _ = self.shutdown.stopped() => {
                    return Ok(());
                }
            }
        }
    }
}

async fn serve_connection(socket: tokio::net::TcpStream, dispatcher: Arc<Dispatcher>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, RespCodec);
    while let Some(frame) = framed.next().await {
        let frame = frame.context("decoding a frame")?;
        let reply = dispatcher.dispatch(frame).await;
        framed.send(reply).await.context("writing a reply")?;
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
