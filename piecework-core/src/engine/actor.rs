//! Reactor task owning the engine.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::future::select_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use super::commands::EngineCommand;
use super::core::Engine;
use super::handle::EngineHandle;
use crate::config::PieceworkConfig;
use crate::network::{TcpDialer, TcpTransport};
use crate::torrent::{PeerSource, TorrentError};

/// Depth of the command queue between handles and the reactor.
const COMMAND_QUEUE_SIZE: usize = 64;

/// Binds the peer listener and spawns the reactor on the current runtime.
///
/// The reactor runs until [`EngineHandle::shutdown`] is called or every
/// handle is dropped.
///
/// # Examples
/// ```rust,no_run
/// # #[tokio::main]
/// # async fn main() {
/// use piecework_core::config::PieceworkConfig;
/// use piecework_core::engine::spawn_engine;
/// use piecework_core::torrent::PeerPool;
///
/// let config = PieceworkConfig::default();
/// let source = PeerPool::new(&config.network.bootstrap_peers, &config.network);
/// let handle = spawn_engine(config, Box::new(source)).await.unwrap();
/// println!("listening on {}", handle.local_addr());
/// # }
/// ```
///
/// # Errors
/// - `TorrentError::Io` - Listener could not be bound
pub async fn spawn_engine(
    config: PieceworkConfig,
    source: Box<dyn PeerSource>,
) -> Result<EngineHandle, TorrentError> {
    let bind_addr = SocketAddr::new(config.network.listen_address, config.network.listen_port);
    let listener = TcpListener::bind(bind_addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "Listening for peers");

    let wake = Arc::new(Notify::new());
    let dialer = TcpDialer::new(config.network.connect_timeout, wake.clone());
    let engine = Engine::new(config, source, Box::new(dialer));

    let (sender, receiver) = mpsc::channel(COMMAND_QUEUE_SIZE);
    tokio::spawn(run_reactor(engine, listener, receiver, wake));

    Ok(EngineHandle::new(sender, local_addr))
}

/// What woke the reactor.
enum Event {
    Command(Option<EngineCommand>),
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    /// Socket readiness, a finished connect or the poll timeout
    Tick,
}

/// Waits for anything that could make progress, then runs one engine tick.
///
/// A tick always runs after the wait, so timers inside the engine fire
/// at least every poll timeout even when the network is quiet.
async fn run_reactor(
    mut engine: Engine,
    listener: TcpListener,
    mut commands: mpsc::Receiver<EngineCommand>,
    wake: Arc<Notify>,
) {
    debug!("Engine reactor started");
    let poll_timeout = engine.poll_timeout();

    loop {
        let event = {
            let readiness = engine.readiness();
            let any_ready = async move {
                if readiness.is_empty() {
                    futures::future::pending::<()>().await;
                } else {
                    select_all(readiness).await;
                }
            };

            tokio::select! {
                command = commands.recv() => Event::Command(command),
                accepted = listener.accept() => Event::Accepted(accepted),
                () = wake.notified() => Event::Tick,
                () = any_ready => Event::Tick,
                () = tokio::time::sleep(poll_timeout) => Event::Tick,
            }
        };

        match event {
            Event::Command(None) => {
                debug!("Every engine handle dropped");
                break;
            }
            Event::Command(Some(command)) => {
                if !handle_command(&mut engine, command) {
                    return;
                }
            }
            Event::Accepted(Ok((stream, address))) => {
                engine.accept(Box::new(TcpTransport::from_stream(stream)), address);
            }
            Event::Accepted(Err(e)) => warn!(error = %e, "Accept failed"),
            Event::Tick => {}
        }

        engine.tick(Instant::now());
    }

    engine.shutdown();
    debug!("Engine reactor stopped");
}

/// Applies one command. Returns false once the reactor should stop.
fn handle_command(engine: &mut Engine, command: EngineCommand) -> bool {
    match command {
        EngineCommand::AddTorrent {
            metainfo,
            download_dir,
            responder,
        } => {
            let result = engine.add_torrent(&metainfo, &download_dir);
            let _ = responder.send(result);
        }
        EngineCommand::RemoveTorrent {
            info_hash,
            responder,
        } => {
            let result = engine.remove_torrent(&info_hash);
            let _ = responder.send(result);
        }
        EngineCommand::GetStatus {
            info_hash,
            responder,
        } => {
            let _ = responder.send(engine.status(&info_hash, Instant::now()));
        }
        EngineCommand::GetAllStatus { responder } => {
            let _ = responder.send(engine.statuses(Instant::now()));
        }
        EngineCommand::Shutdown { responder } => {
            info!("Engine shutting down");
            engine.shutdown();
            let _ = responder.send(());
            return false;
        }
    }
    true
}
