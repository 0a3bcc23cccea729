use crate::InferenceError;
use crate::atom_table::AtomTable;
use crate::config::{Algorithm, OnlineConfig};
use crate::ground_model::GroundModel;
use crate::page_store::{DiskStats, TermPageStore};
use crate::readiness::ReadyMarker;
use crate::reasoner::{Reasoner, ReasonerHandle};
use crate::session::{Control, OnlineSession};
use crate::term::{DcdTerm, PageTerm, SgdTerm};
use crossbeam_channel::Receiver;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Accepts client connections for one session.
///
/// The readiness marker exists exactly while the listener is bound.
pub struct OnlineServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    session: Arc<OnlineSession>,
    marker: ReadyMarker,
}

impl OnlineServer {
    pub async fn bind(config: &OnlineConfig, session: Arc<OnlineSession>) -> Result<Self, InferenceError> {
        let listener = TcpListener::bind(config.address()).await?;
        let local_addr = listener.local_addr()?;
        let marker = ReadyMarker::create(&config.ready_marker_path(), local_addr)?;
        info!(addr = %local_addr, marker = %marker.path().display(), "listening for actions");
        Ok(Self {
            listener,
            local_addr,
            session,
            marker,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections until the session stops, then lets open
    /// connections deliver their last response.
    pub async fn serve(self) -> Result<(), InferenceError> {
        let OnlineServer {
            listener,
            session,
            marker,
            ..
        } = self;
        let mut shutdown = session.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(handle_connection(stream, peer, Arc::clone(&session)));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    log_connection_result(finished);
                }
            }
        }

        drop(listener);
        drop(marker);
        while let Some(finished) = connections.join_next().await {
            log_connection_result(finished);
        }
        info!("listener closed");
        Ok(())
    }
}

fn log_connection_result(finished: Result<Result<(), InferenceError>, tokio::task::JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "connection ended with error"),
        Err(e) => error!(error = %e, "connection task failed"),
    }
}

/// After a stop, lines that reach a connection within this window are still
/// answered before it closes.
const STOP_GRACE: Duration = Duration::from_millis(100);

type LineReader = Lines<BufReader<OwnedReadHalf>>;

/// Applies one action line and writes its response.
async fn answer(
    session: &OnlineSession,
    writer: &mut OwnedWriteHalf,
    next_id: &mut u64,
    line: &str,
) -> Result<Control, InferenceError> {
    let submission = session.submit_action(*next_id, line);
    *next_id += 1;
    writer.write_all(format!("{}\n", submission.response).as_bytes()).await?;
    writer.flush().await?;
    Ok(submission.control)
}

/// Answers whatever the client had already sent when the session stopped.
async fn drain_after_stop(
    session: &OnlineSession,
    lines: &mut LineReader,
    writer: &mut OwnedWriteHalf,
    next_id: &mut u64,
) -> Result<(), InferenceError> {
    let deadline = Instant::now() + STOP_GRACE;
    loop {
        let line = match tokio::time::timeout_at(deadline, lines.next_line()).await {
            Ok(line) => line?,
            Err(_) => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        if line.trim().is_empty() {
            continue;
        }
        debug!(id = *next_id, "answering action received before stop");
        if answer(session, writer, next_id, &line).await? != Control::Continue {
            return Ok(());
        }
    }
}

/// One action per line in, one response per line out, in order.
#[instrument(skip_all, fields(peer = %peer))]
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    session: Arc<OnlineSession>,
) -> Result<(), InferenceError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let mut shutdown = session.subscribe();
    let mut next_id = 0u64;
    debug!("client connected");

    loop {
        // Pending input wins over the stop signal.
        let received = tokio::select! {
            biased;
            line = lines.next_line() => Some(line?),
            _ = shutdown.wait_for(|stopped| *stopped) => None,
        };
        let Some(line) = received else {
            drain_after_stop(&session, &mut lines, &mut writer, &mut next_id).await?;
            break;
        };
        let Some(line) = line else {
            debug!("client closed the channel");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        if answer(&session, &mut writer, &mut next_id, &line).await? != Control::Continue {
            break;
        }
    }

    writer.shutdown().await.ok();
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub epochs: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub inferred_atoms: usize,
}

type ReasonerThread = JoinHandle<Result<u64, InferenceError>>;

fn start_reasoner<T: PageTerm>(
    config: &OnlineConfig,
    atoms: Arc<AtomTable>,
    stats: Arc<DiskStats>,
    handle: ReasonerHandle,
    wake: Receiver<()>,
    session: Arc<OnlineSession>,
) -> Result<ReasonerThread, InferenceError> {
    let options = config.store_options(std::mem::size_of::<T>());
    let store = TermPageStore::<T>::open(&config.cache.cache_dir, options, stats)?;
    info!(
        pages = store.page_count(),
        terms = store.term_count(),
        capacity = store.capacity(),
        algorithm = ?config.reasoner.algorithm,
        "term cache opened"
    );
    let reasoner = Reasoner::new(store, atoms, config.reasoner_options());

    let thread = thread::Builder::new().name("reasoner".to_string()).spawn(move || {
        let result = reasoner.run(handle, wake);
        if let Err(e) = &result {
            error!(error = %e, "reasoner failed, stopping session");
            session.stop();
        }
        result
    })?;
    Ok(thread)
}

async fn join_reasoner(thread: ReasonerThread) -> Result<u64, InferenceError> {
    tokio::task::spawn_blocking(move || thread.join())
        .await
        .map_err(|e| InferenceError::Other(format!("reasoner join failed: {}", e)))?
        .map_err(|_| InferenceError::Other("reasoner thread panicked".to_string()))?
}

/// Loads the ground model from the cache directory, runs the optimizer and
/// the listener until a client stops the session, then writes inferred
/// values if an output directory is configured.
pub async fn run(config: OnlineConfig) -> Result<RunSummary, InferenceError> {
    info!(
        cache_dir = %config.cache.cache_dir.display(),
        read_partition = ?config.read_partition(),
        grounding = ?config.grounding_policy(),
        "starting online inference"
    );
    let (catalog, atoms) = GroundModel::load(&config.cache.cache_dir)?.into_parts()?;
    let atoms = Arc::new(atoms);
    let stats = DiskStats::new();
    let (handle, wake) = ReasonerHandle::channel();
    let session = Arc::new(OnlineSession::new(Arc::new(catalog), Arc::clone(&atoms), handle.clone()));

    let reasoner = match config.reasoner.algorithm {
        Algorithm::Sgd => start_reasoner::<SgdTerm>(
            &config,
            Arc::clone(&atoms),
            Arc::clone(&stats),
            handle,
            wake,
            Arc::clone(&session),
        )?,
        Algorithm::Dcd => start_reasoner::<DcdTerm>(
            &config,
            Arc::clone(&atoms),
            Arc::clone(&stats),
            handle,
            wake,
            Arc::clone(&session),
        )?,
    };

    let served = match OnlineServer::bind(&config, Arc::clone(&session)).await {
        Ok(server) => server.serve().await,
        Err(e) => Err(e),
    };
    session.stop();
    let epochs = join_reasoner(reasoner).await;
    served?;
    let epochs = epochs?;

    let inferred_atoms = match &config.output_dir {
        Some(dir) => session.write_inferred_predicates(dir)?,
        None => 0,
    };

    let summary = RunSummary {
        epochs,
        bytes_read: stats.bytes_read(),
        bytes_written: stats.bytes_written(),
        inferred_atoms,
    };
    info!(?summary, "online inference finished");
    Ok(summary)
}
