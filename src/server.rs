//! The supervisor: sockets, worker threads, signals, reloads and shutdown.
//!
//! The supervisor binds every socket, then starts one reader thread per UDP
//! socket feeding a bounded channel, a pool of worker threads draining it,
//! a TCP thread for bulk leasequery, and a signal thread. Each worker builds
//! its own private pipeline from the current configuration (including its
//! own database connection) and rebuilds it when a SIGHUP installed a new
//! configuration generation; the swap itself is a single atomic pointer
//! store, so request handling never sees a half-reloaded configuration.
//!
//! Worker errors are tracked in a sliding window; too many in too little
//! time means something is systematically wrong and the server shuts down
//! rather than keep misbehaving. Unparsable packets are counted but do not
//! contribute to the window.

use std::collections::VecDeque;
use std::io::Write;
use std::net::{Ipv6Addr, SocketAddrV6, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use arc_swap::ArcSwap;
use crossbeam_channel::{bounded, Receiver, Sender};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::Signals;

use sedge_proto::message::Message;

use crate::bundle::TransactionBundle;
use crate::config::Config;
use crate::handlers::rate_limit::{rate_limit_configs, RateLimitCounters};
use crate::leasequery::sqlite::SqliteLeasequeryStore;
use crate::pipeline::MessageHandler;
use crate::statistics::{ServerStatistics, StatisticsSet};
use crate::transport::{
    interface_sockets, outgoing_datagram, read_tcp_frame, tcp_frame, tcp_listener, wrap_incoming,
    ListeningSocket,
};
use crate::ServerError;

/// One configuration generation plus the state shared between the worker
/// pipelines built from it.
pub struct ConfigHolder {
    pub generation: u64,
    pub config: Arc<Config>,
    pub rate_limiters: Vec<Arc<RateLimitCounters>>,
}

impl ConfigHolder {
    pub fn new(config: Config, generation: u64) -> Self {
        let rate_limiters = rate_limit_configs(&config)
            .into_iter()
            .map(|(rate, per, burst)| Arc::new(RateLimitCounters::new(rate, per, burst)))
            .collect();

        Self {
            generation,
            config: Arc::new(config),
            rate_limiters,
        }
    }
}

/// The sliding handling-error window.
pub struct ExceptionWindow {
    max: usize,
    window: Duration,
    events: Mutex<VecDeque<Instant>>,
}

impl ExceptionWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            events: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one error; true when the threshold is now exceeded.
    pub fn record(&self) -> bool {
        let now = Instant::now();
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());

        events.push_back(now);
        while let Some(first) = events.front() {
            if now.duration_since(*first) > self.window {
                events.pop_front();
            } else {
                break;
            }
        }

        events.len() > self.max
    }
}

enum Job {
    Packet {
        socket_index: usize,
        data: Vec<u8>,
        source: SocketAddrV6,
    },
    Shutdown,
}

struct Shared {
    config: ArcSwap<ConfigHolder>,
    statistics: RwLock<ServerStatistics>,
    sockets: Vec<ListeningSocket>,
    shutdown: AtomicBool,
    exceptions: ExceptionWindow,
    config_path: PathBuf,
}

impl Shared {
    fn trigger_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// A worker's private pipeline, rebuilt when the configuration generation
/// changes.
struct WorkerPipeline {
    generation: u64,
    handler: MessageHandler,
}

impl WorkerPipeline {
    fn build(holder: &ConfigHolder) -> Result<Self, ServerError> {
        let mut handler = MessageHandler::build(&holder.config, &holder.rate_limiters)?;
        handler.worker_init()?;

        Ok(Self {
            generation: holder.generation,
            handler,
        })
    }

    fn refresh(&mut self, shared: &Shared) {
        let holder = shared.config.load();
        if holder.generation == self.generation {
            return;
        }

        info!("Switching to configuration generation {}", holder.generation);
        match Self::build(&holder) {
            Ok(pipeline) => *self = pipeline,
            Err(e) => {
                error!("Could not rebuild pipeline, keeping the old one: {}", e);
                self.generation = holder.generation;
            }
        }
    }
}

pub fn run(config_path: &Path) -> Result<(), ServerError> {
    sedge_proto::load_all_extensions();

    let config = Config::from_file(config_path)?;

    if let Some(leasequery) = &config.leasequery {
        SqliteLeasequeryStore::prepare(&leasequery.store)?;
    }

    let statistics = ServerStatistics::new(config.statistics.as_ref());

    let mut sockets = Vec::new();
    for interface in &config.interfaces {
        sockets.extend(interface_sockets(interface)?);
    }
    if sockets.is_empty() && config.listen_tcp.is_none() {
        return Err(ServerError::config("no listening sockets configured"));
    }

    let threads = config.server.threads;
    let exception_window = Duration::from_secs_f64(config.server.exception_window.max(0.001));
    let max_exceptions = config.server.max_exceptions;

    let shared = Arc::new(Shared {
        config: ArcSwap::from_pointee(ConfigHolder::new(config, 0)),
        statistics: RwLock::new(statistics),
        sockets,
        shutdown: AtomicBool::new(false),
        exceptions: ExceptionWindow::new(max_exceptions, exception_window),
        config_path: config_path.to_path_buf(),
    });

    // Verify that a pipeline can actually be built before going live
    let _ = WorkerPipeline::build(&shared.config.load())?;

    let (tx, rx) = bounded::<Job>(1024);

    let mut threads_handles = Vec::new();

    for index in 0..shared.sockets.len() {
        let shared = shared.clone();
        let tx = tx.clone();
        threads_handles.push(
            thread::Builder::new()
                .name(format!("reader-{}", index))
                .spawn(move || reader_loop(shared, index, tx))?,
        );
    }

    for index in 0..threads {
        let shared = shared.clone();
        let rx = rx.clone();
        threads_handles.push(
            thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || worker_loop(shared, rx))?,
        );
    }

    if let Some(listen_tcp) = shared.config.load().config.listen_tcp.clone() {
        let shared = shared.clone();
        threads_handles.push(
            thread::Builder::new()
                .name("bulk-leasequery".to_string())
                .spawn(move || tcp_loop(shared, listen_tcp))?,
        );
    }

    signal_loop(&shared, &tx, threads);

    for handle in threads_handles {
        let _ = handle.join();
    }

    info!("Shut down cleanly");
    Ok(())
}

/// The signal handling loop, run on the supervisor thread.
fn signal_loop(shared: &Arc<Shared>, tx: &Sender<Job>, workers: usize) {
    let mut signals = match Signals::new([SIGHUP, SIGINT, SIGTERM, SIGUSR1]) {
        Ok(signals) => signals,
        Err(e) => {
            error!("Cannot install signal handlers: {}", e);
            shared.trigger_shutdown();
            return;
        }
    };

    loop {
        if shared.shutting_down() {
            break;
        }

        for signal in signals.wait() {
            match signal {
                SIGHUP => reload(shared),
                SIGUSR1 => {
                    let statistics = shared.statistics.read().unwrap_or_else(|e| e.into_inner());
                    info!("Statistics: {}", statistics.export());
                }
                SIGINT | SIGTERM => {
                    info!("Received termination signal, draining workers");
                    shared.trigger_shutdown();
                    for _ in 0..workers {
                        let _ = tx.send(Job::Shutdown);
                    }
                    return;
                }
                _ => {}
            }
        }
    }
}

fn reload(shared: &Arc<Shared>) {
    info!("Reloading configuration from {}", shared.config_path.display());

    let config = match Config::from_file(&shared.config_path) {
        Ok(config) => config,
        Err(e) => {
            error!("Not reloading, configuration is broken: {}", e);
            return;
        }
    };

    let generation = shared.config.load().generation + 1;
    let holder = ConfigHolder::new(config, generation);

    // Reject configurations whose pipelines cannot be built; workers would
    // otherwise be stuck with the old one anyway
    if let Err(e) = MessageHandler::build(&holder.config, &holder.rate_limiters) {
        error!("Not reloading, pipeline construction failed: {}", e);
        return;
    }

    if let Some(statistics_config) = holder.config.statistics.clone() {
        shared
            .statistics
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .set_categories(&statistics_config);
    }

    shared.config.store(Arc::new(holder));
    info!("Installed configuration generation {}", generation);
}

/// One reader thread per UDP socket: receive datagrams and queue them.
fn reader_loop(shared: Arc<Shared>, socket_index: usize, tx: Sender<Job>) {
    let socket = &shared.sockets[socket_index];
    if let Err(e) = socket.socket.set_read_timeout(Some(Duration::from_millis(500))) {
        error!("Cannot set socket timeout: {}", e);
        return;
    }

    let mut buffer = [0u8; 65535];
    while !shared.shutting_down() {
        match socket.socket.recv_from(&mut buffer) {
            Ok((length, source)) => {
                let std::net::SocketAddr::V6(source) = source else {
                    continue;
                };

                let job = Job::Packet {
                    socket_index,
                    data: buffer[..length].to_vec(),
                    source,
                };
                if tx.send(job).is_err() {
                    break;
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                error!("Receive error on {}: {}", socket.listen_address, e);
                break;
            }
        }
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<Job>) {
    let mut pipeline = match WorkerPipeline::build(&shared.config.load()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Worker could not build its pipeline: {}", e);
            shared.trigger_shutdown();
            return;
        }
    };

    while let Ok(job) = rx.recv() {
        match job {
            Job::Shutdown => break,
            Job::Packet {
                socket_index,
                data,
                source,
            } => {
                if shared.shutting_down() {
                    break;
                }

                pipeline.refresh(&shared);
                handle_packet(&shared, &mut pipeline.handler, socket_index, &data, source);
            }
        }
    }

    debug!("Worker drained");
}

fn handle_packet(
    shared: &Shared,
    handler: &mut MessageHandler,
    socket_index: usize,
    data: &[u8],
    source: SocketAddrV6,
) {
    let socket = &shared.sockets[socket_index];

    let receive_stats = statistics_set(shared, &socket.interface, None);
    receive_stats.count_incoming_packet();

    let message = match Message::parse(data) {
        Ok(message) => message,
        Err(e) => {
            debug!("Dropping unparsable packet from {}: {}", source.ip(), e);
            receive_stats.count_unparsable_packet();
            return;
        }
    };

    let wrapped = wrap_incoming(
        message,
        &socket.interface,
        socket.global_address,
        *source.ip(),
    );

    let mut bundle = TransactionBundle::new(wrapped, socket.is_multicast(), false);
    let statistics = statistics_set(shared, &socket.interface, Some(&bundle));

    let result = catch_unwind(AssertUnwindSafe(|| {
        handler.handle(&mut bundle, &statistics);

        if let Some((destination, reply)) = outgoing_datagram(&mut bundle, socket.interface_index)
        {
            match socket.reply_socket().send_to(&reply, destination) {
                Ok(_) => statistics.count_outgoing_packet(),
                Err(e) => warn!("Could not send reply to {}: {}", destination, e),
            }
        }
    }));

    if result.is_err() {
        error!("Handler crashed while processing a request from {}", source.ip());
        statistics.count_handling_error();
        if shared.exceptions.record() {
            error!("Too many handling errors, shutting down");
            shared.trigger_shutdown();
            // wake the signal loop so it drains the workers
            let _ = signal_hook::low_level::raise(SIGTERM);
        }
    }
}

fn statistics_set(
    shared: &Shared,
    interface: &str,
    bundle: Option<&TransactionBundle>,
) -> StatisticsSet {
    shared
        .statistics
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .update_set(Some(interface), bundle)
}

/// The bulk leasequery listener: sequential, single connection at a time,
/// with its own pipeline. Bulk requestors are management stations, not
/// clients; sequential handling keeps the database access simple.
fn tcp_loop(shared: Arc<Shared>, config: crate::config::ListenTcpConfig) {
    let listener = match tcp_listener(&config) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Cannot listen for bulk leasequery: {}", e);
            shared.trigger_shutdown();
            return;
        }
    };
    if let Err(e) = listener.set_nonblocking(true) {
        error!("Cannot prepare bulk leasequery listener: {}", e);
        return;
    }

    let mut pipeline = match WorkerPipeline::build(&shared.config.load()) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            error!("Bulk leasequery worker could not build its pipeline: {}", e);
            shared.trigger_shutdown();
            return;
        }
    };

    info!("Listening for bulk leasequery on [{}]:547", config.address);

    while !shared.shutting_down() {
        match listener.accept() {
            Ok((stream, peer)) => {
                pipeline.refresh(&shared);

                debug!("Bulk leasequery connection from {}", peer);
                if let Err(e) = handle_tcp_connection(
                    &shared,
                    &mut pipeline.handler,
                    stream,
                    config.address,
                    config.timeout,
                ) {
                    warn!("Bulk leasequery connection from {} failed: {}", peer, e);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                error!("Bulk leasequery accept failed: {}", e);
                break;
            }
        }
    }
}

fn handle_tcp_connection(
    shared: &Shared,
    handler: &mut MessageHandler,
    mut stream: TcpStream,
    link_address: Ipv6Addr,
    timeout: u64,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(timeout)))?;
    stream.set_write_timeout(Some(Duration::from_secs(timeout)))?;
    stream.set_nonblocking(false)?;

    let source = match stream.peer_addr()? {
        std::net::SocketAddr::V6(address) => *address.ip(),
        std::net::SocketAddr::V4(_) => return Ok(()),
    };

    while let Some(data) = read_tcp_frame(&mut stream)? {
        let statistics = statistics_set(shared, "tcp", None);
        statistics.count_incoming_packet();

        let message = match Message::parse(&data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping unparsable bulk leasequery frame: {}", e);
                statistics.count_unparsable_packet();
                continue;
            }
        };

        let wrapped = wrap_incoming(message, "tcp", link_address, source);
        let mut bundle = TransactionBundle::new(wrapped, false, true);

        handler.handle(&mut bundle, &statistics);

        // The reply plus any data/done messages of a bulk stream. Frames
        // are assembled one at a time and written with the socket's natural
        // backpressure.
        let Some(response) = bundle.response.clone() else {
            continue;
        };
        let extra = std::mem::take(&mut bundle.responses);

        for message in std::iter::once(response).chain(extra) {
            let frame = match tcp_frame(&Message::ClientServer(message)) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("Could not frame bulk leasequery reply: {}", e);
                    break;
                }
            };
            stream.write_all(&frame)?;
            statistics.count_outgoing_packet();
        }
    }

    Ok(())
}
