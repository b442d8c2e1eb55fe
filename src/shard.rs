//! One independent endpoint per core
//!
//! Every worker thread runs its own single-threaded runtime, socket, engine and connection table.
//! The sockets share one port through `SO_REUSEPORT`, so the kernel spreads flows across workers
//! and no state is ever shared between them.

use std::{
    net::{SocketAddr, UdpSocket},
    sync::{mpsc as std_mpsc, Arc},
    thread,
};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span};

use crate::{
    Application, ConfigError, Endpoint, EndpointConfig, EndpointError, EndpointStats, Engine,
    Runtime, TokioRuntime,
};

/// Bind a UDP socket to `addr` that other sockets may bind to as well
pub fn bind_reuseport(addr: SocketAddr) -> Result<UdpSocket, ConfigError> {
    let bind_err = |source| ConfigError::Bind { addr, source };
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&SockAddr::from(addr)).map_err(bind_err)?;
    Ok(socket.into())
}

/// Running workers started by [`spawn_workers`]
#[derive(Debug)]
pub struct Workers {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    threads: Vec<thread::JoinHandle<Result<EndpointStats, EndpointError>>>,
}

impl Workers {
    /// The address every worker is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of workers
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    /// Whether there are no workers
    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Ask every worker to close its connections and stop
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Wait for every worker to stop, returning each worker's statistics
    pub fn join(self) -> Vec<Result<EndpointStats, EndpointError>> {
        self.threads
            .into_iter()
            .map(|thread| match thread.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    }
}

/// Start `count` endpoints on `addr`, one per thread
///
/// `factory` builds each worker's engine and application on that worker's thread, so engines
/// need not be `Send`. If `addr` has port zero, every worker shares the port the first one got.
/// Returns once every worker is serving, or with the first error that kept a worker from
/// starting, in which case the workers that did start are stopped.
pub fn spawn_workers<E, A, F>(
    count: usize,
    addr: SocketAddr,
    config: EndpointConfig,
    factory: F,
) -> Result<Workers, ConfigError>
where
    E: Engine + 'static,
    A: Application + 'static,
    F: Fn(usize) -> Result<(E, A), ConfigError> + Send + Sync + 'static,
{
    if count == 0 {
        return Err(ConfigError::NoWorkers);
    }

    let first = bind_reuseport(addr)?;
    let local_addr = first.local_addr().map_err(|source| ConfigError::Bind { addr, source })?;
    let mut sockets = vec![first];
    for _ in 1..count {
        sockets.push(bind_reuseport(local_addr)?);
    }

    let factory = Arc::new(factory);
    let (shutdown, _) = watch::channel(false);
    let (ready_tx, ready_rx) = std_mpsc::channel();
    let mut threads = Vec::with_capacity(count);
    for (index, socket) in sockets.into_iter().enumerate() {
        let factory = factory.clone();
        let config = config.clone();
        let ready = ready_tx.clone();
        let mut stop = shutdown.subscribe();
        let thread = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || {
                let span = info_span!("endpoint", index, local = %local_addr);
                let _guard = span.enter();
                match start_worker(index, socket, local_addr, &*factory, config) {
                    Ok((rt, mut endpoint)) => {
                        let _ = ready.send(Ok(()));
                        drop(ready);
                        debug!("serving");
                        rt.block_on(endpoint.run_until(async move {
                            while !*stop.borrow_and_update() {
                                if stop.changed().await.is_err() {
                                    break;
                                }
                            }
                        }))
                    }
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        Ok(EndpointStats::default())
                    }
                }
            })
            .map_err(ConfigError::Runtime)?;
        threads.push(thread);
    }
    drop(ready_tx);

    let workers = Workers {
        local_addr,
        shutdown,
        threads,
    };
    for _ in 0..count {
        let failure = match ready_rx.recv() {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(_) => ConfigError::WorkerExited,
        };
        error!("worker failed to start: {failure}");
        workers.shutdown();
        workers.join();
        return Err(failure);
    }
    info!(%local_addr, count, "workers serving");
    Ok(workers)
}

fn start_worker<E, A, F>(
    index: usize,
    socket: UdpSocket,
    addr: SocketAddr,
    factory: &F,
    config: EndpointConfig,
) -> Result<(tokio::runtime::Runtime, Endpoint<E, A>), ConfigError>
where
    E: Engine,
    A: Application,
    F: Fn(usize) -> Result<(E, A), ConfigError>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ConfigError::Runtime)?;
    let (engine, app) = factory(index)?;
    let bind_err = |source| ConfigError::Bind { addr, source };
    let endpoint = {
        // Registering the socket and spawning the endpoint's tasks need the runtime context
        let _enter = rt.enter();
        let runtime: Arc<dyn Runtime> = Arc::new(TokioRuntime);
        let socket = runtime.wrap_udp_socket(socket).map_err(bind_err)?;
        Endpoint::new(engine, app, socket, runtime, config).map_err(bind_err)?
    };
    Ok((rt, endpoint))
}
