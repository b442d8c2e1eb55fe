use std::{
    fmt::Debug,
    future::{poll_fn, Future},
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Instant,
};

/// Abstracts I/O and timer operations for runtime independence
pub trait Runtime: Send + Sync + Debug + 'static {
    /// Construct a timer that will expire at `i`
    fn new_timer(&self, i: Instant) -> Pin<Box<dyn AsyncTimer>>;
    /// Drive `future` to completion in the background
    fn spawn(&self, future: Pin<Box<dyn Future<Output = ()> + Send>>);
    /// Convert `t` into the socket type used by this runtime
    fn wrap_udp_socket(&self, t: std::net::UdpSocket) -> io::Result<Arc<dyn AsyncUdpSocket>>;
    /// Look up the current time
    ///
    /// Pacing deadlines reported by the engine are compared against this clock.
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Abstract implementation of an async timer for runtime independence
pub trait AsyncTimer: Send + Debug + 'static {
    /// Update the timer to expire at `i`
    fn reset(self: Pin<&mut Self>, i: Instant);
    /// Check whether the timer has expired, and register to be woken if not
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<()>;
}

/// Abstract implementation of a UDP socket for runtime independence
///
/// One socket is shared by every connection of an endpoint. Writes to it only ever come from send
/// pipelines, each of which has at most one send in flight.
pub trait AsyncUdpSocket: Send + Sync + Debug + 'static {
    /// Send one datagram to `destination`, or register to be woken if sending may succeed in the
    /// future
    fn poll_send_to(
        &self,
        cx: &mut Context,
        datagram: &[u8],
        destination: SocketAddr,
    ) -> Poll<io::Result<usize>>;

    /// Receive one datagram into `buf`, or register to be woken if receiving may succeed in the
    /// future
    ///
    /// A datagram longer than `buf` is truncated to fit.
    fn poll_recv_from(
        &self,
        cx: &mut Context,
        buf: &mut [u8],
    ) -> Poll<io::Result<(usize, SocketAddr)>>;

    /// Look up the local IP address and port used by this socket
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Automatically select an appropriate runtime
///
/// Returns [`TokioRuntime`] when called from within a Tokio runtime context, and `None`
/// otherwise.
pub fn default_runtime() -> Option<Arc<dyn Runtime>> {
    if ::tokio::runtime::Handle::try_current().is_ok() {
        return Some(Arc::new(TokioRuntime));
    }
    None
}

pub(crate) async fn send_to(
    socket: &dyn AsyncUdpSocket,
    datagram: &[u8],
    destination: SocketAddr,
) -> io::Result<usize> {
    poll_fn(|cx| socket.poll_send_to(cx, datagram, destination)).await
}

pub(crate) async fn recv_from(
    socket: &dyn AsyncUdpSocket,
    buf: &mut [u8],
) -> io::Result<(usize, SocketAddr)> {
    poll_fn(|cx| socket.poll_recv_from(cx, buf)).await
}

pub(crate) async fn sleep_until(runtime: &dyn Runtime, deadline: Instant) {
    let mut timer = runtime.new_timer(deadline);
    poll_fn(|cx| timer.as_mut().poll(cx)).await
}

mod tokio;
pub use self::tokio::TokioRuntime;
