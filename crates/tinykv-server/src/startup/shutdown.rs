//! Stop handling for the server process
//!
//! [`StopHandle`] is the one-shot stop command shared between the service
//! host and whoever decides it is time to stop. [`ProcessSupervisor`] turns
//! the first termination signal into that command. [`ConnectionCloser`]
//! ends the connections that outlive the drain deadline.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::Result;

/// Cloneable, idempotent stop command
#[derive(Clone, Debug)]
pub struct StopHandle {
    inner: Arc<StopState>,
}

#[derive(Debug)]
struct StopState {
    requested: AtomicBool,
    sender: watch::Sender<bool>,
}

impl StopHandle {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            inner: Arc::new(StopState {
                requested: AtomicBool::new(false),
                sender,
            }),
        }
    }

    /// Request a stop. Returns true only for the call that initiated it.
    pub fn stop(&self) -> bool {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.sender.send_replace(true);
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested
    pub async fn stopped(&self) {
        let mut receiver = self.inner.sender.subscribe();
        // The sender lives as long as this handle, so this cannot fail
        let _ = receiver.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Forces every accepted connection closed.
///
/// Each connection holds a [`CloseSignal`] subscribed here. Connections run
/// in their own tasks, so ending the accept loop leaves them open until
/// [`close`](Self::close) is called.
#[derive(Debug)]
pub struct ConnectionCloser {
    sender: watch::Sender<bool>,
}

impl ConnectionCloser {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender }
    }

    pub fn signal(&self) -> CloseSignal {
        let mut receiver = self.sender.subscribe();
        CloseSignal {
            // A dropped closer closes its connections too
            wait: async move {
                let _ = receiver.wait_for(|closed| *closed).await;
            }
            .boxed(),
            fired: false,
        }
    }

    pub fn close(&self) {
        self.sender.send_replace(true);
    }

    /// Connections whose signal is still alive
    pub fn open_connections(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Resolves once every connection has dropped its signal
    pub async fn all_closed(&self) {
        self.sender.closed().await
    }
}

impl Default for ConnectionCloser {
    fn default() -> Self {
        Self::new()
    }
}

/// One connection's view of a [`ConnectionCloser`]
pub struct CloseSignal {
    wait: BoxFuture<'static, ()>,
    fired: bool,
}

impl CloseSignal {
    /// Ready once the closer has fired. Registers `cx` for wakeup otherwise.
    pub fn poll_closed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        if !self.fired && self.wait.poll_unpin(cx).is_ready() {
            self.fired = true;
        }
        if self.fired {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }
}

impl std::fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseSignal")
            .field("fired", &self.fired)
            .finish()
    }
}

/// Signals that stop the server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationSignal {
    Hangup,
    Interrupt,
    Terminate,
    Quit,
}

impl std::fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TerminationSignal::Hangup => "SIGHUP",
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
            TerminationSignal::Quit => "SIGQUIT",
        };
        f.write_str(name)
    }
}

/// Subscribe to SIGHUP, SIGINT, SIGTERM and SIGQUIT
#[cfg(unix)]
pub fn os_signals() -> Result<BoxStream<'static, TerminationSignal>> {
    use tokio::signal::unix::{SignalKind, signal};
    use tokio_stream::wrappers::SignalStream;

    use crate::error::ServerError;

    let kinds = [
        (SignalKind::hangup(), TerminationSignal::Hangup),
        (SignalKind::interrupt(), TerminationSignal::Interrupt),
        (SignalKind::terminate(), TerminationSignal::Terminate),
        (SignalKind::quit(), TerminationSignal::Quit),
    ];

    let mut streams = Vec::with_capacity(kinds.len());
    for (kind, sig) in kinds {
        let stream = SignalStream::new(signal(kind).map_err(ServerError::Signal)?);
        streams.push(stream.map(move |()| sig).boxed());
    }
    Ok(futures::stream::select_all(streams).boxed())
}

#[cfg(not(unix))]
pub fn os_signals() -> Result<BoxStream<'static, TerminationSignal>> {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => TerminationSignal::Interrupt,
            Err(_) => futures::future::pending().await,
        }
    };
    Ok(futures::stream::once(ctrl_c).boxed())
}

/// Translates the first termination signal into one stop command.
///
/// Armed on construction, triggered by the first signal, done after the
/// stop has been issued. It never touches the storage engine.
pub struct ProcessSupervisor<S> {
    signals: S,
    stop: StopHandle,
}

impl<S> ProcessSupervisor<S>
where
    S: Stream<Item = TerminationSignal> + Unpin + Send + 'static,
{
    pub fn new(signals: S, stop: StopHandle) -> Self {
        Self { signals, stop }
    }

    /// Wait for a signal and stop the host. Returns `None` when the host was
    /// stopped some other way or the signal source ended.
    pub async fn run(mut self) -> Option<TerminationSignal> {
        let stop = self.stop.clone();
        let signal = tokio::select! {
            signal = self.signals.next() => signal,
            _ = stop.stopped() => None,
        };

        let signal = signal?;
        info!("Received {}, stopping server", signal);
        self.stop.stop();
        Some(signal)
    }

    pub fn spawn(self) -> JoinHandle<Option<TerminationSignal>> {
        tokio::spawn(self.run())
    }
}
