//! TCP socket options and the connection-count semaphore.

use std::sync::Arc;
use std::time::Duration;

use log::debug;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

/// Enables TCP keepalive on the stream. A zero duration leaves the socket
/// untouched.
pub fn set_tcp_keepalive(stream: &TcpStream, period: Duration) {
    if period.is_zero() {
        return;
    }
    let ka = TcpKeepalive::new().with_time(period).with_interval(period);
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&ka) {
        debug!("failed to set TCP keepalive: {e}");
    }
}

/// Limits concurrent tunneled connections. A limit of zero imposes no
/// bound.
pub struct ConnSemaphore {
    sem: Option<Arc<Semaphore>>,
}

/// Held for the lifetime of one tunneled connection; dropping it returns
/// the slot.
pub struct ConnPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnSemaphore {
    pub fn new(max: usize) -> Self {
        let sem = (max > 0).then(|| Arc::new(Semaphore::new(max)));
        Self { sem }
    }

    /// Attempts to take a slot without blocking. Returns `None` when the
    /// semaphore is at capacity.
    pub fn try_acquire(&self) -> Option<ConnPermit> {
        match &self.sem {
            None => Some(ConnPermit { _permit: None }),
            Some(sem) => match sem.clone().try_acquire_owned() {
                Ok(permit) => Some(ConnPermit {
                    _permit: Some(permit),
                }),
                Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
            },
        }
    }
}
