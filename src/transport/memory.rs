// Copyright 2024 meshp2p developers
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! In-memory transport over duplex pipes.
//!
//! Dialable endpoints live in a [`MemoryHub`] that callers share explicitly
//! between the nodes of one process; there is no process-wide registry.

use crate::{
    error::{AddressError, Error},
    transport::{RawConnection, Transport, TransportListener},
};

use multiaddr::{Multiaddr, Protocol};
use parking_lot::RwLock;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio_util::sync::CancellationToken;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

/// Logging target for the file.
const LOG_TARGET: &str = "meshp2p::transport::memory";

/// Buffer size of one direction of a memory connection.
const PIPE_CAPACITY: usize = 64 * 1024;

type PendingAccept = (Box<dyn RawConnection>, Multiaddr);

/// Registry connecting in-process memory listeners and dialers.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<MemoryHubInner>,
}

#[derive(Default)]
struct MemoryHubInner {
    listeners: RwLock<HashMap<u64, Sender<PendingAccept>>>,
    next_port: AtomicU64,
}

impl MemoryHub {
    fn bind(&self, port: u64) -> crate::Result<(u64, Receiver<PendingAccept>)> {
        let mut listeners = self.inner.listeners.write();

        let port = if port == 0 {
            loop {
                let candidate = self.inner.next_port.fetch_add(1, Ordering::Relaxed) + 1;
                if !listeners.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if listeners.contains_key(&port) {
                return Err(Error::InvalidParameters(format!("/memory/{port} is already bound")));
            }
            port
        };

        let (tx, rx) = channel(64);
        listeners.insert(port, tx);

        Ok((port, rx))
    }

    fn connect_to(&self, port: u64) -> Option<Sender<PendingAccept>> {
        self.inner.listeners.read().get(&port).cloned()
    }

    fn unbind(&self, port: u64) {
        self.inner.listeners.write().remove(&port);
    }
}

/// The `/memory` transport.
pub struct MemoryTransport {
    hub: MemoryHub,
    next_dialer_id: AtomicU64,
}

impl MemoryTransport {
    /// Create a new memory transport connected to `hub`.
    pub fn new(hub: MemoryHub) -> Self {
        Self { hub, next_dialer_id: AtomicU64::new(0) }
    }

    fn port_of(address: &Multiaddr) -> crate::Result<u64> {
        match address.iter().next() {
            Some(Protocol::Memory(port)) => Ok(port),
            _ => Err(Error::AddressError(AddressError::InvalidProtocol)),
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    fn tag(&self) -> &'static str {
        "memory"
    }

    fn can_dial(&self, address: &Multiaddr) -> bool {
        matches!(address.iter().next(), Some(Protocol::Memory(_)))
    }

    async fn dial(
        &self,
        address: Multiaddr,
        abort: CancellationToken,
    ) -> crate::Result<Box<dyn RawConnection>> {
        let port = Self::port_of(&address)?;

        let accept_tx = self.hub.connect_to(port).ok_or_else(|| Error::TransportDialFailed {
            address: address.clone(),
            error: "no listener bound".to_string(),
        })?;

        let (dialer_end, listener_end) = tokio::io::duplex(PIPE_CAPACITY);

        // Synthesized source address so the listener sees a distinct remote.
        let dialer_id = self.next_dialer_id.fetch_add(1, Ordering::Relaxed);
        let dialer_address =
            Multiaddr::empty().with(Protocol::Memory(u64::MAX - dialer_id));

        tracing::trace!(target: LOG_TARGET, ?address, "dial memory listener");

        tokio::select! {
            sent = accept_tx.send((Box::new(listener_end), dialer_address)) => {
                sent.map_err(|_| Error::TransportDialFailed {
                    address,
                    error: "listener closed".to_string(),
                })?;
                Ok(Box::new(dialer_end))
            }
            _ = abort.cancelled() => Err(Error::Aborted),
        }
    }

    async fn listen(&self, address: Multiaddr) -> crate::Result<Box<dyn TransportListener>> {
        let port = Self::port_of(&address)?;
        let (port, rx) = self.hub.bind(port)?;

        Ok(Box::new(MemoryListener {
            hub: self.hub.clone(),
            port,
            address: Multiaddr::empty().with(Protocol::Memory(port)),
            rx,
        }))
    }
}

/// Listener half of the memory transport.
struct MemoryListener {
    hub: MemoryHub,
    port: u64,
    address: Multiaddr,
    rx: Receiver<PendingAccept>,
}

#[async_trait::async_trait]
impl TransportListener for MemoryListener {
    fn local_address(&self) -> Multiaddr {
        self.address.clone()
    }

    async fn accept(&mut self) -> crate::Result<(Box<dyn RawConnection>, Multiaddr)> {
        self.rx.recv().await.ok_or(Error::ConnectionEnded)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.hub.unbind(self.port);
    }
}
