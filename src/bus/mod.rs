//! Message Bus Module
//!
//! This module provides the channel registry and message plumbing for
//! KernelMux. The broker sits between an interactive front-end and a proxied
//! compute kernel; every message travels on one of a small fixed set of
//! duplex channels and is routed through the broker, which may intercept,
//! rewrite, or suppress it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  inbound   ┌─────────────┐  to_backend  ┌─────────────┐
//! │  Front-end  │───────────>│  KernelBus  │─────────────>│   Kernel    │
//! │ (notebook)  │<───────────│  (router)   │<─────────────│  (backend)  │
//! └─────────────┘ to_frontend└─────────────┘   inbound    └─────────────┘
//! ```
//!
//! Transport adapters feed messages from both sides into the inbound queue
//! and drain the two outbound queues. The router (see [`crate::broker`])
//! consumes inbound envelopes, runs them through the filter chain and the
//! exchange correlator, and forwards survivors to the opposite side.

pub mod message;

pub use message::{BusEnvelope, BusMessage, Origin};

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::error::{MuxError, Result};

/// Default buffer size for bus queues
const DEFAULT_BUFFER_SIZE: usize = 100;

/// One of the fixed kernel channels.
///
/// The set is immutable for the process lifetime; each channel has a stable
/// index usable for table lookups.
///
/// # Example
/// ```
/// use kernelmux::bus::Channel;
///
/// assert_eq!(Channel::from_name("iopub"), Some(Channel::IoPub));
/// assert_eq!(Channel::IoPub.name(), "iopub");
/// assert_eq!(Channel::ALL[Channel::IoPub.index()], Channel::IoPub);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Request/reply channel for execution and custom control messages
    Shell,
    /// Broadcast channel for output, results, and status
    IoPub,
    /// Stdin requests from the kernel to the front-end
    Stdin,
    /// Out-of-band control requests
    Control,
    /// Liveness probe channel
    Heartbeat,
}

impl Channel {
    /// All channels in index order.
    pub const ALL: [Channel; 5] = [
        Channel::Shell,
        Channel::IoPub,
        Channel::Stdin,
        Channel::Control,
        Channel::Heartbeat,
    ];

    /// The channel's stable name.
    pub fn name(&self) -> &'static str {
        match self {
            Channel::Shell => "shell",
            Channel::IoPub => "iopub",
            Channel::Stdin => "stdin",
            Channel::Control => "control",
            Channel::Heartbeat => "hb",
        }
    }

    /// Looks a channel up by name.
    pub fn from_name(name: &str) -> Option<Channel> {
        Channel::ALL.iter().copied().find(|c| c.name() == name)
    }

    /// The channel's stable index into [`Channel::ALL`].
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Looks a channel up by index.
    pub fn from_index(index: usize) -> Option<Channel> {
        Channel::ALL.get(index).copied()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The central bus multiplexing all channels.
///
/// Three queues:
/// - **inbound**: envelopes from either side awaiting routing
/// - **to_backend**: envelopes to deliver to the kernel transport
/// - **to_frontend**: envelopes to deliver to the front-end transport
///
/// All queues use async MPSC channels backed by Tokio. Cloning the bus
/// shares the same underlying queues.
pub struct KernelBus {
    inbound_tx: mpsc::Sender<BusEnvelope>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<BusEnvelope>>>,
    backend_tx: mpsc::Sender<BusEnvelope>,
    backend_rx: Arc<Mutex<mpsc::Receiver<BusEnvelope>>>,
    frontend_tx: mpsc::Sender<BusEnvelope>,
    frontend_rx: Arc<Mutex<mpsc::Receiver<BusEnvelope>>>,
}

impl KernelBus {
    /// Creates a new bus with default buffer sizes.
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Creates a new bus with a custom queue buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(buffer_size);
        let (backend_tx, backend_rx) = mpsc::channel(buffer_size);
        let (frontend_tx, frontend_rx) = mpsc::channel(buffer_size);
        Self {
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            backend_tx,
            backend_rx: Arc::new(Mutex::new(backend_rx)),
            frontend_tx,
            frontend_rx: Arc::new(Mutex::new(frontend_rx)),
        }
    }

    /// Publishes an envelope for routing.
    ///
    /// Called by transport adapters when a message arrives from either side.
    ///
    /// # Errors
    /// Returns [`MuxError::BusClosed`] if the router has been dropped.
    pub async fn publish_inbound(&self, envelope: BusEnvelope) -> Result<()> {
        self.inbound_tx
            .send(envelope)
            .await
            .map_err(|_| MuxError::BusClosed)
    }

    /// Consumes the next envelope awaiting routing.
    ///
    /// Returns `None` when the queue is closed (all senders dropped).
    pub async fn consume_inbound(&self) -> Option<BusEnvelope> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Queues an envelope for delivery to the kernel.
    pub async fn send_to_backend(&self, envelope: BusEnvelope) -> Result<()> {
        self.backend_tx
            .send(envelope)
            .await
            .map_err(|_| MuxError::BusClosed)
    }

    /// Consumes the next envelope bound for the kernel transport.
    pub async fn consume_backend(&self) -> Option<BusEnvelope> {
        self.backend_rx.lock().await.recv().await
    }

    /// Queues an envelope for delivery to the front-end.
    pub async fn send_to_frontend(&self, envelope: BusEnvelope) -> Result<()> {
        self.frontend_tx
            .send(envelope)
            .await
            .map_err(|_| MuxError::BusClosed)
    }

    /// Consumes the next envelope bound for the front-end transport.
    pub async fn consume_frontend(&self) -> Option<BusEnvelope> {
        self.frontend_rx.lock().await.recv().await
    }

    /// Tries to queue an envelope for the front-end without blocking.
    ///
    /// Used for best-effort event surfacing (observer callbacks must not
    /// block the agent loop).
    pub fn try_send_to_frontend(&self, envelope: BusEnvelope) -> Result<()> {
        self.frontend_tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MuxError::Channel("frontend buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => MuxError::BusClosed,
        })
    }

    /// Tries to publish an inbound envelope without blocking.
    pub fn try_publish_inbound(&self, envelope: BusEnvelope) -> Result<()> {
        self.inbound_tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                MuxError::Channel("inbound buffer full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => MuxError::BusClosed,
        })
    }

    /// Returns a clone of the inbound sender for transport adapters.
    pub fn inbound_sender(&self) -> mpsc::Sender<BusEnvelope> {
        self.inbound_tx.clone()
    }
}

impl Default for KernelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for KernelBus {
    /// Clones the bus, sharing the same underlying queues.
    fn clone(&self) -> Self {
        Self {
            inbound_tx: self.inbound_tx.clone(),
            inbound_rx: Arc::clone(&self.inbound_rx),
            backend_tx: self.backend_tx.clone(),
            backend_rx: Arc::clone(&self.backend_rx),
            frontend_tx: self.frontend_tx.clone(),
            frontend_rx: Arc::clone(&self.frontend_rx),
        }
    }
}
