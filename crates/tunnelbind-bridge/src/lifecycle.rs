//! Interrupt-driven cleanup of bridged tunnels
//!
//! Every successful [`bind`](crate::bind) registers its tunnel and socket
//! here. The first registration installs a single Ctrl+C watcher. On
//! interrupt, all registered tunnels and sockets are closed and the engine
//! logging callback is removed, unless the application holds an
//! [`InterruptClaim`], in which case the application owns shutdown.

use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::runtime::Handle;
use tracing::{debug, warn};
use tunnelbind_engine::{logging, Engine, LogLevel, Tunnel};

use crate::server::ServerSocket;

/// Exit status after an interrupt, as for a default SIGINT termination
pub const INTERRUPT_EXIT_CODE: i32 = 130;

type Registration = (Arc<dyn Tunnel>, Arc<dyn ServerSocket>);

/// What an interrupt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// An application claim was held; nothing was closed
    Deferred,
    /// The given number of registered pairs were closed
    Cleaned(usize),
}

#[derive(Debug)]
pub struct CleanupRegistry {
    entries: Mutex<Vec<Registration>>,
    watching: AtomicBool,
    claims: AtomicUsize,
    exit_on_interrupt: AtomicBool,
    logging_engine: Mutex<Option<Arc<dyn Engine>>>,
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            watching: AtomicBool::new(false),
            claims: AtomicUsize::new(0),
            exit_on_interrupt: AtomicBool::new(true),
            logging_engine: Mutex::new(None),
        }
    }
}

impl CleanupRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track a tunnel/socket pair for interrupt cleanup
    pub fn register(self: &Arc<Self>, tunnel: Arc<dyn Tunnel>, socket: Arc<dyn ServerSocket>) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((tunnel, socket));
        self.watch();
    }

    /// Number of pairs awaiting cleanup
    pub fn pending(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Declare that the application handles interrupts itself. Cleanup is
    /// skipped while the returned guard is alive.
    pub fn claim_interrupt(self: &Arc<Self>) -> InterruptClaim {
        self.claims.fetch_add(1, Ordering::SeqCst);
        InterruptClaim {
            registry: self.clone(),
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.claims.load(Ordering::SeqCst) > 0
    }

    /// Whether the watcher terminates the process after cleaning up
    pub fn set_exit_on_interrupt(&self, exit: bool) {
        self.exit_on_interrupt.store(exit, Ordering::SeqCst);
    }

    pub fn exits_on_interrupt(&self) -> bool {
        self.exit_on_interrupt.load(Ordering::SeqCst)
    }

    /// Engine whose logging callback is removed on interrupt. Without one the
    /// process-wide slot is cleared directly.
    pub fn set_logging_engine(&self, engine: Arc<dyn Engine>) {
        *self.logging_engine.lock().unwrap_or_else(|e| e.into_inner()) = Some(engine);
    }

    /// Run the interrupt handler. Public so interruption can be simulated.
    ///
    /// Registered pairs are drained, so each tunnel and socket is closed at
    /// most once no matter how often this runs. Close errors are ignored.
    pub async fn on_interrupt(&self) -> CleanupOutcome {
        if self.is_claimed() {
            debug!("Interrupt handled by application, skipping tunnel cleanup");
            return CleanupOutcome::Deferred;
        }

        let entries: Vec<Registration> = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let count = entries.len();

        join_all(entries.into_iter().map(|(tunnel, socket)| async move {
            let id = tunnel.id();
            let (tunnel_result, socket_result) = tokio::join!(tunnel.close(), socket.close());
            match tunnel_result {
                Ok(()) => debug!("Closed tunnel: {}", id),
                Err(e) => debug!("Failed to close tunnel {}: {}", id, e),
            }
            match socket_result {
                Ok(()) => debug!("Closed socket: {}", socket.local_endpoint()),
                Err(e) => debug!("Failed to close socket {}: {}", socket.local_endpoint(), e),
            }
        }))
        .await;

        let engine = self
            .logging_engine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match engine {
            Some(engine) => engine.logging_callback(None, LogLevel::default()),
            None => logging::clear_callback(),
        }
        CleanupOutcome::Cleaned(count)
    }

    fn watch(self: &Arc<Self>) {
        if self.watching.swap(true, Ordering::SeqCst) {
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.watching.store(false, Ordering::SeqCst);
                warn!("No async runtime running; interrupt cleanup not installed");
                return;
            }
        };

        let registry = self.clone();
        handle.spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for interrupt: {}", e);
                    registry.watching.store(false, Ordering::SeqCst);
                    return;
                }

                if registry.on_interrupt().await == CleanupOutcome::Deferred {
                    continue;
                }
                if registry.exits_on_interrupt() {
                    std::process::exit(INTERRUPT_EXIT_CODE);
                }
            }
        });
    }
}

/// Guard returned by [`CleanupRegistry::claim_interrupt`]
#[derive(Debug)]
pub struct InterruptClaim {
    registry: Arc<CleanupRegistry>,
}

impl Drop for InterruptClaim {
    fn drop(&mut self) {
        self.registry.claims.fetch_sub(1, Ordering::SeqCst);
    }
}

static GLOBAL: OnceLock<Arc<CleanupRegistry>> = OnceLock::new();

/// The process-wide registry used by [`CleanupMode::Global`](crate::CleanupMode::Global)
pub fn global() -> &'static Arc<CleanupRegistry> {
    GLOBAL.get_or_init(CleanupRegistry::new)
}

/// Claim interrupt handling on the process-wide registry
pub fn claim_interrupt() -> InterruptClaim {
    global().claim_interrupt()
}

pub fn set_exit_on_interrupt(exit: bool) {
    global().set_exit_on_interrupt(exit);
}
