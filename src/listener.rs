//! Storage SCP
//!
//! A [`StorageListener`] owns one background thread that accepts
//! associations and serves them one at a time. C-STORE requests are written
//! to the local storage directory and C-ECHO requests are answered. A failed
//! association is logged and the listener moves on to the next one.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use dimse::types::status;
use dimse::{
    command, DimseAcceptor, DimseCommand, DimseConnection, DimseEngine, DimseMessage, Incoming,
    ListenerOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBus, EventKind};
use crate::models::LocalIdentity;
use crate::storage::{FilesystemStorage, StorageBackend};

/// Poll interval of both the accept loop and command dispatch
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Called with the path of every stored instance
pub type StorageCallback = Arc<dyn Fn(&Path) + Send + Sync>;

/// How an inbound association ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationOutcome {
    /// The requestor released it
    ReleasedByPeer,
    /// We released it (idle, or the listener is stopping)
    Released,
    AbortOrError,
}

struct ListenerRuntime {
    stop: CancellationToken,
    thread: JoinHandle<()>,
    local_addr: Option<SocketAddr>,
}

pub struct StorageListener {
    engine: Arc<dyn DimseEngine>,
    local: LocalIdentity,
    events: Arc<EventBus>,
    callback: Option<StorageCallback>,
    bind_addr: IpAddr,
    idle_timeout: Duration,
    received: Arc<AtomicUsize>,
    runtime: Mutex<Option<ListenerRuntime>>,
}

impl StorageListener {
    pub fn new(engine: Arc<dyn DimseEngine>, local: LocalIdentity, events: Arc<EventBus>) -> Self {
        Self {
            engine,
            local,
            events,
            callback: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            idle_timeout: Duration::from_secs(30),
            received: Arc::new(AtomicUsize::new(0)),
            runtime: Mutex::new(None),
        }
    }

    pub fn with_callback(mut self, callback: StorageCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Release an association after this long without a command
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout.max(POLL_INTERVAL);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Option<ListenerRuntime>> {
        self.runtime.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bind the storage port and start accepting.
    ///
    /// Returns `false` when already running, when storage is disabled, or
    /// when the port or storage directory cannot be set up.
    pub fn start(&self) -> bool {
        let mut runtime = self.lock();
        if runtime.is_some() {
            warn!("Storage listener is already running");
            return false;
        }
        if !self.local.storage_enabled {
            warn!("Storage is disabled; not starting the storage listener");
            return false;
        }

        let storage = match FilesystemStorage::new(&self.local.temp_storage_path) {
            Ok(storage) => storage,
            Err(e) => {
                error!("Cannot prepare storage directory: {}", e);
                self.events.error(format!("Storage listener not started: {}", e));
                return false;
            }
        };

        let options = ListenerOptions {
            ae_title: self.local.ae_title.clone(),
            bind_addr: self.bind_addr,
            port: self.local.storage_port,
            max_pdu_length: self.local.max_pdu_size,
            ..ListenerOptions::default()
        };
        let acceptor = match self.engine.listen(&options) {
            Ok(acceptor) => acceptor,
            Err(e) => {
                error!("Cannot listen on port {}: {}", self.local.storage_port, e);
                self.events.error(format!("Storage listener not started: {}", e));
                return false;
            }
        };
        let local_addr = acceptor.local_addr();

        let stop = CancellationToken::new();
        let session = Session {
            storage: Arc::new(storage),
            events: self.events.clone(),
            callback: self.callback.clone(),
            received: self.received.clone(),
            stop: stop.clone(),
            idle_timeout: self.idle_timeout,
        };
        let thread = match std::thread::Builder::new()
            .name("storage-listener".into())
            .spawn(move || session.accept_loop(acceptor))
        {
            Ok(thread) => thread,
            Err(e) => {
                error!("Cannot spawn the storage listener thread: {}", e);
                return false;
            }
        };

        info!(
            "Storage listener {} accepting on {}",
            self.local.ae_title,
            local_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| format!("port {}", self.local.storage_port))
        );
        *runtime = Some(ListenerRuntime {
            stop,
            thread,
            local_addr,
        });
        true
    }

    /// Signal the loop, wait for it and close the port. Safe to call repeatedly.
    pub fn stop(&self) {
        let Some(runtime) = self.lock().take() else {
            return;
        };
        runtime.stop.cancel();
        if runtime.thread.join().is_err() {
            error!("Storage listener thread panicked");
        }
        info!("Storage listener stopped");
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// The address bound while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock().as_ref().and_then(|r| r.local_addr)
    }

    /// Instances stored since this listener was created
    pub fn received_count(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }
}

impl Drop for StorageListener {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for StorageListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageListener")
            .field("ae_title", &self.local.ae_title)
            .field("port", &self.local.storage_port)
            .field("running", &self.is_running())
            .field("received", &self.received_count())
            .finish()
    }
}

/// Everything the loop thread needs
struct Session {
    storage: Arc<dyn StorageBackend>,
    events: Arc<EventBus>,
    callback: Option<StorageCallback>,
    received: Arc<AtomicUsize>,
    stop: CancellationToken,
    idle_timeout: Duration,
}

impl Session {
    fn accept_loop(self, mut acceptor: Box<dyn DimseAcceptor>) {
        while !self.stop.is_cancelled() {
            match acceptor.accept(POLL_INTERVAL) {
                Ok(None) => continue,
                Ok(Some(connection)) => {
                    let peer = connection.peer_ae_title().to_string();
                    let outcome = self.handle_association(connection);
                    info!(peer = %peer, ?outcome, "Association finished");
                }
                Err(e) => {
                    warn!("Failed to accept association: {}", e);
                    // a broken listener must not spin
                    std::thread::sleep(POLL_INTERVAL / 10);
                }
            }
        }
        debug!("Accept loop exiting");
    }

    fn handle_association(&self, mut connection: Box<dyn DimseConnection>) -> AssociationOutcome {
        let mut idle = Duration::ZERO;
        loop {
            if self.stop.is_cancelled() {
                return release(connection.as_mut(), AssociationOutcome::Released);
            }

            match connection.receive_command(POLL_INTERVAL) {
                Err(e) if e.is_timeout() => {
                    idle += POLL_INTERVAL;
                    if idle >= self.idle_timeout {
                        debug!("Association idle for {:?}, releasing", idle);
                        return release(connection.as_mut(), AssociationOutcome::Released);
                    }
                }
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    connection.abort();
                    return AssociationOutcome::AbortOrError;
                }
                Ok(Incoming::ReleaseRequested) => {
                    return release(connection.as_mut(), AssociationOutcome::ReleasedByPeer);
                }
                Ok(Incoming::Aborted) => return AssociationOutcome::AbortOrError,
                Ok(Incoming::Message(message)) => {
                    idle = Duration::ZERO;
                    if let Err(e) = self.dispatch(connection.as_mut(), message) {
                        warn!("Could not answer request: {}", e);
                        connection.abort();
                        return AssociationOutcome::AbortOrError;
                    }
                }
            }
        }
    }

    fn dispatch(
        &self,
        connection: &mut dyn DimseConnection,
        message: DimseMessage,
    ) -> dimse::Result<()> {
        let field = command::command_field(&message.command);
        match field.and_then(DimseCommand::from_field) {
            Some((DimseCommand::Store, false)) => self.on_store(connection, message),
            Some((DimseCommand::Echo, false)) => {
                let message_id = command::message_id(&message.command).unwrap_or_default();
                debug!("C-ECHO request {}", message_id);
                connection.send_command(DimseMessage::new(
                    message.presentation_context_id,
                    command::echo_rsp(message_id, status::SUCCESS),
                ))
            }
            Some((DimseCommand::Cancel, _)) => {
                debug!("Ignoring C-CANCEL");
                Ok(())
            }
            _ => {
                warn!("Skipping unsupported command {:?}", field);
                Ok(())
            }
        }
    }

    fn on_store(
        &self,
        connection: &mut dyn DimseConnection,
        message: DimseMessage,
    ) -> dimse::Result<()> {
        let message_id = command::message_id(&message.command).unwrap_or_default();
        let sop_class = command::affected_sop_class_uid(&message.command).unwrap_or_default();
        let sop_instance = command::affected_sop_instance_uid(&message.command).unwrap_or_default();

        let status_code = match message.dataset {
            None => {
                warn!(sop_instance_uid = %sop_instance, "C-STORE without a readable data set");
                status::CANNOT_UNDERSTAND
            }
            Some(dataset) => match self.storage.store_instance(&sop_class, &sop_instance, dataset) {
                Ok(path) => {
                    let total = self.received.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(sop_instance_uid = %sop_instance, "Stored {}", path.display());
                    self.events.emit_kind(
                        EventKind::StorageReceived,
                        format!("Received {} ({} so far)", sop_instance, total),
                    );
                    if let Some(callback) = &self.callback {
                        callback(&path);
                    }
                    status::SUCCESS
                }
                Err(e) => {
                    error!(sop_instance_uid = %sop_instance, "Could not save instance: {}", e);
                    self.events.error(format!("Could not save {}: {}", sop_instance, e));
                    status::OUT_OF_RESOURCES
                }
            },
        };

        connection.send_command(DimseMessage::new(
            message.presentation_context_id,
            command::store_rsp(message_id, &sop_class, &sop_instance, status_code),
        ))
    }
}

fn release(
    connection: &mut dyn DimseConnection,
    outcome: AssociationOutcome,
) -> AssociationOutcome {
    match connection.release() {
        Ok(()) => outcome,
        Err(e) => {
            debug!("Release failed, aborting: {}", e);
            connection.abort();
            AssociationOutcome::AbortOrError
        }
    }
}
