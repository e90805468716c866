//! Connection state and the background reconnection loop.
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use opentelemetry::{otel_debug, otel_info, otel_warn};
use tokio::sync::{mpsc, watch, Mutex};

use crate::proto::agent::common::v1::Node;
use crate::proto::resource::v1::Resource;
use crate::sampler::AgentSampler;
use crate::session::Session;
use crate::transport::AgentTransport;
use crate::Error;

/// State of the connection to the agent.
#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionState {
    /// Not connected: no connection was attempted yet, or the exporter was
    /// stopped.
    Unconnected,
    /// A connection attempt is in progress.
    Connecting {
        /// Why the previous connection failed or was lost, if it did.
        last_error: Option<Error>,
    },
    /// Streams to the agent are open.
    Connected,
    /// The last connection failed or was lost.
    Disconnected {
        /// What went wrong.
        error: Error,
        /// When it went wrong.
        at: SystemTime,
    },
}

/// Owns the connection to the agent.
///
/// The state and the active session live behind separate locks, so reading
/// the state never waits on a dial. Only one dial runs at a time.
pub(crate) struct ConnectionManager {
    transport: Arc<dyn AgentTransport>,
    node: Node,
    resource: Option<Resource>,
    sampler: AgentSampler,
    state: RwLock<ConnectionState>,
    session: RwLock<Option<Arc<Session>>>,
    dial_lock: Mutex<()>,
    // capacity one, so signals raised while a reconnect is pending coalesce
    disconnected: mpsc::Sender<()>,
    stop: watch::Sender<bool>,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    /// Create a manager along with the receiving end of its disconnect
    /// signal, to be handed to [`run_reconnection_loop`].
    pub(crate) fn new(
        transport: Arc<dyn AgentTransport>,
        node: Node,
        resource: Option<Resource>,
        sampler: AgentSampler,
    ) -> (Self, mpsc::Receiver<()>) {
        let (disconnected, disconnected_rx) = mpsc::channel(1);
        let (stop, _) = watch::channel(false);
        (
            ConnectionManager {
                transport,
                node,
                resource,
                sampler,
                state: RwLock::new(ConnectionState::Unconnected),
                session: RwLock::new(None),
                dial_lock: Mutex::new(()),
                disconnected,
                stop,
            },
            disconnected_rx,
        )
    }

    /// Dial the agent and open a new session, replacing and closing the
    /// previous one. The outcome is recorded in the connection state.
    pub(crate) async fn connect(&self) -> Result<(), Error> {
        let _dialing = self.dial_lock.lock().await;
        if self.is_stopped() {
            return Err(Error::Stopped);
        }

        self.update_state(|state| match state {
            ConnectionState::Unconnected => {
                *state = ConnectionState::Connecting { last_error: None }
            }
            ConnectionState::Disconnected { error, .. } => {
                let last_error = Some(error.clone());
                *state = ConnectionState::Connecting { last_error }
            }
            ConnectionState::Connected | ConnectionState::Connecting { .. } => {}
        });

        let opened = match self.transport.dial().await {
            Ok(connection) => {
                Session::open(connection, &self.node, self.resource.as_ref(), self.sampler.clone())
                    .await
            }
            Err(err) => Err(err),
        };

        match opened {
            Ok(session) => {
                let previous = self.replace_session(Some(Arc::new(session)));
                self.update_state(|state| *state = ConnectionState::Connected);
                if let Some(previous) = previous {
                    previous.close().await;
                }
                otel_info!(name: "OcAgent.Connected");
                Ok(())
            }
            Err(err) => {
                otel_warn!(name: "OcAgent.ConnectFailed", reason = format!("{}", err));
                self.mark_disconnected(err.clone());
                Err(err)
            }
        }
    }

    /// Record a failure and wake the reconnection loop.
    pub(crate) fn mark_disconnected(&self, error: Error) {
        self.update_state(|state| {
            *state = ConnectionState::Disconnected {
                error,
                at: SystemTime::now(),
            }
        });
        // full means a reconnect is already pending
        let _ = self.disconnected.try_send(());
    }

    /// Record a failure seen on `session`, unless a newer session has
    /// replaced it since.
    pub(crate) fn report_failure(&self, session: &Arc<Session>, error: Error) {
        let current = self.current_session();
        if current.is_some_and(|current| Arc::ptr_eq(&current, session)) {
            self.mark_disconnected(error);
        }
    }

    /// The session to send on, or why there is none.
    pub(crate) fn active_session(&self) -> Result<Arc<Session>, Error> {
        match self.state() {
            ConnectionState::Connected => self.current_session().ok_or(Error::NoConnection),
            ConnectionState::Disconnected { error, .. }
            | ConnectionState::Connecting {
                last_error: Some(error),
            } => Err(Error::LastConnection(Box::new(error))),
            ConnectionState::Unconnected | ConnectionState::Connecting { last_error: None } => {
                Err(Error::NoConnection)
            }
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(state) => state.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(self.state(), ConnectionState::Connected)
    }

    pub(crate) fn last_error(&self) -> Option<Error> {
        match self.state() {
            ConnectionState::Disconnected { error, .. } => Some(error),
            ConnectionState::Connecting { last_error } => last_error,
            ConnectionState::Unconnected | ConnectionState::Connected => None,
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    pub(crate) fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    /// Signal the stop and close the active session.
    pub(crate) async fn shutdown(&self) {
        self.stop.send_replace(true);
        let _dialing = self.dial_lock.lock().await;
        let session = self.replace_session(None);
        self.update_state(|state| *state = ConnectionState::Unconnected);
        if let Some(session) = session {
            session.close().await;
        }
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        match self.session.read() {
            Ok(session) => session.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn replace_session(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        match self.session.write() {
            Ok(mut current) => std::mem::replace(&mut *current, session),
            Err(poisoned) => std::mem::replace(&mut *poisoned.into_inner(), session),
        }
    }

    fn update_state(&self, f: impl FnOnce(&mut ConnectionState)) {
        match self.state.write() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

/// Reconnect whenever a disconnect is signalled, until stopped.
///
/// Each attempt is followed by a fixed wait, so a failing agent is dialed at
/// most once per `period`. A failed attempt signals again by itself.
pub(crate) async fn run_reconnection_loop(
    manager: Arc<ConnectionManager>,
    period: Duration,
    mut disconnected: mpsc::Receiver<()>,
) {
    let mut stop = manager.subscribe_stop();

    loop {
        if *stop.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;
            _ = stop.changed() => continue,
            signal = disconnected.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }

        otel_debug!(name: "OcAgent.Reconnecting");
        let _ = manager.connect().await;

        tokio::select! {
            biased;
            _ = stop.changed() => {}
            _ = tokio::time::sleep(period) => {}
        }
    }

    otel_debug!(name: "OcAgent.ReconnectionLoopStopped");
}
