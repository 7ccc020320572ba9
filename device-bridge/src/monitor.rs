//! Device Monitor
//!
//! Supervises sessions for one backend: a `DeviceSessionManager` is created
//! for every `appeared` of the backend's bus name and destroyed on
//! `vanished`. All of it runs in the single dispatch loop of `run`.
//!
//! Switching backends means shutting down one monitor and building another
//! with a different connector and watcher.

use crate::bridge::{BackendKind, BridgeConnector};
use crate::session::{DeviceSessionManager, SessionEvent, SessionInput, SessionState};
use crate::subscription::Listeners;
use crate::watcher::{BusNameWatcher, NameEvent, OwnerHandle};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub struct DeviceMonitor {
    watcher: BusNameWatcher,
    connector: Arc<dyn BridgeConnector>,
    events: Listeners<SessionEvent>,
    session: Option<DeviceSessionManager>,
}

impl DeviceMonitor {
    pub fn new(
        watcher: BusNameWatcher,
        connector: Arc<dyn BridgeConnector>,
        events: Listeners<SessionEvent>,
    ) -> Self {
        Self {
            watcher,
            connector,
            events,
            session: None,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.connector.kind()
    }

    /// Registry the monitor's sessions report to
    pub fn events(&self) -> &Listeners<SessionEvent> {
        &self.events
    }

    /// The active session, if the backend is currently up
    pub fn session(&self) -> Option<&DeviceSessionManager> {
        self.session.as_ref()
    }

    /// Dispatch until `shutdown` fires or the name watcher ends
    pub async fn run(&mut self, mut shutdown: oneshot::Receiver<()>) {
        info!("Monitoring {} on {}", self.kind(), self.watcher.name());

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Shutdown requested");
                    break;
                }

                event = self.watcher.next() => match event {
                    Some(NameEvent::Appeared { owner }) => self.on_appeared(owner).await,
                    Some(NameEvent::Vanished) => {
                        info!("{} vanished from the bus", self.kind());
                        self.end_session();
                    }
                    None => {
                        warn!("Stopped receiving ownership changes for {}", self.watcher.name());
                        break;
                    }
                },

                Some(input) = session_input(&mut self.session) => self.on_session_input(input),
            }
        }

        self.shutdown();
    }

    /// Destroy the active session and stop watching the bus name
    pub fn shutdown(&mut self) {
        self.end_session();
        self.watcher.unwatch();
    }

    async fn on_appeared(&mut self, owner: OwnerHandle) {
        // The watcher alternates events, but never let two sessions overlap
        self.end_session();
        info!("{} appeared on the bus as {}", self.kind(), owner);

        let bridge = match self.connector.connect(&owner).await {
            Ok(bridge) => bridge,
            Err(e) => {
                warn!("Failed to connect to {}: {}", owner, e);
                return;
            }
        };

        let mut session = DeviceSessionManager::new(bridge, owner, self.events.clone());
        match session.start().await {
            Ok(()) => self.session = Some(session),
            Err(e) => warn!(
                "Failed to start {} session, waiting for the service to reappear: {}",
                self.kind(),
                e
            ),
        }
    }

    fn on_session_input(&mut self, input: SessionInput) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.handle(input);
        if session.state() != SessionState::Active {
            self.session = None;
        }
    }

    fn end_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.destroy();
        }
    }
}

async fn session_input(session: &mut Option<DeviceSessionManager>) -> Option<SessionInput> {
    match session {
        Some(session) => session.next_input().await,
        None => std::future::pending().await,
    }
}
