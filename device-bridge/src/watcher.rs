//! Bus Name Watcher
//!
//! Follows ownership of a backend's well-known bus name and reports
//! `Appeared` / `Vanished` transitions. The watcher guarantees strict
//! alternation: callers never see two `Appeared` without a `Vanished` in
//! between, or the other way round.
//!
//! A failing bus connection is reported the same way as an exiting backend:
//! if the name was owned, a final `Vanished` is delivered before the event
//! stream ends.

use crate::Result;
use futures::stream::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::names::{BusName, UniqueName};
use zbus::Connection;

/// Unique bus name of the process owning the watched name
pub type OwnerHandle = String;

/// Ownership transition of the watched name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameEvent {
    Appeared { owner: OwnerHandle },
    Vanished,
}

/// Folds raw ownership notifications into alternating events
#[derive(Debug, Default)]
pub struct OwnerTracker {
    owner: Option<OwnerHandle>,
}

impl OwnerTracker {
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Record the current owner (`None` when the name is unowned)
    ///
    /// A direct hand-over from one owner to another yields `Vanished`
    /// followed by `Appeared`.
    pub fn observe(&mut self, new_owner: Option<OwnerHandle>) -> Vec<NameEvent> {
        let new_owner = new_owner.filter(|owner| !owner.is_empty());

        match (self.owner.take(), new_owner) {
            (None, None) => Vec::new(),
            (None, Some(owner)) => {
                self.owner = Some(owner.clone());
                vec![NameEvent::Appeared { owner }]
            }
            (Some(_), None) => vec![NameEvent::Vanished],
            (Some(old), Some(owner)) if old == owner => {
                self.owner = Some(old);
                Vec::new()
            }
            (Some(_), Some(owner)) => {
                self.owner = Some(owner.clone());
                vec![NameEvent::Vanished, NameEvent::Appeared { owner }]
            }
        }
    }

    /// The ownership source is gone; treat the name as unowned
    pub fn source_lost(&mut self) -> Option<NameEvent> {
        self.owner.take().map(|_| NameEvent::Vanished)
    }
}

/// Subscription to ownership changes of one well-known name
pub struct BusNameWatcher {
    name: String,
    events: mpsc::UnboundedReceiver<NameEvent>,
    task: Option<JoinHandle<()>>,
    closed: bool,
}

impl BusNameWatcher {
    /// Watch `name` on the given bus connection
    pub async fn watch(connection: &Connection, name: &str) -> Result<Self> {
        let dbus = zbus::fdo::DBusProxy::new(connection).await?;

        // Subscribe before querying so no change between the two is lost
        let changes = dbus.receive_name_owner_changed_with_args(&[(0, name)]).await?;

        let bus_name = BusName::try_from(name).map_err(zbus::Error::from)?;
        let initial = match dbus.get_name_owner(bus_name).await {
            Ok(owner) => Some(owner.to_string()),
            Err(zbus::fdo::Error::NameHasNoOwner(_)) => None,
            Err(e) => return Err(e.into()),
        };

        let changes = changes.filter_map(|signal| async move {
            match signal.args() {
                Ok(args) => {
                    let new_owner: &Option<UniqueName<'_>> = args.new_owner();
                    Some(new_owner.as_ref().map(|owner| owner.to_string()))
                }
                Err(e) => {
                    warn!("Ignoring undecodable NameOwnerChanged: {}", e);
                    None
                }
            }
        });

        info!("Watching bus name {}", name);
        Ok(Self::from_owner_changes(name, initial, changes))
    }

    /// Build a watcher over an arbitrary source of owner changes
    ///
    /// `initial` is the owner at subscription time; each item of `changes`
    /// is the new owner after a change. The end of `changes` counts as loss
    /// of the bus.
    pub fn from_owner_changes<S>(name: &str, initial: Option<OwnerHandle>, changes: S) -> Self
    where
        S: Stream<Item = Option<OwnerHandle>> + Send + 'static,
    {
        let (tx, events) = mpsc::unbounded_channel();
        let watched = name.to_string();

        let task = tokio::spawn(async move {
            let mut tracker = OwnerTracker::default();
            let mut changes = Box::pin(changes);

            let mut pending = tracker.observe(initial);
            loop {
                for event in pending.drain(..) {
                    debug!("{}: {:?}", watched, event);
                    if tx.send(event).is_err() {
                        return;
                    }
                }

                match changes.next().await {
                    Some(owner) => pending = tracker.observe(owner),
                    None => break,
                }
            }

            warn!("Ownership stream for {} ended", watched);
            if let Some(event) = tracker.source_lost() {
                let _ = tx.send(event);
            }
        });

        Self {
            name: name.to_string(),
            events,
            task: Some(task),
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next ownership event; `None` once unwatched or the source has ended
    pub async fn next(&mut self) -> Option<NameEvent> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    /// Stop delivery; events already queued are dropped
    pub fn unwatch(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!("Stopped watching bus name {}", self.name);
    }
}

impl Drop for BusNameWatcher {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
