//! Format subscriptions (`refresh-client -B`)
//!
//! A subscription asks tmux to evaluate a format for a target and report
//! `%subscription-changed` whenever the result changes. The engine uses
//! them as a cheap change detector for window and pane attributes that have
//! no notification of their own (current command, size, name).

use crate::client::ProtocolClient;
use crate::commands::TmuxCommand;
use crate::error::{Result, TmuxError};
use crate::refresh::RefreshScope;
use crate::types::{TmuxPaneId, TmuxWindowId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Window attributes watched on every attach
pub const WINDOWS_SUBSCRIPTION: &str = "devhaven-windows";
const WINDOWS_FORMAT: &str =
    "#{window_index}|#{window_active}|#{window_name}|#{window_width}x#{window_height}";

/// Pane attributes watched on every attach
pub const PANES_SUBSCRIPTION: &str = "devhaven-panes";
const PANES_FORMAT: &str =
    "#{pane_index}|#{pane_active}|#{pane_width}x#{pane_height}|#{pane_current_command}";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub name: String,
    /// `@*`, `%*`, a single `@N`/`%N`, or empty for the session
    pub target: String,
    pub format: String,
}

type ValueKey = (String, Option<TmuxWindowId>, Option<TmuxPaneId>);

/// Registered subscriptions and the last value seen per target.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    subscriptions: BTreeMap<String, Subscription>,
    last_values: HashMap<ValueKey, String>,
}

impl SubscriptionSet {
    /// Register or replace. Returns `false` when an identical subscription
    /// already exists.
    pub fn insert(&mut self, subscription: Subscription) -> bool {
        if self.subscriptions.get(&subscription.name) == Some(&subscription) {
            return false;
        }
        let name = subscription.name.clone();
        self.last_values.retain(|(n, _, _), _| *n != name);
        self.subscriptions.insert(name, subscription);
        true
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.last_values.retain(|(n, _, _), _| n != name);
        self.subscriptions.remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.subscriptions.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.subscriptions.clear();
        self.last_values.clear();
    }

    /// Drop remembered values for windows and panes that no longer exist.
    pub fn forget_targets(&mut self, windows: &[TmuxWindowId], panes: &[TmuxPaneId]) {
        self.last_values.retain(|(_, window_id, pane_id), _| {
            !window_id.is_some_and(|id| windows.contains(&id))
                && !pane_id.is_some_and(|id| panes.contains(&id))
        });
    }

    pub fn tracked_values(&self) -> usize {
        self.last_values.len()
    }

    /// Record a reported value. Returns the refresh it calls for, or `None`
    /// for unknown subscriptions and values identical to the last one.
    ///
    /// A value attributed to a window the mirror knows refreshes just that
    /// window; anything else refreshes the whole session.
    pub fn on_change(
        &mut self,
        name: &str,
        value: &str,
        window_id: Option<TmuxWindowId>,
        pane_id: Option<TmuxPaneId>,
        known_window: impl Fn(TmuxWindowId) -> bool,
    ) -> Option<RefreshScope> {
        if !self.subscriptions.contains_key(name) {
            log::debug!("Ignoring change for unregistered subscription {name}");
            return None;
        }

        let key = (name.to_string(), window_id, pane_id);
        if self.last_values.get(&key).map(String::as_str) == Some(value) {
            return None;
        }
        self.last_values.insert(key, value.to_string());

        Some(match window_id {
            Some(window_id) if known_window(window_id) => RefreshScope::window(window_id),
            _ => RefreshScope::Full,
        })
    }
}

/// Keeps tmux's subscriptions in step with a [`SubscriptionSet`].
pub struct SubscriptionManager {
    client: Arc<ProtocolClient>,
    set: Mutex<SubscriptionSet>,
}

impl SubscriptionManager {
    pub fn new(client: Arc<ProtocolClient>) -> Self {
        Self {
            client,
            set: Mutex::new(SubscriptionSet::default()),
        }
    }

    /// Subscribe, doing nothing if the same subscription is already active.
    ///
    /// tmux rejecting the subscription (old versions, bad format) is logged
    /// and otherwise ignored; only channel failures are returned.
    pub async fn subscribe(&self, name: &str, target: &str, format: &str) -> Result<()> {
        let subscription = Subscription {
            name: name.to_string(),
            target: target.to_string(),
            format: format.to_string(),
        };
        if !self.set.lock().insert(subscription) {
            return Ok(());
        }

        match self
            .client
            .execute(&TmuxCommand::subscribe(name, target, format))
            .await
        {
            Ok(_) => {
                log::debug!("Subscribed {name} on {target:?}");
                Ok(())
            }
            Err(TmuxError::CommandFailed { message, .. }) => {
                log::warn!("tmux rejected subscription {name}: {message}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unsubscribe(&self, name: &str) -> Result<()> {
        if !self.set.lock().remove(name) {
            return Ok(());
        }
        self.client.send(&TmuxCommand::unsubscribe(name)).await
    }

    /// Install the window and pane watchers used by every session.
    pub async fn register_defaults(&self) -> Result<()> {
        self.subscribe(WINDOWS_SUBSCRIPTION, "@*", WINDOWS_FORMAT).await?;
        self.subscribe(PANES_SUBSCRIPTION, "%*", PANES_FORMAT).await
    }

    pub fn on_change(
        &self,
        name: &str,
        value: &str,
        window_id: Option<TmuxWindowId>,
        pane_id: Option<TmuxPaneId>,
        known_window: impl Fn(TmuxWindowId) -> bool,
    ) -> Option<RefreshScope> {
        self.set
            .lock()
            .on_change(name, value, window_id, pane_id, known_window)
    }

    pub fn names(&self) -> Vec<String> {
        self.set.lock().names()
    }

    pub fn forget_targets(&self, windows: &[TmuxWindowId], panes: &[TmuxPaneId]) {
        self.set.lock().forget_targets(windows, panes);
    }

    pub fn tracked_values(&self) -> usize {
        self.set.lock().tracked_values()
    }

    /// Forget every subscription locally; tmux drops them with the client.
    pub fn clear(&self) {
        self.set.lock().clear();
    }
}
