// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Network state monitor.
//!
//! The host reports raw connectivity signals via [`NetworkMonitor::report`].
//! Raw signals flap, so the monitor only commits a state once it has held
//! for `settle_delay`; each committed change produces exactly one
//! [`NetworkEvent`]. A reported value that reverts before settling is
//! swallowed entirely.
//!
//! ```text
//! raw:      on ──off──on─────────off────────────────
//!                 └<settle┘        └──settle──┐
//! settled:  on ──────────────────────────────off────
//! events:                                   Offline
//! ```
//!
//! Connection quality is not measured here; it is taken from a
//! host-provided indicator such as the browser's `effectiveType`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Committed connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Online,
    Offline,
}

impl NetworkEvent {
    fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

impl std::fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Coarse connection-quality hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionQuality {
    #[default]
    Unknown,
    Fast,
    Moderate,
    Constrained,
}

impl ConnectionQuality {
    /// Map a host `effectiveType` string (`slow-2g`, `2g`, `3g`, `4g`) plus
    /// the data-saver flag onto a hint.
    #[must_use]
    pub fn from_host_hint(effective_type: &str, save_data: bool) -> Self {
        if save_data {
            return Self::Constrained;
        }
        match effective_type {
            "slow-2g" | "2g" => Self::Constrained,
            "3g" => Self::Moderate,
            "4g" | "5g" | "wifi" | "ethernet" => Self::Fast,
            _ => Self::Unknown,
        }
    }
}

pub struct NetworkMonitor {
    raw: watch::Sender<bool>,
    settled: watch::Sender<bool>,
    quality: watch::Sender<ConnectionQuality>,
    events: broadcast::Sender<NetworkEvent>,
    settle_delay: Duration,
}

impl NetworkMonitor {
    #[must_use]
    pub fn new(initially_online: bool, settle_delay: Duration) -> Self {
        let (raw, _) = watch::channel(initially_online);
        let (settled, _) = watch::channel(initially_online);
        let (quality, _) = watch::channel(ConnectionQuality::Unknown);
        let (events, _) = broadcast::channel(32);
        Self {
            raw,
            settled,
            quality,
            events,
            settle_delay,
        }
    }

    /// Host-reported raw connectivity. Takes effect after the settle delay.
    pub fn report(&self, online: bool) {
        self.raw.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
    }

    pub fn set_quality(&self, quality: ConnectionQuality) {
        self.quality.send_replace(quality);
    }

    /// Last committed (debounced) state.
    #[must_use]
    pub fn is_online(&self) -> bool {
        *self.settled.borrow()
    }

    #[must_use]
    pub fn quality(&self) -> ConnectionQuality {
        *self.quality.borrow()
    }

    #[must_use]
    pub fn is_constrained(&self) -> bool {
        self.quality() == ConnectionQuality::Constrained
    }

    #[must_use]
    pub fn settle_delay(&self) -> Duration {
        self.settle_delay
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.events.subscribe()
    }

    /// Watch the committed state directly.
    pub fn watch_online(&self) -> watch::Receiver<bool> {
        self.settled.subscribe()
    }

    /// Invoke `callback` for every committed transition until `cancel` fires.
    pub fn on_transition<F>(&self, cancel: CancellationToken, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(NetworkEvent) + Send + 'static,
    {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => callback(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "Transition listener lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Start the debouncer. Must be running for reports to take effect.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let raw = self.raw.subscribe();
        tokio::spawn(async move { monitor.run(raw, cancel).await })
    }

    async fn run(&self, mut raw: watch::Receiver<bool>, cancel: CancellationToken) {
        // A report made between subscribe and first poll still counts.
        if *raw.borrow() != self.is_online() {
            raw.mark_changed();
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = raw.changed() => if changed.is_err() { return; },
            }

            // Wait until the raw value holds for a full settle period.
            loop {
                let candidate = *raw.borrow_and_update();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = raw.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = tokio::time::sleep(self.settle_delay) => {
                        self.commit(candidate);
                        break;
                    }
                }
            }
        }
    }

    fn commit(&self, online: bool) {
        let changed = self.settled.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            debug!(online, "Connectivity flapped back before settling");
            return;
        }

        let event = NetworkEvent::from_online(online);
        info!(event = %event, "Network transition");
        crate::metrics::record_network_transition(&event.to_string());
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
