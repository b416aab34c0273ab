//! Streaming gateway sessions.
//!
//! A [`Session`] is the server side of one long-lived client stream. It owns
//! the client's subscriptions, a keep-alive timer, and the client's presence,
//! and yields envelopes in the order they should be written to the wire:
//!
//! ```text
//! connect ──▶ connected ──▶ { envelope | ping }* ──▶ teardown
//! ```
//!
//! Teardown releases every subscription and marks the user offline. It runs
//! exactly once, whether triggered by [`Session::close`], server shutdown, or
//! the session being dropped when the client goes away.

use crate::broker::{Broker, BrokerError};
use crate::fanout::Subscription;
use crate::presence::PresenceTracker;
use beacon_protocol::{channel, kinds, now_millis, Envelope};
use futures_util::stream::{self, SelectAll, Stream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Gateway errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A subscription could not be opened.
    #[error("Subscription failed: {0}")]
    Broker(#[from] BrokerError),

    /// Too many rooms requested for one connection.
    #[error("Too many rooms requested: {requested} (max {max})")]
    TooManyRooms {
        /// Rooms requested.
        requested: usize,
        /// Rooms allowed.
        max: usize,
    },

    /// The server is shutting down.
    #[error("Server is shutting down")]
    ShuttingDown,
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Interval between keep-alive pings.
    pub keepalive_interval: Duration,
    /// Maximum chat rooms per connection.
    pub max_rooms: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(30),
            max_rooms: 32,
        }
    }
}

/// Opens streaming sessions.
#[derive(Clone)]
pub struct Gateway {
    broker: Arc<dyn Broker>,
    presence: Arc<PresenceTracker>,
    config: GatewayConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Gateway {
    /// Create a gateway.
    #[must_use]
    pub fn new(
        broker: Arc<dyn Broker>,
        presence: Arc<PresenceTracker>,
        config: GatewayConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            broker,
            presence,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Get the broker.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Get the presence tracker.
    #[must_use]
    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// End every open session and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!("Gateway shutting down");
    }

    /// Open a session for an authenticated user.
    ///
    /// Subscribes to the user's notifications, each requested chat room, and
    /// the global presence and match channels, then marks the user online.
    ///
    /// # Errors
    ///
    /// Returns an error if any subscription fails; subscriptions opened so
    /// far are released and presence is left untouched.
    pub async fn connect(&self, user_id: &str, rooms: &[String]) -> Result<Session, GatewayError> {
        if *self.shutdown.borrow() {
            return Err(GatewayError::ShuttingDown);
        }
        if rooms.len() > self.config.max_rooms {
            return Err(GatewayError::TooManyRooms {
                requested: rooms.len(),
                max: self.config.max_rooms,
            });
        }

        let connection_id = uuid::Uuid::new_v4().to_string();

        let mut direct = SelectAll::new();
        direct.push(
            self.broker
                .subscribe(&channel::user_notifications(user_id))
                .await?,
        );
        for room in rooms {
            direct.push(self.broker.subscribe(&channel::chat_room(room)).await?);
        }

        let mut broadcast = SelectAll::new();
        broadcast.push(self.broker.subscribe(channel::PRESENCE_GLOBAL).await?);
        broadcast.push(self.broker.subscribe(channel::MATCHES_GLOBAL).await?);

        let session = Session {
            connection_id: connection_id.clone(),
            user_id: user_id.to_string(),
            greeting: Some(Arc::new(Envelope::connected(
                user_id,
                &connection_id,
                self.config.keepalive_interval.as_millis() as u64,
            ))),
            direct,
            broadcast,
            keepalive: keepalive_timer(self.config.keepalive_interval),
            shutdown: self.shutdown.subscribe(),
            broker: Arc::clone(&self.broker),
            presence: Arc::clone(&self.presence),
            closed: AtomicBool::new(false),
        };

        announce_presence(&self.broker, &self.presence, user_id, true).await;

        info!(
            connection = %connection_id,
            user = %user_id,
            rooms = rooms.len(),
            "Session established"
        );

        Ok(session)
    }
}

fn keepalive_timer(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut timer = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

/// One client's live stream.
pub struct Session {
    connection_id: String,
    user_id: String,
    /// The `connected` envelope, until it has been yielded.
    greeting: Option<Arc<Envelope>>,
    /// User and room channels, delivered unfiltered.
    direct: SelectAll<Subscription>,
    /// Global channels, filtered down to what concerns this user.
    broadcast: SelectAll<Subscription>,
    keepalive: Interval,
    shutdown: watch::Receiver<bool>,
    broker: Arc<dyn Broker>,
    presence: Arc<PresenceTracker>,
    closed: AtomicBool,
}

impl Session {
    /// Get the connection identifier.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Get the user identifier.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Check if teardown has started.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the number of open subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.direct.len() + self.broadcast.len()
    }

    /// Wait for the next envelope to send.
    ///
    /// Returns `None` once the session is closed.
    pub async fn next(&mut self) -> Option<Arc<Envelope>> {
        if self.is_closed() {
            return None;
        }
        if let Some(greeting) = self.greeting.take() {
            return Some(greeting);
        }

        loop {
            if *self.shutdown.borrow() {
                debug!(connection = %self.connection_id, "Closing session for shutdown");
                self.close().await;
                return None;
            }

            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        debug!(connection = %self.connection_id, "Gateway gone, closing session");
                        self.close().await;
                        return None;
                    }
                }

                Some(envelope) = self.direct.next(), if !self.direct.is_empty() => {
                    return Some(envelope);
                }

                Some(envelope) = self.broadcast.next(), if !self.broadcast.is_empty() => {
                    if self.is_relevant(&envelope) {
                        return Some(envelope);
                    }
                }

                _ = self.keepalive.tick() => {
                    if let Err(e) = self.presence.touch(&self.user_id).await {
                        warn!(connection = %self.connection_id, error = %e, "Presence refresh failed");
                    }
                    return Some(Arc::new(Envelope::ping()));
                }
            }
        }
    }

    /// Convert the session into a stream of envelopes.
    ///
    /// Dropping the stream drops the session, which tears it down.
    pub fn into_stream(self) -> impl Stream<Item = Arc<Envelope>> + Send {
        stream::unfold(self, |mut session| async move {
            session.next().await.map(|envelope| (envelope, session))
        })
    }

    /// Tear the session down: release subscriptions, then mark the user
    /// offline. Only the first call has any effect.
    pub async fn close(&mut self) {
        if self.begin_teardown() {
            announce_presence(&self.broker, &self.presence, &self.user_id, false).await;
            info!(connection = %self.connection_id, user = %self.user_id, "Session closed");
        }
    }

    /// Global-channel filter: presence of other users, and matches naming this user.
    fn is_relevant(&self, envelope: &Envelope) -> bool {
        match envelope.kind() {
            kinds::PRESENCE => !envelope.names_participant(&self.user_id),
            kinds::MATCH => envelope.names_participant(&self.user_id),
            _ => true,
        }
    }

    /// Flip the closed flag and release subscriptions.
    ///
    /// Returns `true` for the caller that won the flag.
    fn begin_teardown(&mut self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.greeting = None;
        self.direct = SelectAll::new();
        self.broadcast = SelectAll::new();
        debug!(connection = %self.connection_id, "Released subscriptions");
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.begin_teardown() {
            return;
        }

        let broker = Arc::clone(&self.broker);
        let presence = Arc::clone(&self.presence);
        let user_id = self.user_id.clone();
        let connection_id = self.connection_id.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    announce_presence(&broker, &presence, &user_id, false).await;
                    info!(connection = %connection_id, user = %user_id, "Session dropped");
                });
            }
            Err(_) => warn!(
                connection = %connection_id,
                "No runtime to finish teardown; presence left to the sweep"
            ),
        }
    }
}

/// Record a presence change and announce it. Failures are logged only.
async fn announce_presence(
    broker: &Arc<dyn Broker>,
    presence: &PresenceTracker,
    user_id: &str,
    is_online: bool,
) {
    let result = if is_online {
        presence.touch(user_id).await
    } else {
        presence.mark_offline(user_id).await
    };
    if let Err(e) = result {
        warn!(user = %user_id, online = is_online, error = %e, "Presence update failed");
    }

    let envelope = Envelope::presence(user_id, is_online, now_millis());
    if let Err(e) = broker.publish(channel::PRESENCE_GLOBAL, &envelope).await {
        warn!(user = %user_id, error = %e, "Presence announcement failed");
    }
}
