//! Connection state machine for fedistream.
//!
//! This module provides a pure, side-effect-free state machine for managing
//! the lifecycle of one streaming connection. The state machine takes events
//! as input and produces a new state plus a list of actions to execute.
//!
//! The actual I/O (opening the stream, sleeping, pinging) is performed by
//! stream-client, not by this module.

use std::time::Duration;

/// Connection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and nothing scheduled.
    Disconnected,
    /// Stream open in progress.
    Connecting {
        /// Failed attempts since the last successful connection (0 = first try).
        attempt: u32,
    },
    /// Stream open and delivering events.
    Connected,
    /// Connection lost, waiting for the backoff timer.
    Reconnecting {
        /// Number of the reconnection attempt being waited for.
        attempt: u32,
    },
}

impl ConnectionState {
    /// Create a new state machine in the Disconnected state.
    pub fn new() -> Self {
        Self::Disconnected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects. The caller (stream-client)
    /// is responsible for executing the returned actions.
    pub fn on_event(self, event: Event, policy: &ReconnectPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // From Disconnected
            (Self::Disconnected, Event::ConnectRequested) => {
                (Self::Connecting { attempt: 0 }, vec![Action::Connect])
            }
            (Self::Disconnected, Event::DisconnectRequested) => (Self::Disconnected, vec![]),

            // From Connecting
            (Self::Connecting { .. }, Event::ConnectSucceeded) => (
                Self::Connected,
                vec![
                    Action::StartHeartbeat,
                    Action::EmitEvent(LifecycleEvent::Connected),
                ],
            ),
            (Self::Connecting { attempt }, Event::ConnectFailed { error }) => schedule_reconnect(
                attempt.saturating_add(1),
                LifecycleEvent::ConnectFailed {
                    error: error.clone(),
                },
                error,
                vec![],
                policy,
            ),

            // From Connected
            (Self::Connected, Event::Disconnected { reason }) => schedule_reconnect(
                1,
                LifecycleEvent::ConnectionLost {
                    reason: reason.clone(),
                },
                reason,
                vec![Action::StopHeartbeat],
                policy,
            ),

            // From Reconnecting
            (Self::Reconnecting { attempt }, Event::ReconnectTimer) => {
                (Self::Connecting { attempt }, vec![Action::Connect])
            }

            // User disconnect from any live state
            (
                Self::Connecting { .. } | Self::Connected | Self::Reconnecting { .. },
                Event::DisconnectRequested,
            ) => (
                Self::Disconnected,
                vec![
                    Action::CancelReconnect,
                    Action::StopHeartbeat,
                    Action::Disconnect,
                    Action::EmitEvent(LifecycleEvent::Closed {
                        reason: "user requested".into(),
                    }),
                ],
            ),

            // Invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Check if currently trying to connect.
    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Reconnecting { .. })
    }

    /// Failed attempts since the last successful connection.
    pub fn attempt(&self) -> u32 {
        match self {
            Self::Connecting { attempt } | Self::Reconnecting { attempt } => *attempt,
            Self::Disconnected | Self::Connected => 0,
        }
    }

    /// Short lowercase name of the state.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

fn schedule_reconnect(
    attempt: u32,
    failure: LifecycleEvent,
    error: String,
    mut actions: Vec<Action>,
    policy: &ReconnectPolicy,
) -> (ConnectionState, Vec<Action>) {
    actions.push(Action::EmitEvent(failure));

    if policy.max_attempts.is_some_and(|max| attempt > max) {
        actions.push(Action::EmitEvent(LifecycleEvent::GaveUp {
            attempts: attempt - 1,
            error,
        }));
        return (ConnectionState::Disconnected, actions);
    }

    let delay = policy.delay_for(attempt);
    actions.push(Action::EmitEvent(LifecycleEvent::ReconnectScheduled {
        attempt,
        delay,
    }));
    actions.push(Action::StartReconnectTimer { delay });
    (ConnectionState::Reconnecting { attempt }, actions)
}

/// Events that can occur in the connection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Caller requested a connection.
    ConnectRequested,
    /// The stream opened.
    ConnectSucceeded,
    /// Opening the stream failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An open stream failed or ended.
    Disconnected {
        /// Reason for disconnection.
        reason: String,
    },
    /// Caller requested disconnect.
    DisconnectRequested,
    /// Reconnect timer fired.
    ReconnectTimer,
}

/// Actions to be executed by the stream-client.
///
/// These are instructions, not side effects. The stream-client interprets
/// these and performs the actual I/O.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open the stream.
    Connect,
    /// Close the stream.
    Disconnect,
    /// Start the heartbeat timer.
    StartHeartbeat,
    /// Stop the heartbeat timer.
    StopHeartbeat,
    /// Start a timer for reconnection.
    StartReconnectTimer {
        /// Delay before attempting reconnection.
        delay: Duration,
    },
    /// Cancel any pending reconnect timer.
    CancelReconnect,
    /// Emit an event to listeners.
    EmitEvent(LifecycleEvent),
}

/// Lifecycle events emitted to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Stream is open.
    Connected,
    /// An attempt to open the stream failed.
    ConnectFailed {
        /// Error message describing the failure.
        error: String,
    },
    /// An open stream broke.
    ConnectionLost {
        /// Reason for disconnection.
        reason: String,
    },
    /// A reconnect is scheduled.
    ReconnectScheduled {
        /// Which reconnection attempt this will be.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Retry cap exhausted; the connection is now disconnected.
    GaveUp {
        /// Attempts made before giving up.
        attempts: u32,
        /// Last error seen.
        error: String,
    },
    /// Connection closed on request.
    Closed {
        /// Reason for closing.
        reason: String,
    },
}

/// Reconnection backoff parameters.
///
/// Delay for attempt `n` is `min(base * 2^(n-1), max)` plus random jitter,
/// unless the server suggested a retry interval, which takes precedence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Upper bound for the exponential delay.
    pub max_delay: Duration,
    /// Give up after this many failed attempts (None = retry forever).
    pub max_attempts: Option<u32>,
    /// Upper bound for random jitter added to each delay.
    pub max_jitter: Duration,
    /// Most recent `retry:` suggestion from the server.
    pub server_retry: Option<Duration>,
}

impl ReconnectPolicy {
    /// Create a policy with the given base and maximum delay.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts: None,
            max_jitter: Duration::ZERO,
            server_retry: None,
        }
    }

    /// Set the retry cap.
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the jitter bound.
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Record the server's `retry:` suggestion for future reconnects.
    pub fn set_server_retry(&mut self, retry: Duration) {
        self.server_retry = Some(retry);
    }

    /// Delay before reconnection attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.server_retry {
            Some(retry) => retry,
            None => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.base_delay
                    .saturating_mul(1u32 << exponent)
                    .min(self.max_delay)
            }
        };
        base + random_jitter(self.max_jitter)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

/// Random jitter between zero and `max` inclusive (millisecond resolution).
fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => Duration::from_millis(u64::from_le_bytes(bytes) % (max_ms + 1)),
        Err(_) => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_millis(500), Duration::from_secs(8))
    }

    fn has_timer(actions: &[Action]) -> Option<Duration> {
        actions.iter().find_map(|a| match a {
            Action::StartReconnectTimer { delay } => Some(*delay),
            _ => None,
        })
    }

    #[test]
    fn starts_disconnected() {
        let state = ConnectionState::new();
        assert!(matches!(state, ConnectionState::Disconnected));
    }

    #[test]
    fn connect_request_transitions_to_connecting() {
        let (new_state, actions) =
            ConnectionState::Disconnected.on_event(Event::ConnectRequested, &policy());

        assert_eq!(new_state, ConnectionState::Connecting { attempt: 0 });
        assert!(actions.iter().any(|a| matches!(a, Action::Connect)));
    }

    #[test]
    fn connect_success_starts_heartbeat() {
        let (new_state, actions) = ConnectionState::Connecting { attempt: 0 }
            .on_event(Event::ConnectSucceeded, &policy());

        assert!(new_state.is_connected());
        assert!(actions.contains(&Action::StartHeartbeat));
        assert!(actions.contains(&Action::EmitEvent(LifecycleEvent::Connected)));
    }

    #[test]
    fn connect_failure_schedules_first_reconnect() {
        let (new_state, actions) = ConnectionState::Connecting { attempt: 0 }.on_event(
            Event::ConnectFailed {
                error: "refused".into(),
            },
            &policy(),
        );

        assert_eq!(new_state, ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(has_timer(&actions), Some(Duration::from_millis(500)));
    }

    #[test]
    fn reconnect_timer_keeps_attempt_count() {
        let (state, actions) =
            ConnectionState::Reconnecting { attempt: 3 }.on_event(Event::ReconnectTimer, &policy());
        assert_eq!(state, ConnectionState::Connecting { attempt: 3 });
        assert!(actions.contains(&Action::Connect));

        let (state, _) = state.on_event(
            Event::ConnectFailed {
                error: "timeout".into(),
            },
            &policy(),
        );
        assert_eq!(state, ConnectionState::Reconnecting { attempt: 4 });
    }

    #[test]
    fn lost_connection_stops_heartbeat_and_reconnects() {
        let (state, actions) = ConnectionState::Connected.on_event(
            Event::Disconnected {
                reason: "stream ended".into(),
            },
            &policy(),
        );

        assert_eq!(state, ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(actions[0], Action::StopHeartbeat);
        assert!(actions.contains(&Action::EmitEvent(LifecycleEvent::ConnectionLost {
            reason: "stream ended".into()
        })));
        assert!(has_timer(&actions).is_some());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for(40), Duration::from_secs(8));
    }

    #[test]
    fn server_retry_overrides_backoff() {
        let mut policy = policy();
        policy.set_server_retry(Duration::from_millis(2500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2500));
        assert_eq!(policy.delay_for(9), Duration::from_millis(2500));
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = policy().with_jitter(Duration::from_millis(250));
        for _ in 0..50 {
            let delay = policy.delay_for(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(750));
        }
    }

    #[test]
    fn retry_cap_gives_up() {
        let policy = policy().with_max_attempts(Some(2));
        let (state, _) = ConnectionState::Connecting { attempt: 1 }.on_event(
            Event::ConnectFailed { error: "x".into() },
            &policy,
        );
        assert_eq!(state, ConnectionState::Reconnecting { attempt: 2 });

        let (state, actions) = ConnectionState::Connecting { attempt: 2 }.on_event(
            Event::ConnectFailed {
                error: "still down".into(),
            },
            &policy,
        );
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(has_timer(&actions).is_none());
        assert!(actions.contains(&Action::EmitEvent(LifecycleEvent::GaveUp {
            attempts: 2,
            error: "still down".into()
        })));
    }

    #[test]
    fn full_reconnection_flow() {
        let policy = policy();
        let state = ConnectionState::Connected;

        let (state, _) = state.on_event(
            Event::Disconnected {
                reason: "reset".into(),
            },
            &policy,
        );
        let (state, _) = state.on_event(Event::ReconnectTimer, &policy);
        assert_eq!(state, ConnectionState::Connecting { attempt: 1 });

        let (state, _) = state.on_event(Event::ConnectSucceeded, &policy);
        assert!(state.is_connected());
        assert_eq!(state.attempt(), 0);
    }

    #[test]
    fn disconnect_request_from_every_live_state() {
        for state in [
            ConnectionState::Connecting { attempt: 0 },
            ConnectionState::Connected,
            ConnectionState::Reconnecting { attempt: 2 },
        ] {
            let (new_state, actions) = state.on_event(Event::DisconnectRequested, &policy());
            assert_eq!(new_state, ConnectionState::Disconnected);
            assert!(actions.contains(&Action::CancelReconnect));
            assert!(actions.contains(&Action::StopHeartbeat));
        }
    }

    #[test]
    fn disconnect_when_disconnected_is_a_no_op() {
        let (state, actions) =
            ConnectionState::Disconnected.on_event(Event::DisconnectRequested, &policy());
        assert_eq!(state, ConnectionState::Disconnected);
        assert!(actions.is_empty());
    }

    #[test]
    fn invalid_transitions_are_ignored() {
        let (state, actions) =
            ConnectionState::Connected.on_event(Event::ConnectRequested, &policy());
        assert_eq!(state, ConnectionState::Connected);
        assert!(actions.is_empty());
    }

    #[test]
    fn helpers() {
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(ConnectionState::Connecting { attempt: 0 }.is_connecting());
        assert!(ConnectionState::Reconnecting { attempt: 1 }.is_connecting());
        assert!(!ConnectionState::Connected.is_connecting());
        assert_eq!(ConnectionState::Reconnecting { attempt: 4 }.name(), "reconnecting");
    }
}
