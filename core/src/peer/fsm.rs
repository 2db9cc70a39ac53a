// Copyright 2025 ribd Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! This module implements the BGP FSM.
//!
//! `Fsm` is the pure part: states, the transition table, timer deadlines and
//! negotiated session parameters. The session coordinator drives it and
//! performs the I/O each transition implies.

use crate::bgp::capability::{negotiate_hold, NegotiatedCapabilities};
use crate::types::{AdminState, StateReason};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// RFC 4271 8.1.1: Maximum IdleHoldTime for DampPeerOscillations backoff.
pub const MAX_IDLE_HOLD_TIME: Duration = Duration::from_secs(120);

/// A session that stays Established this long clears the reset backoff.
const STABLE_SESSION_TIME: Duration = Duration::from_secs(60);

/// BGP FSM states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BgpState {
    Idle,
    Active,
    OpenSent,
    OpenConfirm,
    Established,
    /// Terminal: the FSM was shut down and its tasks are exiting.
    Dying,
}

impl fmt::Display for BgpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BgpState::Idle => "idle",
            BgpState::Active => "active",
            BgpState::OpenSent => "open-sent",
            BgpState::OpenConfirm => "open-confirm",
            BgpState::Established => "established",
            BgpState::Dying => "dying",
        };
        f.write_str(name)
    }
}

/// FSM input events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmEvent {
    /// Idle hold timer expired, or an external connect trigger
    Start,
    /// Administrative stop or reset
    Stop,
    /// A usable TCP connection, inbound or outbound
    ConnectionUp,
    OpenReceived,
    KeepaliveReceived,
    UpdateReceived,
    RouteRefreshReceived,
    NotificationReceived,
    HoldTimerExpires,
    IoFailure,
    /// Decode or validation error that closes the session
    MessageError,
    /// Terminal shutdown
    Kill,
}

impl FsmEvent {
    /// Message events that are protocol errors in some states.
    pub fn is_message(&self) -> bool {
        matches!(
            self,
            FsmEvent::OpenReceived
                | FsmEvent::KeepaliveReceived
                | FsmEvent::UpdateReceived
                | FsmEvent::RouteRefreshReceived
        )
    }
}

/// Timer deadlines. `None` means the timer is not running.
#[derive(Debug, Clone, Default)]
pub struct FsmTimers {
    pub hold: Option<Instant>,
    /// Only used before Established; the writer task ticks afterwards.
    pub keepalive: Option<Instant>,
    pub idle_hold: Option<Instant>,
    pub graceful_restart: Option<Instant>,
}

impl FsmTimers {
    fn stop_session_timers(&mut self) {
        self.hold = None;
        self.keepalive = None;
    }
}

/// BGP Finite State Machine
#[derive(Debug)]
pub struct Fsm {
    state: BgpState,
    pub timers: FsmTimers,
    pub admin: AdminState,
    /// Identifies this FSM instance; stamped on every event it emits.
    pub generation: u64,
    /// Incremented on every entry to Established.
    pub epoch: u64,
    pub negotiated: Option<NegotiatedCapabilities>,
    /// Negotiated hold time and keepalive interval, in seconds.
    pub hold_time: u16,
    pub keepalive_time: u16,
    pub last_reason: Option<StateReason>,
    idle_hold_base: Duration,
    consecutive_resets: u32,
    established_at: Option<Instant>,
}

impl Fsm {
    pub fn new(generation: u64, idle_hold_base: Duration, admin: AdminState) -> Self {
        Fsm {
            state: BgpState::Idle,
            timers: FsmTimers::default(),
            admin,
            generation,
            epoch: 0,
            negotiated: None,
            hold_time: 0,
            keepalive_time: 0,
            last_reason: None,
            idle_hold_base,
            consecutive_resets: 0,
            established_at: None,
        }
    }

    #[cfg(test)]
    pub fn with_state(state: BgpState) -> Self {
        Fsm {
            state,
            ..Fsm::new(1, Duration::from_secs(5), AdminState::Up)
        }
    }

    pub fn state(&self) -> BgpState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == BgpState::Established
    }

    /// Handle an event and return the new state. Invalid events leave the
    /// state unchanged. The caller performs the side effects.
    pub fn handle_event(&mut self, event: &FsmEvent) -> BgpState {
        use BgpState::*;
        use FsmEvent::*;

        let new_state = match (self.state, event) {
            (Dying, _) => Dying,
            (_, Kill) => Dying,

            (Idle, Start) => Active,

            (Active, ConnectionUp) => OpenSent,
            (Active, Stop) => Idle,

            (OpenSent, OpenReceived) => OpenConfirm,

            (OpenConfirm, KeepaliveReceived) => Established,

            (Established, KeepaliveReceived)
            | (Established, UpdateReceived)
            | (Established, RouteRefreshReceived) => Established,

            // RFC 4271 6.6: any other message is an FSM error
            (OpenSent | OpenConfirm | Established, e) if e.is_message() => Idle,

            (
                OpenSent | OpenConfirm | Established,
                Stop | HoldTimerExpires | IoFailure | MessageError | NotificationReceived,
            ) => Idle,

            (state, _) => state,
        };

        self.state = new_state;
        new_state
    }

    /// Fix the session's hold time and keepalive interval at OpenConfirm
    /// entry: min(local, remote) and a third of it.
    pub fn set_negotiated(&mut self, caps: NegotiatedCapabilities, local_hold: u16, remote_hold: u16) {
        let (hold, keepalive) = negotiate_hold(local_hold, remote_hold);
        self.hold_time = hold;
        self.keepalive_time = keepalive;
        self.negotiated = Some(caps);
    }

    pub fn hold_duration(&self) -> Option<Duration> {
        (self.hold_time > 0).then(|| Duration::from_secs(self.hold_time as u64))
    }

    pub fn keepalive_duration(&self) -> Option<Duration> {
        (self.keepalive_time > 0).then(|| Duration::from_secs(self.keepalive_time as u64))
    }

    /// Push the hold deadline out after any received message.
    pub fn reset_hold_timer(&mut self, now: Instant) {
        if self.timers.hold.is_some() {
            self.timers.hold = self.hold_duration().map(|d| now + d);
        }
    }

    pub fn on_established(&mut self, now: Instant) {
        self.epoch += 1;
        self.established_at = Some(now);
        self.timers.keepalive = None;
        self.timers.graceful_restart = None;
    }

    /// Account a session going down. Resets that follow a long enough
    /// Established period restart the backoff.
    pub fn on_session_down(&mut self, now: Instant, count_reset: bool) {
        self.timers.stop_session_timers();
        if let Some(since) = self.established_at.take() {
            if now.duration_since(since) >= STABLE_SESSION_TIME {
                self.consecutive_resets = 0;
            }
        }
        if count_reset {
            self.consecutive_resets += 1;
        }
    }

    /// Idle hold time with DampPeerOscillations backoff (RFC 4271 8.1.1).
    /// Zero before the first reset.
    pub fn idle_hold_time(&self) -> Duration {
        if self.consecutive_resets == 0 {
            return Duration::ZERO;
        }
        let exp = (self.consecutive_resets - 1).min(6);
        (self.idle_hold_base * 2u32.pow(exp)).min(MAX_IDLE_HOLD_TIME)
    }

    /// Arm the idle hold timer if the FSM may restart on its own.
    pub fn schedule_restart(&mut self, now: Instant) {
        self.timers.idle_hold = match (self.state, self.admin) {
            (BgpState::Idle, AdminState::Up) => Some(now + self.idle_hold_time()),
            _ => None,
        };
    }

    pub fn clear_backoff(&mut self) {
        self.consecutive_resets = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::family::AfiSafi;

    #[test]
    fn test_successful_connection_establishment() {
        let mut fsm = Fsm::with_state(BgpState::Idle);

        let steps = [
            (FsmEvent::Start, BgpState::Active),
            (FsmEvent::ConnectionUp, BgpState::OpenSent),
            (FsmEvent::OpenReceived, BgpState::OpenConfirm),
            (FsmEvent::KeepaliveReceived, BgpState::Established),
            (FsmEvent::UpdateReceived, BgpState::Established),
            (FsmEvent::RouteRefreshReceived, BgpState::Established),
        ];
        for (event, expected) in steps {
            assert_eq!(fsm.handle_event(&event), expected, "{:?}", event);
        }
        assert!(fsm.is_established());
    }

    #[test]
    fn test_transitions_to_idle() {
        let events = [
            FsmEvent::Stop,
            FsmEvent::HoldTimerExpires,
            FsmEvent::IoFailure,
            FsmEvent::MessageError,
            FsmEvent::NotificationReceived,
        ];
        for state in [BgpState::OpenSent, BgpState::OpenConfirm, BgpState::Established] {
            for event in events {
                let mut fsm = Fsm::with_state(state);
                assert_eq!(
                    fsm.handle_event(&event),
                    BgpState::Idle,
                    "{:?} + {:?} should transition to Idle",
                    state,
                    event
                );
            }
        }
    }

    #[test]
    fn test_fsm_errors() {
        // RFC 4271 6.6: unexpected messages close the session
        let test_cases = vec![
            (BgpState::OpenSent, FsmEvent::KeepaliveReceived),
            (BgpState::OpenSent, FsmEvent::UpdateReceived),
            (BgpState::OpenConfirm, FsmEvent::UpdateReceived),
            (BgpState::OpenConfirm, FsmEvent::OpenReceived),
            (BgpState::Established, FsmEvent::OpenReceived),
        ];
        for (initial_state, event) in test_cases {
            let mut fsm = Fsm::with_state(initial_state);
            assert_eq!(
                fsm.handle_event(&event),
                BgpState::Idle,
                "{:?} + {:?} should transition to Idle",
                initial_state,
                event
            );
        }
    }

    #[test]
    fn test_ignored_events() {
        let test_cases = vec![
            (BgpState::Idle, FsmEvent::HoldTimerExpires, BgpState::Idle),
            (BgpState::Idle, FsmEvent::ConnectionUp, BgpState::Idle),
            (BgpState::Active, FsmEvent::Start, BgpState::Active),
            (BgpState::Active, FsmEvent::HoldTimerExpires, BgpState::Active),
            (BgpState::Dying, FsmEvent::Start, BgpState::Dying),
            (BgpState::Established, FsmEvent::Kill, BgpState::Dying),
        ];
        for (state, event, expected) in test_cases {
            let mut fsm = Fsm::with_state(state);
            assert_eq!(fsm.handle_event(&event), expected, "{:?} + {:?}", state, event);
        }
    }

    #[test]
    fn test_negotiated_hold() {
        // (local, remote, hold, keepalive)
        let cases = [(180, 90, 90, 30), (30, 180, 30, 10), (180, 0, 0, 0), (3, 3, 3, 1)];
        for (local, remote, hold, keepalive) in cases {
            let mut fsm = Fsm::with_state(BgpState::OpenSent);
            fsm.set_negotiated(NegotiatedCapabilities::default(), local, remote);
            assert_eq!((fsm.hold_time, fsm.keepalive_time), (hold, keepalive));
            assert_eq!(fsm.hold_duration().is_none(), hold == 0);
            assert_eq!(fsm.keepalive_duration().is_none(), keepalive == 0);
        }
    }

    #[test]
    fn test_hold_timer_reset_only_when_running() {
        let now = Instant::now();
        let mut fsm = Fsm::with_state(BgpState::Established);
        fsm.set_negotiated(NegotiatedCapabilities::default(), 90, 90);

        fsm.reset_hold_timer(now);
        assert_eq!(fsm.timers.hold, None);

        fsm.timers.hold = Some(now);
        fsm.reset_hold_timer(now);
        assert_eq!(fsm.timers.hold, Some(now + Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_get_idle_hold_time() {
        // (base_secs, resets, expected_secs)
        let cases = [
            (5, 0, 0),    // first start
            (5, 1, 5),    // first reset uses the base
            (5, 2, 10),   // then doubles
            (5, 4, 40),
            (30, 3, 120), // 30*4, capped at 120
            (30, 5, 120),
            (10, 10, 120), // exp capped at 6 -> 640, capped at 120
            (0, 3, 0),
        ];
        for (base, resets, expected) in cases {
            let mut fsm = Fsm::new(1, Duration::from_secs(base), AdminState::Up);
            fsm.consecutive_resets = resets;
            assert_eq!(
                fsm.idle_hold_time(),
                Duration::from_secs(expected),
                "base={}, resets={}",
                base,
                resets
            );
        }
    }

    #[tokio::test]
    async fn test_stable_session_clears_backoff() {
        let start = Instant::now();
        let mut fsm = Fsm::new(1, Duration::from_secs(5), AdminState::Up);

        fsm.on_session_down(start, true);
        fsm.on_session_down(start, true);
        assert_eq!(fsm.idle_hold_time(), Duration::from_secs(10));

        fsm.on_established(start);
        fsm.on_session_down(start + Duration::from_secs(30), true);
        assert_eq!(fsm.idle_hold_time(), Duration::from_secs(20));

        fsm.on_established(start);
        fsm.on_session_down(start + STABLE_SESSION_TIME, true);
        assert_eq!(fsm.idle_hold_time(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_schedule_restart_respects_admin_state() {
        let now = Instant::now();
        let mut fsm = Fsm::new(1, Duration::from_secs(5), AdminState::Up);
        fsm.schedule_restart(now);
        assert_eq!(fsm.timers.idle_hold, Some(now));

        fsm.admin = AdminState::Down;
        fsm.schedule_restart(now);
        assert_eq!(fsm.timers.idle_hold, None);
    }

    #[test]
    fn test_on_established_bumps_epoch_and_disarms_gr() {
        let now = Instant::now();
        let mut fsm = Fsm::with_state(BgpState::OpenConfirm);
        fsm.timers.graceful_restart = Some(now);
        fsm.negotiated = Some(NegotiatedCapabilities {
            families: [AfiSafi::IPV4_UNICAST].into(),
            ..Default::default()
        });
        fsm.on_established(now);
        fsm.on_established(now);
        assert_eq!(fsm.epoch, 2);
        assert_eq!(fsm.timers.graceful_restart, None);
    }
}
