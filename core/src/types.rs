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

//! Shared types used across modules

use crate::bgp::notification::{CeaseSubcode, NotificationMessage};
use std::fmt;

/// Why an FSM changed state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateReason {
    /// Ordinary progress through the handshake.
    Progress,
    IoFailure(String),
    HoldTimerExpired,
    NotificationReceived(NotificationMessage),
    /// We closed the session with this NOTIFICATION (invalid message, FSM
    /// error, prefix limit).
    NotificationSent(NotificationMessage),
    AdminDown(CeaseSubcode),
    AdminReset(CeaseSubcode),
    Deconfigured,
    /// A new connection replaced an Established session with graceful
    /// restart negotiated.
    PeerRestarted,
    GracefulRestartExpired,
    ConnectionCollision,
}

impl StateReason {
    /// Teardowns after which a graceful restart helper keeps the peer's
    /// routes as stale instead of withdrawing them.
    pub fn is_gr_eligible(&self) -> bool {
        matches!(
            self,
            StateReason::IoFailure(_) | StateReason::HoldTimerExpired | StateReason::PeerRestarted
        )
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateReason::Progress => f.write_str("progress"),
            StateReason::IoFailure(e) => write!(f, "i/o failure: {}", e),
            StateReason::HoldTimerExpired => f.write_str("hold timer expired"),
            StateReason::NotificationReceived(n) => write!(f, "notification received: {}", n),
            StateReason::NotificationSent(n) => write!(f, "notification sent: {}", n),
            StateReason::AdminDown(sub) => write!(f, "admin down ({:?})", sub),
            StateReason::AdminReset(sub) => write!(f, "admin reset ({:?})", sub),
            StateReason::Deconfigured => f.write_str("deconfigured"),
            StateReason::PeerRestarted => f.write_str("peer restarted"),
            StateReason::GracefulRestartExpired => f.write_str("graceful restart expired"),
            StateReason::ConnectionCollision => f.write_str("connection collision"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdminState {
    #[default]
    Up,
    Down,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gr_eligible() {
        let cases = [
            (StateReason::IoFailure("reset".into()), true),
            (StateReason::HoldTimerExpired, true),
            (StateReason::PeerRestarted, true),
            (StateReason::AdminReset(CeaseSubcode::AdministrativeReset), false),
            (
                StateReason::NotificationReceived(NotificationMessage::fsm_error()),
                false,
            ),
            (StateReason::Deconfigured, false),
        ];
        for (reason, expected) in cases {
            assert_eq!(reason.is_gr_eligible(), expected, "{}", reason);
        }
    }
}
