use crate::connection::Connection;
use crate::service::ServiceId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Known state of a connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionState {
    Init,
    ServiceInit,
    ServiceStart,
    Test,
    Up,
    WrongProtocol,
    Failed,
    NotConfigured,
    TestFailed,
    Ended,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Init => "Init",
            ConnectionState::ServiceInit => "ServiceInit",
            ConnectionState::ServiceStart => "ServiceStart",
            ConnectionState::Test => "Test",
            ConnectionState::Up => "Up",
            ConnectionState::WrongProtocol => "WrongProtocol",
            ConnectionState::Failed => "Failed",
            ConnectionState::NotConfigured => "NotConfigured",
            ConnectionState::TestFailed => "TestFailed",
            ConnectionState::Ended => "Ended",
        }
    }

    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            ConnectionState::WrongProtocol
                | ConnectionState::Failed
                | ConnectionState::NotConfigured
                | ConnectionState::TestFailed
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One transition of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub time: DateTime<Utc>,
    pub connection: Connection,
    pub service_id: Option<ServiceId>,
}

impl ConnectionEvent {
    /// First event of a new attempt
    pub fn init(connection: Connection) -> Self {
        ConnectionEvent {
            state: ConnectionState::Init,
            time: Utc::now(),
            connection,
            service_id: None,
        }
    }

    /// Successor event in `state`. Nothing follows `Ended`.
    pub fn next(&self, state: ConnectionState) -> Self {
        debug_assert!(
            self.state != ConnectionState::Ended,
            "connection already ended"
        );
        ConnectionEvent {
            state,
            time: Utc::now(),
            connection: self.connection.clone(),
            service_id: self.service_id.clone(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection.id
    }
}

/// Snapshot of the recent events of one connection, oldest first
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionHistory {
    pub history: Vec<ConnectionEvent>,
}

impl ConnectionHistory {
    pub fn current(&self) -> Option<&ConnectionEvent> {
        self.history.last()
    }

    /// True iff the most recent event is `Up`
    pub fn is_up(&self) -> bool {
        self.current()
            .map(|e| e.state == ConnectionState::Up)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
