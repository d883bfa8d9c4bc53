use crate::models::Timestamp;

/// Emitted by the record store after every committed write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    TasksChanged(ChangeOrigin),
    SettingsChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user-driven mutation; schedules an automatic backup.
    Local,
    /// The task collection was replaced from a cloud envelope.
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Checking,
    Restoring,
    BackingUp,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SyncStatus {
    pub phase: SyncPhase,
    pub last_synced_at: Option<Timestamp>,
    pub last_error: Option<String>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Idle,
            last_synced_at: None,
            last_error: None,
        }
    }
}
