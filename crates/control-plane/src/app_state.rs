use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Notify;

use crate::config::{AuthConfig, CommandConfig, LimitsConfig, LivenessConfig, SessionConfig};
use crate::persistence;

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub auth: AuthConfig,
    pub sessions: SessionConfig,
    pub liveness: LivenessConfig,
    pub commands: CommandConfig,
    pub limits: LimitsConfig,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
    pub command_signals: CommandSignals,
}

/// Per-device wakeup registry for dispatch.
///
/// Enqueuing a command notifies the device's waiter so an open pull stream
/// picks it up without waiting for its poll interval. Entries are created
/// lazily and shared; a device with no waiter just accumulates a permit.
#[derive(Clone, Default)]
pub struct CommandSignals {
    inner: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl CommandSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_device(&self, device_id: &str) -> Arc<Notify> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify(&self, device_id: &str) {
        self.for_device(device_id).notify_one();
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}
