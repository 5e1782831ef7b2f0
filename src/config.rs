use std::time::Duration;

/// Policy values for a [`DeviceManager`][crate::DeviceManager].
///
/// The management service provides no timeout for service resolution and no universal timeout for operations, so
/// the bounds applied by the state machine are configured here.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Name of the local radio, e.g. `hci0`
    pub adapter_name: String,
    /// How long to wait for `ServicesResolved` after connecting, per attempt
    pub resolve_timeout: Duration,
    /// Number of resolution attempts before the device is disconnected with a
    /// [`Timeout`][crate::error::ErrorKind::Timeout] error
    pub max_resolve_attempts: u32,
    /// Upper bound on a connect request. `None` leaves it to the management service.
    pub connect_timeout: Option<Duration>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            adapter_name: "hci0".to_string(),
            resolve_timeout: Duration::from_secs(5),
            max_resolve_attempts: 3,
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl ManagerConfig {
    /// Default policy for the adapter named `adapter_name`
    pub fn new(adapter_name: impl Into<String>) -> Self {
        ManagerConfig {
            adapter_name: adapter_name.into(),
            ..Default::default()
        }
    }

    /// Sets [`ManagerConfig::resolve_timeout`]
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    /// Sets [`ManagerConfig::max_resolve_attempts`]. Values below one are treated as one.
    pub fn with_max_resolve_attempts(mut self, attempts: u32) -> Self {
        self.max_resolve_attempts = attempts.max(1);
        self
    }

    /// Sets [`ManagerConfig::connect_timeout`]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
