use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub scan_interval: Duration,
    /// Consecutive failed cycles before the driver forces close+connect. 0 disables.
    pub reconnect_after_failures: u32,
    /// Window after process start during which failures are not externally visible. 0 disables.
    pub startup_grace: Duration,
    /// Window after a connection drop during which Degraded is not reported. 0 disables.
    pub reconnect_grace: Duration,
    pub stop_command_attempts: u32,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub stream_silence_timeout: Duration,
    /// Terminal Failed after this many reconnect cycles in a row. None retries forever.
    pub max_reconnect_cycles: Option<u32>,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub device_password: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            reconnect_after_failures: 3,
            startup_grace: Duration::from_secs(60),
            reconnect_grace: Duration::from_secs(30),
            stop_command_attempts: 3,
            read_timeout: Duration::from_secs(2),
            write_timeout: Duration::from_secs(1),
            stream_silence_timeout: Duration::from_secs(10),
            max_reconnect_cycles: None,
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            device_password: String::new(),
        }
    }
}
