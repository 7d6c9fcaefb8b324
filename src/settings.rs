use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSettings {
    pub connect_timeout_secs: u64,
    pub check_timeout_secs: u64,
    pub cache_ttl_secs: u64,
    pub idle_timeout_secs: u64,
    pub liveness_check_after_secs: u64,
    pub probe_timeout_secs: u64,
    pub smbclient_path: String,
}

impl Default for AccessSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            check_timeout_secs: 30,
            cache_ttl_secs: 30,
            idle_timeout_secs: 300,
            liveness_check_after_secs: 60,
            probe_timeout_secs: 5,
            smbclient_path: "smbclient".to_string(),
        }
    }
}

impl AccessSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn liveness_check_after(&self) -> Duration {
        Duration::from_secs(self.liveness_check_after_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
