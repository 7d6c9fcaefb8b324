use crate::client::{ClientFactory, ConnectInfo};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::session::SessionRegistry;
use crate::settings::AccessSettings;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "camelCase")]
pub enum ConnectionResult {
    Success,
    Warning(WarningReason),
    Failure(FailureCause),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum WarningReason {
    EmptyFolder,
    DfsFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureCause {
    Security,
    HostUnreachable,
    NameResolution,
    Protocol(String),
    Timeout,
    Unknown(String),
}

impl From<&StorageError> for FailureCause {
    fn from(err: &StorageError) -> Self {
        match err {
            StorageError::AuthenticationFailed | StorageError::PermissionDenied(_) => Self::Security,
            StorageError::HostUnreachable(_) => Self::HostUnreachable,
            StorageError::NameResolutionFailed(_) => Self::NameResolution,
            StorageError::Timeout => Self::Timeout,
            StorageError::NotFound(detail) => Self::Protocol(format!("folder not found: {detail}")),
            StorageError::ProtocolError(_)
            | StorageError::SessionExpired
            | StorageError::InvalidDescriptor(_)
            | StorageError::AlreadyExists(_) => Self::Protocol(err.to_string()),
            StorageError::Cancelled | StorageError::IoError(_) | StorageError::UnknownError(_) => {
                Self::Unknown(err.to_string())
            }
        }
    }
}

impl ConnectionResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    fn classify(outcome: Result<(ConnectInfo, bool)>) -> Self {
        match outcome {
            Ok((info, _)) if info.dfs_fallback => Self::Warning(WarningReason::DfsFallback),
            Ok((_, true)) => Self::Warning(WarningReason::EmptyFolder),
            Ok(_) => Self::Success,
            Err(err) => Self::Failure(FailureCause::from(&err)),
        }
    }
}

impl fmt::Display for ConnectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("Connection successful"),
            Self::Warning(WarningReason::EmptyFolder) => {
                f.write_str("Connected, but the folder is empty (check the folder path)")
            }
            Self::Warning(WarningReason::DfsFallback) => {
                f.write_str("Connected without DFS, the referral could not be resolved")
            }
            Self::Failure(FailureCause::Security) => f.write_str("Authentication rejected"),
            Self::Failure(FailureCause::HostUnreachable) => f.write_str("Host unreachable"),
            Self::Failure(FailureCause::NameResolution) => f.write_str("Host name could not be resolved"),
            Self::Failure(FailureCause::Timeout) => f.write_str("Connection timed out"),
            Self::Failure(FailureCause::Protocol(detail)) => write!(f, "Protocol error: {detail}"),
            Self::Failure(FailureCause::Unknown(detail)) => write!(f, "Unknown error: {detail}"),
        }
    }
}

pub struct ConnectionChecker {
    registry: SessionRegistry,
    factory: Arc<dyn ClientFactory>,
    settings: AccessSettings,
}

impl ConnectionChecker {
    pub fn new(registry: SessionRegistry, factory: Arc<dyn ClientFactory>, settings: AccessSettings) -> Self {
        Self {
            registry,
            factory,
            settings,
        }
    }

    pub async fn check(&self, descriptor: &ConnectionDescriptor) -> ConnectionResult {
        let outcome = match descriptor.validate() {
            Err(err) => Err(err),
            Ok(()) => match self.registry.live_session(descriptor) {
                Some(_) => self.probe_registered(descriptor).await,
                None => self.probe_fresh(descriptor).await,
            },
        };
        let result = ConnectionResult::classify(outcome);
        info!(host = %descriptor.host, result = %result, "connection check finished");
        result
    }

    async fn probe_registered(&self, descriptor: &ConnectionDescriptor) -> Result<(ConnectInfo, bool)> {
        debug!(host = %descriptor.host, "checking through the registered session");
        let root = descriptor.root_folder();
        let probe = async {
            let session = self.registry.acquire(descriptor).await?;
            let mut client = session.lock().await?;
            let entries = client.list(&root).await?;
            Ok((session.info().clone(), entries.is_empty()))
        };
        tokio::time::timeout(self.settings.check_timeout(), probe)
            .await
            .unwrap_or(Err(StorageError::Timeout))
    }

    async fn probe_fresh(&self, descriptor: &ConnectionDescriptor) -> Result<(ConnectInfo, bool)> {
        let root = descriptor.root_folder();
        let mut client = self.factory.create(descriptor)?;
        let probe = async {
            let info = client.connect().await?;
            let entries = client.list(&root).await?;
            Ok((info, entries.is_empty()))
        };
        let outcome = tokio::time::timeout(self.settings.check_timeout(), probe)
            .await
            .unwrap_or(Err(StorageError::Timeout));

        match tokio::time::timeout(self.settings.probe_timeout(), client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(host = %descriptor.host, error = %err, "probe disconnect failed"),
            Err(_) => warn!(host = %descriptor.host, "probe disconnect timed out"),
        }
        outcome
    }
}
