use crate::client::{Capabilities, ClientFactory, ConnectInfo, ProtocolClient};
use crate::descriptor::ConnectionDescriptor;
use crate::error::{Result, StorageError};
use crate::settings::AccessSettings;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub type ClientGuard = OwnedMutexGuard<Box<dyn ProtocolClient>>;

pub struct Session {
    id: u64,
    descriptor: ConnectionDescriptor,
    info: ConnectInfo,
    capabilities: Capabilities,
    client: Arc<Mutex<Box<dyn ProtocolClient>>>,
    opened: Instant,
    last_used_ms: AtomicU64,
    leases: AtomicUsize,
    closed: AtomicBool,
    teardown_timeout: Duration,
}

impl Session {
    fn new(
        id: u64,
        descriptor: ConnectionDescriptor,
        info: ConnectInfo,
        client: Box<dyn ProtocolClient>,
        teardown_timeout: Duration,
    ) -> Self {
        Self {
            id,
            descriptor,
            info,
            capabilities: client.capabilities(),
            client: Arc::new(Mutex::new(client)),
            opened: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            leases: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            teardown_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    pub fn info(&self) -> &ConnectInfo {
        &self.info
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_busy(&self) -> bool {
        self.leases.load(Ordering::Acquire) > 0
    }

    pub fn idle_for(&self) -> Duration {
        if self.is_busy() {
            return Duration::ZERO;
        }
        let last = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.opened.elapsed().saturating_sub(last)
    }

    pub(crate) fn lease(self: &Arc<Self>) -> SessionLease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        self.touch();
        SessionLease {
            session: Arc::clone(self),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.opened.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_used_ms.store(now, Ordering::Relaxed);
    }

    /// Exclusive access to the transport. Operations on one session are
    /// serialized through this lock.
    pub async fn lock(&self) -> Result<ClientGuard> {
        if self.is_closed() {
            return Err(StorageError::SessionExpired);
        }
        let guard = Arc::clone(&self.client).lock_owned().await;
        if self.is_closed() {
            return Err(StorageError::SessionExpired);
        }
        self.touch();
        Ok(guard)
    }

    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let teardown = async {
            let mut client = self.client.lock().await;
            client.disconnect().await
        };
        match tokio::time::timeout(self.teardown_timeout, teardown).await {
            Ok(Ok(())) => debug!(session = self.id, host = %self.descriptor.host, "session closed"),
            Ok(Err(err)) => warn!(session = self.id, error = %err, "error while closing session"),
            Err(_) => warn!(session = self.id, "timed out closing session"),
        }
    }

    async fn still_alive(&self, check_after: Duration, probe_timeout: Duration) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.is_busy() || self.idle_for() < check_after {
            return true;
        }
        let Ok(mut client) = self.client.try_lock() else {
            // In use right now, so evidently alive.
            return true;
        };
        tokio::time::timeout(probe_timeout, client.is_alive())
            .await
            .unwrap_or(false)
    }
}

/// Marks a session as in use for as long as a stream opened on it lives.
/// Busy sessions are neither reaped nor probed.
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        self.session.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("descriptor", &self.descriptor)
            .field("info", &self.info)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

enum Slot {
    Connecting { generation: u64, future: ConnectFuture },
    Live(Arc<Session>),
}

enum Lookup {
    Live(Arc<Session>),
    Pending(ConnectFuture),
}

struct Inner {
    factory: Arc<dyn ClientFactory>,
    settings: AccessSettings,
    slots: StdMutex<HashMap<ConnectionDescriptor, Slot>>,
    next_id: AtomicU64,
    next_generation: AtomicU64,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<Inner>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ClientFactory>, settings: AccessSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                settings,
                slots: StdMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ConnectionDescriptor, Slot>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the live session for `descriptor`, connecting if needed.
    /// Concurrent callers for the same descriptor share one connect attempt
    /// and observe the same session or the same error.
    pub async fn acquire(&self, descriptor: &ConnectionDescriptor) -> Result<Arc<Session>> {
        descriptor.validate()?;
        let settings = &self.inner.settings;
        loop {
            let lookup = {
                let mut slots = self.slots();
                match slots.get(descriptor) {
                    Some(Slot::Live(session)) if !session.is_closed() => {
                        Lookup::Live(Arc::clone(session))
                    }
                    Some(Slot::Connecting { future, .. }) => Lookup::Pending(future.clone()),
                    _ => Lookup::Pending(self.start_connect(&mut slots, descriptor)),
                }
            };

            match lookup {
                Lookup::Pending(future) => return future.await,
                Lookup::Live(session) => {
                    if session
                        .still_alive(settings.liveness_check_after(), settings.probe_timeout())
                        .await
                    {
                        debug!(session = session.id(), host = %descriptor.host, "reusing session");
                        session.touch();
                        return Ok(session);
                    }
                    info!(session = session.id(), host = %descriptor.host, "session is dead, reconnecting");
                    self.discard(descriptor, &session).await;
                }
            }
        }
    }

    fn start_connect(
        &self,
        slots: &mut HashMap<ConnectionDescriptor, Slot>,
        descriptor: &ConnectionDescriptor,
    ) -> ConnectFuture {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let registry = self.clone();
        let target = descriptor.clone();
        let task = tokio::spawn(async move { registry.connect(target, generation).await });
        let future = async move { task.await? }.boxed().shared();
        slots.insert(
            descriptor.clone(),
            Slot::Connecting {
                generation,
                future: future.clone(),
            },
        );
        future
    }

    async fn connect(&self, descriptor: ConnectionDescriptor, generation: u64) -> Result<Arc<Session>> {
        let settings = &self.inner.settings;
        info!(storage = %descriptor.storage, host = %descriptor.host, "connecting");

        let mut client = match self.inner.factory.create(&descriptor) {
            Ok(client) => client,
            Err(err) => {
                self.clear_connecting(&descriptor, generation);
                return Err(err);
            }
        };
        let connected = tokio::time::timeout(settings.connect_timeout(), client.connect())
            .await
            .unwrap_or(Err(StorageError::Timeout));
        let info = match connected {
            Ok(info) => info,
            Err(err) => {
                warn!(host = %descriptor.host, error = %err, "connect failed");
                let _ = tokio::time::timeout(settings.probe_timeout(), client.disconnect()).await;
                self.clear_connecting(&descriptor, generation);
                return Err(err);
            }
        };

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(
            id,
            descriptor.clone(),
            info,
            client,
            settings.probe_timeout(),
        ));
        if self.install(&descriptor, generation, &session) {
            info!(session = id, host = %descriptor.host, "session established");
            Ok(session)
        } else {
            debug!(session = id, "connect was abandoned, closing fresh session");
            session.close().await;
            Err(StorageError::Cancelled)
        }
    }

    fn install(&self, descriptor: &ConnectionDescriptor, generation: u64, session: &Arc<Session>) -> bool {
        let mut slots = self.slots();
        match slots.get(descriptor) {
            Some(Slot::Connecting { generation: current, .. }) if *current == generation => {
                slots.insert(descriptor.clone(), Slot::Live(Arc::clone(session)));
                true
            }
            _ => false,
        }
    }

    fn clear_connecting(&self, descriptor: &ConnectionDescriptor, generation: u64) {
        let mut slots = self.slots();
        if matches!(
            slots.get(descriptor),
            Some(Slot::Connecting { generation: current, .. }) if *current == generation
        ) {
            slots.remove(descriptor);
        }
    }

    async fn discard(&self, descriptor: &ConnectionDescriptor, session: &Arc<Session>) {
        let removed = {
            let mut slots = self.slots();
            match slots.get(descriptor) {
                Some(Slot::Live(current)) if current.id() == session.id() => slots.remove(descriptor),
                _ => None,
            }
        };
        drop(removed);
        session.close().await;
    }

    pub fn live_session(&self, descriptor: &ConnectionDescriptor) -> Option<Arc<Session>> {
        match self.slots().get(descriptor) {
            Some(Slot::Live(session)) if !session.is_closed() => Some(Arc::clone(session)),
            _ => None,
        }
    }

    /// Closes and forgets the session for `descriptor`. An in-flight connect
    /// is abandoned and its session closed when it completes.
    pub async fn evict(&self, descriptor: &ConnectionDescriptor) {
        let removed = self.slots().remove(descriptor);
        match removed {
            Some(Slot::Live(session)) => {
                info!(session = session.id(), host = %descriptor.host, "evicting session");
                session.close().await;
            }
            Some(Slot::Connecting { .. }) => {
                debug!(host = %descriptor.host, "abandoning in-flight connect");
            }
            None => {}
        }
    }

    pub async fn evict_id(&self, id: &str) -> usize {
        if id == ConnectionDescriptor::NEW_ID {
            return 0;
        }
        let sessions = {
            let mut slots = self.slots();
            let matching: Vec<ConnectionDescriptor> =
                slots.keys().filter(|d| d.id == id).cloned().collect();
            matching
                .iter()
                .filter_map(|d| match slots.remove(d) {
                    Some(Slot::Live(session)) => Some(session),
                    _ => None,
                })
                .collect::<Vec<_>>()
        };
        let count = sessions.len();
        join_all(sessions.iter().map(|session| session.close())).await;
        if count > 0 {
            info!(connection = id, count, "evicted sessions");
        }
        count
    }

    pub async fn evict_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut slots = self.slots();
            slots
                .drain()
                .filter_map(|(_, slot)| match slot {
                    Slot::Live(session) => Some(session),
                    Slot::Connecting { .. } => None,
                })
                .collect()
        };
        if !sessions.is_empty() {
            info!(count = sessions.len(), "closing all sessions");
        }
        join_all(sessions.iter().map(|session| session.close())).await;
    }

    pub async fn reap_idle(&self) -> usize {
        let idle_timeout = self.inner.settings.idle_timeout();
        let idle: Vec<Arc<Session>> = {
            let mut slots = self.slots();
            let expired: Vec<ConnectionDescriptor> = slots
                .iter()
                .filter_map(|(descriptor, slot)| match slot {
                    Slot::Live(session) if !session.is_busy() && session.idle_for() >= idle_timeout => {
                        Some(descriptor.clone())
                    }
                    _ => None,
                })
                .collect();
            expired
                .iter()
                .filter_map(|descriptor| match slots.remove(descriptor) {
                    Some(Slot::Live(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };
        for session in &idle {
            debug!(session = session.id(), idle = ?session.idle_for(), "reaping idle session");
        }
        join_all(idle.iter().map(|session| session.close())).await;
        idle.len()
    }

    pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let registry = SessionRegistry { inner };
                let reaped = registry.reap_idle().await;
                if reaped > 0 {
                    info!(reaped, "idle sessions closed");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;
    use crate::descriptor::StorageType;
    use std::sync::atomic::AtomicUsize;

    struct MockFactory {
        created: AtomicUsize,
        disconnects: Arc<AtomicUsize>,
        connect_result: Result<ConnectInfo>,
    }

    impl MockFactory {
        fn new(connect_result: Result<ConnectInfo>) -> Arc<Self> {
            Arc::new(Self {
                created: AtomicUsize::new(0),
                disconnects: Arc::new(AtomicUsize::new(0)),
                connect_result,
            })
        }
    }

    impl ClientFactory for MockFactory {
        fn create(&self, _descriptor: &ConnectionDescriptor) -> Result<Box<dyn ProtocolClient>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            let mut client = MockClient::new();
            let result = self.connect_result.clone();
            client.expect_capabilities().return_const(Capabilities::default());
            client.expect_connect().returning(move || result.clone());
            client.expect_is_alive().returning(|| true);
            let disconnects = Arc::clone(&self.disconnects);
            client.expect_disconnect().returning(move || {
                disconnects.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            Ok(Box::new(client))
        }
    }

    fn descriptor(host: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new(StorageType::Ftp, host)
    }

    #[tokio::test]
    async fn test_equal_descriptors_share_one_session() {
        let factory = MockFactory::new(Ok(ConnectInfo::default()));
        let registry = SessionRegistry::new(factory.clone(), AccessSettings::default());

        let first = registry.acquire(&descriptor("a")).await.unwrap();
        let second = registry.acquire(&descriptor("a")).await.unwrap();
        let other = registry.acquire(&descriptor("b")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_connect_is_not_cached() {
        let factory = MockFactory::new(Err(StorageError::AuthenticationFailed));
        let registry = SessionRegistry::new(factory.clone(), AccessSettings::default());

        let err = registry.acquire(&descriptor("a")).await.unwrap_err();
        assert_eq!(err, StorageError::AuthenticationFailed);
        assert!(registry.is_empty());

        registry.acquire(&descriptor("a")).await.unwrap_err();
        assert_eq!(factory.created.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_evict_closes_once_and_is_idempotent() {
        let factory = MockFactory::new(Ok(ConnectInfo::default()));
        let registry = SessionRegistry::new(factory.clone(), AccessSettings::default());
        let d = descriptor("a");

        let session = registry.acquire(&d).await.unwrap();
        registry.evict(&d).await;
        registry.evict(&d).await;
        session.close().await;

        assert!(session.is_closed());
        assert!(registry.live_session(&d).is_none());
        assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(session.lock().await.err(), Some(StorageError::SessionExpired));

        let fresh = registry.acquire(&d).await.unwrap();
        assert_ne!(fresh.id(), session.id());
    }

    #[tokio::test]
    async fn test_evict_id_only_touches_matching_connections() {
        let factory = MockFactory::new(Ok(ConnectInfo::default()));
        let registry = SessionRegistry::new(factory, AccessSettings::default());

        let mut saved = descriptor("a");
        saved.id = "42".into();
        let mut edited = saved.clone();
        edited.safe_transfer = true;
        let unrelated = descriptor("b");

        registry.acquire(&saved).await.unwrap();
        registry.acquire(&edited).await.unwrap();
        registry.acquire(&unrelated).await.unwrap();

        assert_eq!(registry.evict_id("42").await, 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.live_session(&unrelated).is_some());
    }

    #[tokio::test]
    async fn test_reap_idle_closes_expired_sessions() {
        let factory = MockFactory::new(Ok(ConnectInfo::default()));
        let settings = AccessSettings {
            idle_timeout_secs: 0,
            ..AccessSettings::default()
        };
        let registry = SessionRegistry::new(factory.clone(), settings);

        registry.acquire(&descriptor("a")).await.unwrap();
        assert_eq!(registry.reap_idle().await, 1);
        assert!(registry.is_empty());
        assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_leased_session_survives_reaping() {
        let factory = MockFactory::new(Ok(ConnectInfo::default()));
        let settings = AccessSettings {
            idle_timeout_secs: 0,
            ..AccessSettings::default()
        };
        let registry = SessionRegistry::new(factory.clone(), settings);

        let session = registry.acquire(&descriptor("a")).await.unwrap();
        let lease = session.lease();
        assert!(session.is_busy());
        assert_eq!(registry.reap_idle().await, 0);
        assert!(!session.is_closed());

        drop(lease);
        assert!(!session.is_busy());
        assert_eq!(registry.reap_idle().await, 1);
        assert_eq!(factory.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalid_descriptor_never_reaches_factory() {
        let factory = MockFactory::new(Ok(ConnectInfo::default()));
        let registry = SessionRegistry::new(factory.clone(), AccessSettings::default());

        let err = registry.acquire(&descriptor("")).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidDescriptor(_)));
        assert_eq!(factory.created.load(Ordering::SeqCst), 0);
    }
}
