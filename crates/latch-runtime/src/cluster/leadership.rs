use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use latch_core::cluster::{MemberInfo, NodeId};
use latch_core::config::LeadershipConfig;
use latch_core::coordination::{LeadershipManager, MembershipListener};
use latch_core::error::{LatchError, Result};
use latch_core::store::{key_join, ConnectionState, CoordinationStore};

use super::debounce::Debouncer;
use crate::counter::DistributedCounter;

pub const NEXT_ID_KEY: &str = "group/nextId";
pub const LEADER_KEY: &str = "group/leader";
pub const MEMBERS_KEY: &str = "group/members";

fn member_key(node_id: NodeId) -> String {
    key_join(&[MEMBERS_KEY, &node_id.to_string()])
}

/// Node currently holding the leader claim, if any.
pub async fn current_leader(store: &dyn CoordinationStore) -> Result<Option<NodeId>> {
    Ok(store
        .get(LEADER_KEY)
        .await?
        .and_then(|v| std::str::from_utf8(&v.value).ok().and_then(NodeId::from_str)))
}

async fn is_live_member(store: &dyn CoordinationStore, node_id: NodeId) -> Result<bool> {
    Ok(store.get(&member_key(node_id)).await?.is_some())
}

/// Take the next free id from the shared counter, wrapping at
/// [`NodeId::MAX`] and skipping ids held by live members.
pub async fn allocate_node_id(store: Arc<dyn CoordinationStore>) -> Result<NodeId> {
    let counter = DistributedCounter::new(store.clone(), NEXT_ID_KEY);
    let max = i64::from(NodeId::MAX);
    let mut taken = 0u32;

    loop {
        let mut pre = counter.increment().await?;
        if !(0..max).contains(&pre) {
            while !(0..max).contains(&pre) {
                if counter.compare_and_set(pre, 0).await? {
                    break;
                }
                pre = counter.get().await?;
            }
            continue;
        }

        let candidate = NodeId::new(pre as u16)?;
        if is_live_member(store.as_ref(), candidate).await? {
            taken += 1;
            if taken >= u32::from(NodeId::MAX) {
                return Err(LatchError::CapacityExceeded(format!(
                    "all {} node ids are held by live members",
                    NodeId::MAX
                )));
            }
            continue;
        }
        return Ok(candidate);
    }
}

struct Inner {
    store: Arc<dyn CoordinationStore>,
    node_id: NodeId,
    hostname: String,
    config: LeadershipConfig,
    can_be_leader: AtomicBool,
    is_leader: AtomicBool,
    started: AtomicBool,
    stopped: AtomicBool,
    debouncer: Debouncer,
    shutdown_tx: watch::Sender<bool>,
}

impl Inner {
    fn schedule_if_needed(&self) {
        if self.is_leader.load(Ordering::SeqCst) && self.debouncer.schedule() {
            tracing::debug!(node_id = %self.node_id, "Membership callback scheduled");
        }
    }

    async fn register_member(&self) -> Result<()> {
        let info = MemberInfo::new(
            self.node_id,
            self.hostname.clone(),
            self.can_be_leader.load(Ordering::SeqCst),
        );
        let payload = serde_json::to_vec(&info)?;
        match self
            .store
            .create_ephemeral(&member_key(self.node_id), &payload)
            .await
        {
            Ok(_) => Ok(()),
            Err(LatchError::AlreadyExists(_)) => Err(LatchError::Duplicate(format!(
                "node id {} is already registered by a live member",
                self.node_id
            ))),
            Err(e) => Err(e),
        }
    }

    /// Re-register membership whenever the session comes back.
    async fn keep_membership(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut state_rx = self.store.connection_state();
        loop {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if *state_rx.borrow_and_update() != ConnectionState::Reconnected {
                        continue;
                    }
                    match is_live_member(self.store.as_ref(), self.node_id).await {
                        Ok(true) => {}
                        Ok(false) => match self.register_member().await {
                            Ok(()) => tracing::info!(node_id = %self.node_id, "Re-registered group membership"),
                            Err(e) => tracing::warn!(node_id = %self.node_id, error = %e, "Failed to re-register group membership"),
                        },
                        Err(e) => tracing::warn!(node_id = %self.node_id, error = %e, "Failed to check group membership"),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    /// Forward membership changes to the debouncer while leader.
    async fn watch_members(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut changes = match self.store.watch_children(MEMBERS_KEY).await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to watch group membership");
                return;
            }
        };
        loop {
            tokio::select! {
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    changes.borrow_and_update();
                    self.schedule_if_needed();
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }

    fn claim(&self) -> String {
        self.node_id.to_string()
    }

    /// Delete the leader record only while it still carries this node's
    /// claim. Fails with `AlreadyGone` when the record is absent or another
    /// node has claimed it since.
    async fn remove_claim(&self) -> Result<()> {
        let claim = self.claim();
        match self.store.get(LEADER_KEY).await? {
            Some(current) if current.value == claim.as_bytes() => {
                match self.store.delete(LEADER_KEY, Some(current.version)).await {
                    Ok(()) => Ok(()),
                    Err(LatchError::NotFound(_)) | Err(LatchError::VersionMismatch(_)) => Err(
                        LatchError::AlreadyGone("leader claim changed during removal".to_string()),
                    ),
                    Err(e) => Err(e),
                }
            }
            Some(_) => Err(LatchError::AlreadyGone(
                "leader claim held by another node".to_string(),
            )),
            None => Err(LatchError::AlreadyGone("no leader claim".to_string())),
        }
    }

    async fn run_election(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        while !*shutdown_rx.borrow() {
            if let Err(e) = self.contend(&mut shutdown_rx).await {
                tracing::warn!(node_id = %self.node_id, error = %e, "Leader election attempt failed");
                tokio::select! {
                    _ = tokio::time::sleep(self.config.election_poll_interval()) => {}
                    _ = shutdown_rx.changed() => {}
                }
            }
        }
    }

    /// One round: claim the leader record, or wait for it to be vacated.
    async fn contend(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<()> {
        let mut leader_rx = self.store.watch(LEADER_KEY).await?;
        let claim = self.claim();

        match self
            .store
            .create_ephemeral(LEADER_KEY, claim.as_bytes())
            .await
        {
            Ok(version) => {
                self.hold_office(version, leader_rx, shutdown_rx).await;
                Ok(())
            }
            Err(LatchError::AlreadyExists(_)) => {
                if current_leader(self.store.as_ref()).await? == Some(self.node_id) {
                    tracing::info!(node_id = %self.node_id, "Removing stale leader claim");
                    return match self.remove_claim().await {
                        Ok(()) | Err(LatchError::AlreadyGone(_)) => Ok(()),
                        Err(e) => Err(e),
                    };
                }
                loop {
                    if leader_rx.borrow_and_update().is_none() {
                        return Ok(());
                    }
                    tokio::select! {
                        changed = leader_rx.changed() => {
                            if changed.is_err() {
                                return Err(LatchError::Connectivity("leader watch closed".to_string()));
                            }
                        }
                        _ = shutdown_rx.changed() => return Ok(()),
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Hold leadership until the claim disappears, the session is disturbed
    /// or shutdown is requested.
    async fn hold_office(
        &self,
        version: u64,
        mut leader_rx: watch::Receiver<Option<u64>>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) {
        let mut state_rx = self.store.connection_state();
        state_rx.borrow_and_update();

        self.is_leader.store(true, Ordering::SeqCst);
        tracing::info!(node_id = %self.node_id, "Became leader");
        self.schedule_if_needed();

        loop {
            tokio::select! {
                changed = leader_rx.changed() => {
                    if changed.is_err() || *leader_rx.borrow_and_update() != Some(version) {
                        tracing::warn!(node_id = %self.node_id, "Lost leadership");
                        break;
                    }
                }
                changed = state_rx.changed() => {
                    let state = *state_rx.borrow_and_update();
                    if changed.is_err() || state.is_error() {
                        tracing::warn!(node_id = %self.node_id, state = %state, "Lost leadership");
                        break;
                    }
                }
                _ = shutdown_rx.changed() => {
                    tracing::info!(node_id = %self.node_id, "Lost leadership expected due to shutdown");
                    break;
                }
            }
        }

        self.is_leader.store(false, Ordering::SeqCst);
        if let Err(e) = self.remove_claim().await {
            tracing::debug!(node_id = %self.node_id, error = %e, "Leader claim not removed");
        }

        // Requeue only once the session is usable again.
        while state_rx.borrow().is_error() && !*shutdown_rx.borrow() {
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }
}

/// [`LeadershipManager`] over the coordination store: ephemeral membership
/// under `group/members`, an ephemeral claim on `group/leader`, and ids from
/// the `group/nextId` counter.
pub struct StoreLeadershipManager {
    inner: Arc<Inner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl StoreLeadershipManager {
    /// Resolve this node's id: the configured one if no live member holds
    /// it, otherwise a freshly allocated one.
    pub async fn new(
        store: Arc<dyn CoordinationStore>,
        config: LeadershipConfig,
        configured_id: Option<NodeId>,
        hostname: impl Into<String>,
    ) -> Result<Self> {
        let node_id = match configured_id {
            Some(id) => {
                if is_live_member(store.as_ref(), id).await? {
                    return Err(LatchError::Duplicate(format!(
                        "node id {} is already registered by a live member",
                        id
                    )));
                }
                id
            }
            None => allocate_node_id(store.clone()).await?,
        };
        tracing::info!(node_id = %node_id, "Node id assigned");

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                node_id,
                hostname: hostname.into(),
                debouncer: Debouncer::new(config.debounce()),
                config,
                can_be_leader: AtomicBool::new(false),
                is_leader: AtomicBool::new(false),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                shutdown_tx,
            }),
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Node currently holding the leader claim.
    pub async fn leader(&self) -> Result<Option<NodeId>> {
        current_leader(self.inner.store.as_ref()).await
    }

    fn spawn(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }
}

#[async_trait]
impl LeadershipManager for StoreLeadershipManager {
    fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    async fn start(&self, can_be_leader: bool) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            tracing::warn!(node_id = %self.inner.node_id, "Leadership manager already started");
            return Ok(());
        }
        self.inner.can_be_leader.store(can_be_leader, Ordering::SeqCst);
        self.inner.register_member().await?;

        let inner = self.inner.clone();
        self.spawn(tokio::spawn(
            inner.keep_membership(self.inner.shutdown_tx.subscribe()),
        ));

        if can_be_leader {
            let inner = self.inner.clone();
            self.spawn(tokio::spawn(
                inner.run_election(self.inner.shutdown_tx.subscribe()),
            ));
            let inner = self.inner.clone();
            self.spawn(tokio::spawn(
                inner.watch_members(self.inner.shutdown_tx.subscribe()),
            ));
        }

        tracing::info!(
            node_id = %self.inner.node_id,
            can_be_leader,
            "Joined group"
        );
        Ok(())
    }

    fn is_this_instance_leader(&self) -> bool {
        self.inner.can_be_leader.load(Ordering::SeqCst) && self.inner.is_leader.load(Ordering::SeqCst)
    }

    fn on_group_membership_change(&self, listener: Arc<dyn MembershipListener>) {
        self.inner.debouncer.set_listener(listener);
        self.inner.schedule_if_needed();
    }

    async fn get_group_members(&self) -> Result<Vec<NodeId>> {
        let mut members: Vec<NodeId> = self
            .inner
            .store
            .children(MEMBERS_KEY)
            .await?
            .iter()
            .filter_map(|name| NodeId::from_str(name))
            .collect();
        members.sort();
        Ok(members)
    }

    async fn wait_for_leader_to_be_elected(&self, timeout: Duration) -> Result<()> {
        if !self.inner.can_be_leader.load(Ordering::SeqCst) {
            return Ok(());
        }
        let interval = self.inner.config.election_poll_interval();
        let attempts = self.inner.config.election_poll_attempts.max(1);
        let deadline = tokio::time::Instant::now() + timeout;

        for attempt in 0..attempts {
            if attempt > 0 {
                if tokio::time::Instant::now() + interval > deadline {
                    return Err(LatchError::Timeout(format!(
                        "no leader elected within {:?}",
                        timeout
                    )));
                }
                tokio::time::sleep(interval).await;
            }
            if self.is_this_instance_leader() || self.leader().await?.is_some() {
                return Ok(());
            }
        }
        Err(LatchError::NoLeader(format!(
            "Waited too long for leader to be present after {} checks",
            attempts
        )))
    }

    async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.debouncer.shutdown();
        self.inner.shutdown_tx.send_replace(true);

        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Leadership task ended abnormally");
            }
        }

        if self.inner.started.load(Ordering::SeqCst) {
            match self.inner.store.delete(&member_key(self.inner.node_id), None).await {
                Ok(()) | Err(LatchError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(node_id = %self.inner.node_id, error = %e, "Failed to leave group")
                }
            }
        }
        tracing::info!(node_id = %self.inner.node_id, "Leadership manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCluster, MemoryCoordinationStore};
    use std::sync::atomic::AtomicUsize;

    fn config() -> LeadershipConfig {
        LeadershipConfig {
            debounce_secs: 10,
            election_poll_interval_ms: 10,
            election_poll_attempts: 25,
        }
    }

    async fn manager(store: Arc<MemoryCoordinationStore>) -> StoreLeadershipManager {
        StoreLeadershipManager::new(store, config(), None, "test-host")
            .await
            .unwrap()
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ids_are_allocated_in_sequence() {
        let cluster = MemoryCluster::new();
        let a = manager(Arc::new(cluster.connect())).await;
        let b = manager(Arc::new(cluster.connect())).await;
        assert_eq!(a.node_id().as_u16(), 0);
        assert_eq!(b.node_id().as_u16(), 1);
    }

    #[tokio::test]
    async fn test_allocation_skips_live_members_and_wraps() {
        let cluster = MemoryCluster::new();
        let store = Arc::new(cluster.connect());
        store.set(NEXT_ID_KEY, b"999").await.unwrap();
        store.create_ephemeral("group/members/0", b"{}").await.unwrap();

        assert_eq!(allocate_node_id(store.clone()).await.unwrap().as_u16(), 999);
        // 1000 wraps to 0, which is live, so 1 is next.
        assert_eq!(allocate_node_id(store.clone()).await.unwrap().as_u16(), 1);
    }

    #[tokio::test]
    async fn test_configured_id_held_by_live_member_is_duplicate() {
        let cluster = MemoryCluster::new();
        let first = StoreLeadershipManager::new(
            Arc::new(cluster.connect()),
            config(),
            NodeId::new(7).ok(),
            "a",
        )
        .await
        .unwrap();
        first.start(false).await.unwrap();

        let second = StoreLeadershipManager::new(
            Arc::new(cluster.connect()),
            config(),
            NodeId::new(7).ok(),
            "b",
        )
        .await;
        assert!(matches!(second, Err(LatchError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_exactly_one_leader() {
        let cluster = MemoryCluster::new();
        let mut managers = Vec::new();
        for _ in 0..3 {
            let m = manager(Arc::new(cluster.connect())).await;
            m.start(true).await.unwrap();
            managers.push(m);
        }
        for m in &managers {
            m.wait_for_leader_to_be_elected(Duration::from_secs(1))
                .await
                .unwrap();
        }
        let leaders = managers.iter().filter(|m| m.is_this_instance_leader()).count();
        assert_eq!(leaders, 1);
        assert_eq!(managers[0].get_group_members().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_leadership_moves_when_leader_session_expires() {
        let cluster = MemoryCluster::new();
        let store_a = Arc::new(cluster.connect());
        let a = manager(store_a.clone()).await;
        a.start(true).await.unwrap();
        wait_for(|| a.is_this_instance_leader()).await;

        let b = manager(Arc::new(cluster.connect())).await;
        b.start(true).await.unwrap();

        store_a.expire();
        wait_for(|| b.is_this_instance_leader()).await;
        wait_for(|| !a.is_this_instance_leader()).await;
        assert_eq!(b.leader().await.unwrap(), Some(b.node_id()));

        store_a.resume();
        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_non_leader_eligible_node_does_not_wait() {
        let cluster = MemoryCluster::new();
        let m = manager(Arc::new(cluster.connect())).await;
        m.start(false).await.unwrap();
        m.wait_for_leader_to_be_elected(Duration::from_millis(10))
            .await
            .unwrap();
        assert!(!m.is_this_instance_leader());
    }

    #[tokio::test]
    async fn test_wait_without_any_leader_fails() {
        let cluster = MemoryCluster::new();
        let store = Arc::new(cluster.connect());
        // Another session squats on the claim and never yields it.
        let squatter = cluster.connect();
        squatter.create_ephemeral(LEADER_KEY, b"999").await.unwrap();

        let m = manager(store).await;
        m.start(true).await.unwrap();
        squatter.delete(LEADER_KEY, None).await.unwrap();
        m.shutdown().await;

        // Eligible but shut down, nobody leads.
        assert!(matches!(
            m.wait_for_leader_to_be_elected(Duration::from_secs(5)).await,
            Err(LatchError::NoLeader(_))
        ));
        assert!(matches!(
            m.wait_for_leader_to_be_elected(Duration::from_millis(25)).await,
            Err(LatchError::Timeout(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_bounded_by_configured_attempts() {
        let cluster = MemoryCluster::new();
        let squatter = cluster.connect();
        squatter.create_ephemeral(LEADER_KEY, b"999").await.unwrap();
        let mut short = config();
        short.election_poll_attempts = 3;
        let m = StoreLeadershipManager::new(Arc::new(cluster.connect()), short, None, "h")
            .await
            .unwrap();
        m.start(true).await.unwrap();
        squatter.delete(LEADER_KEY, None).await.unwrap();
        m.shutdown().await;

        let started = tokio::time::Instant::now();
        assert!(matches!(
            m.wait_for_leader_to_be_elected(Duration::from_secs(60)).await,
            Err(LatchError::NoLeader(_))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_claim_removal_spares_another_nodes_claim() {
        let cluster = MemoryCluster::new();
        let m = manager(Arc::new(cluster.connect())).await;
        let other = cluster.connect();
        other.create_ephemeral(LEADER_KEY, b"999").await.unwrap();

        assert!(matches!(
            m.inner.remove_claim().await,
            Err(LatchError::AlreadyGone(_))
        ));
        assert_eq!(
            current_leader(&other).await.unwrap(),
            NodeId::new(999).ok()
        );

        other.delete(LEADER_KEY, None).await.unwrap();
        other
            .create_ephemeral(LEADER_KEY, m.node_id().to_string().as_bytes())
            .await
            .unwrap();
        m.inner.remove_claim().await.unwrap();
        assert!(other.get(LEADER_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_leader_does_not_remove_successors_claim() {
        let cluster = MemoryCluster::new();
        let store_a = Arc::new(cluster.connect());
        let a = manager(store_a.clone()).await;
        a.start(true).await.unwrap();
        wait_for(|| a.is_this_instance_leader()).await;

        let b = manager(Arc::new(cluster.connect())).await;
        b.start(true).await.unwrap();
        store_a.expire();
        wait_for(|| b.is_this_instance_leader()).await;

        store_a.resume();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b.is_this_instance_leader());
        assert_eq!(b.leader().await.unwrap(), Some(b.node_id()));

        a.shutdown().await;
        assert_eq!(b.leader().await.unwrap(), Some(b.node_id()));
        b.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_membership_burst_yields_one_callback() {
        let cluster = MemoryCluster::new();
        let leader = manager(Arc::new(cluster.connect())).await;
        leader.start(true).await.unwrap();
        leader
            .wait_for_leader_to_be_elected(Duration::from_secs(1))
            .await
            .unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        leader.on_group_membership_change(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        // Registering the listener on the leader schedules one run.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let mut joined = Vec::new();
        for _ in 0..4 {
            let m = manager(Arc::new(cluster.connect())).await;
            m.start(false).await.unwrap();
            joined.push(m);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        for m in joined {
            m.shutdown().await;
        }
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_leaves_group() {
        let cluster = MemoryCluster::new();
        let store = Arc::new(cluster.connect());
        let m = manager(store.clone()).await;
        m.start(true).await.unwrap();
        wait_for(|| m.is_this_instance_leader()).await;

        m.shutdown().await;
        m.shutdown().await;
        assert!(!m.is_this_instance_leader());
        assert!(store.get(LEADER_KEY).await.unwrap().is_none());
        assert!(m.get_group_members().await.unwrap().is_empty());
    }
}
