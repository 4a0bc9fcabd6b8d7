use super::*;

const SESSION_TTL: Duration = Duration::from_secs(600);
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Above this extranonce1 width the address space is large enough (2^24+) that a bare
/// counter never collides in practice; below it we must scan for a free slot.
const SCANNED_ENONCE1_WIDTH: usize = 2;

pub(crate) struct Metatron {
    blocks: AtomicU64,
    accepted: AtomicU64,
    rejected: AtomicU64,
    started: Instant,
    connections: AtomicU64,
    users: DashMap<Address<bitcoin::address::NetworkUnchecked>, Arc<UserStats>>,
    extranonces: Extranonces,
    next_enonce1: AtomicU64,
    active_enonce1: DashSet<Extranonce>,
    sessions: DashMap<Extranonce, SessionSnapshot>,
    pending_block_solves: DashMap<BlockHash, Instant>,
    share_hashes: DashSet<BlockHash>,
}

impl Metatron {
    pub(crate) fn new(extranonces: Extranonces) -> Self {
        Self {
            blocks: AtomicU64::new(0),
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            started: Instant::now(),
            connections: AtomicU64::new(0),
            users: DashMap::new(),
            extranonces,
            next_enonce1: AtomicU64::new(0),
            active_enonce1: DashSet::new(),
            sessions: DashMap::new(),
            pending_block_solves: DashMap::new(),
            share_hashes: DashSet::new(),
        }
    }

    pub(crate) fn spawn(self: Arc<Self>, cancel_token: CancellationToken, tasks: &mut JoinSet<()>) {
        tasks.spawn(async move {
            let mut sweep = interval(SESSION_SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = sweep.tick() => {
                        let active_enonce1 = &self.active_enonce1;
                        self.sessions.retain(|enonce1, snapshot| {
                            let expired = snapshot.is_expired(SESSION_TTL);
                            if expired {
                                active_enonce1.remove(enonce1);
                            }
                            !expired
                        });
                    }
                }
            }
        });
    }

    pub(crate) fn extranonces(&self) -> &Extranonces {
        &self.extranonces
    }

    pub(crate) fn enonce2_size(&self) -> usize {
        self.extranonces.enonce2_size()
    }

    /// Allocates a fresh extranonce1 (or, for proxy mode, the locally-owned extension
    /// appended to the upstream-assigned prefix). Widths of 1-2 bytes give a space small
    /// enough that a bare counter would eventually hand out a value already held by a
    /// live or reconnect-pending client, so those widths scan for a free slot instead;
    /// wider spaces keep the cheap counter since collisions there are not reachable in
    /// practice. Returns `None` ("pool full") if every slot in a scanned space is taken.
    pub(crate) fn next_enonce1(&self) -> Option<Extranonce> {
        let scanned_width = match &self.extranonces {
            Extranonces::Pool(_) => self.extranonces.enonce1_size(),
            Extranonces::Proxy(proxy) => proxy.extension_size(),
        };

        let extension = if scanned_width <= SCANNED_ENONCE1_WIDTH {
            let slots = 1usize << (scanned_width * 8);
            let start = self.next_enonce1.fetch_add(1, Ordering::Relaxed) as usize;

            (0..slots).find_map(|offset| {
                let candidate = ((start + offset) % slots) as u64;
                let extension =
                    Extranonce::from_bytes(&candidate.to_be_bytes()).pad_or_truncate(scanned_width);

                let full = match &self.extranonces {
                    Extranonces::Pool(_) => extension.clone(),
                    Extranonces::Proxy(proxy) => {
                        let mut bytes = proxy.upstream_enonce1().as_bytes().to_vec();
                        bytes.extend_from_slice(extension.as_bytes());
                        Extranonce::from_bytes(&bytes)
                    }
                };

                self.active_enonce1.insert(full).then_some(extension)
            })?
        } else {
            let counter = self.next_enonce1.fetch_add(1, Ordering::Relaxed);
            Extranonce::from_bytes(&counter.to_be_bytes()).pad_or_truncate(scanned_width)
        };

        let enonce1 = match &self.extranonces {
            Extranonces::Pool(_) => extension,
            Extranonces::Proxy(proxy) => {
                let mut bytes = proxy.upstream_enonce1().as_bytes().to_vec();
                bytes.extend_from_slice(extension.as_bytes());
                Extranonce::from_bytes(&bytes)
            }
        };

        if scanned_width > SCANNED_ENONCE1_WIDTH {
            self.active_enonce1.insert(enonce1.clone());
        }

        Some(enonce1)
    }

    /// Marks an enonce1 as no longer held by any live or reconnect-pending client,
    /// making it eligible for reallocation by [`Self::next_enonce1`].
    pub(crate) fn release_enonce1(&self, enonce1: &Extranonce) {
        self.active_enonce1.remove(enonce1);
    }

    pub(crate) fn take_session(&self, enonce1: &Extranonce) -> Option<SessionSnapshot> {
        let (_, snapshot) = self.sessions.remove(enonce1)?;

        if snapshot.is_expired(SESSION_TTL) {
            self.active_enonce1.remove(enonce1);
            None
        } else {
            Some(snapshot)
        }
    }

    pub(crate) fn store_session(&self, snapshot: SessionSnapshot) {
        self.sessions.insert(snapshot.enonce1.clone(), snapshot);
    }

    pub(crate) fn get_or_create_worker(
        &self,
        address: Address<bitcoin::address::NetworkUnchecked>,
        workername: &str,
    ) -> Arc<WorkerStats> {
        let user = self
            .users
            .entry(address.clone())
            .or_insert_with(|| Arc::new(UserStats::new(address)))
            .clone();

        user.get_or_create_worker(workername)
    }

    pub(crate) fn record_authorize(&self, address: &Address<bitcoin::address::NetworkUnchecked>) {
        if let Some(user) = self.users.get(address) {
            user.record_authorize();
        }
    }

    pub(crate) fn record_share(
        &self,
        address: &Address<bitcoin::address::NetworkUnchecked>,
        workername: &str,
        difficulty: f64,
    ) {
        if let Some(user) = self.users.get(address) {
            let worker = user.get_or_create_worker(workername);
            worker.record_share(difficulty);
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Registers a block hash as submitted-but-not-yet-confirmed, so it shows up in
    /// pool stats while the generator's `submitblock` RPC is in flight.
    pub(crate) fn record_pending_block_solve(&self, hash: BlockHash) {
        self.pending_block_solves.insert(hash, Instant::now());
    }

    /// Removes a block hash from the pending list once the generator confirms or
    /// rejects it. Only bumps the accepted-block counter on confirmation.
    pub(crate) fn resolve_block_solve(&self, hash: &BlockHash, confirmed: bool) {
        self.pending_block_solves.remove(hash);
        if confirmed {
            self.add_block();
        }
    }

    pub(crate) fn pending_block_solves(&self) -> usize {
        self.pending_block_solves.len()
    }

    /// Pool-wide duplicate detection across all connections, complementing each
    /// connection's own per-job LRU: a share with this exact header hash already
    /// accepted by any worker is rejected even if two different connections happened
    /// to submit it. Must be cleared on block change or it grows without bound.
    pub(crate) fn is_duplicate_share(&self, hash: BlockHash) -> bool {
        !self.share_hashes.insert(hash)
    }

    pub(crate) fn clear_share_hashes(&self) {
        self.share_hashes.clear();
    }

    pub(crate) fn add_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_connection(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_connection(&self) {
        self.connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn hash_rate_1m(&self) -> HashRate {
        self.users
            .iter()
            .map(|u| u.hash_rate_1m())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_5m(&self) -> HashRate {
        self.users
            .iter()
            .map(|u| u.hash_rate_5m())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_1h(&self) -> HashRate {
        self.users
            .iter()
            .map(|u| u.hash_rate_1h())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_1d(&self) -> HashRate {
        self.users
            .iter()
            .map(|u| u.hash_rate_1d())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_7d(&self) -> HashRate {
        self.users
            .iter()
            .map(|u| u.hash_rate_7d())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn sps_1m(&self) -> f64 {
        self.users.iter().map(|u| u.sps_1m()).sum()
    }

    pub(crate) fn best_ever(&self) -> f64 {
        self.users
            .iter()
            .map(|u| u.best_ever())
            .fold(0.0, f64::max)
    }

    pub(crate) fn last_share(&self) -> Option<Instant> {
        self.users.iter().filter_map(|u| u.last_share()).max()
    }

    pub(crate) fn total_blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    pub(crate) fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn total_connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub(crate) fn total_users(&self) -> usize {
        self.users.len()
    }

    pub(crate) fn total_workers(&self) -> usize {
        self.users.iter().map(|u| u.worker_count()).sum()
    }

    pub(crate) fn total_shares(&self) -> u64 {
        self.users.iter().map(|u| u.total_shares()).sum()
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn get_user(
        &self,
        address: &Address<bitcoin::address::NetworkUnchecked>,
    ) -> Option<Arc<UserStats>> {
        self.users.get(address).map(|r| r.value().clone())
    }

    pub(crate) fn users(&self) -> Vec<Arc<UserStats>> {
        self.users.iter().map(|r| r.value().clone()).collect()
    }

    pub(crate) fn iter_users(
        &self,
    ) -> impl Iterator<Item = (Address<bitcoin::address::NetworkUnchecked>, Arc<UserStats>)> + '_ {
        self.users.iter().map(|r| (r.key().clone(), r.value().clone()))
    }
}

impl StatusLine for Metatron {
    fn status_line(&self) -> String {
        format!(
            "hr_5m={}  users={}  workers={}  conns={}  accepted={}  rejected={}  blocks={}  uptime={}s",
            self.hash_rate_5m(),
            self.total_users(),
            self.total_workers(),
            self.total_connections(),
            self.accepted(),
            self.rejected(),
            self.total_blocks(),
            self.uptime().as_secs()
        )
    }
}

/// Per-address aggregate: authorization count plus one [`WorkerStats`] per workername.
pub(crate) struct UserStats {
    pub(crate) address: Address<bitcoin::address::NetworkUnchecked>,
    pub(crate) authorized: AtomicU64,
    workers: DashMap<String, Arc<WorkerStats>>,
}

impl UserStats {
    fn new(address: Address<bitcoin::address::NetworkUnchecked>) -> Self {
        Self {
            address,
            authorized: AtomicU64::new(0),
            workers: DashMap::new(),
        }
    }

    fn get_or_create_worker(&self, workername: &str) -> Arc<WorkerStats> {
        self.workers
            .entry(workername.to_string())
            .or_insert_with(|| Arc::new(WorkerStats::new(workername.to_string())))
            .clone()
    }

    fn record_authorize(&self) {
        self.authorized.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn total_shares(&self) -> u64 {
        self.workers.iter().map(|w| w.total_shares()).sum()
    }

    pub(crate) fn accepted(&self) -> u64 {
        self.workers.iter().map(|w| w.accepted()).sum()
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.workers.iter().map(|w| w.rejected()).sum()
    }

    pub(crate) fn best_ever(&self) -> f64 {
        self.workers.iter().map(|w| w.best_ever()).fold(0.0, f64::max)
    }

    pub(crate) fn sps_1m(&self) -> f64 {
        self.workers.iter().map(|w| w.sps_1m()).sum()
    }

    pub(crate) fn last_share(&self) -> Option<Instant> {
        self.workers.iter().filter_map(|w| w.last_share()).max()
    }

    pub(crate) fn hash_rate_1m(&self) -> HashRate {
        self.workers
            .iter()
            .map(|w| w.hash_rate_1m())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_5m(&self) -> HashRate {
        self.workers
            .iter()
            .map(|w| w.hash_rate_5m())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_1h(&self) -> HashRate {
        self.workers
            .iter()
            .map(|w| w.hash_rate_1h())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_1d(&self) -> HashRate {
        self.workers
            .iter()
            .map(|w| w.hash_rate_1d())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn hash_rate_7d(&self) -> HashRate {
        self.workers
            .iter()
            .map(|w| w.hash_rate_7d())
            .fold(HashRate::ZERO, |acc, r| acc + r)
    }

    pub(crate) fn workers(&self) -> impl Iterator<Item = Arc<WorkerStats>> + '_ {
        self.workers.iter().map(|r| r.value().clone())
    }
}

/// Per-worker (address, workername) share accounting with decaying hashrate windows.
pub(crate) struct WorkerStats {
    pub(crate) workername: String,
    accepted: AtomicU64,
    rejected: AtomicU64,
    best_ever: Mutex<f64>,
    last_share: Mutex<Option<Instant>>,
    dsps_1m: Mutex<DecayingAverage>,
    dsps_5m: Mutex<DecayingAverage>,
    dsps_1h: Mutex<DecayingAverage>,
    dsps_1d: Mutex<DecayingAverage>,
    dsps_7d: Mutex<DecayingAverage>,
    sps_1m: Mutex<DecayingAverage>,
}

impl WorkerStats {
    fn new(workername: String) -> Self {
        Self {
            workername,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            best_ever: Mutex::new(0.0),
            last_share: Mutex::new(None),
            dsps_1m: Mutex::new(DecayingAverage::new(Duration::from_secs(60))),
            dsps_5m: Mutex::new(DecayingAverage::new(Duration::from_secs(5 * 60))),
            dsps_1h: Mutex::new(DecayingAverage::new(Duration::from_secs(60 * 60))),
            dsps_1d: Mutex::new(DecayingAverage::new(Duration::from_secs(24 * 60 * 60))),
            dsps_7d: Mutex::new(DecayingAverage::new(Duration::from_secs(7 * 24 * 60 * 60))),
            sps_1m: Mutex::new(DecayingAverage::new(Duration::from_secs(60))),
        }
    }

    pub(crate) fn workername(&self) -> &str {
        &self.workername
    }

    /// Records a share at the given pool difficulty; used by callers that only track
    /// aggregate accepted-share difficulty rather than full accept/reject detail.
    pub(crate) fn record_share(&self, difficulty: f64) {
        self.record_accepted_at(difficulty, difficulty);
    }

    pub(crate) fn record_accepted(&self, pool_diff: Difficulty, share_diff: Difficulty) {
        self.record_accepted_at(pool_diff.as_f64(), share_diff.as_f64());
    }

    fn record_accepted_at(&self, pool_diff: f64, share_diff: f64) {
        let now = Instant::now();

        self.accepted.fetch_add(1, Ordering::Relaxed);
        *self.last_share.lock() = Some(now);

        let mut best = self.best_ever.lock();
        if share_diff > *best {
            *best = share_diff;
        }
        drop(best);

        self.dsps_1m.lock().record(pool_diff, now);
        self.dsps_5m.lock().record(pool_diff, now);
        self.dsps_1h.lock().record(pool_diff, now);
        self.dsps_1d.lock().record(pool_diff, now);
        self.dsps_7d.lock().record(pool_diff, now);
        self.sps_1m.lock().record(1.0, now);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub(crate) fn total_shares(&self) -> u64 {
        self.accepted() + self.rejected()
    }

    pub(crate) fn best_ever(&self) -> f64 {
        *self.best_ever.lock()
    }

    pub(crate) fn last_share(&self) -> Option<Instant> {
        *self.last_share.lock()
    }

    pub(crate) fn sps_1m(&self) -> f64 {
        self.sps_1m.lock().value()
    }

    pub(crate) fn hash_rate_1m(&self) -> HashRate {
        HashRate::from_dsps(self.dsps_1m.lock().value())
    }

    pub(crate) fn hash_rate_5m(&self) -> HashRate {
        HashRate::from_dsps(self.dsps_5m.lock().value())
    }

    pub(crate) fn hash_rate_1h(&self) -> HashRate {
        HashRate::from_dsps(self.dsps_1h.lock().value())
    }

    pub(crate) fn hash_rate_1d(&self) -> HashRate {
        HashRate::from_dsps(self.dsps_1d.lock().value())
    }

    pub(crate) fn hash_rate_7d(&self) -> HashRate {
        HashRate::from_dsps(self.dsps_7d.lock().value())
    }
}
