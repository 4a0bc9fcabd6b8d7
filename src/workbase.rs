use super::*;

/// At most this many workbases are kept regardless of age.
const MAX_RETAINED_WORKBASES: usize = 3;

/// Below this age a workbase is retained even past [`MAX_RETAINED_WORKBASES`], so a
/// straggling job built just before a refresh still finds its workbase by id.
const WORKBASE_RETENTION: Duration = Duration::from_secs(600);

/// Keyed collection of in-flight workbases, generic over pool (`BlockTemplate`) and proxy
/// (`Notify`) feeds alike. Assigns monotone ids, tracks the most recent workbase as
/// "current", and ages out old entries once both the count and time bounds are exceeded.
pub(crate) struct Workbases<W: Workbase> {
    next_id: AtomicU64,
    entries: DashMap<u64, (Arc<W>, Instant)>,
    current: RwLock<Option<(u64, Arc<W>)>>,
}

impl<W: Workbase> Workbases<W> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            current: RwLock::new(None),
        }
    }

    /// Assigns an id to `workbase`, makes it current, and returns `(id, is_block_change)`.
    /// `is_block_change` mirrors [`Workbase::clean_jobs`] against the previous current
    /// workbase.
    pub(crate) fn ingest(&self, workbase: Arc<W>) -> (u64, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let is_block_change = self
            .current
            .read()
            .as_ref()
            .map(|(_, prev)| workbase.clean_jobs(Some(prev)))
            .unwrap_or(true);

        self.entries.insert(id, (workbase.clone(), Instant::now()));
        *self.current.write() = Some((id, workbase));

        self.age_and_evict();

        (id, is_block_change)
    }

    pub(crate) fn current(&self) -> Option<(u64, Arc<W>)> {
        self.current.read().clone()
    }

    pub(crate) fn find(&self, id: u64) -> Option<Arc<W>> {
        self.entries.get(&id).map(|entry| entry.0.clone())
    }

    /// Evicts the oldest entries once more than [`MAX_RETAINED_WORKBASES`] are held, but
    /// only those already older than [`WORKBASE_RETENTION`].
    pub(crate) fn age_and_evict(&self) {
        if self.entries.len() <= MAX_RETAINED_WORKBASES {
            return;
        }

        let mut ids: Vec<u64> = self.entries.iter().map(|entry| *entry.key()).collect();
        ids.sort_unstable();

        for id in &ids[..ids.len() - MAX_RETAINED_WORKBASES] {
            let aged = self
                .entries
                .get(id)
                .map(|entry| entry.1.elapsed() >= WORKBASE_RETENTION)
                .unwrap_or(false);

            if aged && self.entries.remove(id).is_some() {
                debug!("Aged out workbase {id}");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[allow(dead_code)]
pub(crate) trait Workbase: Clone + Send + Sync + 'static {
    fn merkle_branches(&self) -> &[MerkleNode];
    fn prevhash(&self) -> PrevHash;
    fn version(&self) -> Version;
    fn nbits(&self) -> Nbits;
    fn ntime(&self) -> Ntime;
    fn height(&self) -> Option<u64>;

    fn create_job(
        self: &Arc<Self>,
        enonce1: &Extranonce,
        enonce2_size: usize,
        address: Option<&Address>,
        job_id: JobId,
        version_mask: Option<Version>,
    ) -> Result<Job<Self>>
    where
        Self: Sized;

    fn clean_jobs(&self, prev: Option<&Self>) -> bool;

    fn build_block(&self, job: &Job<Self>, submit: &Submit, header: Header) -> Result<Block>
    where
        Self: Sized;
}

impl Workbase for BlockTemplate {
    fn merkle_branches(&self) -> &[MerkleNode] {
        &self.merkle_branches
    }

    fn prevhash(&self) -> PrevHash {
        self.previous_block_hash.into()
    }

    fn version(&self) -> Version {
        self.version
    }

    fn nbits(&self) -> Nbits {
        self.bits
    }

    fn ntime(&self) -> Ntime {
        self.current_time
    }

    fn height(&self) -> Option<u64> {
        Some(self.height)
    }

    fn create_job(
        self: &Arc<Self>,
        enonce1: &Extranonce,
        enonce2_size: usize,
        address: Option<&Address>,
        job_id: JobId,
        version_mask: Option<Version>,
    ) -> Result<Job<Self>> {
        let address = address.ok_or_else(|| anyhow!("pool mode requires address"))?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system time before UNIX epoch")?
            .as_secs();

        let (_coinbase_tx, coinb1, coinb2, _genoffset) = CoinbaseBuilder::new(
            address.clone(),
            enonce1.clone(),
            enonce2_size,
            self.height,
            self.coinbase_value,
            self.default_witness_commitment.clone(),
        )
        .with_aux(self.coinbaseaux.clone())
        .with_timestamp(timestamp)
        .with_pool_sig("|parasite|".into())
        .build()
        .context("failed to build coinbase")?;

        Ok(Job {
            job_id,
            coinb1,
            coinb2,
            enonce1: enonce1.clone(),
            version_mask,
            workbase: self.clone(),
        })
    }

    fn clean_jobs(&self, prev: Option<&Self>) -> bool {
        prev.map(|prev| prev.height != self.height).unwrap_or(true)
    }

    fn build_block(&self, job: &Job<Self>, submit: &Submit, header: Header) -> Result<Block> {
        let coinbase_bin = hex::decode(format!(
            "{}{}{}{}",
            job.coinb1, job.enonce1, submit.enonce2, job.coinb2,
        ))
        .context("failed to decode coinbase hex")?;

        let mut cursor = bitcoin::io::Cursor::new(&coinbase_bin);
        let coinbase_tx = Transaction::consensus_decode_from_finite_reader(&mut cursor)
            .context("failed to decode coinbase transaction")?;

        let txdata = std::iter::once(coinbase_tx)
            .chain(self.transactions.iter().map(|tx| tx.transaction.clone()))
            .collect();

        let block = Block { header, txdata };

        if self.height > 16 {
            ensure!(
                block.bip34_block_height().is_ok(),
                "block has invalid BIP34 height encoding"
            );
        }

        Ok(block)
    }
}

/// Watches a workbase feed and clears the pool-wide duplicate-share set whenever a new
/// template starts a fresh block, so the set never accumulates hashes from blocks that
/// have already been superseded.
pub(crate) fn spawn_share_hash_purger<W: Workbase>(
    mut workbase_rx: watch::Receiver<Arc<W>>,
    metatron: Arc<Metatron>,
    cancel_token: CancellationToken,
    tasks: &mut JoinSet<()>,
) {
    tasks.spawn(async move {
        let mut prev = workbase_rx.borrow().clone();

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                changed = workbase_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }

                    let current = workbase_rx.borrow_and_update().clone();
                    if current.clean_jobs(Some(&prev)) {
                        metatron.clear_share_hashes();
                    }
                    prev = current;
                }
            }
        }
    });
}

impl Workbase for Notify {
    fn merkle_branches(&self) -> &[MerkleNode] {
        &self.merkle_branches
    }

    fn prevhash(&self) -> PrevHash {
        self.prevhash.clone()
    }

    fn version(&self) -> Version {
        self.version
    }

    fn nbits(&self) -> Nbits {
        self.nbits
    }

    fn ntime(&self) -> Ntime {
        self.ntime
    }

    fn height(&self) -> Option<u64> {
        None
    }

    fn create_job(
        self: &Arc<Self>,
        enonce1: &Extranonce,
        _enonce2_size: usize,
        _address: Option<&Address>,
        _job_id: JobId,
        version_mask: Option<Version>,
    ) -> Result<Job<Self>> {
        Ok(Job {
            job_id: self.job_id,
            coinb1: self.coinb1.clone(),
            coinb2: self.coinb2.clone(),
            enonce1: enonce1.clone(),
            version_mask,
            workbase: self.clone(),
        })
    }

    fn clean_jobs(&self, _prev: Option<&Self>) -> bool {
        self.clean_jobs
    }

    fn build_block(&self, _job: &Job<Self>, _submit: &Submit, _header: Header) -> Result<Block> {
        bail!("proxy mode does not build blocks")
    }
}
