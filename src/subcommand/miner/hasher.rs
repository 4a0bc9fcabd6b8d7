use super::*;

#[derive(Debug)]
pub(crate) struct Hasher {
    pub(crate) extranonce2: Extranonce,
    pub(crate) header: Header,
    pub(crate) job_id: JobId,
    pub(crate) pool_target: Target,
}

impl Hasher {
    pub(crate) fn hash(
        &mut self,
        cancel: CancellationToken,
    ) -> Result<(JobId, Header, Extranonce)> {
        let mut hashes = 0;
        let start = Instant::now();
        let mut last_log = start;

        let span =
            tracing::info_span!("hasher", job_id = %self.job_id, extranonce2 = %self.extranonce2);
        let _ = span.enter();

        loop {
            if cancel.is_cancelled() {
                return Err(anyhow!("hasher cancelled"));
            }

            for _ in 0..10000 {
                let hash = self.header.block_hash();
                hashes += 1;

                if self.pool_target.is_met_by(hash) {
                    info!("Solved block with hash: {hash}");
                    return Ok((self.job_id, self.header, self.extranonce2.clone()));
                }

                self.header.nonce = self
                    .header
                    .nonce
                    .checked_add(1)
                    .ok_or_else(|| anyhow!("nonce space exhausted"))?;
            }

            let now = Instant::now();
            let elapsed_since_last = now.duration_since(last_log).as_secs();

            if elapsed_since_last >= 5 {
                let total_elapsed = now.duration_since(start).as_secs_f64().max(1e-6);
                let current_hashrate = hashes as f64 / total_elapsed;

                info!("Hashrate: {}", HashRate(current_hashrate));

                last_log = now;
            }
        }
    }
}
