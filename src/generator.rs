use super::*;

/// Channel depth for pending block solves; solves are rare enough that a handful of
/// slots absorbs any burst without backpressuring share processing.
const BLOCK_SOLVE_CHANNEL_SIZE: usize = 16;

/// A block assembled by a connection task that met (or nearly met) network difficulty,
/// handed to the generator so the single `submitblock` RPC call happens from one place
/// rather than racing concurrently from every connection task that finds a solve.
pub(crate) struct BlockSolve {
    pub(crate) block: Block,
    pub(crate) response: oneshot::Sender<std::result::Result<(), String>>,
}

/// Fetches block templates on a timer, refreshing immediately whenever ZMQ reports a new
/// tip so miners are not left working stale templates between polls. Also owns the only
/// `submitblock` RPC path, fed by connection tasks via [`BlockSolve`].
pub(crate) struct Generator {
    bitcoin_rpc_client: Arc<Client>,
    cancel: CancellationToken,
    settings: Arc<Settings>,
    join: Option<JoinHandle<()>>,
}

impl Generator {
    pub(crate) async fn new(settings: Arc<Settings>) -> Result<Self> {
        Ok(Self {
            bitcoin_rpc_client: Arc::new(settings.bitcoin_rpc_client().await?),
            cancel: CancellationToken::new(),
            settings,
            join: None,
        })
    }

    pub(crate) async fn spawn(
        &mut self,
    ) -> Result<(
        watch::Receiver<Arc<BlockTemplate>>,
        mpsc::Sender<BlockSolve>,
        Arc<Workbases<BlockTemplate>>,
    )> {
        let bitcoin_rpc_client = self.bitcoin_rpc_client.clone();
        let cancel = self.cancel.clone();
        let settings = self.settings.clone();

        let initial_template = Arc::new(get_block_template(&bitcoin_rpc_client, &settings).await?);

        let workbases = Arc::new(Workbases::new());
        workbases.ingest(initial_template.clone());

        let (template_sender, template_receiver) = watch::channel(initial_template);
        let (submit_tx, mut submit_rx) = mpsc::channel::<BlockSolve>(BLOCK_SOLVE_CHANNEL_SIZE);
        let task_workbases = workbases.clone();

        let mut zmq = match Zmq::connect(settings.clone()).await {
            Ok(zmq) => Some(zmq),
            Err(err) => {
                warn!("Continuing without ZMQ fast path: {err}");
                None
            }
        };

        self.join = Some(task::spawn(async move {
            loop {
                let woken_early = if let Some(zmq) = zmq.as_mut() {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(settings.update_interval()) => false,
                        result = zmq.recv_blockhash() => {
                            if let Err(err) = result {
                                warn!("ZMQ hashblock error: {err}");
                            }
                            true
                        }
                        Some(solve) = submit_rx.recv() => {
                            submit_block(&bitcoin_rpc_client, solve).await;
                            continue;
                        }
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(settings.update_interval()) => false,
                        Some(solve) = submit_rx.recv() => {
                            submit_block(&bitcoin_rpc_client, solve).await;
                            continue;
                        }
                    }
                };

                if woken_early {
                    debug!("New block announced over ZMQ, refreshing template early");
                }

                match get_block_template(&bitcoin_rpc_client, &settings).await {
                    Ok(template) => {
                        let template = Arc::new(template);
                        let (id, block_change) = task_workbases.ingest(template.clone());
                        if block_change {
                            debug!("New block, workbase {id} is now current");
                        }
                        template_sender.send_replace(template);
                    }
                    Err(err) => {
                        warn!("Failed to fetch block template: {err}");
                    }
                }
            }
            info!("Shutting down generator")
        }));

        Ok((template_receiver, submit_tx, workbases))
    }

    pub(crate) async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

async fn submit_block(bitcoin_rpc_client: &Client, solve: BlockSolve) {
    let result = bitcoin_rpc_client
        .submit_block(&solve.block)
        .await
        .map_err(|err| err.to_string());

    if let Err(ref err) = result {
        error!("Failed to submit block {}: {err}", solve.block.block_hash());
    }

    let _ = solve.response.send(result);
}

async fn get_block_template(
    bitcoin_rpc_client: &Client,
    settings: &Settings,
) -> Result<BlockTemplate> {
    info!("Fetching new block template");

    let mut rules = vec!["segwit"];
    if settings.chain() == Chain::Signet {
        rules.push("signet");
    }

    let params = json!({
        "capabilities": ["coinbasetxn", "workid", "coinbase/append"],
        "rules": rules,
    });

    Ok(bitcoin_rpc_client
        .call::<BlockTemplate>("getblocktemplate", &[params])
        .await?)
}

pub(crate) async fn spawn_generator(
    settings: Arc<Settings>,
    cancel_token: CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Result<(
    watch::Receiver<Arc<BlockTemplate>>,
    mpsc::Sender<BlockSolve>,
    Arc<Workbases<BlockTemplate>>,
)> {
    let mut generator = Generator::new(settings).await?;

    let (workbase_rx, submit_tx, workbases) = generator.spawn().await?;

    tasks.spawn(async move {
        cancel_token.cancelled().await;
        generator.shutdown().await;
    });

    Ok((workbase_rx, submit_tx, workbases))
}
