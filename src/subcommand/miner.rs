use {
    super::*,
    controller::Controller,
    hasher::Hasher,
    metrics::Metrics,
    settings::Settings,
    stratum::{Client, ClientConfig},
};

mod controller;
mod hasher;
mod metrics;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Mode {
    Continuous,
    ShareFound,
    BlockFound,
}

#[derive(Debug, Parser)]
pub(crate) struct Miner {
    #[arg(help = "Stratum <HOST:PORT>.")]
    stratum_endpoint: Option<String>,
    #[arg(long, help = "Stratum <USERNAME>.")]
    username: Option<String>,
    #[arg(long, help = "Stratum <PASSWORD>.")]
    password: Option<String>,
    #[arg(
        long,
        value_enum,
        help = "Mining mode: <continuous|share-found|block-found>."
    )]
    mode: Option<Mode>,
    #[arg(long, help = "Number of <CPU_CORES> to use.")]
    cpu_cores: Option<usize>,
    #[arg(long, help = "Hash rate to <THROTTLE> to.")]
    throttle: Option<HashRate>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Share {
    pub extranonce1: Extranonce,
    pub extranonce2: Extranonce,
    pub job_id: JobId,
    pub nonce: Nonce,
    pub ntime: Ntime,
    pub username: Username,
    pub version_bits: Option<Version>,
}

impl Miner {
    pub(crate) async fn run(self, cancel_token: CancellationToken) -> Result {
        let stratum_endpoint = self
            .stratum_endpoint
            .ok_or_else(|| anyhow!("stratum endpoint required"))?;

        let username = self
            .username
            .ok_or_else(|| anyhow!("username required"))?;

        let password = self.password;

        let mode = self.mode.unwrap_or(Mode::Continuous);

        let cpu_cores = self.cpu_cores;

        let throttle = self.throttle;

        let username: Username = username.into();

        info!("Connecting to {stratum_endpoint} with user {username}");

        let address = resolve_stratum_endpoint(&stratum_endpoint).await?;

        let config = ClientConfig {
            address: address.to_string(),
            username: username.clone(),
            user_agent: USER_AGENT.into(),
            password,
            timeout: Duration::from_secs(10),
        };

        let client = Client::new(config);

        let mut system = System::new();
        system.refresh_cpu_all();
        let available_cpu_cores = system.cpus().len();

        let cpu_cores = if let Some(cpu_cores) = cpu_cores {
            std::cmp::min(cpu_cores, available_cpu_cores)
        } else {
            available_cpu_cores
        };

        info!("Available CPU cores: {}", available_cpu_cores);
        info!("CPU cores to use: {}", cpu_cores);

        let shares =
            Controller::run(client, username, cpu_cores, throttle, mode, false, cancel_token)
                .await?;

        println!("{}", serde_json::to_string_pretty(&shares)?);

        Ok(())
    }
}
