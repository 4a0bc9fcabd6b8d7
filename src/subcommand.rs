use super::*;

mod miner;
mod ping;
pub(crate) mod pool;
pub(crate) mod proxy;
pub mod template;

#[derive(Debug, Parser)]
pub(crate) enum Subcommand {
    #[command(about = "Run a toy miner")]
    Miner(miner::Miner),
    #[command(about = "Measure Stratum message ping")]
    Ping(ping::Ping),
    #[command(about = "Run a solo pool")]
    Pool(pool::Pool),
    #[command(about = "Run a Stratum proxy")]
    Proxy(proxy::Proxy),
    #[command(about = "Monitor block templates")]
    Template(template::Template),
}

impl Subcommand {
    pub(crate) async fn run(self, cancel_token: CancellationToken) -> Result {
        match self {
            Self::Miner(miner) => miner.run(cancel_token).await,
            Self::Ping(ping) => ping.run().await,
            Self::Pool(pool) => pool.run(cancel_token).await,
            Self::Proxy(proxy) => proxy.run(cancel_token).await,
            Self::Template(template) => template.run().await,
        }
    }
}
