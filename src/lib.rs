#![allow(clippy::too_many_arguments)]
use {
    anyhow::{Context, Error, anyhow, bail, ensure},
    arguments::Arguments,
    axum::{
        Extension, Router,
        extract::{DefaultBodyLimit, Json},
        http::{
            self, HeaderValue, StatusCode,
            header::{CONTENT_DISPOSITION, CONTENT_TYPE},
        },
        response::{IntoResponse, Response},
        routing::{MethodRouter, get, post},
    },
    axum_server::Handle,
    bitcoin::{
        Address, Amount, Block, BlockHash, CompactTarget, Network, OutPoint, ScriptBuf, Sequence,
        Target, Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
        block::{self, Header},
        consensus::{self, Decodable, Encodable, encode},
        hashes::{Hash, sha256d},
        locktime::absolute::LockTime,
        script::write_scriptint,
    },
    bitcoind_async_client::{Auth, Client},
    block_template::BlockTemplate,
    byteorder::{BigEndian, ByteOrder, LittleEndian},
    chain::Chain,
    clap::Parser,
    coinbase_builder::CoinbaseBuilder,
    dashmap::{DashMap, DashSet},
    decay::DecayingAverage,
    derive_more::Display,
    extranonces::{Extranonces, PoolExtranonces, ProxyExtranonces},
    futures::stream::StreamExt,
    generator::BlockSolve,
    hash_rate::HashRate,
    hex::FromHex,
    job::Job,
    jobs::Jobs,
    logs::logs_enabled,
    metatron::Metatron,
    metrics::Metrics,
    parking_lot::{Mutex, RwLock},
    rand::Rng,
    record_sink::{
        BlockFoundEvent, DbEvent, ShareEvent, UserAuthorizedEvent, WorkerConnectedEvent,
        WorkerDisconnectedEvent, build_record_sink,
    },
    reqwest::Url,
    rust_embed::RustEmbed,
    rustls_acme::{
        AcmeConfig,
        acme::{LETS_ENCRYPT_PRODUCTION_DIRECTORY, LETS_ENCRYPT_STAGING_DIRECTORY},
        axum::AxumAcceptor,
        caches::DirCache,
    },
    serde::{
        Deserialize, Serialize, Serializer,
        de::{self, Deserializer},
        ser::SerializeSeq,
    },
    serde_json::{Value, json},
    serde_with::{DeserializeFromStr, SerializeDisplay},
    settings::Settings,
    sqlx::{Pool, Postgres, postgres::PgPoolOptions},
    std::{
        collections::{BTreeMap, HashMap, VecDeque},
        env,
        fmt::{self, Display, Formatter},
        fs, io,
        net::{SocketAddr, ToSocketAddrs},
        ops::{Add, BitAnd, BitOr, BitXor, Not},
        path::{Path, PathBuf},
        process,
        str::FromStr,
        sync::{
            Arc, LazyLock,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        thread,
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    },
    share::Share,
    stratifier::Stratifier,
    stratum::{
        Authorize, Configure, Difficulty, Extranonce, Id, JobId, MAX_MESSAGE_SIZE, MerkleNode,
        Message, Nbits, Nonce, Notify, Ntime, PrevHash, SetDifficulty, StratumError, Submit,
        Subscribe, SubscribeResult, Username, Version,
    },
    sysinfo::{Disks, System},
    throbber::{StatusLine, spawn_throbber},
    tokio::{
        io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
        net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
        runtime::Runtime,
        signal::ctrl_c,
        sync::{broadcast, mpsc, oneshot, watch},
        task::{self, JoinHandle, JoinSet},
        time::{MissedTickBehavior, interval, sleep},
    },
    tokio_util::sync::CancellationToken,
    tower_http::{
        services::ServeDir, set_header::SetResponseHeaderLayer,
        validate_request::ValidateRequestHeaderLayer,
    },
    tracing::{Subscriber, debug, error, info, warn},
    tracing_appender::non_blocking,
    tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt},
    upstream::Upstream,
    workbase::{Workbase, Workbases},
    zmq::Zmq,
};

pub(crate) mod api;

mod arguments;
mod block_template;
mod chain;
pub mod ckpool;
pub mod coinbase_builder;
mod decay;
pub mod extranonces;
pub mod generator;
pub mod hash_rate;
mod http_server;
mod job;
mod jobs;
mod logs;
mod metatron;
mod metrics;
mod record_sink;
mod settings;
pub mod share;
pub mod stats;
pub mod stratifier;
pub mod subcommand;
mod throbber;
mod upstream;
pub mod vardiff;
pub mod workbase;
mod zmq;

pub const COIN_VALUE: u64 = 100_000_000;
pub const USER_AGENT: &str = "paraminer/0.0.1";
pub const EXTRANONCE2_SIZE: usize = 8;
pub(crate) const SHARE_CHANNEL_CAPACITY: usize = 256;

pub(crate) fn integration_test() -> bool {
    env::var_os("PARA_INTEGRATION_TEST").is_some()
}
pub(crate) const MIN_ENONCE_SIZE: usize = 2;
pub(crate) const MAX_ENONCE_SIZE: usize = 8;

/// Fixed subscription id returned in `mining.subscribe`'s result array; this pool
/// never hands out more than one subscription per connection so there is nothing to
/// disambiguate and miners only ever echo it back verbatim.
pub(crate) const SUBSCRIPTION_ID: &str = "ae6812eb4cd7735a302a8a9dd95cf71f";

/// Miners with a skewed clock are still allowed to submit if their ntime is ahead of
/// the job's by less than this many seconds; this is Bitcoin Core's own
/// `MAX_FUTURE_BLOCK_TIME` tolerance, reused here since the header time check
/// ultimately has to satisfy the same consensus rule.
pub(crate) const MAX_NTIME_OFFSET: u32 = 2 * 60 * 60;

/// A share at or above 99% of network difficulty is treated as a possible block
/// solve and routed to the generator to attempt `submitblock`; the margin below
/// 100% accounts for difficulty rounding between the share hash and the compact
/// `nbits` target so a genuine solve is never missed because of floating point
/// difficulty comparison.
pub(crate) const BLOCK_SOLVE_THRESHOLD: f64 = 0.99;

type Result<T = (), E = Error> = std::result::Result<T, E>;

fn target_as_block_hash(target: bitcoin::Target) -> BlockHash {
    BlockHash::from_raw_hash(Hash::from_byte_array(target.to_le_bytes()))
}

pub fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cancel_token = CancellationToken::new();

    let runtime = Runtime::new().expect("failed to start tokio runtime");

    let result = runtime.block_on(async {
        let token = cancel_token.clone();
        tokio::spawn(async move {
            let _ = ctrl_c().await;
            token.cancel();
        });

        Arguments::parse().run(cancel_token).await
    });

    match result {
        Err(err) => {
            error!("error: {err}");

            if env::var_os("RUST_BACKTRACE")
                .map(|val| val == "1")
                .unwrap_or_default()
            {
                error!("{}", err.backtrace());
            }
            process::exit(1);
        }
        Ok(_) => {
            process::exit(0);
        }
    }
}
