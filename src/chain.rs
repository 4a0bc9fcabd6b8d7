use super::*;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Chain {
    #[default]
    #[value(name = "bitcoin", alias = "mainnet")]
    Mainnet,
    Testnet,
    Testnet4,
    Signet,
    Regtest,
}

impl Chain {
    pub fn network(self) -> Network {
        match self {
            Self::Mainnet => Network::Bitcoin,
            Self::Testnet => Network::Testnet,
            Self::Testnet4 => Network::Testnet4,
            Self::Signet => Network::Signet,
            Self::Regtest => Network::Regtest,
        }
    }

    pub fn default_rpc_port(self) -> u16 {
        match self {
            Self::Mainnet => 8332,
            Self::Testnet => 18332,
            Self::Testnet4 => 48332,
            Self::Signet => 38332,
            Self::Regtest => 18443,
        }
    }

    /// Bitcoin Core keeps per-network data under a network-named subdirectory of the
    /// data dir, except for mainnet which lives directly in the data dir.
    pub fn join_with_data_dir(self, data_dir: impl AsRef<Path>) -> PathBuf {
        let data_dir = data_dir.as_ref();
        match self {
            Self::Mainnet => data_dir.to_path_buf(),
            Self::Testnet => data_dir.join("testnet3"),
            Self::Testnet4 => data_dir.join("testnet4"),
            Self::Signet => data_dir.join("signet"),
            Self::Regtest => data_dir.join("regtest"),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Mainnet => "mainnet",
                Self::Testnet => "testnet",
                Self::Testnet4 => "testnet4",
                Self::Signet => "signet",
                Self::Regtest => "regtest",
            }
        )
    }
}

impl FromStr for Chain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bitcoin" | "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            "testnet4" => Ok(Self::Testnet4),
            "signet" => Ok(Self::Signet),
            "regtest" => Ok(Self::Regtest),
            other => bail!("invalid chain `{other}`"),
        }
    }
}
