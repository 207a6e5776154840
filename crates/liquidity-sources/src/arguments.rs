use {
    alloy::primitives::Address,
    anyhow::{Context, Result},
    std::{
        fmt::{self, Display, Formatter},
        str::FromStr,
        time::Duration,
    },
};

#[derive(clap::Parser)]
pub struct Arguments {
    #[clap(flatten)]
    pub ethrpc: ethrpc::Arguments,

    #[clap(flatten)]
    pub state_cache: state_cache::Arguments,

    #[clap(flatten)]
    pub logging: observe::Logging,

    /// Uniswap V2 style pairs whose reserves are followed.
    #[clap(long, env, use_value_delimiter = true)]
    pub uniswap_v2_pairs: Vec<Address>,

    /// Vaults to follow in the following format:
    /// `<FEED>|<TOKEN>|<HOLDER>,<FEED>|<TOKEN>|<HOLDER>`
    #[clap(long, env, use_value_delimiter = true)]
    pub vaults: Vec<Vault>,

    /// How often the most recent state of every source gets logged.
    #[clap(long, env, default_value = "30s", value_parser = humantime::parse_duration)]
    pub report_interval: Duration,
}

/// Oracle valued token holdings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Vault {
    pub feed: Address,
    pub token: Address,
    pub holder: Address,
}

impl FromStr for Vault {
    type Err = anyhow::Error;

    fn from_str(vault: &str) -> Result<Self> {
        let mut parts = vault.split('|');
        let mut next = |name: &str| -> Result<Address> {
            parts
                .next()
                .with_context(|| format!("missing {name} of vault"))?
                .parse()
                .with_context(|| format!("invalid {name} address"))
        };
        let vault = Self {
            feed: next("feed")?,
            token: next("token")?,
            holder: next("holder")?,
        };
        anyhow::ensure!(parts.next().is_none(), "too many arguments for vault");
        Ok(vault)
    }
}

impl Display for Vault {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}|{}|{}", self.feed, self.token, self.holder)
    }
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            ethrpc,
            state_cache,
            logging,
            uniswap_v2_pairs,
            vaults,
            report_interval,
        } = self;

        write!(f, "{ethrpc}")?;
        write!(f, "{state_cache}")?;
        write!(f, "{logging}")?;
        writeln!(f, "uniswap_v2_pairs: {uniswap_v2_pairs:?}")?;
        let vaults = vaults.iter().map(Vault::to_string).collect::<Vec<_>>();
        writeln!(f, "vaults: {vaults:?}")?;
        writeln!(
            f,
            "report_interval: {}",
            humantime::format_duration(*report_interval)
        )?;
        Ok(())
    }
}
