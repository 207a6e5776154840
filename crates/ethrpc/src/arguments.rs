use {
    alloy::primitives::Address,
    std::{
        fmt::{self, Display, Formatter},
        time::Duration,
    },
    url::Url,
};

/// Command line arguments for the common Ethereum RPC connections.
#[derive(clap::Parser, Clone, Debug)]
#[group(skip)]
pub struct Arguments {
    /// The Ethereum node URL to connect to.
    #[clap(long, env, default_value = "http://localhost:8545")]
    pub node_url: Url,

    /// Address of the Multicall3 contract used to aggregate read calls.
    #[clap(long, env, default_value_t = crate::multicall::MULTICALL3_ADDRESS)]
    pub multicall_address: Address,

    /// Maximum number of calls aggregated into a single multicall. Larger
    /// requests are split into several concurrently executed chunks.
    #[clap(long, env, default_value = "100")]
    pub multicall_batch_size: usize,

    /// How often the node gets polled for a new block.
    #[clap(long, env, default_value = "2s", value_parser = humantime::parse_duration)]
    pub block_stream_poll_interval: Duration,
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            node_url,
            multicall_address,
            multicall_batch_size,
            block_stream_poll_interval,
        } = self;

        // Node URLs tend to embed API keys.
        writeln!(f, "node_url: {}", node_url.origin().ascii_serialization())?;
        writeln!(f, "multicall_address: {multicall_address}")?;
        writeln!(f, "multicall_batch_size: {multicall_batch_size}")?;
        writeln!(
            f,
            "block_stream_poll_interval: {}",
            humantime::format_duration(*block_stream_poll_interval)
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, clap::Parser};

    #[test]
    fn parses_defaults() {
        let args = Arguments::parse_from(["test"]);
        assert_eq!(args.multicall_address, crate::multicall::MULTICALL3_ADDRESS);
        assert_eq!(args.multicall_batch_size, 100);
        assert_eq!(args.block_stream_poll_interval, Duration::from_secs(2));
    }

    #[test]
    fn display_hides_url_path() {
        let args = Arguments::parse_from([
            "test",
            "--node-url",
            "https://node.example.org/v3/secret-key",
            "--multicall-batch-size",
            "7",
        ]);
        let printed = args.to_string();
        assert!(printed.contains("node_url: https://node.example.org"));
        assert!(!printed.contains("secret-key"));
        assert!(printed.contains("multicall_batch_size: 7"));
    }
}
