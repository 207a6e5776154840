use {
    crate::{arguments::Arguments, uniswap_v2, vault},
    anyhow::{Context, Result},
    clap::Parser,
    ethrpc::{BlockRetrieving, current_block},
    futures::future,
    state_cache::{BlockLogSource, LogDispatcher, log_source::AlloyLogFetcher},
    std::sync::Arc,
    tracing::Instrument,
};

pub async fn start(args: impl Iterator<Item = String>) {
    let args = Arguments::parse_from(args);
    observe::tracing::initialize(&observe::Config::from(&args.logging));
    tracing::info!("running liquidity sources with validated arguments:\n{}", args);
    observe::metrics::setup_registry(Some("price_sources".into()), None);

    if let Err(err) = run(args).await {
        tracing::error!(?err, "liquidity sources stopped");
        std::process::exit(1);
    }
}

/// Assumes tracing has already been set up.
pub async fn run(args: Arguments) -> Result<()> {
    let (provider, batcher) = ethrpc::connect(&args.ethrpc)?;
    let retriever: Arc<dyn BlockRetrieving> = Arc::new(provider.clone());
    let current_block =
        current_block::current_block_stream(retriever, args.ethrpc.block_stream_poll_interval)
            .await
            .context("failed to start block stream")?;
    let start = current_block.borrow().number;
    let config = args.state_cache.subscriber_config();
    let dispatcher = Arc::new(LogDispatcher::new());
    let log_source: Arc<dyn BlockLogSource> = dispatcher.clone();

    let pairs = future::try_join_all(args.uniswap_v2_pairs.iter().map(|&pair| {
        let subscriber =
            uniswap_v2::subscriber(pair, batcher.clone(), log_source.clone(), config);
        async move {
            subscriber
                .initialize(start, None)
                .await
                .with_context(|| format!("failed to initialize pair {pair}"))?;
            Ok::<_, anyhow::Error>(subscriber)
        }
    }))
    .instrument(tracing::info_span!("initialize_pairs", start))
    .await?;

    let mut vaults = Vec::new();
    for arg in &args.vaults {
        let subscriber = vault::subscriber(
            arg.feed,
            arg.token,
            arg.holder,
            batcher.clone(),
            log_source.clone(),
            config,
        )?;
        subscriber
            .initialize(start, None)
            .await
            .with_context(|| format!("failed to initialize vault {arg}"))?;
        vaults.push(subscriber);
    }
    tracing::info!(
        start,
        pairs = pairs.len(),
        vaults = vaults.len(),
        "following sources"
    );

    let fetcher = AlloyLogFetcher(provider);
    let follow = dispatcher.run(&fetcher, current_block::into_stream(current_block));
    let report = async {
        loop {
            tokio::time::sleep(args.report_interval).await;
            for pair in &pairs {
                tracing::info!(
                    name = %pair.handler().generator.pair,
                    block = ?pair.get_state_block_number(),
                    reserves = ?pair.get_stale_state(),
                    status = ?pair.status(),
                    "pair"
                );
            }
            for vault in &vaults {
                let state = vault.get_stale_state();
                tracing::info!(
                    block = ?vault.get_state_block_number(),
                    value = ?state.as_ref().and_then(|state| state.value()),
                    ?state,
                    status = ?vault.status(),
                    "vault"
                );
            }
        }
    };

    tokio::select! {
        _ = follow => (),
        _ = report => (),
    }
    anyhow::bail!("block stream ended")
}
