use std::{
    fmt::{self, Display, Formatter},
    num::NonZeroUsize,
    time::Duration,
};

/// Command line arguments shared by all state cache subscribers.
#[derive(clap::Parser, Clone, Debug)]
#[group(skip)]
pub struct Arguments {
    /// The number of block snapshots every subscriber keeps.
    #[clap(long, env, default_value = "60")]
    pub snapshot_retention: NonZeroUsize,

    /// How often state generation gets retried before a block is given up.
    #[clap(long, env, default_value = "3")]
    pub state_generation_max_retries: u32,

    /// How long to sleep between state generation retries.
    #[clap(long, env, default_value = "1s", value_parser = humantime::parse_duration)]
    pub state_generation_delay_between_retries: Duration,
}

impl Arguments {
    pub fn subscriber_config(&self) -> SubscriberConfig {
        SubscriberConfig {
            snapshot_retention: self.snapshot_retention,
            max_retries: self.state_generation_max_retries,
            delay_between_retries: self.state_generation_delay_between_retries,
        }
    }
}

impl Display for Arguments {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Self {
            snapshot_retention,
            state_generation_max_retries,
            state_generation_delay_between_retries,
        } = self;

        writeln!(f, "snapshot_retention: {snapshot_retention}")?;
        writeln!(
            f,
            "state_generation_max_retries: {state_generation_max_retries}"
        )?;
        writeln!(
            f,
            "state_generation_delay_between_retries: {:?}",
            state_generation_delay_between_retries
        )?;
        Ok(())
    }
}

/// Configuration of a single [`Subscriber`](crate::Subscriber).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SubscriberConfig {
    pub snapshot_retention: NonZeroUsize,
    pub max_retries: u32,
    pub delay_between_retries: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            snapshot_retention: NonZeroUsize::new(60).unwrap(),
            max_retries: Default::default(),
            delay_between_retries: Default::default(),
        }
    }
}
