//! Price sources kept up to date by [`state_cache`] subscribers.

pub mod arguments;
pub mod run;
pub mod uniswap_v2;
pub mod vault;

pub use run::{run, start};
