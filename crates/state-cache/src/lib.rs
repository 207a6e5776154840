//! Block-indexed, event-sourced state caching for on-chain price sources.
//!
//! A [`Subscriber`] keeps the recent history of one on-chain entity's state
//! keyed by block number. States are derived incrementally by reducing the
//! logs the entity emits and regenerated from chain reads whenever the
//! incremental path cannot be trusted. [`ComposedSubscriber`]s assemble one
//! state out of several independently reduced parts addressed by [`Lens`]es.

pub mod arguments;
pub mod composed;
pub mod generator;
pub mod lens;
pub mod log_source;
pub mod offchain;
pub mod reducer;
pub mod snapshot;
pub mod subscriber;

pub use {
    arguments::{Arguments, SubscriberConfig},
    composed::{ComposedSubscriber, Composition},
    ethrpc::{Block, BlockInfo},
    generator::StateGenerating,
    lens::Lens,
    log_source::{BlockLogSource, LogDispatcher, LogSubscribing, SubscriptionId},
    reducer::{EventSourced, Events, LogMeta, LogReducer, Reduction},
    snapshot::{Snapshot, SnapshotStore, StoreError},
    subscriber::{Status, Subscriber},
};
