//! One state assembled from independently reduced parts.
//!
//! Each part of a [`Composition`] owns a [`Lens`] into the composite state and
//! handles the logs of its own addresses. The composite keeps a single
//! snapshot store for the merged state; parts keep nothing.

use {
    crate::{
        EventSourced,
        LogMeta,
        Reduction,
        Subscriber,
        SubscriberConfig,
        lens::{FieldPath, Lens},
        log_source::BlockLogSource,
    },
    alloy::{primitives::Address, rpc::types::Log},
    anyhow::{Context as _, Result},
    ethrpc::Block,
    futures::{
        FutureExt,
        future::{self, BoxFuture},
    },
    std::{fmt::Debug, sync::Arc},
};

pub type ComposedSubscriber<P> = Subscriber<Composition<P>>;

type Setter<'a, P> = Box<dyn FnOnce(&P) -> P + Send + 'a>;

trait Part<P>: Send + Sync {
    fn path(&self) -> FieldPath;

    fn watches(&self, address: &Address) -> bool;

    fn addresses(&self) -> &[Address];

    fn apply(&self, parent: &P, log: &Log, meta: &LogMeta) -> Reduction<P>;

    /// Generates the part and returns how to put it into a parent.
    fn generate(&self, block: Block) -> BoxFuture<'_, Result<Setter<'_, P>>>;
}

struct Lensed<L, H> {
    lens: L,
    addresses: Vec<Address>,
    handler: H,
}

impl<P, L, H> Part<P> for Lensed<L, H>
where
    P: 'static,
    L: Lens<P, Part = H::State>,
    H: EventSourced,
{
    fn path(&self) -> FieldPath {
        self.lens.path()
    }

    fn watches(&self, address: &Address) -> bool {
        self.addresses.contains(address)
    }

    fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    fn apply(&self, parent: &P, log: &Log, meta: &LogMeta) -> Reduction<P> {
        let part = self.lens.get(parent);
        self.handler
            .apply(&part, log, meta)
            .map(|part| self.lens.set(parent, part))
    }

    fn generate(&self, block: Block) -> BoxFuture<'_, Result<Setter<'_, P>>> {
        async move {
            let part = self
                .handler
                .generate_state(block)
                .await
                .with_context(|| format!("failed to generate {}", self.lens.path()))?;
            let setter: Setter<'_, P> = Box::new(move |parent: &P| self.lens.set(parent, part));
            Ok(setter)
        }
        .boxed()
    }
}

/// Composite state handler made of lensed parts.
pub struct Composition<P> {
    skeleton: P,
    parts: Vec<Box<dyn Part<P>>>,
}

impl<P: 'static> Composition<P> {
    /// `skeleton` provides every field that no part owns.
    pub fn new(skeleton: P) -> Self {
        Self {
            skeleton,
            parts: Vec::new(),
        }
    }

    /// Adds a part handling the logs of `addresses` and owning the field
    /// `lens` points to.
    ///
    /// Fails if the lens overlaps with the lens of another part.
    pub fn with_part<L, H>(mut self, lens: L, addresses: Vec<Address>, handler: H) -> Result<Self>
    where
        L: Lens<P, Part = H::State>,
        H: EventSourced,
    {
        let path = lens.path();
        if let Some(existing) = self.parts.iter().find(|part| part.path().overlaps(&path)) {
            anyhow::bail!("lens {path} overlaps with lens {}", existing.path());
        }
        self.parts.push(Box::new(Lensed {
            lens,
            addresses,
            handler,
        }));
        Ok(self)
    }

    /// All addresses of all parts in declaration order.
    pub fn addresses(&self) -> Vec<Address> {
        let mut addresses = Vec::new();
        for address in self.parts.iter().flat_map(|part| part.addresses()) {
            if !addresses.contains(address) {
                addresses.push(*address);
            }
        }
        addresses
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[async_trait::async_trait]
impl<P> EventSourced for Composition<P>
where
    P: Clone + Debug + Send + Sync + 'static,
{
    type State = P;

    /// Applies the log to every part watching its address in declaration
    /// order. Any inconsistent part makes the whole log inconsistent.
    fn apply(&self, state: &P, log: &Log, meta: &LogMeta) -> Reduction<P> {
        let mut updated: Option<P> = None;
        let mut handled = false;
        for part in self.parts.iter().filter(|part| part.watches(&meta.address)) {
            match part.apply(updated.as_ref().unwrap_or(state), log, meta) {
                Reduction::Updated(state) => {
                    updated = Some(state);
                    handled = true;
                }
                Reduction::Unchanged => handled = true,
                Reduction::Unhandled => (),
                Reduction::Inconsistent(reason) => {
                    return Reduction::Inconsistent(format!("{}: {reason}", part.path()));
                }
            }
        }
        match (updated, handled) {
            (Some(state), _) => Reduction::Updated(state),
            (None, true) => Reduction::Unchanged,
            (None, false) => Reduction::Unhandled,
        }
    }

    /// Generates all parts concurrently and sets them into the skeleton in
    /// declaration order.
    ///
    /// With [`Block::Recent`] parts may read different blocks.
    async fn generate_state(&self, block: Block) -> Result<P> {
        let setters =
            future::try_join_all(self.parts.iter().map(|part| part.generate(block))).await?;
        Ok(setters
            .into_iter()
            .fold(self.skeleton.clone(), |parent, set| set(&parent)))
    }
}

impl<P> Subscriber<Composition<P>>
where
    P: Clone + Debug + Send + Sync + 'static,
{
    /// Subscriber watching the addresses of all parts of the composition.
    pub fn composed(
        name: impl Into<String>,
        metrics_label: &'static str,
        composition: Composition<P>,
        log_source: Arc<dyn BlockLogSource>,
        config: SubscriberConfig,
    ) -> Self {
        let addresses = composition.addresses();
        Self::new(
            name,
            metrics_label,
            composition,
            addresses,
            log_source,
            config,
        )
    }
}
