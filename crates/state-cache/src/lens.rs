//! Pure accessors into immutable composite states.
//!
//! A lens describes how to read one part of a parent value and how to build
//! a new parent with that part replaced. Lenses never mutate: `set` takes the
//! parent by reference and returns a fresh value.

use std::{fmt, marker::PhantomData};

/// Bidirectional accessor for one part of `P`.
///
/// Implementations must uphold `get(&set(p, v)) == v` and must not touch any
/// field outside of [`Lens::path`].
pub trait Lens<P>: Send + Sync + 'static {
    type Part;

    fn get(&self, parent: &P) -> Self::Part;

    fn set(&self, parent: &P, part: Self::Part) -> P;

    /// The fields this lens reads and writes.
    fn path(&self) -> FieldPath;

    /// Focuses further into the part of this lens.
    fn then<L>(self, inner: L) -> Compose<Self, L>
    where
        Self: Sized,
        L: Lens<Self::Part>,
    {
        Compose { outer: self, inner }
    }
}

/// Field names leading from the root of a state to the focused part.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct FieldPath(Vec<&'static str>);

impl FieldPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn field(name: &'static str) -> Self {
        Self(vec![name])
    }

    pub fn join(&self, other: &FieldPath) -> Self {
        Self(self.0.iter().chain(&other.0).copied().collect())
    }

    /// Two paths overlap if one of them is a prefix of the other, i.e. writing
    /// through one of them can change what the other one reads.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.is_empty() {
            true => f.write_str("."),
            false => f.write_str(&self.0.join(".")),
        }
    }
}

/// Lens onto a named field defined by a pair of plain functions.
///
/// Usually created with the [`lens!`](crate::lens!) macro.
pub struct Field<P, T> {
    name: &'static str,
    get: fn(&P) -> T,
    set: fn(&P, T) -> P,
}

impl<P, T> Field<P, T> {
    pub const fn new(name: &'static str, get: fn(&P) -> T, set: fn(&P, T) -> P) -> Self {
        Self { name, get, set }
    }
}

impl<P, T> Clone for Field<P, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, T> Copy for Field<P, T> {}

impl<P, T> fmt::Debug for Field<P, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Field").field(&self.name).finish()
    }
}

impl<P: 'static, T: 'static> Lens<P> for Field<P, T> {
    type Part = T;

    fn get(&self, parent: &P) -> T {
        (self.get)(parent)
    }

    fn set(&self, parent: &P, part: T) -> P {
        (self.set)(parent, part)
    }

    fn path(&self) -> FieldPath {
        FieldPath::field(self.name)
    }
}

/// Creates a [`Field`] lens for a field of a `Clone` struct.
///
/// ```ignore
/// let price = lens!(VaultState, price);
/// ```
#[macro_export]
macro_rules! lens {
    ($parent:ty, $field:ident) => {
        $crate::lens::Field::new(
            stringify!($field),
            |parent: &$parent| parent.$field.clone(),
            |parent: &$parent, value| {
                let mut parent = parent.clone();
                parent.$field = value;
                parent
            },
        )
    };
}

/// Lens focusing on the whole value.
pub struct Identity<P>(PhantomData<fn() -> P>);

impl<P> Default for Identity<P> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<P: Clone + 'static> Lens<P> for Identity<P> {
    type Part = P;

    fn get(&self, parent: &P) -> P {
        parent.clone()
    }

    fn set(&self, _: &P, part: P) -> P {
        part
    }

    fn path(&self) -> FieldPath {
        FieldPath::root()
    }
}

/// Lens created by [`Lens::then`].
#[derive(Clone, Copy, Debug)]
pub struct Compose<A, B> {
    outer: A,
    inner: B,
}

impl<P, A, B> Lens<P> for Compose<A, B>
where
    A: Lens<P>,
    B: Lens<A::Part>,
{
    type Part = B::Part;

    fn get(&self, parent: &P) -> B::Part {
        self.inner.get(&self.outer.get(parent))
    }

    fn set(&self, parent: &P, part: B::Part) -> P {
        let outer = self.outer.get(parent);
        self.outer.set(parent, self.inner.set(&outer, part))
    }

    fn path(&self) -> FieldPath {
        self.outer.path().join(&self.inner.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Reserves {
        base: u64,
        quote: u64,
    }

    #[derive(Clone, Debug, Default, PartialEq)]
    struct Pool {
        price: u64,
        reserves: Reserves,
    }

    fn sample() -> Pool {
        Pool {
            price: 7,
            reserves: Reserves { base: 1, quote: 2 },
        }
    }

    #[test]
    fn get_after_set_returns_value() {
        let price = lens!(Pool, price);
        let pool = price.set(&sample(), 42);
        assert_eq!(price.get(&pool), 42);
    }

    #[test]
    fn set_leaves_other_fields_alone() {
        let price = lens!(Pool, price);
        let reserves = lens!(Pool, reserves);
        let before = sample();

        let after = price.set(&before, 100);
        assert_eq!(reserves.get(&after), reserves.get(&before));

        let after = reserves.set(&before, Reserves::default());
        assert_eq!(price.get(&after), price.get(&before));
        // The input is never modified.
        assert_eq!(before, sample());
    }

    #[test]
    fn composed_lens_updates_nested_field() {
        let quote = lens!(Pool, reserves).then(lens!(Reserves, quote));
        let pool = quote.set(&sample(), 9);

        assert_eq!(pool.reserves, Reserves { base: 1, quote: 9 });
        assert_eq!(pool.price, 7);
        assert_eq!(quote.path().to_string(), "reserves.quote");
    }

    #[test]
    fn overlapping_paths() {
        let reserves = lens!(Pool, reserves).path();
        let base = lens!(Pool, reserves).then(lens!(Reserves, base)).path();
        let quote = lens!(Pool, reserves).then(lens!(Reserves, quote)).path();
        let price = lens!(Pool, price).path();

        assert!(reserves.overlaps(&base));
        assert!(base.overlaps(&reserves));
        assert!(!base.overlaps(&quote));
        assert!(!price.overlaps(&reserves));
        assert!(Identity::<Pool>::default().path().overlaps(&price));
    }
}
