//! Collations and the collator pool.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::{Debug, Display};
use std::sync::Mutex;

/// Locale-aware comparison of two payloads.
///
/// Implementations are not required to be [`Sync`]: an instance is only ever used by one sorting task
/// at a time, see [`CollatorPool`].
pub trait Collation: Send {
    /// Compares two (possibly ill-formed UTF-8) payloads.
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;
}

/// Collation factory.
pub trait CollationBuilder: Send + Sync {
    type Collation: Collation;

    /// Creates a new collation instance.
    fn build(&self) -> Result<Self::Collation, CollationError>;
}

/// Collation construction error.
#[derive(Debug)]
pub struct CollationError {
    message: String,
}

impl CollationError {
    pub fn new(message: impl Into<String>) -> Self {
        CollationError {
            message: message.into(),
        }
    }
}

impl Error for CollationError {}

impl Display for CollationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Collation type used when lines are ordered byte-wise. It has no values.
#[derive(Debug)]
pub enum NoCollation {}

impl Collation for NoCollation {
    fn compare(&self, _left: &[u8], _right: &[u8]) -> Ordering {
        match *self {}
    }
}

/// Null collation builder: selects byte-wise ordering.
#[derive(Debug, Default, Clone, Copy)]
pub struct ByteOrder;

impl CollationBuilder for ByteOrder {
    type Collation = NoCollation;

    fn build(&self) -> Result<Self::Collation, CollationError> {
        Err(CollationError::new("byte order does not use a collator"))
    }
}

/// Pool of reusable collation instances.
///
/// Instances are built lazily on first demand and recycled once returned. A checkout is exclusive to
/// the task holding it. A pool without a builder is inert: it never allocates and hands out empty
/// checkouts, which makes callers fall back to byte-wise ordering.
pub struct CollatorPool<B: CollationBuilder = ByteOrder> {
    builder: Option<B>,
    idle: Mutex<Vec<B::Collation>>,
}

impl<B: CollationBuilder> CollatorPool<B> {
    /// Creates a pool. `None` selects byte-wise ordering.
    pub fn new(builder: Option<B>) -> Self {
        CollatorPool {
            builder,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Checks whether the pool hands out collations.
    pub fn is_collated(&self) -> bool {
        self.builder.is_some()
    }

    /// Checks out a collation, building a new one if none is idle.
    pub fn get(&self) -> Result<Checkout<'_, B>, CollationError> {
        let builder = match &self.builder {
            Some(builder) => builder,
            None => return Ok(Checkout { pool: self, collation: None }),
        };

        let idle = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).pop();
        let collation = match idle {
            Some(collation) => collation,
            None => {
                log::debug!("building a new collator");
                builder.build()?
            }
        };

        Ok(Checkout {
            pool: self,
            collation: Some(collation),
        })
    }

    /// Returns a collation to the pool.
    pub fn put(&self, collation: B::Collation) {
        if self.builder.is_some() {
            self.idle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(collation);
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }
}

impl<B: CollationBuilder> Default for CollatorPool<B> {
    fn default() -> Self {
        CollatorPool::new(None)
    }
}

impl<B: CollationBuilder> Debug for CollatorPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollatorPool")
            .field("collated", &self.is_collated())
            .field("idle", &self.idle_count())
            .finish()
    }
}

/// Exclusive checkout of a pooled collation, returned to the pool on drop.
pub struct Checkout<'a, B: CollationBuilder> {
    pool: &'a CollatorPool<B>,
    collation: Option<B::Collation>,
}

impl<'a, B: CollationBuilder> Checkout<'a, B> {
    /// Checked out collation, [`None`] if the pool orders byte-wise.
    pub fn collation(&self) -> Option<&B::Collation> {
        self.collation.as_ref()
    }
}

impl<'a, B: CollationBuilder> Drop for Checkout<'a, B> {
    fn drop(&mut self) {
        if let Some(collation) = self.collation.take() {
            self.pool.put(collation);
        }
    }
}


#[cfg(test)]
mod test {
    use std::sync::atomic::Ordering as AtomicOrdering;

    use super::test_utils::CountingBuilder;
    use super::{ByteOrder, CollatorPool};

    #[test]
    fn test_byte_order_pool_is_inert() {
        let pool: CollatorPool<ByteOrder> = CollatorPool::default();
        assert_eq!(pool.is_collated(), false);

        let checkout = pool.get().unwrap();
        assert!(checkout.collation().is_none());
        drop(checkout);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_pool_builds_lazily_and_recycles() {
        let builder = CountingBuilder::default();
        let built = builder.built.clone();
        let pool = CollatorPool::new(Some(builder));
        assert_eq!(built.load(AtomicOrdering::SeqCst), 0);

        {
            let first = pool.get().unwrap();
            let second = pool.get().unwrap();
            assert!(first.collation().is_some());
            assert!(second.collation().is_some());
            assert_eq!(built.load(AtomicOrdering::SeqCst), 2);
        }
        assert_eq!(pool.idle_count(), 2);

        let _third = pool.get().unwrap();
        assert_eq!(built.load(AtomicOrdering::SeqCst), 2);
        assert_eq!(pool.idle_count(), 1);
    }
}

#[cfg(feature = "collation")]
pub mod icu {
    //! ICU4X backed collation.

    use std::cmp::Ordering;

    use icu_collator::{Collator, CollatorOptions};
    use icu_locid::Locale;
    use icu_provider::DataLocale;

    use super::{Collation, CollationBuilder, CollationError};

    /// Collation for a single locale.
    pub struct IcuCollation {
        collator: Collator,
    }

    impl Collation for IcuCollation {
        fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
            self.collator.compare_utf8(left, right)
        }
    }

    /// Builds [`IcuCollation`] instances for a locale.
    #[derive(Debug, Clone)]
    pub struct IcuCollationBuilder {
        locale: DataLocale,
        options: CollatorOptions,
    }

    impl IcuCollationBuilder {
        /// Creates a builder for a BCP-47 locale name, for example `en` or `de-AT`.
        /// Fails if the locale cannot be parsed. A well-formed locale without its own collation data
        /// (for example `xx`) falls back to the root collation.
        pub fn new(locale: &str) -> Result<Self, CollationError> {
            let parsed: Locale = locale
                .parse()
                .map_err(|err| CollationError::new(format!("invalid locale {}: {}", locale, err)))?;

            let builder = IcuCollationBuilder {
                locale: DataLocale::from(parsed),
                options: CollatorOptions::new(),
            };
            builder.build()?;

            Ok(builder)
        }
    }

    impl CollationBuilder for IcuCollationBuilder {
        type Collation = IcuCollation;

        fn build(&self) -> Result<Self::Collation, CollationError> {
            let collator = Collator::try_new(&self.locale, self.options)
                .map_err(|err| CollationError::new(format!("collator not created: {}", err)))?;

            Ok(IcuCollation { collator })
        }
    }

}
