//! Memoizing, re-iterable sequences over fallible generators.

use std::{cell::RefCell, fmt, rc::Rc, sync::Arc};

use thiserror::Error;

use crate::error::ConfigError;

/// A failure raised while producing a lazy sequence.
///
/// Cloneable so every traversal that reaches the failure point sees it again.
#[derive(Debug, Clone, Error)]
pub enum FindError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("{0:#}")]
    Source(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for FindError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<ConfigError>() {
            Ok(config) => Self::Config(config),
            Err(other) => Self::Source(Arc::new(other)),
        }
    }
}

type Upstream<'a, T> = Box<dyn Iterator<Item = Result<T, FindError>> + 'a>;

struct Shared<'a, T> {
    cache: Vec<T>,
    upstream: Option<Upstream<'a, T>>,
    failure: Option<FindError>,
}

/// A sequence that pulls from its upstream only on demand.
///
/// Items are cached as they are produced, so clones share progress and a
/// second traversal replays the cache instead of re-running the upstream.
pub struct LazySequence<'a, T> {
    shared: Rc<RefCell<Shared<'a, T>>>,
}

impl<T> Clone for LazySequence<'_, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Rc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for LazySequence<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.borrow();
        f.debug_struct("LazySequence")
            .field("evaluated", &shared.cache.len())
            .field("exhausted", &shared.upstream.is_none())
            .finish()
    }
}

impl<'a, T: Clone + 'a> LazySequence<'a, T> {
    pub fn new(upstream: impl Iterator<Item = Result<T, FindError>> + 'a) -> Self {
        Self {
            shared: Rc::new(RefCell::new(Shared {
                cache: Vec::new(),
                upstream: Some(Box::new(upstream)),
                failure: None,
            })),
        }
    }

    pub fn from_items(items: impl IntoIterator<Item = T> + 'a) -> Self {
        Self::new(items.into_iter().map(Ok))
    }

    /// The item at `index`, pulling from upstream as needed.
    pub fn get(&self, index: usize) -> Result<Option<T>, FindError> {
        let mut shared = self.shared.borrow_mut();
        while shared.cache.len() <= index {
            if let Some(failure) = &shared.failure {
                return Err(failure.clone());
            }
            let Some(upstream) = shared.upstream.as_mut() else {
                return Ok(None);
            };
            match upstream.next() {
                Some(Ok(item)) => shared.cache.push(item),
                Some(Err(err)) => {
                    shared.upstream = None;
                    shared.failure = Some(err.clone());
                    return Err(err);
                }
                None => {
                    shared.upstream = None;
                    return Ok(None);
                }
            }
        }
        Ok(shared.cache.get(index).cloned())
    }

    pub fn first(&self) -> Result<Option<T>, FindError> {
        self.get(0)
    }

    pub fn is_empty(&self) -> Result<bool, FindError> {
        self.first().map(|item| item.is_none())
    }

    /// Number of items; forces the whole upstream.
    pub fn len(&self) -> Result<usize, FindError> {
        self.iter().try_fold(0, |count, item| item.map(|_| count + 1))
    }

    /// How many items have been produced so far.
    pub fn evaluated(&self) -> usize {
        self.shared.borrow().cache.len()
    }

    pub fn iter(&self) -> Iter<'a, T> {
        Iter {
            sequence: self.clone(),
            index: 0,
            done: false,
        }
    }

    pub fn to_vec(&self) -> Result<Vec<T>, FindError> {
        self.iter().collect()
    }

    /// A lazy view keeping the items that satisfy `predicate`.
    pub fn filtered(&self, predicate: impl Fn(&T) -> bool + 'a) -> Self {
        Self::new(self.iter().filter(move |item| match item {
            Ok(value) => predicate(value),
            Err(_) => true,
        }))
    }

    /// Like [`filtered`](Self::filtered), but a failing predicate ends the
    /// view with that failure.
    pub fn try_filtered(
        &self,
        predicate: impl Fn(&T) -> Result<bool, FindError> + 'a,
    ) -> Self {
        Self::new(self.iter().filter_map(move |item| match item {
            Ok(value) => match predicate(&value) {
                Ok(true) => Some(Ok(value)),
                Ok(false) => None,
                Err(err) => Some(Err(err)),
            },
            Err(err) => Some(Err(err)),
        }))
    }
}

/// Cursor over a [`LazySequence`]; stops after yielding a failure.
pub struct Iter<'a, T> {
    sequence: LazySequence<'a, T>,
    index: usize,
    done: bool,
}

impl<'a, T: Clone + 'a> Iterator for Iter<'a, T> {
    type Item = Result<T, FindError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.sequence.get(self.index) {
            Ok(Some(item)) => {
                self.index += 1;
                Some(Ok(item))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
