//! A concurrent ordered set.

use std::borrow::Borrow;
use std::fmt;
use std::iter::FromIterator;

use crate::base;

/// An ordered set of keys that can be shared between threads.
///
/// All operations take `&self`; insertion and removal lock only the few
/// nodes adjacent to the affected key, and membership tests lock nothing
/// at all.
pub struct SkipSet<K> {
    inner: base::SkipList<K>,
}

impl<K> SkipSet<K> {
    /// Returns a new, empty set.
    pub fn new() -> SkipSet<K> {
        SkipSet {
            inner: base::SkipList::new(),
        }
    }

    /// Returns the number of keys in the set.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns an iterator over a snapshot of the set, in ascending key
    /// order. Keys inserted or removed while the iterator is alive may or
    /// may not be reflected.
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            inner: self.inner.iter(),
        }
    }
}

impl<K> SkipSet<K>
where
    K: Ord + Send + 'static,
{
    /// Returns `true` if the set holds `key`.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.inner.contains(key)
    }

    /// Inserts `key` into the set.
    ///
    /// Returns `true` if the key was not already present.
    pub fn insert(&self, key: K) -> bool {
        self.inner.insert(key)
    }

    /// Removes `key` from the set.
    ///
    /// Returns `true` if this call removed the key; removing an absent key
    /// returns `false` and changes nothing.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.inner.remove(key)
    }
}

impl<K> Default for SkipSet<K> {
    fn default() -> SkipSet<K> {
        SkipSet::new()
    }
}

impl<K> fmt::Debug for SkipSet<K>
where
    K: Ord + Clone + Send + fmt::Debug + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<K> FromIterator<K> for SkipSet<K>
where
    K: Ord + Send + 'static,
{
    fn from_iter<I>(iter: I) -> SkipSet<K>
    where
        I: IntoIterator<Item = K>,
    {
        let set = SkipSet::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl<K> Extend<K> for SkipSet<K>
where
    K: Ord + Send + 'static,
{
    fn extend<I>(&mut self, iter: I)
    where
        I: IntoIterator<Item = K>,
    {
        for key in iter {
            self.insert(key);
        }
    }
}

/// An iterator over a snapshot of a [`SkipSet`].
pub struct Iter<'a, K> {
    inner: base::Iter<'a, K>,
}

impl<'a, K> Iterator for Iter<'a, K>
where
    K: Clone,
{
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.inner.next()
    }
}

impl<'a, K> fmt::Debug for Iter<'a, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter").finish()
    }
}
