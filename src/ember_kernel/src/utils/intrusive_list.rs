//! Intrusive circular doubly linked list whose elements live in a
//! [`Slab`] and refer to each other by slab key.
use core::fmt;
use slab::Slab;

/// Circular linked list header.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct ListHead {
    pub first: Option<usize>,
}

impl fmt::Debug for ListHead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct Link {
    pub prev: usize,
    pub next: usize,
}

/// An element that carries exactly one [`Link`]. An element can be a member
/// of at most one list at a time.
pub(crate) trait Linked {
    fn link(&self) -> Option<Link>;
    fn link_mut(&mut self) -> &mut Option<Link>;
}

#[inline]
fn link_of<T: Linked>(pool: &Slab<T>, i: usize) -> Link {
    pool[i]
        .link()
        .unwrap_or_else(|| unreachable!("list element {i} is not linked"))
}

#[inline]
fn link_mut_of<T: Linked>(pool: &mut Slab<T>, i: usize) -> &mut Link {
    pool[i]
        .link_mut()
        .as_mut()
        .unwrap_or_else(|| unreachable!("list element {i} is not linked"))
}

impl ListHead {
    pub const fn new() -> Self {
        Self { first: None }
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }

    pub fn front(&self) -> Option<usize> {
        self.first
    }

    pub fn back<T: Linked>(&self, pool: &Slab<T>) -> Option<usize> {
        self.first.map(|first| link_of(pool, first).prev)
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or to the
    /// list's back (if `at` is `None`).
    pub fn insert<T: Linked>(&mut self, pool: &mut Slab<T>, item: usize, at: Option<usize>) {
        debug_assert!(pool[item].link().is_none(), "{item} is already linked");

        let Some(first) = self.first else {
            debug_assert!(at.is_none());
            *pool[item].link_mut() = Some(Link {
                prev: item,
                next: item,
            });
            self.first = Some(item);
            return;
        };

        let next = at.unwrap_or(first);
        let prev = link_of(pool, next).prev;

        link_mut_of(pool, prev).next = item;
        link_mut_of(pool, next).prev = item;
        *pool[item].link_mut() = Some(Link { prev, next });

        if at == Some(first) {
            self.first = Some(item);
        }
    }

    pub fn push_back<T: Linked>(&mut self, pool: &mut Slab<T>, item: usize) {
        self.insert(pool, item, None);
    }

    pub fn push_front<T: Linked>(&mut self, pool: &mut Slab<T>, item: usize) {
        let at = self.first;
        self.insert(pool, item, at);
    }

    /// Remove `item` from the list. Returns `false` if `item` wasn't linked.
    ///
    /// `item` must not be a member of another list.
    pub fn remove<T: Linked>(&mut self, pool: &mut Slab<T>, item: usize) -> bool {
        let Some(link) = pool[item].link_mut().take() else {
            return false;
        };

        if link.next == item {
            // The list just became empty
            debug_assert_eq!(self.first, Some(item));
            self.first = None;
            return true;
        }

        link_mut_of(pool, link.prev).next = link.next;
        link_mut_of(pool, link.next).prev = link.prev;

        if self.first == Some(item) {
            self.first = Some(link.next);
        }

        true
    }

    pub fn pop_front<T: Linked>(&mut self, pool: &mut Slab<T>) -> Option<usize> {
        let item = self.first?;
        self.remove(pool, item);
        Some(item)
    }

    /// Get the element following `item`, or `None` if `item` is the last one.
    pub fn next<T: Linked>(&self, pool: &Slab<T>, item: usize) -> Option<usize> {
        let next = link_of(pool, item).next;
        if Some(next) == self.first {
            None
        } else {
            Some(next)
        }
    }

    pub fn iter<'a, T: Linked>(&'a self, pool: &'a Slab<T>) -> Iter<'a, T> {
        Iter {
            head: self,
            pool,
            next: self.first,
        }
    }
}

pub(crate) struct Iter<'a, T> {
    head: &'a ListHead,
    pool: &'a Slab<T>,
    next: Option<usize>,
}

impl<T: Linked> Iterator for Iter<'_, T> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.next?;
        self.next = self.head.next(self.pool, item);
        Some(item)
    }
}
