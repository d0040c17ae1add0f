//! Reference Index
//!
//! Every instance keeps two indices of [`GraphReference`] edges: the edges
//! it owns (out-references, bucketed by property) and the edges pointing at
//! it (in-references, bucketed by the property of the parent). Together they
//! let the path engine walk forward from a root and backward from a mutated
//! instance.
//!
//! Most reference properties hold zero or one edge, so a bucket stores a
//! single edge inline and only allocates an ordered set when a second edge
//! arrives. Buckets are dropped when their last edge is removed.

use indexmap::{map::Entry, IndexMap, IndexSet};

use super::InstanceId;
use crate::model::PropertyId;

/// A realized reference from `parent` to `child` through `property`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GraphReference {
    pub property: PropertyId,
    pub parent: InstanceId,
    pub child: InstanceId,
}

impl GraphReference {
    pub fn new(property: PropertyId, parent: InstanceId, child: InstanceId) -> Self {
        Self {
            property,
            parent,
            child,
        }
    }
}

#[derive(Debug, Clone)]
enum ReferenceSet {
    One(GraphReference),
    Many(IndexSet<GraphReference>),
}

/// Edges of one instance, bucketed by property, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ReferenceIndex {
    buckets: IndexMap<PropertyId, ReferenceSet>,
}

impl ReferenceIndex {
    /// Append `edge` to its bucket. An edge already present is left where
    /// it is and `false` is returned.
    pub(crate) fn insert(&mut self, edge: GraphReference) -> bool {
        self.insert_at(usize::MAX, edge)
    }

    /// Insert `edge` at `index` within its bucket, clamped to the bucket
    /// length.
    pub(crate) fn insert_at(&mut self, index: usize, edge: GraphReference) -> bool {
        match self.buckets.entry(edge.property) {
            Entry::Vacant(vacant) => {
                vacant.insert(ReferenceSet::One(edge));
                true
            }
            Entry::Occupied(mut occupied) => {
                let set = occupied.get_mut();
                match set {
                    ReferenceSet::One(existing) => {
                        let existing = *existing;
                        if existing == edge {
                            return false;
                        }
                        let mut many = IndexSet::with_capacity(2);
                        if index == 0 {
                            many.insert(edge);
                            many.insert(existing);
                        } else {
                            many.insert(existing);
                            many.insert(edge);
                        }
                        *set = ReferenceSet::Many(many);
                        true
                    }
                    ReferenceSet::Many(many) => {
                        if many.contains(&edge) {
                            return false;
                        }
                        let index = index.min(many.len());
                        many.shift_insert(index, edge);
                        true
                    }
                }
            }
        }
    }

    /// Remove `edge`, returning the position it occupied in its bucket.
    pub(crate) fn remove(&mut self, edge: &GraphReference) -> Option<usize> {
        let Entry::Occupied(mut occupied) = self.buckets.entry(edge.property) else {
            return None;
        };
        let (position, now_empty) = match occupied.get_mut() {
            ReferenceSet::One(existing) => {
                if existing != edge {
                    return None;
                }
                (0, true)
            }
            ReferenceSet::Many(many) => {
                let (position, _) = many.shift_remove_full(edge)?;
                (position, many.is_empty())
            }
        };
        if now_empty {
            occupied.shift_remove();
        }
        Some(position)
    }

    pub fn contains(&self, edge: &GraphReference) -> bool {
        self.position(edge).is_some()
    }

    /// Position of `edge` within its bucket.
    pub fn position(&self, edge: &GraphReference) -> Option<usize> {
        match self.buckets.get(&edge.property)? {
            ReferenceSet::One(existing) => (existing == edge).then_some(0),
            ReferenceSet::Many(many) => many.get_index_of(edge),
        }
    }

    /// Edges for `property`, in order.
    pub fn get(&self, property: PropertyId) -> Edges<'_> {
        match self.buckets.get(&property) {
            None => Edges::Empty,
            Some(ReferenceSet::One(edge)) => Edges::One(Some(edge)),
            Some(ReferenceSet::Many(many)) => Edges::Many(many.iter()),
        }
    }

    pub fn len(&self, property: PropertyId) -> usize {
        match self.buckets.get(&property) {
            None => 0,
            Some(ReferenceSet::One(_)) => 1,
            Some(ReferenceSet::Many(many)) => many.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Properties that currently have at least one edge.
    pub fn properties(&self) -> impl Iterator<Item = PropertyId> + '_ {
        self.buckets.keys().copied()
    }

    /// Every edge in the index.
    pub fn iter(&self) -> impl Iterator<Item = &GraphReference> + '_ {
        self.buckets.keys().flat_map(move |property| self.get(*property))
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Iterator over the edges of one bucket.
#[derive(Debug)]
pub enum Edges<'a> {
    Empty,
    One(Option<&'a GraphReference>),
    Many(indexmap::set::Iter<'a, GraphReference>),
}

impl<'a> Iterator for Edges<'a> {
    type Item = &'a GraphReference;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Edges::Empty => None,
            Edges::One(edge) => edge.take(),
            Edges::Many(iter) => iter.next(),
        }
    }
}
