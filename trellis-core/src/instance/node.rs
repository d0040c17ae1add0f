//! Tracked Instances
//!
//! A [`GraphInstance`] is one slot of a context's arena. It carries the
//! instance's type, its current id, its lifecycle state, one value slot per
//! property and the two reference indices.

use smallvec::SmallVec;

use super::references::ReferenceIndex;
use super::{InstanceId, InstanceRef};
use crate::model::{TypeId, Value};

/// Lifecycle state of an arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Known only by type and id. Becomes live on first access.
    Unresolved,
    /// Materialized and usable.
    Live,
    /// Deleted and detached from every index. The slot is never reused.
    Deleted,
}

/// Bit set of the properties that have been read at least once.
#[derive(Debug, Clone, Default)]
pub(crate) struct AccessBits {
    words: SmallVec<[u64; 2]>,
}

impl AccessBits {
    /// Set bit `index`, returning whether it was previously clear.
    pub(crate) fn set(&mut self, index: usize) -> bool {
        let (word, bit) = (index / 64, index % 64);
        if self.words.len() <= word {
            self.words.resize(word + 1, 0);
        }
        let mask = 1u64 << bit;
        let was_clear = self.words[word] & mask == 0;
        self.words[word] |= mask;
        was_clear
    }

    pub(crate) fn get(&self, index: usize) -> bool {
        self.words
            .get(index / 64)
            .is_some_and(|word| word & (1u64 << (index % 64)) != 0)
    }

    pub(crate) fn clear(&mut self) {
        self.words.clear();
    }
}

/// A tracked instance.
#[derive(Debug)]
pub struct GraphInstance {
    pub(crate) handle: InstanceId,
    pub(crate) type_id: TypeId,
    pub(crate) type_name: String,
    pub(crate) id: String,
    pub(crate) placeholder: bool,
    pub(crate) state: InstanceState,
    pub(crate) initialized: bool,
    pub(crate) pending_delete: bool,
    pub(crate) cached: bool,
    pub(crate) accessed: AccessBits,
    pub(crate) values: Vec<Value>,
    pub(crate) out_references: ReferenceIndex,
    pub(crate) in_references: ReferenceIndex,
}

impl GraphInstance {
    pub(crate) fn new(
        handle: InstanceId,
        type_id: TypeId,
        type_name: &str,
        id: String,
        placeholder: bool,
        property_count: usize,
    ) -> Self {
        Self {
            handle,
            type_id,
            type_name: type_name.to_string(),
            id,
            placeholder,
            state: InstanceState::Live,
            initialized: false,
            pending_delete: false,
            cached: false,
            accessed: AccessBits::default(),
            values: vec![Value::Null; property_count],
            out_references: ReferenceIndex::default(),
            in_references: ReferenceIndex::default(),
        }
    }

    pub fn handle(&self) -> InstanceId {
        self.handle
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Current id: a placeholder until the instance is saved.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the instance has not been persisted yet.
    pub fn is_new(&self) -> bool {
        self.placeholder
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_pending_delete(&self) -> bool {
        self.pending_delete
    }

    /// Shared with other contexts; never holds in-references.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Whether the property at `index` has been read.
    pub fn is_accessed(&self, index: usize) -> bool {
        self.accessed.get(index)
    }

    pub fn out_references(&self) -> &ReferenceIndex {
        &self.out_references
    }

    pub fn in_references(&self) -> &ReferenceIndex {
        &self.in_references
    }

    pub fn to_ref(&self) -> InstanceRef {
        InstanceRef::new(self.type_name.clone(), self.id.clone())
    }

    /// Return the slot to the unresolved state, keeping type and id.
    pub(crate) fn reset(&mut self) {
        self.state = InstanceState::Unresolved;
        self.initialized = false;
        self.pending_delete = false;
        self.accessed.clear();
        self.values.iter_mut().for_each(|value| *value = Value::Null);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_bits_grow_on_demand() {
        let mut bits = AccessBits::default();
        assert!(!bits.get(70));
        assert!(bits.set(70));
        assert!(!bits.set(70));
        assert!(bits.get(70));
        assert!(!bits.get(6));
        bits.clear();
        assert!(!bits.get(70));
    }

    #[test]
    fn reset_keeps_identity() {
        let mut instance = GraphInstance::new(InstanceId(0), TypeId(0), "Order", "?1".into(), true, 2);
        instance.initialized = true;
        instance.values[0] = Value::from("x");
        instance.accessed.set(0);
        instance.reset();

        assert_eq!(instance.state(), InstanceState::Unresolved);
        assert_eq!(instance.id(), "?1");
        assert!(!instance.is_initialized());
        assert!(instance.values.iter().all(Value::is_null));
        assert!(!instance.is_accessed(0));
    }
}
