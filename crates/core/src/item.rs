//! Items and item groups.
//!
//! An [`ItemGroup`] is the application's view of a stream: items keyed by id,
//! with a name index. On the send side it is what the heap generator reads;
//! on the receive side [`ItemGroup::update`] folds received heaps into it.
//!
//! Every change to an item's descriptor or value is stamped from a counter
//! owned by the group, so the generator can tell what changed since it last
//! looked without holding a reference into the group.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::descriptor::ItemDescriptor;
use crate::error::{Error, ItemError, Result};
use crate::flavour::ids;
use crate::heap::FrozenHeap;
use crate::value::{self, Value};

/// A descriptor plus its current value.
#[derive(Debug, Clone)]
pub struct Item {
    descriptor: ItemDescriptor,
    value: Option<Value>,
    descriptor_stamp: u64,
    value_stamp: u64,
}

impl Item {
    pub fn id(&self) -> u64 {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ItemDescriptor {
        &self.descriptor
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Stamp of the last descriptor change.
    pub fn descriptor_stamp(&self) -> u64 {
        self.descriptor_stamp
    }

    /// Stamp of the last value change, 0 if never set.
    pub fn value_stamp(&self) -> u64 {
        self.value_stamp
    }
}

// Stamps are bookkeeping; two items are equal if they describe the same
// thing and hold the same value.
impl PartialEq for Item {
    fn eq(&self, other: &Self) -> bool {
        self.descriptor == other.descriptor && self.value == other.value
    }
}

/// What [`ItemGroup::update`] changed.
#[derive(Debug, Default)]
pub struct UpdateReport {
    /// Ids whose descriptor was added or replaced
    pub descriptors: Vec<u64>,
    /// Ids whose value was set
    pub values: Vec<u64>,
    /// Per-item failures; the rest of the heap was still applied
    pub errors: Vec<Error>,
}

impl UpdateReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Items keyed by id, iterated in ascending id order.
#[derive(Debug, Clone, Default)]
pub struct ItemGroup {
    items: BTreeMap<u64, Item>,
    by_name: HashMap<String, u64>,
    stamp: u64,
}

impl PartialEq for ItemGroup {
    fn eq(&self, other: &Self) -> bool {
        self.items == other.items
    }
}

impl ItemGroup {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_stamp(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    /// Add an item, replacing any item with the same id or the same name.
    ///
    /// The value, if given, must encode under the descriptor.
    pub fn add_item(&mut self, descriptor: ItemDescriptor, value: Option<Value>) -> Result<&Item> {
        if let Some(value) = &value {
            value::encode(&descriptor, value)?;
        }
        let id = descriptor.id;
        self.insert(descriptor, value);
        self.items.get(&id).ok_or_else(|| ItemError::UnknownItemId(id).into())
    }

    fn insert(&mut self, descriptor: ItemDescriptor, value: Option<Value>) {
        let id = descriptor.id;
        if let Some(&other) = self.by_name.get(&descriptor.name) {
            if other != id {
                debug!(id = other, name = %descriptor.name, "replacing item with the same name");
                self.items.remove(&other);
            }
        }
        if let Some(old) = self.items.get(&id) {
            self.by_name.remove(&old.descriptor.name);
        }
        let descriptor_stamp = self.next_stamp();
        let value_stamp = if value.is_some() { self.next_stamp() } else { 0 };
        self.by_name.insert(descriptor.name.clone(), id);
        self.items.insert(
            id,
            Item {
                descriptor,
                value,
                descriptor_stamp,
                value_stamp,
            },
        );
    }

    pub fn get(&self, id: u64) -> Option<&Item> {
        self.items.get(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Item> {
        self.by_name.get(name).and_then(|id| self.items.get(id))
    }

    /// Set the value of item `id`.
    ///
    /// # Errors
    /// - `ItemError::UnknownItemId` if there is no such item
    /// - codec errors if the value does not match the descriptor
    pub fn set_value(&mut self, id: u64, value: Value) -> Result<()> {
        let item = self.items.get(&id).ok_or(ItemError::UnknownItemId(id))?;
        value::encode(&item.descriptor, &value)?;
        self.store_value(id, value);
        Ok(())
    }

    pub fn set_value_by_name(&mut self, name: &str, value: Value) -> Result<()> {
        let id = *self
            .by_name
            .get(name)
            .ok_or_else(|| ItemError::UnknownItemName(name.to_string()))?;
        self.set_value(id, value)
    }

    fn store_value(&mut self, id: u64, value: Value) {
        let stamp = self.next_stamp();
        if let Some(item) = self.items.get_mut(&id) {
            item.value = Some(value);
            item.value_stamp = stamp;
        }
    }

    pub fn remove(&mut self, id: u64) -> Option<Item> {
        let item = self.items.remove(&id)?;
        self.by_name.remove(&item.descriptor.name);
        Some(item)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Apply a received heap: descriptors first, then values.
    ///
    /// A descriptor identical to the one already held keeps the current
    /// value; a changed one resets it. Items that fail to decode, or whose id
    /// has no descriptor, are reported and skipped.
    pub fn update(&mut self, heap: &FrozenHeap) -> UpdateReport {
        let mut report = UpdateReport::default();

        for descriptor in heap.descriptors() {
            match descriptor {
                Ok(descriptor) => {
                    let unchanged = self
                        .items
                        .get(&descriptor.id)
                        .is_some_and(|item| item.descriptor == descriptor);
                    if !unchanged {
                        report.descriptors.push(descriptor.id);
                        self.insert(descriptor, None);
                    }
                }
                Err(err) => {
                    warn!(heap_cnt = heap.cnt(), error = %err, "bad descriptor");
                    report.errors.push(err);
                }
            }
        }

        for raw in heap.items() {
            if raw.id < ids::FIRST_USER_ID {
                continue;
            }
            let Some(item) = self.items.get(&raw.id) else {
                report.errors.push(ItemError::UnknownItemId(raw.id).into());
                continue;
            };
            let decoded = if raw.is_immediate {
                value::decode_immediate(&item.descriptor, &raw.data)
            } else {
                value::decode(&item.descriptor, &raw.data)
            };
            match decoded {
                Ok(value) => {
                    self.store_value(raw.id, value);
                    report.values.push(raw.id);
                }
                Err(err) => {
                    warn!(heap_cnt = heap.cnt(), id = raw.id, error = %err, "cannot decode item");
                    report.errors.push(err);
                }
            }
        }
        report
    }
}
