//! Send-side state machine: item group to heaps.
//!
//! ```text
//! NotStarted -> DescriptorsPending -> DataReady -> Fragmented -> Exhausted
//!                      ^                  ^            |
//!                      +------------------+------------+  (group changes)
//! ```
//!
//! The generator remembers, per item id, the descriptor and value stamps it
//! last put into a heap. Anything with a newer stamp is stale and goes into
//! the next heap.

use std::collections::HashMap;

use tracing::trace;

use crate::error::{ItemError, Result};
use crate::flavour::Flavour;
use crate::heap::Heap;
use crate::item::ItemGroup;
use crate::value;

/// Where the generator stands relative to an item group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    /// No heap generated yet
    NotStarted,
    /// Some descriptor is new or changed since it was last sent
    DescriptorsPending,
    /// Descriptors are current but some value changed
    DataReady,
    /// Everything has been handed off in heaps
    Fragmented,
    /// The end-of-stream heap was produced
    Exhausted,
}

/// Which descriptors or values go into a heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    /// Only those changed since last sent
    #[default]
    Stale,
    /// Everything in the group
    All,
    /// Nothing
    None,
}

pub type DescriptorMode = Selection;
pub type DataMode = Selection;

#[derive(Debug, Clone, Copy, Default)]
struct Sent {
    descriptor: u64,
    value: u64,
}

/// Builds heaps from an [`ItemGroup`].
#[derive(Debug)]
pub struct HeapGenerator {
    flavour: Flavour,
    next_cnt: u64,
    sent: HashMap<u64, Sent>,
    started: bool,
    exhausted: bool,
}

impl HeapGenerator {
    pub fn new(flavour: Flavour) -> Self {
        Self {
            flavour,
            next_cnt: 1,
            sent: HashMap::new(),
            started: false,
            exhausted: false,
        }
    }

    pub fn flavour(&self) -> &Flavour {
        &self.flavour
    }

    fn take_cnt(&mut self) -> Result<u64> {
        if self.exhausted {
            return Err(ItemError::GeneratorExhausted.into());
        }
        let cnt = self.next_cnt;
        // wraps within 1..=2^hab - 1
        self.next_cnt = if cnt >= self.flavour.max_address() { 1 } else { cnt + 1 };
        self.started = true;
        Ok(cnt)
    }

    /// Heap with every stale descriptor followed by every changed value.
    pub fn get_heap(&mut self, group: &ItemGroup) -> Result<Heap> {
        self.get_heap_with(group, Selection::Stale, Selection::Stale)
    }

    /// Heap with an explicit choice of descriptors and values.
    ///
    /// Values are encoded now; later changes to `group` do not affect the
    /// returned heap. Items without a value are never sent as data.
    pub fn get_heap_with(
        &mut self,
        group: &ItemGroup,
        descriptors: DescriptorMode,
        data: DataMode,
    ) -> Result<Heap> {
        if self.exhausted {
            return Err(ItemError::GeneratorExhausted.into());
        }
        let mut heap = Heap::new(self.next_cnt, self.flavour);
        let mut sent = Vec::new();

        for item in group.iter() {
            let last = self.sent.get(&item.id()).copied().unwrap_or_default();
            let include = match descriptors {
                Selection::All => true,
                Selection::Stale => last.descriptor != item.descriptor_stamp(),
                Selection::None => false,
            };
            if include {
                heap.add_descriptor(item.descriptor())?;
                sent.push((item.id(), Some(item.descriptor_stamp()), None));
            }
        }

        for item in group.iter() {
            let Some(value) = item.value() else { continue };
            let last = self.sent.get(&item.id()).copied().unwrap_or_default();
            let include = match data {
                Selection::All => true,
                Selection::Stale => last.value != item.value_stamp(),
                Selection::None => false,
            };
            if include {
                let descriptor = item.descriptor();
                let bytes = value::encode(descriptor, value)?;
                heap.add_item(item.id(), bytes, !descriptor.is_variable_size());
                sent.push((item.id(), None, Some(item.value_stamp())));
            }
        }

        self.take_cnt()?;
        for (id, descriptor, value) in sent {
            let entry = self.sent.entry(id).or_default();
            if let Some(stamp) = descriptor {
                entry.descriptor = stamp;
            }
            if let Some(stamp) = value {
                entry.value = stamp;
            }
        }
        trace!(
            heap_cnt = heap.cnt(),
            items = heap.items().len(),
            descriptors = heap.has_descriptors(),
            "generated heap"
        );
        Ok(heap)
    }

    /// Heap carrying only the start-of-stream marker.
    pub fn get_start(&mut self) -> Result<Heap> {
        let mut heap = Heap::new(self.take_cnt()?, self.flavour);
        heap.add_start();
        Ok(heap)
    }

    /// Heap carrying only the end-of-stream marker. No heaps can follow.
    pub fn get_end(&mut self) -> Result<Heap> {
        let mut heap = Heap::new(self.take_cnt()?, self.flavour);
        heap.add_end();
        self.exhausted = true;
        Ok(heap)
    }

    /// Current state with respect to `group`.
    pub fn state(&self, group: &ItemGroup) -> GeneratorState {
        if self.exhausted {
            return GeneratorState::Exhausted;
        }
        if !self.started {
            return GeneratorState::NotStarted;
        }
        let last = |id: u64| self.sent.get(&id).copied().unwrap_or_default();
        if group
            .iter()
            .any(|item| last(item.id()).descriptor != item.descriptor_stamp())
        {
            return GeneratorState::DescriptorsPending;
        }
        if group
            .iter()
            .any(|item| item.value().is_some() && last(item.id()).value != item.value_stamp())
        {
            return GeneratorState::DataReady;
        }
        GeneratorState::Fragmented
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Dim, ItemDescriptor};
    use crate::dtype::DType;
    use crate::flavour::{ids, BugCompat};
    use crate::heap::ItemData;
    use crate::value::Value;

    fn group() -> ItemGroup {
        let mut group = ItemGroup::new();
        let d = ItemDescriptor::with_dtype(0x1000, "a", "", vec![Dim::Fixed(2)], DType::u16()).unwrap();
        group.add_item(d, Some(Value::from(vec![1u16, 2]))).unwrap();
        let d = ItemDescriptor::with_dtype(0x1001, "b", "", vec![Dim::Variable], DType::u8()).unwrap();
        group.add_item(d, None).unwrap();
        group
    }

    #[test]
    fn test_descriptors_first_then_data() {
        let group = group();
        let mut generator = HeapGenerator::new(Flavour::default());
        assert_eq!(generator.state(&group), GeneratorState::NotStarted);

        let heap = generator.get_heap(&group).unwrap();
        let order: Vec<_> = heap.items().iter().map(|item| item.id).collect();
        assert_eq!(order, vec![ids::DESCRIPTOR, ids::DESCRIPTOR, 0x1000]);
        assert_eq!(generator.state(&group), GeneratorState::Fragmented);
    }

    #[test]
    fn test_only_changes_are_resent() {
        let mut group = group();
        let mut generator = HeapGenerator::new(Flavour::default());
        generator.get_heap(&group).unwrap();

        let heap = generator.get_heap(&group).unwrap();
        assert!(heap.is_empty());

        group.set_value(0x1001, Value::from(vec![7u8, 8, 9])).unwrap();
        assert_eq!(generator.state(&group), GeneratorState::DataReady);
        let heap = generator.get_heap(&group).unwrap();
        assert_eq!(heap.items().len(), 1);
        // variable-size items never go inline
        assert_eq!(
            heap.items()[0].data,
            ItemData::Bytes {
                data: vec![7, 8, 9],
                allow_immediate: false
            }
        );

        let d = ItemDescriptor::with_dtype(0x1002, "c", "", vec![], DType::f64()).unwrap();
        group.add_item(d, None).unwrap();
        assert_eq!(generator.state(&group), GeneratorState::DescriptorsPending);
    }

    #[test]
    fn test_selection_modes() {
        let group = group();
        let mut generator = HeapGenerator::new(Flavour::default());
        generator.get_heap(&group).unwrap();

        let heap = generator
            .get_heap_with(&group, Selection::All, Selection::None)
            .unwrap();
        assert_eq!(heap.items().len(), 2);
        assert!(heap.has_descriptors());

        let heap = generator
            .get_heap_with(&group, Selection::None, Selection::All)
            .unwrap();
        assert_eq!(heap.items().len(), 1);
        assert!(!heap.has_descriptors());
    }

    #[test]
    fn test_cnt_increments_and_wraps() {
        let group = ItemGroup::new();
        let flavour = Flavour::new(8, BugCompat::empty()).unwrap();
        let mut generator = HeapGenerator::new(flavour);
        assert_eq!(generator.get_start().unwrap().cnt(), 1);
        assert_eq!(generator.get_heap(&group).unwrap().cnt(), 2);
        let mut last = 0;
        for _ in 0..253 {
            last = generator.get_heap(&group).unwrap().cnt();
        }
        assert_eq!(last, 255);
        assert_eq!(generator.get_heap(&group).unwrap().cnt(), 1);
    }

    #[test]
    fn test_end_exhausts() {
        let group = group();
        let mut generator = HeapGenerator::new(Flavour::default());
        let end = generator.get_end().unwrap();
        assert!(end.is_end_of_stream());
        assert_eq!(end.items().len(), 1);
        assert_eq!(generator.state(&group), GeneratorState::Exhausted);
        assert!(matches!(
            generator.get_heap(&group),
            Err(crate::error::Error::Item(ItemError::GeneratorExhausted))
        ));
    }
}
