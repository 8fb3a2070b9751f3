//! Item group generation for the simulation.
//!
//! The sender owns one item group and moves it through numbered steps. The
//! values at every step are a pure function of `(seed, step)`, so the
//! receiver can rebuild what should have arrived from the `step` item alone.
//!
//! # Items
//!
//! - `step`: u32 scalar, always an immediate
//! - `spectrum`: 64 x f32
//! - `samples`: variable-length i16
//! - `status`: packed record `u4, b1, i11`
//! - `beam`: 4 x 8 u8 grid

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use spead_core::{
    descriptor::{Dim, ItemDescriptor},
    dtype::DType,
    value::{Scalar, Value},
    ItemGroup,
};

pub const STEP_ID: u64 = 0x1000;
const SPECTRUM_ID: u64 = 0x1001;
const SAMPLES_ID: u64 = 0x1002;
const STATUS_ID: u64 = 0x1003;
const BEAM_ID: u64 = 0x1004;

fn descriptors() -> Result<Vec<ItemDescriptor>> {
    Ok(vec![
        ItemDescriptor::with_dtype(STEP_ID, "step", "sender step counter", vec![], DType::u32())?,
        ItemDescriptor::with_dtype(SPECTRUM_ID, "spectrum", "power per channel", vec![Dim::Fixed(64)], DType::f32())?,
        ItemDescriptor::with_dtype(SAMPLES_ID, "samples", "raw voltage samples", vec![Dim::Variable], DType::i16())?,
        ItemDescriptor::with_format(STATUS_ID, "status", "mode, lock flag, offset", vec![], &[('u', 4), ('b', 1), ('i', 11)])?,
        ItemDescriptor::with_dtype(BEAM_ID, "beam", "beam weights", vec![Dim::Fixed(4), Dim::Fixed(8)], DType::u8())?,
    ])
}

/// Values of every item at `step`.
pub fn values_for(seed: u64, step: u32) -> Result<Vec<(u64, Value)>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ ((step as u64) << 32));

    let spectrum: Vec<f32> = (0..64).map(|_| rng.gen_range(0.0..100.0)).collect();
    let n_samples = rng.gen_range(0..=300);
    let samples: Vec<i16> = (0..n_samples).map(|_| rng.gen()).collect();
    let status = Value::record(vec![
        Scalar::UInt(rng.gen_range(0..16)),
        Scalar::Bool(rng.gen()),
        Scalar::Int(rng.gen_range(-1024..1024)),
    ]);
    let beam: Vec<u8> = (0..32).map(|_| rng.gen()).collect();

    Ok(vec![
        (STEP_ID, Value::array(vec![], vec![step])?),
        (SPECTRUM_ID, Value::from(spectrum)),
        (SAMPLES_ID, Value::from(samples)),
        (STATUS_ID, status),
        (BEAM_ID, Value::array(vec![4, 8], beam)?),
    ])
}

/// The group as it stands at step 0.
pub fn sample_group(seed: u64) -> Result<ItemGroup> {
    let mut group = ItemGroup::new();
    for descriptor in descriptors()? {
        group.add_item(descriptor, None)?;
    }
    apply_step(&mut group, seed, 0)?;
    Ok(group)
}

/// Move the group to `step`.
pub fn apply_step(group: &mut ItemGroup, seed: u64, step: u32) -> Result<()> {
    for (id, value) in values_for(seed, step)? {
        group.set_value(id, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determinism() {
        let a = values_for(12345, 3).unwrap();
        let b = values_for(12345, 3).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_steps_differ() {
        let a = values_for(1, 1).unwrap();
        let b = values_for(1, 2).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_sample_group_has_values() {
        let group = sample_group(9).unwrap();
        assert_eq!(group.len(), 5);
        assert!(group.iter().all(|item| item.value().is_some()));
        assert_eq!(
            group.get(STEP_ID).unwrap().value(),
            Some(&Value::array(vec![], vec![0u32]).unwrap())
        );
    }

    #[test]
    fn test_apply_step() {
        let mut group = sample_group(9).unwrap();
        apply_step(&mut group, 9, 4).unwrap();
        let expected = values_for(9, 4).unwrap();
        for (id, value) in expected {
            assert_eq!(group.get(id).unwrap().value(), Some(&value));
        }
    }
}
