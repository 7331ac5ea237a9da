#![allow(missing_docs)]

use carray::{Carray, CarrayBuilder, CarrayError, Scalar};

#[test]
fn million_int32_end_to_end() -> Result<(), Box<dyn std::error::Error>> {
    let data: Vec<i32> = (0..1_000_000).collect();
    let a = Carray::from_slice(&data)?;

    assert_eq!(a.len(), 1_000_000);
    assert_eq!(a.get::<i32>(0)?, 0);
    assert_eq!(a.get::<i32>(999_999)?, 999_999);
    assert_eq!(a.sum()?, Scalar::Int(499_999_500_000));

    // The compressed footprint beats the raw one on this input.
    assert!(a.cbytes() < a.nbytes());
    assert_eq!(a.len(), a.nchunks() * a.chunklen() + a.leftover_rows());
    Ok(())
}

#[test]
fn zero_float64_collapses_to_constant_chunk() -> Result<(), Box<dyn std::error::Error>> {
    let a = Carray::from_slice(&vec![0.0f64; 10_000])?;

    assert_eq!(a.nchunks(), 1);
    let chunk = a.chunk(0)?;
    assert!(chunk.is_constant());
    assert!(chunk.cbytes() < 1024);
    assert!(chunk.cbytes() < chunk.nbytes());

    assert_eq!(a.get::<f64>(5_000)?, 0.0);
    assert_eq!(a.sum()?, Scalar::F64(0.0));

    let mut out = vec![1.0f64; 16];
    out.copy_from_slice(&a.slice::<f64>(4_000, 4_016, 1)?);
    assert!(out.iter().all(|&v| v == 0.0));
    Ok(())
}

#[test]
fn wheretrue_skip_limit_window() -> Result<(), Box<dyn std::error::Error>> {
    let flags: Vec<bool> = (0..10_000).map(|i| i != 0 && i % 17 == 0).collect();
    let a = Carray::from_slice(&flags)?;

    let hits: Vec<usize> = a.wheretrue(Some(5), 3)?.collect::<Result<_, _>>()?;
    assert_eq!(hits, vec![68, 85, 102, 119, 136]);

    // Exhaustion is sticky.
    let mut it = a.wheretrue(Some(1), 0)?;
    assert_eq!(it.next().transpose()?, Some(17));
    assert!(it.next().is_none());
    assert!(it.next().is_none());
    Ok(())
}

#[test]
fn mask_assignment_selects_small_values() -> Result<(), Box<dyn std::error::Error>> {
    let data: Vec<i8> = (0..100).map(|i| (i % 4) as i8).collect();
    let mut a = Carray::from_slice(&data)?;

    let mask: Vec<bool> = a.to_vec::<i8>()?.iter().map(|&v| v < 2).collect();
    let nselected = mask.iter().filter(|&&m| m).count();
    a.set_where(&mask, &vec![99i8; nselected])?;

    let expected: Vec<i8> = (0..100)
        .map(|i| if i % 4 < 2 { 99 } else { (i % 4) as i8 })
        .collect();
    assert_eq!(a.to_vec::<i8>()?, expected);
    assert_eq!(&expected[..8], &[99, 99, 2, 3, 99, 99, 2, 3]);
    Ok(())
}

#[test]
fn scalar_write_read_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
    let mut a = CarrayBuilder::new()
        .chunklen(128)
        .build_from_slice(&vec![0i64; 5_000])?;
    for &i in &[0isize, 1, 127, 128, 500, 4_095, 4_999, -1, -5_000] {
        a.set(i, i as i64 * 11)?;
        assert_eq!(a.get::<i64>(i)?, i as i64 * 11);
    }
    // Re-read after unrelated writes: earlier values survive.
    assert_eq!(a.get::<i64>(0)?, -5_000 * 11);
    assert_eq!(a.get::<i64>(127)?, 127 * 11);
    assert!(matches!(
        a.get::<i64>(5_000),
        Err(CarrayError::OutOfRange { .. })
    ));
    Ok(())
}

#[test]
fn iteration_agrees_with_eager_reads() -> Result<(), Box<dyn std::error::Error>> {
    let data: Vec<u32> = (0..3_000).map(|i| i * i % 1_009).collect();
    let a = CarrayBuilder::new().chunklen(256).build_from_slice(&data)?;

    let lazy: Vec<u32> = a.iter::<u32>()?.collect::<Result<_, _>>()?;
    assert_eq!(lazy, data);

    let mask: Vec<bool> = data.iter().map(|&v| v > 900).collect();
    let eager: Vec<u32> = a.get_masked(&mask)?;
    let lazy: Vec<u32> = a.where_dense(&mask, None, 0)?.collect::<Result<_, _>>()?;
    assert_eq!(lazy, eager);

    let flags = Carray::from_slice(&mask)?;
    let indices: Vec<usize> = flags.wheretrue(None, 0)?.collect::<Result<_, _>>()?;
    let expected: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter_map(|(i, &m)| m.then_some(i))
        .collect();
    assert_eq!(indices, expected);
    Ok(())
}

#[test]
fn where_mask_elides_constant_chunks() -> Result<(), Box<dyn std::error::Error>> {
    // The mask's first two chunks are all-false and constant.
    let mut mask = CarrayBuilder::new().chunklen(1_000).build_empty::<bool>()?;
    mask.append(&vec![false; 2_000])?;
    mask.append(&(0..500).map(|i| i % 2 == 0).collect::<Vec<bool>>())?;
    assert!(mask.chunk(0)?.is_constant());

    let data: Vec<i32> = (0..2_500).collect();
    let a = CarrayBuilder::new().chunklen(1_000).build_from_slice(&data)?;
    let selected: Vec<i32> = a.where_mask(&mask, None, 0)?.collect::<Result<_, _>>()?;
    let expected: Vec<i32> = (2_000..2_500).filter(|i| (i - 2_000) % 2 == 0).collect();
    assert_eq!(selected, expected);
    Ok(())
}

#[test]
fn append_then_trim_accounting() -> Result<(), Box<dyn std::error::Error>> {
    let mut a = CarrayBuilder::new().chunklen(64).build_empty::<u64>()?;
    let mut reference = Vec::new();
    for round in 0..20u64 {
        let batch: Vec<u64> = (0..round * 13 + 1).map(|i| round * 1_000 + i).collect();
        a.append(&batch)?;
        reference.extend_from_slice(&batch);
        assert_eq!(a.len(), reference.len());
        assert_eq!(a.len(), a.nchunks() * a.chunklen() + a.leftover_rows());
    }
    a.trim(reference.len() / 3)?;
    reference.truncate(reference.len() - reference.len() / 3);
    assert_eq!(a.to_vec::<u64>()?, reference);
    Ok(())
}

#[test]
fn fancy_indexing_reads_and_writes() -> Result<(), Box<dyn std::error::Error>> {
    let mut a = Carray::from_slice(&(0..1_000i32).collect::<Vec<_>>())?;
    assert_eq!(
        a.get_indices::<i32>(&[0, 999, -1, 500, 3])?,
        vec![0, 999, 999, 500, 3]
    );
    a.set_indices(&[1, -2, 10], &[-1i32, -2, -3])?;
    assert_eq!(a.get::<i32>(1)?, -1);
    assert_eq!(a.get::<i32>(998)?, -2);
    assert_eq!(a.get::<i32>(10)?, -3);
    assert!(a.get_indices::<i32>(&[1_000]).is_err());
    Ok(())
}

#[test]
fn type_mismatch_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let mut a = Carray::from_slice(&(0..10i32).collect::<Vec<_>>())?;
    assert!(matches!(
        a.append(&[1i64]),
        Err(CarrayError::TypeMismatch { .. })
    ));
    assert!(matches!(
        a.get::<f32>(0),
        Err(CarrayError::TypeMismatch { .. })
    ));
    assert!(matches!(
        a.slice::<u32>(0, 5, 1),
        Err(CarrayError::TypeMismatch { .. })
    ));
    Ok(())
}
