#![allow(missing_docs)]

use carray::{Carray, CarrayBuilder, CarrayError, Compressor, Cparams, Mode, ShuffleMode};

#[test]
fn row_at_a_time_appends_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("mod7");

    let mut a = CarrayBuilder::new()
        .chunklen(256)
        .rootdir(&root)
        .build_empty::<u16>()?;
    for i in 0..1_000u16 {
        a.append(&[i % 7])?;
    }
    assert_eq!(a.len(), 1_000);
    assert_eq!(a.get::<u16>(257)?, 257 % 7);
    a.flush()?;

    let b = Carray::open(&root)?;
    assert_eq!(b.len(), 1_000);
    assert_eq!(b.chunklen(), 256);
    let expected: Vec<u16> = (0..1_000).map(|i| i % 7).collect();
    assert_eq!(b.to_vec::<u16>()?, expected);
    Ok(())
}

#[test]
fn trim_leaves_exactly_the_needed_chunk_files() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("squares");

    let squares: Vec<i64> = (0..5_000).map(|i| i * i).collect();
    let mut a = CarrayBuilder::new()
        .chunklen(500)
        .rootdir(&root)
        .build_from_slice(&squares)?;
    assert_eq!(a.nchunks(), 10);

    a.trim(750)?;
    a.flush()?;
    assert_eq!(a.len(), 4_250);
    assert_eq!(a.get::<i64>(4_249)?, 4_249 * 4_249);

    let chunk_files = std::fs::read_dir(root.join("data"))?.count();
    assert_eq!(chunk_files, 4_250usize.div_ceil(500));

    let b = Carray::open(&root)?;
    assert_eq!(b.len(), 4_250);
    assert_eq!(b.leftover_rows(), 250);
    assert_eq!(b.to_vec::<i64>()?, &squares[..4_250]);
    Ok(())
}

#[test]
fn reopen_preserves_all_parameters() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("params");

    let cparams = Cparams {
        clevel: 7,
        shuffle: ShuffleMode::Bit,
        cname: Compressor::Lz4,
        quantize: None,
    };
    let data: Vec<f64> = (0..3_333).map(|i| f64::from(i) * 0.5).collect();
    let mut a = CarrayBuilder::new()
        .cparams(cparams.clone())
        .chunklen(300)
        .expectedlen(50_000)
        .dflt(-1.0f64)
        .rootdir(&root)
        .build_from_slice(&data)?;
    a.flush()?;

    let b = Carray::open(&root)?;
    assert_eq!(b.shape(), a.shape());
    assert_eq!(b.dtype(), a.dtype());
    assert_eq!(b.chunklen(), 300);
    assert_eq!(b.expectedlen(), 50_000);
    assert_eq!(b.cparams(), &cparams);
    assert_eq!(b.dflt(), (-1.0f64).to_ne_bytes().as_slice());
    assert_eq!(b.nbytes(), a.nbytes());
    assert_eq!(b.cbytes(), a.cbytes());
    assert_eq!(b.to_vec::<f64>()?, data);
    Ok(())
}

#[test]
fn reopened_array_keeps_appending() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("grow");

    let mut a = CarrayBuilder::new()
        .chunklen(100)
        .rootdir(&root)
        .build_from_slice(&(0..250i32).collect::<Vec<_>>())?;
    a.flush()?;
    drop(a);

    let mut b = Carray::open(&root)?;
    assert_eq!(b.leftover_rows(), 50);
    b.append(&(250..400i32).collect::<Vec<_>>())?;
    b.flush()?;

    let c = Carray::open(&root)?;
    assert_eq!(c.to_vec::<i32>()?, (0..400).collect::<Vec<i32>>());
    Ok(())
}

#[test]
fn write_mode_truncates_and_root_collisions_fail() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("a");

    CarrayBuilder::new()
        .rootdir(&root)
        .build_from_slice(&(0..100i32).collect::<Vec<_>>())?;

    // Creating over an existing root without write mode fails.
    assert!(matches!(
        CarrayBuilder::new()
            .rootdir(&root)
            .build_from_slice(&[1i32]),
        Err(CarrayError::RootExists(_))
    ));

    // Opening in write mode truncates.
    let a = Carray::open_mode(&root, Mode::Write)?;
    assert_eq!(a.len(), 0);
    drop(a);
    let b = Carray::open(&root)?;
    assert_eq!(b.len(), 0);
    Ok(())
}

#[test]
fn unflushed_appends_are_not_visible() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("unflushed");

    let mut a = CarrayBuilder::new()
        .chunklen(100)
        .rootdir(&root)
        .build_from_slice(&(0..100i32).collect::<Vec<_>>())?;
    // These 30 rows stay in the tail; without a flush the size descriptor
    // still records 100 rows.
    a.append(&(100..130i32).collect::<Vec<_>>())?;
    drop(a);

    let b = Carray::open(&root)?;
    assert_eq!(b.len(), 100);
    Ok(())
}

#[test]
fn persistent_chunks_are_never_constant() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("zeros");

    let mut a = CarrayBuilder::new()
        .chunklen(1_000)
        .rootdir(&root)
        .build_from_slice(&vec![0.0f64; 5_000])?;
    a.flush()?;
    for i in 0..a.nchunks() {
        assert!(!a.chunk(i)?.is_constant());
    }
    assert_eq!(a.sum()?, carray::Scalar::F64(0.0));
    Ok(())
}

#[test]
fn persistent_reshape_replaces_the_root() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("reshape");

    let a = CarrayBuilder::new()
        .chunklen(64)
        .rootdir(&root)
        .build_from_slice(&(0..600i16).collect::<Vec<_>>())?;
    let b = a.reshape(&[-1, 3])?;
    assert_eq!(b.shape(), vec![200, 3]);
    assert_eq!(b.rootdir(), Some(root.as_path()));
    // The rename swap cleans up both the build dir and the old root.
    assert!(!root.with_extension("reshape-tmp").exists());
    assert!(!root.with_extension("reshape-old").exists());

    let c = Carray::open(&root)?;
    assert_eq!(c.shape(), vec![200, 3]);
    assert_eq!(c.dtype().to_string(), "(3)i2");
    assert_eq!(
        c.get_bytes(199)?,
        [597i16, 598, 599]
            .iter()
            .flat_map(|v| v.to_ne_bytes())
            .collect::<Vec<u8>>()
    );
    Ok(())
}

#[test]
fn attrs_roundtrip_and_purge() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("attrs");

    let mut a = CarrayBuilder::new()
        .rootdir(&root)
        .build_from_slice(&[1u8, 2, 3])?;
    a.attrs_mut().set("origin", serde_json::json!("unit-test"))?;
    a.flush()?;

    let b = Carray::open(&root)?;
    assert_eq!(b.attrs().get("origin"), Some(&serde_json::json!("unit-test")));

    let mut b = b;
    b.purge()?;
    assert!(!root.exists());
    assert!(b.rootdir().is_none());
    Ok(())
}

#[test]
fn byte_string_dtype_persists() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("tags");

    let dtype = carray::Dtype::parse("S4")?;
    let rows: &[u8] = b"abcdefgh\0\0\0\0wxyz";
    let mut a = CarrayBuilder::new()
        .chunklen(2)
        .rootdir(&root)
        .build_from_bytes(dtype.clone(), rows)?;
    a.flush()?;

    let b = Carray::open(&root)?;
    assert_eq!(b.dtype(), &dtype);
    assert_eq!(b.len(), 4);
    assert_eq!(b.get_bytes(1)?, b"efgh");
    assert_eq!(b.get_bytes(2)?, b"\0\0\0\0");
    assert_eq!(b.get_bytes(-1)?, b"wxyz");
    Ok(())
}

#[test]
fn object_arrays_persist_one_chunk_per_element() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let root = dir.path().join("objects");

    let mut a = CarrayBuilder::new()
        .rootdir(&root)
        .build_from_bytes(carray::Dtype::object(), &[])?;
    a.append_object(b"serialized-alpha")?;
    a.append_object(b"serialized-beta-with-more-bytes")?;
    a.flush()?;

    let b = Carray::open(&root)?;
    assert_eq!(b.len(), 2);
    assert_eq!(b.get_object(0)?, b"serialized-alpha");
    assert_eq!(b.get_object(1)?, b"serialized-beta-with-more-bytes");
    assert_eq!(std::fs::read_dir(root.join("data"))?.count(), 2);
    Ok(())
}
