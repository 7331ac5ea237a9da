//! Reductions.

use super::Carray;
use crate::dtype::{convert_from_bytes_slice, DtypeKind, Scalar};
use crate::error::CarrayError;

fn sum_int(bytes: &[u8], itemsize: usize) -> i64 {
    match itemsize {
        1 => bytes
            .iter()
            .fold(0i64, |acc, &b| acc.wrapping_add(i64::from(b as i8))),
        2 => convert_from_bytes_slice::<i16>(bytes)
            .iter()
            .fold(0i64, |acc, &v| acc.wrapping_add(i64::from(v))),
        4 => convert_from_bytes_slice::<i32>(bytes)
            .iter()
            .fold(0i64, |acc, &v| acc.wrapping_add(i64::from(v))),
        _ => convert_from_bytes_slice::<i64>(bytes)
            .iter()
            .fold(0i64, |acc, &v| acc.wrapping_add(v)),
    }
}

fn sum_uint(bytes: &[u8], itemsize: usize) -> u64 {
    match itemsize {
        1 => bytes.iter().fold(0u64, |acc, &b| acc.wrapping_add(u64::from(b))),
        2 => convert_from_bytes_slice::<u16>(bytes)
            .iter()
            .fold(0u64, |acc, &v| acc.wrapping_add(u64::from(v))),
        4 => convert_from_bytes_slice::<u32>(bytes)
            .iter()
            .fold(0u64, |acc, &v| acc.wrapping_add(u64::from(v))),
        _ => convert_from_bytes_slice::<u64>(bytes)
            .iter()
            .fold(0u64, |acc, &v| acc.wrapping_add(v)),
    }
}

fn sum_float(bytes: &[u8], itemsize: usize) -> f64 {
    if itemsize == 4 {
        convert_from_bytes_slice::<f32>(bytes)
            .iter()
            .map(|&v| f64::from(v))
            .sum()
    } else {
        convert_from_bytes_slice::<f64>(bytes).iter().sum()
    }
}

fn sum_bool(bytes: &[u8]) -> i64 {
    bytes.iter().filter(|&&b| b != 0).count() as i64
}

impl Carray {
    /// Sum every scalar in the array with dtype promotion.
    ///
    /// Booleans and signed integers widen to `i64` (booleans summing to their
    /// true count), unsigned integers to `u64`, and floats keep their width.
    /// Constant chunks contribute symbolically, boolean chunks through their
    /// cached true count, and everything else is decompressed one chunk at a
    /// time.
    ///
    /// # Errors
    /// Returns [`CarrayError::NotSupported`] for string, opaque-record, and
    /// object element types, or a decode failure.
    pub fn sum(&self) -> Result<Scalar, CarrayError> {
        let kind = self.dtype.kind();
        if !matches!(
            kind,
            DtypeKind::Bool | DtypeKind::Int | DtypeKind::UInt | DtypeKind::Float
        ) {
            return Err(CarrayError::NotSupported(format!(
                "sum of `{}` arrays",
                self.dtype
            )));
        }
        let itemsize = self.dtype.itemsize();
        let atomsize = self.atomsize();

        let mut int_total = 0i64;
        let mut uint_total = 0u64;
        let mut float_total = 0f64;
        let mut scratch = Vec::new();

        fn add(
            kind: DtypeKind,
            itemsize: usize,
            int_total: &mut i64,
            uint_total: &mut u64,
            float_total: &mut f64,
            bytes: &[u8],
            repeat: usize,
        ) {
            match kind {
                DtypeKind::Bool => {
                    *int_total =
                        int_total.wrapping_add(sum_bool(bytes).wrapping_mul(repeat as i64));
                }
                DtypeKind::Int => {
                    *int_total = int_total
                        .wrapping_add(sum_int(bytes, itemsize).wrapping_mul(repeat as i64));
                }
                DtypeKind::UInt => {
                    *uint_total = uint_total
                        .wrapping_add(sum_uint(bytes, itemsize).wrapping_mul(repeat as u64));
                }
                DtypeKind::Float => {
                    *float_total += sum_float(bytes, itemsize) * repeat as f64;
                }
                _ => {}
            }
        }

        for i in 0..self.chunks.len() {
            let chunk = self.chunks.get(i)?;
            if kind == DtypeKind::Bool {
                if let Some(true_count) = chunk.true_count() {
                    int_total = int_total.wrapping_add(true_count as i64);
                    continue;
                }
            }
            if let Some(atom) = chunk.constant_atom() {
                add(
                    kind,
                    itemsize,
                    &mut int_total,
                    &mut uint_total,
                    &mut float_total,
                    atom,
                    chunk.nrows(),
                );
                continue;
            }
            let nrows = chunk.nrows();
            scratch.clear();
            scratch.resize(nrows * atomsize, 0);
            chunk.get(&mut scratch, 0, nrows, &self.ctx)?;
            add(
                kind,
                itemsize,
                &mut int_total,
                &mut uint_total,
                &mut float_total,
                &scratch,
                1,
            );
        }
        add(
            kind,
            itemsize,
            &mut int_total,
            &mut uint_total,
            &mut float_total,
            &self.leftover[..self.leftover_rows * atomsize],
            1,
        );

        Ok(match kind {
            DtypeKind::Bool | DtypeKind::Int => Scalar::Int(int_total),
            DtypeKind::UInt => Scalar::UInt(uint_total),
            DtypeKind::Float if itemsize == 4 => Scalar::F32(float_total as f32),
            _ => Scalar::F64(float_total),
        })
    }
}
