//! Slice, fancy-index, and mask access.
//!
//! Reads canonicalise `(start, stop, step)` against the array length, then
//! visit only the chunks intersecting the range; each chunk is clipped to
//! chunk-local coordinates consistent with the step. Writes decode the
//! affected chunk, overwrite the strided sub-range, rebuild, and replace it
//! in the store; full-chunk-aligned overwrites rebuild straight from the
//! input.

use super::Carray;
use crate::dtype::Element;
use crate::error::CarrayError;

/// Chunk-local clipping of a canonical `(start, stop, step)` range.
///
/// Returns `(startb, stopb, blen)` for chunk `nchunk`, or [`None`] when the
/// step grid skips the chunk entirely.
fn clip_chunk(
    nchunk: usize,
    start: usize,
    stop: usize,
    step: usize,
    chunklen: usize,
) -> Option<(usize, usize, usize)> {
    let chunk_begin = nchunk * chunklen;
    let mut startb = start.saturating_sub(chunk_begin);
    // Advance to the next row on the step grid.
    let dist = chunk_begin + startb - start;
    startb += (step - dist % step) % step;
    let stopb = (stop - chunk_begin).min(chunklen);
    if startb >= stopb {
        return None;
    }
    Some((startb, stopb, (stopb - startb).div_ceil(step)))
}

impl Carray {
    fn check_sliceable(&self, step: usize) -> Result<(), CarrayError> {
        if self.dtype().is_object() {
            return Err(CarrayError::NotSupported(
                "object arrays read with get_object".to_string(),
            ));
        }
        if step == 0 {
            return Err(CarrayError::NotSupported(
                "slice step must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Read `[start, stop)` with a positive `step` as typed scalars.
    ///
    /// Bounds are clamped to the array length; the result holds
    /// `ceil((stop - start) / step)` rows.
    ///
    /// # Errors
    /// Returns [`CarrayError::NotSupported`] for a zero step or an object
    /// array, [`CarrayError::TypeMismatch`], or a decode failure.
    pub fn slice<T: Element>(
        &self,
        start: usize,
        stop: usize,
        step: usize,
    ) -> Result<Vec<T>, CarrayError> {
        self.check_element::<T>()?;
        let mut bytes = Vec::new();
        self.read_slice_bytes(start, stop, step, &mut bytes)?;
        Ok(T::from_bytes(&bytes))
    }

    /// Read the whole array as typed scalars.
    ///
    /// # Errors
    /// As [`slice`](Self::slice).
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>, CarrayError> {
        self.slice(0, self.len, 1)
    }

    /// Read `[start, stop)` with a positive `step` into `out` as raw atoms.
    ///
    /// # Errors
    /// As [`slice`](Self::slice).
    pub fn read_slice_bytes(
        &self,
        start: usize,
        stop: usize,
        step: usize,
        out: &mut Vec<u8>,
    ) -> Result<(), CarrayError> {
        self.check_sliceable(step)?;
        let stop = stop.min(self.len);
        let start = start.min(stop);
        let atomsize = self.atomsize();
        let rows_out = (stop - start).div_ceil(step);
        out.clear();
        out.resize(rows_out * atomsize, 0);
        if rows_out == 0 {
            return Ok(());
        }

        let chunklen = self.chunklen;
        let nchunks = self.chunks.len();
        let mut scratch = Vec::new();
        for nchunk in start / chunklen..=(stop - 1) / chunklen {
            let Some((startb, stopb, blen)) = clip_chunk(nchunk, start, stop, step, chunklen)
            else {
                continue;
            };
            let out_row = (nchunk * chunklen + startb - start) / step;
            let dst = &mut out[out_row * atomsize..(out_row + blen) * atomsize];

            if nchunk == nchunks {
                for (i, r) in (startb..stopb).step_by(step).enumerate() {
                    dst[i * atomsize..(i + 1) * atomsize]
                        .copy_from_slice(&self.leftover[r * atomsize..(r + 1) * atomsize]);
                }
            } else {
                let chunk = self.chunks.get(nchunk)?;
                if step == 1 {
                    chunk.get(dst, startb, stopb, self.context())?;
                } else {
                    scratch.clear();
                    scratch.resize((stopb - startb) * atomsize, 0);
                    chunk.get(&mut scratch, startb, stopb, self.context())?;
                    for (i, r) in (0..stopb - startb).step_by(step).enumerate() {
                        dst[i * atomsize..(i + 1) * atomsize]
                            .copy_from_slice(&scratch[r * atomsize..(r + 1) * atomsize]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Overwrite `[start, stop)` with a positive `step` from typed scalars.
    ///
    /// # Errors
    /// As [`slice`](Self::slice), plus [`CarrayError::ReadOnly`] and
    /// [`CarrayError::InvalidArgument`] when the value count disagrees with
    /// the selection.
    pub fn set_slice<T: Element>(
        &mut self,
        start: usize,
        stop: usize,
        step: usize,
        values: &[T],
    ) -> Result<(), CarrayError> {
        self.check_element::<T>()?;
        self.set_slice_bytes(start, stop, step, T::to_bytes(values))
    }

    /// Overwrite `[start, stop)` with a positive `step` from raw atoms.
    ///
    /// # Errors
    /// As [`set_slice`](Self::set_slice).
    pub fn set_slice_bytes(
        &mut self,
        start: usize,
        stop: usize,
        step: usize,
        src: &[u8],
    ) -> Result<(), CarrayError> {
        self.check_writable()?;
        self.check_sliceable(step)?;
        let stop = stop.min(self.len);
        let start = start.min(stop);
        let atomsize = self.atomsize();
        let rows = (stop - start).div_ceil(step);
        if src.len() != rows * atomsize {
            return Err(CarrayError::InvalidArgument(format!(
                "{} bytes for a selection of {rows} rows",
                src.len()
            )));
        }
        if rows == 0 {
            return Ok(());
        }

        let chunklen = self.chunklen;
        let nchunks = self.chunks.len();
        let mut scratch = Vec::new();
        for nchunk in start / chunklen..=(stop - 1) / chunklen {
            let Some((startb, stopb, blen)) = clip_chunk(nchunk, start, stop, step, chunklen)
            else {
                continue;
            };
            let src_row = (nchunk * chunklen + startb - start) / step;
            let src_part = &src[src_row * atomsize..(src_row + blen) * atomsize];

            if nchunk == nchunks {
                for (i, r) in (startb..stopb).step_by(step).enumerate() {
                    self.leftover[r * atomsize..(r + 1) * atomsize]
                        .copy_from_slice(&src_part[i * atomsize..(i + 1) * atomsize]);
                }
            } else if step == 1 && startb == 0 && stopb == chunklen {
                // Full overwrite: rebuild straight from the input.
                let chunk = self.build_chunk(src_part)?;
                let added = chunk.cbytes();
                let replaced = self.chunks.set(nchunk, chunk)?;
                self.chunks_cbytes = self.chunks_cbytes + added - replaced;
            } else {
                let chunk = self.chunks.get(nchunk)?;
                let chunk_rows = chunk.nrows();
                scratch.clear();
                scratch.resize(chunk_rows * atomsize, 0);
                chunk.get(&mut scratch, 0, chunk_rows, self.context())?;
                for (i, r) in (startb..stopb).step_by(step).enumerate() {
                    scratch[r * atomsize..(r + 1) * atomsize]
                        .copy_from_slice(&src_part[i * atomsize..(i + 1) * atomsize]);
                }
                let rebuilt = self.build_chunk(&scratch)?;
                let added = rebuilt.cbytes();
                let replaced = self.chunks.set(nchunk, rebuilt)?;
                self.chunks_cbytes = self.chunks_cbytes + added - replaced;
            }
        }
        self.mark_cache_dirty();
        Ok(())
    }

    /// Overwrite the rows where `mask` is true with consecutive rows of
    /// `values`.
    ///
    /// `mask` must cover the whole array and `values` must hold exactly one
    /// row per set bit. Chunks with no set bits are not touched.
    ///
    /// # Errors
    /// As [`set_slice`](Self::set_slice).
    pub fn set_where<T: Element>(
        &mut self,
        mask: &[bool],
        values: &[T],
    ) -> Result<(), CarrayError> {
        self.check_element::<T>()?;
        self.set_where_bytes(mask, T::to_bytes(values))
    }

    /// Byte-level flavour of [`set_where`](Self::set_where).
    ///
    /// # Errors
    /// As [`set_where`](Self::set_where).
    pub fn set_where_bytes(&mut self, mask: &[bool], values: &[u8]) -> Result<(), CarrayError> {
        self.check_writable()?;
        self.check_sliceable(1)?;
        if mask.len() != self.len {
            return Err(CarrayError::InvalidArgument(format!(
                "mask of {} rows for an array of {}",
                mask.len(),
                self.len
            )));
        }
        let atomsize = self.atomsize();
        let ntrue = mask.iter().filter(|&&m| m).count();
        if values.len() != ntrue * atomsize {
            return Err(CarrayError::InvalidArgument(format!(
                "{} bytes for {ntrue} selected rows",
                values.len()
            )));
        }

        let chunklen = self.chunklen;
        let nchunks = self.chunks.len();
        let mut cursor = 0usize;
        let mut scratch = Vec::new();
        for nchunk in 0..=nchunks {
            let begin = nchunk * chunklen;
            if begin >= self.len {
                break;
            }
            let end = (begin + chunklen).min(self.len);
            let mchunk = &mask[begin..end];
            if !mchunk.iter().any(|&m| m) {
                continue;
            }

            if nchunk == nchunks {
                for (r, &m) in mchunk.iter().enumerate() {
                    if m {
                        self.leftover[r * atomsize..(r + 1) * atomsize]
                            .copy_from_slice(&values[cursor..cursor + atomsize]);
                        cursor += atomsize;
                    }
                }
            } else {
                let chunk = self.chunks.get(nchunk)?;
                let chunk_rows = chunk.nrows();
                scratch.clear();
                scratch.resize(chunk_rows * atomsize, 0);
                chunk.get(&mut scratch, 0, chunk_rows, self.context())?;
                for (r, &m) in mchunk.iter().enumerate() {
                    if m {
                        scratch[r * atomsize..(r + 1) * atomsize]
                            .copy_from_slice(&values[cursor..cursor + atomsize]);
                        cursor += atomsize;
                    }
                }
                let rebuilt = self.build_chunk(&scratch)?;
                let added = rebuilt.cbytes();
                let replaced = self.chunks.set(nchunk, rebuilt)?;
                self.chunks_cbytes = self.chunks_cbytes + added - replaced;
            }
        }
        self.mark_cache_dirty();
        Ok(())
    }

    /// Gather the rows where `mask` is true, in order.
    ///
    /// # Errors
    /// As [`slice`](Self::slice).
    pub fn get_masked<T: Element>(&self, mask: &[bool]) -> Result<Vec<T>, CarrayError> {
        self.check_element::<T>()?;
        if mask.len() != self.len {
            return Err(CarrayError::InvalidArgument(format!(
                "mask of {} rows for an array of {}",
                mask.len(),
                self.len
            )));
        }
        let atomsize = self.atomsize();
        let chunklen = self.chunklen;
        let nchunks = self.chunks.len();
        let mut out = Vec::new();
        let mut scratch = Vec::new();
        for nchunk in 0..=nchunks {
            let begin = nchunk * chunklen;
            if begin >= self.len {
                break;
            }
            let end = (begin + chunklen).min(self.len);
            let mchunk = &mask[begin..end];
            if !mchunk.iter().any(|&m| m) {
                continue;
            }
            let rows = if nchunk == nchunks {
                &self.leftover[..(end - begin) * atomsize]
            } else {
                let chunk = self.chunks.get(nchunk)?;
                let chunk_rows = chunk.nrows();
                scratch.clear();
                scratch.resize(chunk_rows * atomsize, 0);
                chunk.get(&mut scratch, 0, chunk_rows, self.context())?;
                &scratch[..]
            };
            for (r, &m) in mchunk.iter().enumerate() {
                if m {
                    out.extend(T::from_bytes(&rows[r * atomsize..(r + 1) * atomsize]));
                }
            }
        }
        Ok(out)
    }

    /// Gather the rows selected by a string predicate.
    ///
    /// The expression itself is evaluated by the host-provided `evaluator`;
    /// this array only applies the resulting mask.
    ///
    /// # Errors
    /// Propagates the evaluator's error, else as
    /// [`get_masked`](Self::get_masked).
    pub fn get_where_expr<T: Element>(
        &self,
        expression: &str,
        evaluator: &dyn MaskEvaluator,
    ) -> Result<Vec<T>, CarrayError> {
        let mask = evaluator.evaluate(expression, self)?;
        self.get_masked(&mask)
    }
}

/// A host-provided expression evaluator for string-predicate indexing.
///
/// The core does not parse expressions; it hands the expression and the array
/// to the evaluator and applies the boolean mask it returns, which must cover
/// the whole array.
pub trait MaskEvaluator {
    /// Evaluate `expression` over `array` into a full-length boolean mask.
    ///
    /// # Errors
    /// Implementations return [`CarrayError`] for unparseable expressions.
    fn evaluate(&self, expression: &str, array: &Carray) -> Result<Vec<bool>, CarrayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::CarrayBuilder;

    #[test]
    fn clip_chunk_math() {
        // chunklen 10, range [3, 27) step 4 selects 3, 7, 11, 15, 19, 23.
        assert_eq!(clip_chunk(0, 3, 27, 4, 10), Some((3, 10, 2)));
        assert_eq!(clip_chunk(1, 3, 27, 4, 10), Some((1, 10, 3)));
        assert_eq!(clip_chunk(2, 3, 27, 4, 10), Some((3, 7, 1)));
        // A chunk the step grid hops over entirely.
        assert_eq!(clip_chunk(1, 0, 30, 25, 10), None);
        assert_eq!(clip_chunk(2, 0, 30, 25, 10), Some((5, 10, 1)));
    }

    fn reference_slice(data: &[i32], start: usize, stop: usize, step: usize) -> Vec<i32> {
        (start..stop.min(data.len()))
            .step_by(step)
            .map(|i| data[i])
            .collect()
    }

    #[test]
    fn strided_reads_match_reference() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<i32> = (0..1000).map(|i| i * 3 - 500).collect();
        let a = CarrayBuilder::new().chunklen(64).build_from_slice(&data)?;
        for &(start, stop, step) in &[
            (0usize, 1000usize, 1usize),
            (0, 1000, 7),
            (3, 27, 4),
            (100, 90, 1),
            (500, 2000, 13),
            (999, 1000, 5),
            (0, 0, 1),
        ] {
            assert_eq!(
                a.slice::<i32>(start, stop, step)?,
                reference_slice(&data, start, stop, step),
                "slice ({start}, {stop}, {step})"
            );
        }
        assert!(a.slice::<i32>(0, 10, 0).is_err());
        Ok(())
    }

    #[test]
    fn slice_length_law() -> Result<(), Box<dyn std::error::Error>> {
        let a = CarrayBuilder::new()
            .chunklen(32)
            .build_from_slice(&(0..300i16).collect::<Vec<_>>())?;
        for start in [0usize, 1, 31, 32, 150, 299, 300] {
            for stop in [0usize, 1, 32, 33, 299, 300, 400] {
                for step in [1usize, 2, 7, 50] {
                    let len = a.slice::<i16>(start, stop, step)?.len();
                    let expected = stop.min(300).saturating_sub(start).div_ceil(step);
                    assert_eq!(len, expected, "({start}, {stop}, {step})");
                }
            }
        }
        Ok(())
    }

    #[test]
    fn strided_write_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let mut data: Vec<i64> = (0..500).collect();
        let mut a = CarrayBuilder::new().chunklen(100).build_from_slice(&data)?;

        let replacement: Vec<i64> = (0..((450 - 5) as usize).div_ceil(3)).map(|i| -(i as i64)).collect();
        a.set_slice(5, 450, 3, &replacement)?;
        for (i, r) in (5..450).step_by(3).enumerate() {
            data[r] = replacement[i];
        }
        assert_eq!(a.to_vec::<i64>()?, data);

        // Full-chunk-aligned overwrite takes the rebuild-from-input path.
        let full: Vec<i64> = (0..200).map(|i| i + 10_000).collect();
        a.set_slice(100, 300, 1, &full)?;
        data[100..300].copy_from_slice(&full);
        assert_eq!(a.to_vec::<i64>()?, data);
        Ok(())
    }

    #[test]
    fn mask_write_touches_only_selected_rows() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<i8> = (0..100).map(|i| i % 4).collect();
        let mut a = CarrayBuilder::new().chunklen(16).build_from_slice(&data)?;
        let mask: Vec<bool> = data.iter().map(|&v| v < 2).collect();
        let values = vec![99i8; mask.iter().filter(|&&m| m).count()];
        a.set_where(&mask, &values)?;
        let expected: Vec<i8> = data.iter().map(|&v| if v < 2 { 99 } else { v }).collect();
        assert_eq!(a.to_vec::<i8>()?, expected);

        assert!(a.set_where(&mask[..50], &values).is_err());
        Ok(())
    }

    #[test]
    fn expression_delegation_applies_the_mask() -> Result<(), Box<dyn std::error::Error>> {
        struct Threshold;
        impl MaskEvaluator for Threshold {
            fn evaluate(
                &self,
                expression: &str,
                array: &Carray,
            ) -> Result<Vec<bool>, CarrayError> {
                let threshold: i32 = expression
                    .strip_prefix("value > ")
                    .and_then(|t| t.parse().ok())
                    .ok_or_else(|| {
                        CarrayError::InvalidArgument(format!("unparseable `{expression}`"))
                    })?;
                Ok(array.to_vec::<i32>()?.iter().map(|&v| v > threshold).collect())
            }
        }

        let a = Carray::from_slice(&(0..50i32).collect::<Vec<_>>())?;
        let selected = a.get_where_expr::<i32>("value > 45", &Threshold)?;
        assert_eq!(selected, vec![46, 47, 48, 49]);
        assert!(a.get_where_expr::<i32>("bogus", &Threshold).is_err());
        Ok(())
    }
}
