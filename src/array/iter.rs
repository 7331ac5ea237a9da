//! Iteration over a [`Carray`].
//!
//! Three concrete iterator variants, each constructed from the array and
//! owning a [`view`](Carray::view) so iteration never disturbs the underlying
//! array's block cache:
//!
//! - [`CarrayIter`]: plain `(start, stop, step)` traversal of element values,
//! - [`WheretrueIter`]: the indices of the true elements of a boolean array,
//! - [`WhereIter`]: the element values selected by a companion boolean mask.
//!
//! All three read decompressed buffers of up to one chunk at a time.
//! [`WheretrueIter`] and [`WhereIter`] elide whole chunks without
//! decompression when the scanned chunk (the array itself, or the mask) is a
//! constant all-false chunk, and burn down `skip` by per-buffer hit counts
//! before materialising anything.
//!
//! `skip` discards the first `skip` hits; `limit` bounds the yielded items.
//! Internally the hit counter is bounded at `limit + skip`. An exhausted
//! iterator stays exhausted.

use std::marker::PhantomData;

use super::Carray;
use crate::dtype::{DtypeKind, Element};
use crate::error::CarrayError;

/// Plain-range iteration over element values.
#[derive(Debug)]
pub struct CarrayIter<T: Element> {
    view: Carray,
    nrow: usize,
    stop: usize,
    step: usize,
    remaining: Option<usize>,
    buf: Vec<u8>,
    buf_pos: usize,
    buf_rows: usize,
    exhausted: bool,
    _marker: PhantomData<T>,
}

impl<T: Element> Iterator for CarrayIter<T> {
    type Item = Result<T, CarrayError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }
        if self.remaining == Some(0) || self.nrow >= self.stop {
            self.exhausted = true;
            return None;
        }
        let atomsize = self.view.atomsize();
        if self.buf_pos >= self.buf_rows {
            // Refill with this chunk's remaining selected rows.
            let chunk_end = (self.nrow / self.view.chunklen + 1) * self.view.chunklen;
            let load_stop = chunk_end.min(self.stop);
            if let Err(e) = self
                .view
                .read_slice_bytes(self.nrow, load_stop, self.step, &mut self.buf)
            {
                self.exhausted = true;
                return Some(Err(e));
            }
            self.buf_rows = self.buf.len() / atomsize;
            self.buf_pos = 0;
            if self.buf_rows == 0 {
                self.exhausted = true;
                return None;
            }
        }
        let value = T::from_atom(&self.buf[self.buf_pos * atomsize..(self.buf_pos + 1) * atomsize]);
        self.buf_pos += 1;
        self.nrow += self.step;
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }
        Some(Ok(value))
    }
}

/// Index iteration over the true elements of a boolean array.
#[derive(Debug)]
pub struct WheretrueIter {
    view: Carray,
    nrow: usize,
    nhits: usize,
    skip: usize,
    /// Total-hit bound: the caller's limit plus the skipped hits.
    limit: Option<usize>,
    buf: Vec<u8>,
    buf_start: usize,
    buf_pos: usize,
    buf_rows: usize,
    exhausted: bool,
}

impl Iterator for WheretrueIter {
    type Item = Result<usize, CarrayError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.exhausted {
                return None;
            }
            if self.limit.is_some_and(|limit| self.nhits >= limit) {
                self.exhausted = true;
                return None;
            }

            // Drain the current buffer.
            while self.buf_pos < self.buf_rows {
                let pos = self.buf_pos;
                self.buf_pos += 1;
                if self.buf[pos] != 0 {
                    self.nhits += 1;
                    if self.nhits <= self.skip {
                        continue;
                    }
                    if self.limit.is_some_and(|limit| self.nhits > limit) {
                        self.exhausted = true;
                        return None;
                    }
                    return Some(Ok(self.buf_start + pos));
                }
            }

            if self.nrow >= self.view.len {
                self.exhausted = true;
                return None;
            }
            let chunk_idx = self.nrow / self.view.chunklen;
            let chunk_end = ((chunk_idx + 1) * self.view.chunklen).min(self.view.len);

            if chunk_idx < self.view.chunks.len() {
                let chunk = match self.view.chunks.get(chunk_idx) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                };
                // An all-false constant chunk cannot hit; skip it whole.
                if chunk.constant_atom().is_some_and(|atom| atom[0] == 0) {
                    self.nrow = chunk_end;
                    continue;
                }
                // Burn down `skip` by whole buffers when the hit count is
                // known up front.
                if self.nhits < self.skip {
                    if let Some(true_count) = chunk.true_count() {
                        if self.nhits + true_count <= self.skip {
                            self.nhits += true_count;
                            self.nrow = chunk_end;
                            continue;
                        }
                    }
                }
            }

            if let Err(e) = self
                .view
                .read_slice_bytes(self.nrow, chunk_end, 1, &mut self.buf)
            {
                self.exhausted = true;
                return Some(Err(e));
            }
            self.buf_start = self.nrow;
            self.buf_rows = chunk_end - self.nrow;
            self.buf_pos = 0;
            self.nrow = chunk_end;
        }
    }
}

#[derive(Debug)]
enum MaskSource {
    Array(Carray),
    Dense(Vec<bool>),
}

/// Value iteration selected by a companion boolean mask.
#[derive(Debug)]
pub struct WhereIter<T: Element> {
    view: Carray,
    mask: MaskSource,
    nrow: usize,
    nhits: usize,
    skip: usize,
    limit: Option<usize>,
    buf: Vec<u8>,
    mbuf: Vec<u8>,
    buf_pos: usize,
    buf_rows: usize,
    exhausted: bool,
    _marker: PhantomData<T>,
}

impl<T: Element> Iterator for WhereIter<T> {
    type Item = Result<T, CarrayError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.exhausted {
                return None;
            }
            if self.limit.is_some_and(|limit| self.nhits >= limit) {
                self.exhausted = true;
                return None;
            }

            let atomsize = self.view.atomsize();
            while self.buf_pos < self.buf_rows {
                let pos = self.buf_pos;
                self.buf_pos += 1;
                if self.mbuf[pos] != 0 {
                    self.nhits += 1;
                    if self.nhits <= self.skip {
                        continue;
                    }
                    if self.limit.is_some_and(|limit| self.nhits > limit) {
                        self.exhausted = true;
                        return None;
                    }
                    return Some(Ok(T::from_atom(
                        &self.buf[pos * atomsize..(pos + 1) * atomsize],
                    )));
                }
            }

            if self.nrow >= self.view.len {
                self.exhausted = true;
                return None;
            }
            let chunk_idx = self.nrow / self.view.chunklen;
            let chunk_end = ((chunk_idx + 1) * self.view.chunklen).min(self.view.len);

            // Chunk-level elision from the mask when the chunk grids align:
            // an all-false constant mask chunk, or one whose known hit count
            // burns down inside `skip`, is passed over without decompressing
            // either side.
            if let MaskSource::Array(mask) = &self.mask {
                if mask.chunklen == self.view.chunklen && chunk_idx < mask.chunks.len() {
                    let chunk = match mask.chunks.get(chunk_idx) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            self.exhausted = true;
                            return Some(Err(e));
                        }
                    };
                    if chunk.constant_atom().is_some_and(|atom| atom[0] == 0) {
                        self.nrow = chunk_end;
                        continue;
                    }
                    if self.nhits < self.skip {
                        if let Some(true_count) = chunk.true_count() {
                            if self.nhits + true_count <= self.skip {
                                self.nhits += true_count;
                                self.nrow = chunk_end;
                                continue;
                            }
                        }
                    }
                }
            }

            match &self.mask {
                MaskSource::Array(mask) => {
                    if let Err(e) = mask.read_slice_bytes(self.nrow, chunk_end, 1, &mut self.mbuf) {
                        self.exhausted = true;
                        return Some(Err(e));
                    }
                }
                MaskSource::Dense(mask) => {
                    self.mbuf.clear();
                    self.mbuf
                        .extend(mask[self.nrow..chunk_end].iter().map(|&m| u8::from(m)));
                }
            }
            let hits = self.mbuf.iter().filter(|&&m| m != 0).count();
            if hits == 0 || self.nhits + hits <= self.skip {
                self.nhits += hits;
                self.nrow = chunk_end;
                continue;
            }

            // The mask has live hits here; materialise the data buffer.
            if let Err(e) = self
                .view
                .read_slice_bytes(self.nrow, chunk_end, 1, &mut self.buf)
            {
                self.exhausted = true;
                return Some(Err(e));
            }
            self.buf_rows = chunk_end - self.nrow;
            self.buf_pos = 0;
            self.nrow = chunk_end;
        }
    }
}

fn check_bool_rank1(array: &Carray) -> Result<(), CarrayError> {
    if array.dtype.kind() != DtypeKind::Bool || !array.dtype.shape().is_empty() {
        return Err(CarrayError::NotSupported(format!(
            "boolean selection requires a rank-1 bool array, not `{}`",
            array.dtype
        )));
    }
    Ok(())
}

fn check_scalar_atoms(array: &Carray) -> Result<(), CarrayError> {
    if array.dtype.is_object() {
        return Err(CarrayError::NotSupported(
            "object arrays iterate with get_object".to_string(),
        ));
    }
    if array.dtype.items_per_atom() != 1 {
        return Err(CarrayError::NotSupported(
            "typed iteration requires scalar atoms".to_string(),
        ));
    }
    Ok(())
}

impl Carray {
    /// Iterate the whole array in order.
    ///
    /// # Errors
    /// Returns [`CarrayError::TypeMismatch`] or
    /// [`CarrayError::NotSupported`] for non-scalar atoms.
    pub fn iter<T: Element>(&self) -> Result<CarrayIter<T>, CarrayError> {
        self.iter_range(0, self.len, 1, None, 0)
    }

    /// Iterate `[start, stop)` by `step`, skipping the first `skip` rows of
    /// the selection and yielding at most `limit` values.
    ///
    /// # Errors
    /// As [`iter`](Self::iter), plus [`CarrayError::NotSupported`] for a
    /// zero step.
    pub fn iter_range<T: Element>(
        &self,
        start: usize,
        stop: usize,
        step: usize,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<CarrayIter<T>, CarrayError> {
        self.check_element::<T>()?;
        check_scalar_atoms(self)?;
        if step == 0 {
            return Err(CarrayError::NotSupported(
                "iteration step must be positive".to_string(),
            ));
        }
        let stop = stop.min(self.len);
        let start = start.min(stop).saturating_add(skip.saturating_mul(step));
        Ok(CarrayIter {
            view: self.view(),
            nrow: start,
            stop,
            step,
            remaining: limit,
            buf: Vec::new(),
            buf_pos: 0,
            buf_rows: 0,
            exhausted: false,
            _marker: PhantomData,
        })
    }

    /// Iterate the indices of the true elements.
    ///
    /// Requires a rank-1 boolean array. The first `skip` hits are discarded
    /// and at most `limit` indices are yielded.
    ///
    /// # Errors
    /// Returns [`CarrayError::NotSupported`] for other element types.
    pub fn wheretrue(
        &self,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<WheretrueIter, CarrayError> {
        check_bool_rank1(self)?;
        Ok(WheretrueIter {
            view: self.view(),
            nrow: 0,
            nhits: 0,
            skip,
            limit: limit.map(|limit| limit + skip),
            buf: Vec::new(),
            buf_start: 0,
            buf_pos: 0,
            buf_rows: 0,
            exhausted: false,
        })
    }

    /// Iterate the values selected by a boolean [`Carray`] mask.
    ///
    /// The mask must be a rank-1 boolean array of the same length; all-false
    /// constant mask chunks are skipped without decompression.
    ///
    /// # Errors
    /// Returns [`CarrayError::NotSupported`] for an unsuitable mask,
    /// [`CarrayError::InvalidArgument`] for a length mismatch.
    pub fn where_mask<T: Element>(
        &self,
        mask: &Carray,
        limit: Option<usize>,
        skip: usize,
    ) -> Result<WhereIter<T>, CarrayError> {
        self.check_element::<T>()?;
        check_scalar_atoms(self)?;
        check_bool_rank1(mask)?;
        if mask.len != self.len {
            return Err(CarrayError::InvalidArgument(format!(
                "mask of {} rows for an array of {}",
                mask.len, self.len
            )));
        }
        Ok(WhereIter {
            view: self.view(),
            mask: MaskSource::Array(mask.view()),
            nrow: 0,
            nhits: 0,
            skip,
            limit: limit.map(|limit| limit + skip),
            buf: Vec::new(),
            mbuf: Vec::new(),
            buf_pos: 0,
            buf_rows: 0,
            exhausted: false,
            _marker: PhantomData,
        })
    }

    /// Iterate the values selected by a dense boolean mask.
    ///
    /// # Errors
    /// As [`where_mask`](Self::where_mask).
    pub fn where_dense<T: Element>(
        &self,
        mask: &[bool],
        limit: Option<usize>,
        skip: usize,
    ) -> Result<WhereIter<T>, CarrayError> {
        self.check_element::<T>()?;
        check_scalar_atoms(self)?;
        if mask.len() != self.len {
            return Err(CarrayError::InvalidArgument(format!(
                "mask of {} rows for an array of {}",
                mask.len(),
                self.len
            )));
        }
        Ok(WhereIter {
            view: self.view(),
            mask: MaskSource::Dense(mask.to_vec()),
            nrow: 0,
            nhits: 0,
            skip,
            limit: limit.map(|limit| limit + skip),
            buf: Vec::new(),
            mbuf: Vec::new(),
            buf_pos: 0,
            buf_rows: 0,
            exhausted: false,
            _marker: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::CarrayBuilder;

    #[test]
    fn plain_iteration_matches_eager() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<i32> = (0..500).map(|i| i * 2).collect();
        let a = CarrayBuilder::new().chunklen(64).build_from_slice(&data)?;
        let eager = a.slice::<i32>(10, 480, 7)?;
        let lazy: Vec<i32> = a
            .iter_range::<i32>(10, 480, 7, None, 0)?
            .collect::<Result<_, _>>()?;
        assert_eq!(lazy, eager);
        Ok(())
    }

    #[test]
    fn plain_iteration_skip_limit() -> Result<(), Box<dyn std::error::Error>> {
        let a = CarrayBuilder::new()
            .chunklen(10)
            .build_from_slice(&(0..100i64).collect::<Vec<_>>())?;
        let values: Vec<i64> = a
            .iter_range::<i64>(0, 100, 2, Some(4), 3)?
            .collect::<Result<_, _>>()?;
        // Step 2 selects evens; skip 3 drops 0, 2, 4; limit 4 yields four.
        assert_eq!(values, vec![6, 8, 10, 12]);

        let mut it = a.iter_range::<i64>(95, 100, 1, None, 0)?;
        assert_eq!(it.by_ref().count(), 5);
        assert!(it.next().is_none());
        assert!(it.next().is_none());
        Ok(())
    }

    #[test]
    fn wheretrue_matches_eager() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<bool> = (0..1_000).map(|i| i % 13 == 0).collect();
        let a = CarrayBuilder::new().chunklen(128).build_from_slice(&data)?;
        let expected: Vec<usize> = (0..1_000).filter(|i| i % 13 == 0).collect();
        let indices: Vec<usize> = a.wheretrue(None, 0)?.collect::<Result<_, _>>()?;
        assert_eq!(indices, expected);
        Ok(())
    }

    #[test]
    fn wheretrue_elides_constant_chunks() -> Result<(), Box<dyn std::error::Error>> {
        // Two all-false constant chunks, then data in the tail.
        let mut a = CarrayBuilder::new().chunklen(100).build_empty::<bool>()?;
        a.append(&vec![false; 200])?;
        a.append(&[false, true, false, true])?;
        assert_eq!(a.nchunks(), 2);
        assert!(a.chunks.get(0)?.is_constant());

        let indices: Vec<usize> = a.wheretrue(None, 0)?.collect::<Result<_, _>>()?;
        assert_eq!(indices, vec![201, 203]);
        Ok(())
    }

    #[test]
    fn where_mask_matches_eager() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<f64> = (0..600).map(f64::from).collect();
        let mask_data: Vec<bool> = (0..600).map(|i| i % 11 == 0).collect();
        let a = CarrayBuilder::new().chunklen(50).build_from_slice(&data)?;
        let mask = CarrayBuilder::new().chunklen(50).build_from_slice(&mask_data)?;

        let expected: Vec<f64> = data
            .iter()
            .zip(&mask_data)
            .filter_map(|(&v, &m)| m.then_some(v))
            .collect();
        let selected: Vec<f64> = a.where_mask(&mask, None, 0)?.collect::<Result<_, _>>()?;
        assert_eq!(selected, expected);

        let dense: Vec<f64> = a
            .where_dense(&mask_data, None, 0)?
            .collect::<Result<_, _>>()?;
        assert_eq!(dense, expected);
        Ok(())
    }

    #[test]
    fn where_skip_limit_window() -> Result<(), Box<dyn std::error::Error>> {
        let data: Vec<i32> = (0..100).collect();
        let mask: Vec<bool> = (0..100).map(|i| i % 10 == 0).collect();
        let a = CarrayBuilder::new().chunklen(16).build_from_slice(&data)?;
        let selected: Vec<i32> = a
            .where_dense(&mask, Some(3), 2)?
            .collect::<Result<_, _>>()?;
        // Hits are 0, 10, 20, …; skip 2, take 3.
        assert_eq!(selected, vec![20, 30, 40]);
        Ok(())
    }
}
