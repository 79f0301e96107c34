//! Differential cell updates.
//!
//! [`CellBuffer`] keeps two copies of the display contents. `confirmed` is
//! what the device has acknowledged. `staged` is `confirmed` plus every span
//! that has been handed out for transmission and not yet rejected. New images
//! are compared against `staged`, so a span is reported once and then not
//! again until it is rolled back with [`CellBuffer::reject`].

use std::ops::Range;

use crate::error::{Error, Result};

/// A run of consecutive cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }

    /// Split into consecutive spans of at most `max` cells.
    pub fn chunks(self, max: usize) -> impl Iterator<Item = Span> {
        let max = max.max(1);
        (self.start..self.end())
            .step_by(max)
            .map(move |start| Span::new(start, max.min(self.end() - start)))
    }
}

/// Granularity the device can write at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    /// Any run of cells.
    Cells,
    /// Whole rows of the given width only.
    Rows(usize),
}

#[derive(Debug, Clone)]
pub struct CellBuffer {
    confirmed: Vec<u8>,
    staged: Vec<u8>,
    force: bool,
    merge_gap: usize,
    alignment: Alignment,
}

impl CellBuffer {
    /// A blank buffer of `cells` cells, assumed to match the device.
    pub fn new(cells: usize, alignment: Alignment) -> Self {
        Self {
            confirmed: vec![0; cells],
            staged: vec![0; cells],
            force: false,
            merge_gap: 0,
            alignment,
        }
    }

    /// Fold changed runs separated by at most `gap` unchanged cells.
    pub fn with_merge_gap(mut self, gap: usize) -> Self {
        self.merge_gap = gap;
        self
    }

    pub fn len(&self) -> usize {
        self.confirmed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.confirmed.is_empty()
    }

    pub fn confirmed(&self) -> &[u8] {
        &self.confirmed
    }

    /// The contents most recently handed out, whether acknowledged or not.
    pub fn staged(&self) -> &[u8] {
        &self.staged
    }

    /// Treat the whole image as changed on the next update.
    pub fn force_full(&mut self) {
        self.force = true;
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }

    /// Compute the spans that must be written to show `image`.
    ///
    /// The returned spans are staged and will not be reported again.
    pub fn update(&mut self, image: &[u8]) -> Result<Vec<Span>> {
        if image.len() != self.len() {
            return Err(Error::ImageSize {
                expected: self.len(),
                actual: image.len(),
            });
        }

        let spans = if self.force {
            self.force = false;
            if image.is_empty() {
                Vec::new()
            } else {
                vec![Span::new(0, image.len())]
            }
        } else {
            self.align(self.changed_runs(image))
        };

        self.staged.copy_from_slice(image);
        Ok(spans)
    }

    /// The device accepted `cells` for `span`.
    pub fn acknowledge(&mut self, span: Span, cells: &[u8]) {
        let range = self.clamp(span);
        let n = range.len().min(cells.len());
        self.confirmed[range.start..range.start + n].copy_from_slice(&cells[..n]);
    }

    /// The write for `span` failed; report it again on the next update.
    pub fn reject(&mut self, span: Span) {
        let range = self.clamp(span);
        self.staged[range.clone()].copy_from_slice(&self.confirmed[range]);
    }

    fn clamp(&self, span: Span) -> Range<usize> {
        let end = span.end().min(self.len());
        span.start.min(end)..end
    }

    fn changed_runs(&self, image: &[u8]) -> Vec<Span> {
        let mut runs: Vec<Span> = Vec::new();
        let changed = image
            .iter()
            .zip(&self.staged)
            .enumerate()
            .filter(|(_, (new, old))| new != old)
            .map(|(i, _)| i);

        for i in changed {
            match runs.last_mut() {
                Some(last) if i - last.end() <= self.merge_gap => last.len = i + 1 - last.start,
                _ => runs.push(Span::new(i, 1)),
            }
        }
        runs
    }

    fn align(&self, runs: Vec<Span>) -> Vec<Span> {
        let cols = match self.alignment {
            Alignment::Rows(cols) if cols > 0 => cols,
            _ => return runs,
        };

        let mut rows: Vec<Span> = Vec::new();
        for run in runs {
            let start = run.start / cols * cols;
            let end = run.end().div_ceil(cols) * cols;
            match rows.last_mut() {
                Some(last) if start <= last.end() => last.len = end.max(last.end()) - last.start,
                _ => rows.push(Span::new(start, end - start)),
            }
        }
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn image(runs: &[(u8, usize)]) -> Vec<u8> {
        runs.iter()
            .flat_map(|&(value, n)| std::iter::repeat(value).take(n))
            .collect()
    }

    #[test]
    fn test_single_run() {
        let mut cells = CellBuffer::new(40, Alignment::Cells);
        let spans = cells.update(&image(&[(0, 10), (1, 5), (0, 25)])).unwrap();
        assert_eq!(spans, vec![Span::new(10, 5)]);
    }

    #[test]
    fn test_idempotent() {
        let mut cells = CellBuffer::new(40, Alignment::Cells);
        let target = image(&[(0, 10), (1, 5), (0, 25)]);
        assert!(!cells.update(&target).unwrap().is_empty());
        assert!(cells.update(&target).unwrap().is_empty());
    }

    #[test]
    fn test_spans_cover_exactly_the_changes() {
        let mut cells = CellBuffer::new(20, Alignment::Cells);
        let mut target = vec![0u8; 20];
        for i in [0, 3, 4, 5, 12, 19] {
            target[i] = 0xff;
        }
        let spans = cells.update(&target).unwrap();
        assert_eq!(
            spans,
            vec![Span::new(0, 1), Span::new(3, 3), Span::new(12, 1), Span::new(19, 1)]
        );
        for span in &spans {
            for i in span.range() {
                assert_ne!(target[i], 0, "span {span:?} covers unchanged cell {i}");
            }
        }
    }

    #[test_case(0, vec![Span::new(2, 1), Span::new(5, 1), Span::new(9, 1)] ; "no merging")]
    #[test_case(2, vec![Span::new(2, 4), Span::new(9, 1)] ; "merge short gap")]
    #[test_case(3, vec![Span::new(2, 8)] ; "merge all")]
    fn test_merge_gap(gap: usize, expected: Vec<Span>) {
        let mut cells = CellBuffer::new(12, Alignment::Cells).with_merge_gap(gap);
        let mut target = vec![0u8; 12];
        for i in [2, 5, 9] {
            target[i] = 1;
        }
        assert_eq!(cells.update(&target).unwrap(), expected);
    }

    #[test]
    fn test_row_alignment() {
        let mut cells = CellBuffer::new(40, Alignment::Rows(10));
        let mut target = vec![0u8; 40];
        target[3] = 1;
        target[9] = 1;
        target[10] = 1;
        target[35] = 1;
        assert_eq!(
            cells.update(&target).unwrap(),
            vec![Span::new(0, 20), Span::new(30, 10)]
        );
    }

    #[test]
    fn test_force_reports_everything_once() {
        let mut cells = CellBuffer::new(8, Alignment::Cells);
        cells.force_full();
        assert_eq!(cells.update(&[0; 8]).unwrap(), vec![Span::new(0, 8)]);
        assert!(!cells.is_forced());
        assert!(cells.update(&[0; 8]).unwrap().is_empty());
    }

    #[test]
    fn test_confirmed_only_after_acknowledge() {
        let mut cells = CellBuffer::new(8, Alignment::Cells);
        let target = [0, 0, 7, 7, 0, 0, 0, 0];
        let spans = cells.update(&target).unwrap();
        assert_eq!(spans, vec![Span::new(2, 2)]);
        assert_eq!(cells.confirmed(), &[0; 8]);

        cells.acknowledge(spans[0], &target[spans[0].range()]);
        assert_eq!(cells.confirmed(), &target);
    }

    #[test]
    fn test_reject_reports_span_again() {
        let mut cells = CellBuffer::new(8, Alignment::Cells);
        let target = [0, 0, 7, 7, 0, 0, 0, 0];
        let spans = cells.update(&target).unwrap();
        cells.reject(spans[0]);
        assert_eq!(cells.update(&target).unwrap(), spans);
    }

    #[test]
    fn test_acknowledge_uses_sent_cells() {
        let mut cells = CellBuffer::new(4, Alignment::Cells);
        let first = [1, 1, 0, 0];
        let spans = cells.update(&first).unwrap();
        // A newer image is staged before the first write is acknowledged.
        cells.update(&[2, 2, 0, 0]).unwrap();
        cells.acknowledge(spans[0], &first[spans[0].range()]);
        assert_eq!(cells.confirmed(), &first);
        assert_eq!(cells.staged(), &[2, 2, 0, 0]);
    }

    #[test]
    fn test_wrong_size() {
        let mut cells = CellBuffer::new(40, Alignment::Cells);
        assert!(matches!(
            cells.update(&[0; 39]),
            Err(Error::ImageSize { expected: 40, actual: 39 })
        ));
    }

    #[test]
    fn test_span_chunks() {
        let chunks: Vec<Span> = Span::new(5, 10).chunks(4).collect();
        assert_eq!(chunks, vec![Span::new(5, 4), Span::new(9, 4), Span::new(13, 2)]);
    }
}
