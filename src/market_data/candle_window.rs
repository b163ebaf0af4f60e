use serde::Serialize;

use crate::types::CandleRow;

/// Maximum number of buckets retained per series.
pub const DEFAULT_MAX_WINDOW_LEN: usize = 1440;

/// Column order of the tabular window representation.
pub const WINDOW_COLUMNS: [&str; 5] = ["open", "high", "low", "close", "volume"];

// ---------------------------------------------------------------------------
// CandleWindow -- ordered, de-duplicated run of candles for one series
// ---------------------------------------------------------------------------

/// Candles for one series, sorted by timestamp with no duplicate timestamps.
///
/// Windows are immutable once published; a poll produces a fresh window via
/// [`CandleWindow::merged`] + [`CandleWindow::trim_to`] and swaps it in whole.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandleWindow {
    rows: Vec<CandleRow>,
}

impl CandleWindow {
    /// Build a window from a fetched batch in arbitrary order.
    ///
    /// When the batch repeats a timestamp, the row appearing later in the
    /// batch wins.
    pub fn from_batch(batch: impl IntoIterator<Item = CandleRow>) -> Self {
        let mut rows: Vec<CandleRow> = batch.into_iter().collect();
        // Stable sort keeps batch order among equal timestamps.
        rows.sort_by_key(|r| r.timestamp);

        let mut deduped: Vec<CandleRow> = Vec::with_capacity(rows.len());
        for row in rows {
            match deduped.last_mut() {
                Some(last) if last.timestamp == row.timestamp => *last = row,
                _ => deduped.push(row),
            }
        }

        Self { rows: deduped }
    }

    /// Combine `fresh` with `self`: every timestamp in either window appears
    /// once; where both have it, `fresh` wins. Rows only in `self` survive
    /// unchanged.
    pub fn merged(&self, fresh: &CandleWindow) -> CandleWindow {
        let old = &self.rows;
        let new = &fresh.rows;
        let mut out = Vec::with_capacity(old.len() + new.len());

        let (mut i, mut j) = (0, 0);
        while i < old.len() && j < new.len() {
            let (a, b) = (old[i], new[j]);
            if a.timestamp < b.timestamp {
                out.push(a);
                i += 1;
            } else if b.timestamp < a.timestamp {
                out.push(b);
                j += 1;
            } else {
                out.push(b);
                i += 1;
                j += 1;
            }
        }
        out.extend_from_slice(&old[i..]);
        out.extend_from_slice(&new[j..]);

        CandleWindow { rows: out }
    }

    /// Keep only the newest `max_len` rows.
    pub fn trim_to(&mut self, max_len: usize) {
        if self.rows.len() > max_len {
            let excess = self.rows.len() - max_len;
            self.rows.drain(..excess);
        }
    }

    #[cfg(test)]
    pub fn rows(&self) -> &[CandleRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Most recent bucket.
    pub fn last(&self) -> Option<&CandleRow> {
        self.rows.last()
    }

    #[cfg(test)]
    pub fn get(&self, timestamp: i64) -> Option<&CandleRow> {
        self.rows
            .binary_search_by_key(&timestamp, |r| r.timestamp)
            .ok()
            .map(|idx| &self.rows[idx])
    }

    /// Column/index/data view used by the HTTP layer.
    pub fn to_table(&self) -> WindowTable {
        WindowTable {
            columns: WINDOW_COLUMNS,
            index: self.rows.iter().map(|r| r.timestamp).collect(),
            data: self
                .rows
                .iter()
                .map(|r| [r.open, r.high, r.low, r.close, r.volume])
                .collect(),
        }
    }
}

/// Split-orientation table: `data[i]` holds the columns for `index[i]`.
#[derive(Debug, Clone, Serialize)]
pub struct WindowTable {
    pub columns: [&'static str; 5],
    pub index: Vec<i64>,
    pub data: Vec<[f64; 5]>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
