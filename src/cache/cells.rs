use std::collections::BTreeSet;

use crate::backend::{Batch, Pos, SeqId, TokenId};
use crate::errors::CacheError;

const EMPTY: Pos = -1;

#[derive(Debug, Clone)]
struct Cell {
    pos: Pos,
    token: TokenId,
    seqs: BTreeSet<SeqId>,
}

impl Cell {
    fn empty() -> Self {
        Self {
            pos: EMPTY,
            token: 0,
            seqs: BTreeSet::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.pos == EMPTY
    }

    fn reset(&mut self) {
        self.pos = EMPTY;
        self.token = 0;
        self.seqs.clear();
    }

    fn matches(&self, seq: SeqId) -> bool {
        !self.is_empty() && (seq < 0 || self.seqs.contains(&seq))
    }
}

/// Metadata for every slot of the attention cache: which position and which
/// sequences occupy it. The tensors themselves live in the runtime; this table
/// is what the runtime consults to place new tokens and to learn that the
/// layout changed underneath it (`revision`).
#[derive(Debug, Clone)]
pub struct KvCells {
    cells: Vec<Cell>,
    used: usize,
    head: usize,
    revision: u64,
}

fn normalize_range(p0: Pos, p1: Pos) -> Result<(Pos, Pos), CacheError> {
    let start = p0.max(0);
    let end = if p1 < 0 { Pos::MAX } else { p1 };
    if start > end {
        return Err(CacheError::InvalidRange { start: p0, end: p1 });
    }
    Ok((start, end))
}

impl KvCells {
    pub fn new(capacity: usize) -> Self {
        Self {
            cells: vec![Cell::empty(); capacity],
            used: 0,
            head: 0,
            revision: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn free(&self) -> usize {
        self.cells.len() - self.used
    }

    /// Bumped by every edit that moves or drops resident positions.
    /// Appending through `store` leaves it untouched.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn store(&mut self, batch: &Batch) -> Result<(), CacheError> {
        if batch.len() > self.free() {
            return Err(CacheError::Full {
                requested: batch.len(),
                free: self.free(),
            });
        }

        let capacity = self.cells.len();
        for entry in batch.iter() {
            let mut probed = 0;
            while !self.cells[self.head].is_empty() {
                self.head = (self.head + 1) % capacity;
                probed += 1;
                if probed > capacity {
                    return Err(CacheError::Full {
                        requested: 1,
                        free: 0,
                    });
                }
            }
            let cell = &mut self.cells[self.head];
            cell.pos = entry.pos;
            cell.token = entry.token;
            cell.seqs.insert(entry.seq);
            self.used += 1;
            self.head = (self.head + 1) % capacity;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        for cell in &mut self.cells {
            cell.reset();
        }
        self.used = 0;
        self.head = 0;
        self.revision += 1;
    }

    /// Drops `[p0, p1)` from `seq` (every sequence when `seq < 0`). A cell is
    /// freed once no sequence references it.
    pub fn seq_rm(&mut self, seq: SeqId, p0: Pos, p1: Pos) -> Result<(), CacheError> {
        let (start, end) = normalize_range(p0, p1)?;
        let mut freed = 0;
        for cell in &mut self.cells {
            if !cell.matches(seq) || cell.pos < start || cell.pos >= end {
                continue;
            }
            if seq >= 0 {
                cell.seqs.remove(&seq);
            }
            if seq < 0 || cell.seqs.is_empty() {
                cell.reset();
                freed += 1;
            }
        }
        self.used -= freed;
        self.head = 0;
        self.revision += 1;
        Ok(())
    }

    /// Moves every position of `seq` inside `[p0, p1)` by `delta`. Cells pushed
    /// below position zero are dropped.
    pub fn seq_add(&mut self, seq: SeqId, p0: Pos, p1: Pos, delta: Pos) -> Result<(), CacheError> {
        let (start, end) = normalize_range(p0, p1)?;
        if delta == 0 {
            return Ok(());
        }
        let overflows = self
            .cells
            .iter()
            .filter(|cell| cell.matches(seq) && cell.pos >= start && cell.pos < end)
            .any(|cell| cell.pos.checked_add(delta).is_none());
        if overflows {
            return Err(CacheError::InvalidRange { start: p0, end: p1 });
        }
        let mut freed = 0;
        for cell in &mut self.cells {
            if !cell.matches(seq) || cell.pos < start || cell.pos >= end {
                continue;
            }
            cell.pos += delta;
            if cell.pos < 0 {
                cell.reset();
                freed += 1;
            }
        }
        self.used -= freed;
        self.revision += 1;
        Ok(())
    }

    pub fn seq_cp(&mut self, src: SeqId, dst: SeqId, p0: Pos, p1: Pos) -> Result<(), CacheError> {
        if src < 0 {
            return Err(CacheError::InvalidSequence(src));
        }
        if dst < 0 {
            return Err(CacheError::InvalidSequence(dst));
        }
        let (start, end) = normalize_range(p0, p1)?;
        if src == dst {
            return Ok(());
        }
        for cell in &mut self.cells {
            if cell.matches(src) && cell.pos >= start && cell.pos < end {
                cell.seqs.insert(dst);
            }
        }
        self.revision += 1;
        Ok(())
    }

    pub fn seq_keep(&mut self, seq: SeqId) -> Result<(), CacheError> {
        if seq < 0 {
            return Err(CacheError::InvalidSequence(seq));
        }
        let mut freed = 0;
        for cell in &mut self.cells {
            if cell.is_empty() {
                continue;
            }
            if cell.seqs.contains(&seq) {
                cell.seqs.retain(|s| *s == seq);
            } else {
                cell.reset();
                freed += 1;
            }
        }
        self.used -= freed;
        self.head = 0;
        self.revision += 1;
        Ok(())
    }

    pub fn seq_pos_max(&self, seq: SeqId) -> Option<Pos> {
        self.cells
            .iter()
            .filter(|c| c.matches(seq))
            .map(|c| c.pos)
            .max()
    }

    /// Resident `(pos, token)` pairs of one sequence in position order.
    pub fn seq_tokens(&self, seq: SeqId) -> Vec<(Pos, TokenId)> {
        let mut out: Vec<(Pos, TokenId)> = self
            .cells
            .iter()
            .filter(|c| c.matches(seq))
            .map(|c| (c.pos, c.token))
            .collect();
        out.sort_by_key(|(pos, _)| *pos);
        out
    }
}
