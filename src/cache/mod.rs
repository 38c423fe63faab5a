mod cells;

pub use cells::KvCells;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{Pos, SeqId};
use crate::errors::CacheError;

/// Rough per-cell size used for reporting; live accounting belongs to the runtime.
const REPORTED_BYTES_PER_CELL: usize = 4096;
const PRIMARY_SEQ: SeqId = 0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub defrag_threshold: f32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            defrag_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_cells: usize,
    pub used_cells: usize,
    pub usage_ratio: f32,
    pub memory_bytes: usize,
    pub defrag_requests: u64,
}

/// Owns the working set of the active context. Unbound (no context) means
/// every edit fails with `CacheError::Unbound` and every query reports zero.
#[derive(Debug)]
pub struct KvCache {
    cells: Option<KvCells>,
    config: CacheConfig,
    defrag_requests: u64,
}

impl KvCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            cells: None,
            config,
            defrag_requests: 0,
        }
    }

    pub fn bind(&mut self, n_ctx: usize) {
        self.cells = Some(KvCells::new(n_ctx));
        self.defrag_requests = 0;
        info!(n_ctx, "CACHE: bound to context");
    }

    pub fn unbind(&mut self) {
        if self.cells.take().is_some() {
            info!("CACHE: released");
        }
    }

    pub fn is_bound(&self) -> bool {
        self.cells.is_some()
    }

    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn cells(&self) -> Result<&KvCells, CacheError> {
        self.cells.as_ref().ok_or(CacheError::Unbound)
    }

    pub fn cells_mut(&mut self) -> Result<&mut KvCells, CacheError> {
        self.cells.as_mut().ok_or(CacheError::Unbound)
    }

    pub fn clear(&mut self) -> Result<(), CacheError> {
        self.cells_mut()?.clear();
        debug!("CACHE: cleared");
        Ok(())
    }

    pub fn remove_tokens(&mut self, start: Pos, end: Pos) -> Result<(), CacheError> {
        self.cells_mut()?.seq_rm(-1, start, end)?;
        debug!(start, end, "CACHE: removed positions");
        Ok(())
    }

    pub fn shift_tokens(&mut self, start: Pos, delta: Pos) -> Result<(), CacheError> {
        self.cells_mut()?.seq_add(-1, start, -1, delta)?;
        debug!(start, delta, "CACHE: shifted positions");
        Ok(())
    }

    pub fn sequence_copy(&mut self, src: SeqId, dst: SeqId, start: Pos, end: Pos) -> Result<(), CacheError> {
        self.cells_mut()?.seq_cp(src, dst, start, end)?;
        debug!(src, dst, start, end, "CACHE: copied sequence");
        Ok(())
    }

    pub fn sequence_remove(&mut self, seq: SeqId, start: Pos, end: Pos) -> Result<(), CacheError> {
        self.cells_mut()?.seq_rm(seq, start, end)?;
        debug!(seq, start, end, "CACHE: removed sequence range");
        Ok(())
    }

    pub fn sequence_keep(&mut self, seq: SeqId) -> Result<(), CacheError> {
        self.cells_mut()?.seq_keep(seq)?;
        debug!(seq, "CACHE: keeping single sequence");
        Ok(())
    }

    /// Compaction happens inside the runtime; this only records the request.
    pub fn defragment(&mut self) {
        if self.is_bound() {
            self.defrag_requests += 1;
            info!(usage = self.usage_ratio(), "CACHE: defragment requested");
        }
    }

    pub fn needs_defragmentation(&self) -> bool {
        self.is_bound() && self.usage_ratio() > self.config.defrag_threshold
    }

    /// Occupied span of the primary sequence: highest position plus one.
    pub fn used_cells(&self) -> usize {
        self.cells
            .as_ref()
            .and_then(|c| c.seq_pos_max(PRIMARY_SEQ))
            .map(|max| max as usize + 1)
            .unwrap_or(0)
    }

    pub fn total_cells(&self) -> usize {
        self.cells.as_ref().map(KvCells::capacity).unwrap_or(0)
    }

    pub fn usage_ratio(&self) -> f32 {
        let total = self.total_cells();
        if total == 0 {
            return 0.0;
        }
        self.used_cells() as f32 / total as f32
    }

    pub fn stats(&self) -> CacheStats {
        if !self.is_bound() {
            return CacheStats::default();
        }
        let used_cells = self.used_cells();
        CacheStats {
            total_cells: self.total_cells(),
            used_cells,
            usage_ratio: self.usage_ratio(),
            memory_bytes: used_cells * REPORTED_BYTES_PER_CELL,
            defrag_requests: self.defrag_requests,
        }
    }

    /// Key and value tensors for every layer plus a 10% allowance for
    /// metadata and alignment. Used for sizing before a context exists.
    pub fn estimate_memory(n_ctx: usize, n_embd: usize, n_layer: usize) -> usize {
        let kv_size = 2 * n_layer * n_ctx * n_embd * std::mem::size_of::<f32>();
        kv_size + kv_size / 10
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheConfig, KvCache};
    use crate::backend::Batch;
    use crate::errors::CacheError;

    fn bound_with(n_ctx: usize, resident: usize) -> KvCache {
        let mut cache = KvCache::new(CacheConfig::default());
        cache.bind(n_ctx);
        let mut batch = Batch::with_capacity(resident);
        for i in 0..resident {
            batch.push(i as u32, i as i32, 0, false);
        }
        cache.cells_mut().expect("bound").store(&batch).expect("store");
        cache
    }

    #[test]
    fn unbound_controller_refuses_every_edit() {
        let mut cache = KvCache::new(CacheConfig::default());
        assert_eq!(cache.clear(), Err(CacheError::Unbound));
        assert_eq!(cache.remove_tokens(0, 4), Err(CacheError::Unbound));
        assert_eq!(cache.shift_tokens(4, -4), Err(CacheError::Unbound));
        assert_eq!(cache.sequence_copy(0, 1, 0, -1), Err(CacheError::Unbound));
        assert_eq!(cache.sequence_remove(1, 0, -1), Err(CacheError::Unbound));
        assert_eq!(cache.sequence_keep(0), Err(CacheError::Unbound));
        assert!(!cache.needs_defragmentation());
        assert_eq!(cache.stats().total_cells, 0);
    }

    #[test]
    fn defragmentation_flag_follows_threshold() {
        let cache = bound_with(10, 8);
        assert!(!cache.needs_defragmentation());

        let cache = bound_with(10, 9);
        assert!(cache.needs_defragmentation());
        let stats = cache.stats();
        assert_eq!(stats.used_cells, 9);
        assert_eq!(stats.total_cells, 10);
        assert_eq!(stats.memory_bytes, 9 * 4096);
    }

    #[test]
    fn remove_and_shift_through_controller() {
        let mut cache = bound_with(32, 20);
        cache.remove_tokens(0, 5).expect("remove");
        cache.shift_tokens(5, -5).expect("shift");
        assert_eq!(cache.used_cells(), 15);
    }

    #[test]
    fn oversized_shift_reports_invalid_range() {
        let mut cache = bound_with(16, 6);
        assert!(matches!(
            cache.shift_tokens(1, i32::MAX),
            Err(CacheError::InvalidRange { .. })
        ));
        assert_eq!(cache.used_cells(), 6);
    }

    #[test]
    fn clear_is_idempotent() {
        let mut cache = bound_with(16, 6);
        cache.clear().expect("first clear");
        cache.clear().expect("second clear");
        assert_eq!(cache.used_cells(), 0);
        assert_eq!(cache.cells().expect("bound").used(), 0);
    }

    #[test]
    fn memory_estimate_includes_overhead() {
        let base = 2 * 32 * 4096 * 4096 * 4;
        assert_eq!(KvCache::estimate_memory(4096, 4096, 32), base + base / 10);
    }
}
