use crate::chunked::ChunkDescriptor;

/// Converts a byte count into a percentage of `size`, clamped to 0–100.
pub fn percent_of(bytes: u64, size: u64) -> f64 {
    if size == 0 {
        return 100.0;
    }
    (bytes.min(size) as f64 * 100.0) / size as f64
}

/// Per-chunk progress with a byte-weighted aggregate.
///
/// The aggregate is `sum(size * percent) / sum(size)`, so a small trailing
/// chunk moves the total less than a full-size one.
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    sizes: Vec<u64>,
    percents: Vec<f64>,
    total_bytes: u64,
}

impl ProgressBoard {
    /// Creates a board with every chunk at 0%.
    pub fn new(chunks: &[ChunkDescriptor]) -> Self {
        let sizes: Vec<u64> = chunks.iter().map(ChunkDescriptor::size).collect();
        let total_bytes = sizes.iter().sum();
        Self {
            percents: vec![0.0; sizes.len()],
            sizes,
            total_bytes,
        }
    }

    /// Number of chunks tracked.
    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// Sets the progress of chunk `index`. Returns `true` if the value changed.
    pub fn set(&mut self, index: usize, percent: f64) -> bool {
        let Some(slot) = self.percents.get_mut(index) else {
            return false;
        };
        let percent = percent.clamp(0.0, 100.0);
        if (*slot - percent).abs() < f64::EPSILON {
            return false;
        }
        *slot = percent;
        true
    }

    /// Records `bytes` sent for chunk `index`.
    pub fn set_bytes(&mut self, index: usize, bytes: u64) -> bool {
        match self.sizes.get(index) {
            Some(&size) => self.set(index, percent_of(bytes, size)),
            None => false,
        }
    }

    /// Progress of chunk `index` (0 for unknown indices).
    pub fn get(&self, index: usize) -> f64 {
        self.percents.get(index).copied().unwrap_or(0.0)
    }

    /// Resets every chunk to 0%.
    pub fn clear(&mut self) {
        self.percents.iter_mut().for_each(|p| *p = 0.0);
    }

    /// Byte-weighted aggregate percentage.
    pub fn total_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let loaded: f64 = self
            .sizes
            .iter()
            .zip(&self.percents)
            .map(|(&size, &pct)| size as f64 * pct)
            .sum();
        loaded / self.total_bytes as f64
    }

    /// Indices of chunks not yet at 100%.
    pub fn incomplete(&self) -> impl Iterator<Item = usize> + '_ {
        self.percents
            .iter()
            .enumerate()
            .filter(|(_, p)| **p < 100.0)
            .map(|(i, _)| i)
    }
}
