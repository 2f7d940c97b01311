use std::collections::HashMap;

/// Sparse, unbounded machine memory.
///
/// Every non-negative address is readable and writable. Cells that were never
/// written read as 0, so relative-addressed and self-modifying writes far past
/// the end of the program image never fault.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Memory {
    cells: HashMap<u64, i64>,
    /// One past the highest address ever populated.
    extent: u64,
}

impl Memory {
    /// Load a program image at addresses `0..image.len()`.
    pub fn new(image: &[i64]) -> Self {
        let cells = image
            .iter()
            .enumerate()
            .map(|(addr, &value)| (addr as u64, value))
            .collect();
        Self {
            cells,
            extent: image.len() as u64,
        }
    }

    #[inline]
    pub fn get(&self, address: u64) -> i64 {
        self.cells.get(&address).copied().unwrap_or(0)
    }

    #[inline]
    pub fn set(&mut self, address: u64, value: i64) {
        self.cells.insert(address, value);
        self.extent = self.extent.max(address.saturating_add(1));
    }

    /// One past the highest address that was loaded or written.
    pub fn len_hint(&self) -> u64 {
        self.extent
    }

    /// Dense copy of addresses `0..len`, unwritten cells as 0.
    pub fn snapshot(&self, len: u64) -> Vec<i64> {
        (0..len).map(|addr| self.get(addr)).collect()
    }
}
