//! Extranonce assignment for new connections

use parking_lot::Mutex;

/// Largest supported extranonce size in bytes
pub const MAX_EXTRANONCE_SIZE: u8 = 3;

/// Hands out distinct extranonce prefixes to connections
///
/// Values run from 1 to `2^(8*size) - 1` and wrap around; zero is never
/// handed out. A size of zero disables assignment.
#[derive(Debug)]
pub struct ExtranonceAllocator {
    size: u8,
    next: Mutex<u32>,
}

impl ExtranonceAllocator {
    /// Create an allocator, clamping `size` to [`MAX_EXTRANONCE_SIZE`]
    pub fn new(size: u8) -> Self {
        Self {
            size: size.min(MAX_EXTRANONCE_SIZE),
            next: Mutex::new(1),
        }
    }

    /// Extranonce size in bytes
    pub fn size(&self) -> u8 {
        self.size
    }

    /// Next extranonce as lowercase hex, or `None` when disabled
    pub fn next(&self) -> Option<String> {
        if self.size == 0 {
            return None;
        }

        let max = (1u32 << (8 * self.size as u32)) - 1;
        let mut next = self.next.lock();
        let value = *next;
        *next = if value >= max { 1 } else { value + 1 };

        Some(format!("{:0width$x}", value, width = 2 * self.size as usize))
    }
}
