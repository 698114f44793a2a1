use crate::error::Error;

/// Name of the semaphore bounding concurrently open remote files.
pub const OPEN_FILE_SEMAPHORE: &str = "openfile";

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the [`OPEN_FILE_SEMAPHORE`].
    pub max_open_files: usize,
    /// Number of distinct request ids; the full 32-bit space unless a test shrinks it.
    pub id_space: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_open_files: 10,
            id_space: 1 << 32,
        }
    }
}

impl SessionConfig {
    pub fn semaphore_capacity(&self, name: &str) -> Result<usize, Error> {
        match name {
            OPEN_FILE_SEMAPHORE => Ok(self.max_open_files),
            _ => Err(Error::internal(format!("unknown semaphore {name:?}"))),
        }
    }
}
