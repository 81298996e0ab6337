use std::path::Path;

use anyhow::{ensure, Context, Result};
use bytes::Bytes;

/// Compiled, serialized engine; the only thing that outlives a build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedEngine(Bytes);

impl SerializedEngine {
    pub fn new(bytes: Bytes) -> Result<Self> {
        ensure!(!bytes.is_empty(), "serialized engine is empty");
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.0
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, &self.0)
            .with_context(|| format!("failed to write engine to {}", path.display()))
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read engine from {}", path.display()))?;
        Self::new(Bytes::from(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_buffer_is_not_an_engine() {
        assert!(SerializedEngine::new(Bytes::new()).is_err());
    }

    #[test]
    fn write_then_read() -> Result<()> {
        let path = std::env::temp_dir().join(format!("netforge-artifact-{}.nfe", std::process::id()));
        let engine = SerializedEngine::new(Bytes::from_static(b"NFGE\x01\x00"))?;
        engine.write_to(&path)?;
        let back = SerializedEngine::read_from(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(back, engine);
        Ok(())
    }
}
