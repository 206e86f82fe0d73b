use std::fmt::Display;
use std::num::NonZeroU32;

/// Opaque identifier of one engine instance.
///
/// Internally an index into the bridge's arena plus the generation the slot
/// had when the handle was issued. Once destroyed, the slot's generation moves
/// on, so the same token never names a later instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EngineHandle {
    index: u32,
    generation: NonZeroU32,
}

impl EngineHandle {
    pub(crate) fn new(index: u32, generation: NonZeroU32) -> Self {
        Self { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation.get()
    }

    /// Token form used across the C ABI. Never zero.
    pub fn to_raw(self) -> u64 {
        (u64::from(self.generation.get()) << 32) | u64::from(self.index)
    }

    /// Parses a token. Returns `None` for values no handle can have (such as 0).
    pub fn from_raw(raw: u64) -> Option<Self> {
        let generation = NonZeroU32::new((raw >> 32) as u32)?;
        Some(Self { index: raw as u32, generation })
    }
}

impl Display for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "engine#{}.{}", self.index, self.generation)
    }
}
