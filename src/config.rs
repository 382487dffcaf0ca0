/// Where [`Rmalloc::allocate`](crate::Rmalloc::allocate) looks for memory first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Placement {
    /// Reuse a reclaimed chunk from the free lists when one fits, otherwise
    /// bump the high-water mark. Keeps the arena dense between compactions.
    #[default]
    ReuseFirst,
    /// Bump the high-water mark while the region has room and only fall back
    /// to the free lists once it runs out.
    BumpFirst,
}

/// Arena construction options.
///
/// ```
/// use rmalloc::{Config, Placement};
///
/// let config = Config::new().with_placement(Placement::BumpFirst).with_poison(0xde);
/// assert_eq!(config.poison, Some(0xde));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Config {
    pub placement: Placement,
    /// Byte to overwrite freed chunks' client bytes with, if any.
    pub poison: Option<u8>,
}

impl Config {
    pub const fn new() -> Self {
        Self { placement: Placement::ReuseFirst, poison: None }
    }

    pub const fn with_placement(self, placement: Placement) -> Self {
        Self { placement, ..self }
    }

    pub const fn with_poison(self, byte: u8) -> Self {
        Self { poison: Some(byte), ..self }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
