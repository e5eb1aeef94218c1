//! Driver configuration.

/// Tunables of the notary protocol driver.
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// One earned notarization is allowed per period of this many blocks.
    pub block_notarization_modulo: u32,
    /// Blocks a notarization must age before notaries may finalize it.
    pub min_blocks_before_finalized: u32,
    /// Blocks added to the current height for a new finalization's
    /// minimum height.
    pub finalization_delay: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            block_notarization_modulo: 10,
            min_blocks_before_finalized: 10,
            finalization_delay: 15,
        }
    }
}
