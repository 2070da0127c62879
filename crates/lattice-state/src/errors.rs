//! State builder errors.

use lattice_core::InstanceKey;
use thiserror::Error;

/// Errors from graph reconstruction and lookups.
#[derive(Debug, Error)]
pub enum StateError {
    /// In single-anchor mode the first payload must carry the configured
    /// anchor type. Fatal for the channel.
    #[error("anchor type mismatch: channel expects '{expected}', first payload was '{received}'")]
    AnchorTypeMismatch {
        /// The type tag the channel was configured with.
        expected: String,
        /// The type tag the first payload carried.
        received: String,
    },

    /// Lookup for an identity that is not in the index.
    #[error("no instance indexed under '{key}'")]
    InstanceNotFound {
        /// The missing identity.
        key: InstanceKey,
    },
}
