//! Side-band status flags
//!
//! Many per-bundle conditions are worth reporting without failing the call
//! that noticed them: a non-compliant block was skipped, a duplicate custody
//! ID was already pending, the active table wrapped. Each engine call returns
//! a [`StatusFlags`] set alongside its result; flags accumulate within one
//! call and are never carried across calls.

use bitflags::bitflags;

bitflags! {
    /// Cumulative per-call condition flags
    pub struct StatusFlags: u32 {
        /// A block carried semantics this agent does not implement
        const NON_COMPLIANT     = 0x0001;
        /// Input ended before the structure it promised
        const INCOMPLETE        = 0x0002;
        /// A bundle is held for a destination with no route up
        const ROUTE_NEEDED      = 0x0004;
        /// The active table wrapped onto a live entry
        const ACTIVE_TABLE_WRAP = 0x0008;
        /// An SDNV did not fit its reserved width
        const SDNV_OVERFLOW     = 0x0010;
        /// An SDNV ran out of input before its terminator
        const SDNV_INCOMPLETE   = 0x0020;
        /// A storage operation failed mid-bundle
        const STORE_FAILURE     = 0x0040;
        /// An ordered index refused further entries
        const TREE_FULL         = 0x0080;
        /// A duplicate bundle or custody ID was ignored
        const DUPLICATES        = 0x0100;
        /// Delivered and forwarded acknowledgments mixed in one accumulator
        const MIXED_RESPONSE    = 0x0200;
        /// More remote custodians than open-DACS slots
        const TOO_MANY_SOURCES  = 0x0400;
        /// The cache entry pool is exhausted
        const OUT_OF_MEMORY     = 0x0800;
        /// The call did productive work
        const ACTIVITY          = 0x1000;
        /// This agent holds custody of the bundle
        const LOCAL_CUSTODY     = 0x2000;
    }
}

impl Default for StatusFlags {
    fn default() -> Self {
        StatusFlags::empty()
    }
}
