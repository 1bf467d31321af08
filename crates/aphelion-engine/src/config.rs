//! Channel configuration
//!
//! A channel's attributes fix its local endpoint and the primary-block
//! template it originates from. Most options can be changed at runtime
//! through [`ChannelOption`]; changing any primary-block field rebuilds the
//! outbound template.

use aphelion_codec::{CipherSuite, WireVersion};
use aphelion_core::EndpointId;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// Policy when the active table wraps onto a live custody entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WrapResponse {
    /// Force-retransmit the occupying bundle under a fresh custody ID
    #[default]
    Resend,
    /// Fail the call with `Overflow` after a bounded wait
    Block,
    /// Abandon the occupying bundle and count it lost
    Drop,
}

/// Channel attributes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Wire format this channel speaks
    pub version: WireVersion,
    /// Local endpoint of the channel
    pub local: EndpointId,
    /// Default destination for originated bundles
    pub destination: EndpointId,
    /// Report-to endpoint stamped into originated bundles
    pub report_to: EndpointId,
    /// Custodian endpoint stamped into originated bundles
    pub custodian: EndpointId,
    /// Lifetime of originated bundles in seconds; 0 = infinite
    pub lifetime_secs: u64,
    /// Request custody transfer for originated bundles
    pub request_custody: bool,
    /// Attach an integrity block to originated bundles
    pub integrity_check: bool,
    /// Cipher suite for the integrity block
    pub cipher_suite: CipherSuite,
    /// Key material for keyed suites
    pub integrity_key: Option<[u8; 32]>,
    /// Fragment payloads larger than `max_bundle_len`
    pub allow_fragment: bool,
    /// Largest payload carried by one bundle
    pub max_bundle_len: usize,
    /// Custody retransmission timeout in seconds
    pub timeout_secs: u64,
    /// Whether this channel may originate bundles
    pub originate: bool,
    /// Deliver only administrative records
    pub process_admin_only: bool,
    /// Active-table wrap policy
    pub wrap_response: WrapResponse,
    /// Keep the same custody ID on retransmission
    pub cid_reuse: bool,
    /// Seconds between aggregate custody signals per custodian
    pub dacs_rate_secs: u64,
    /// Open DACS accumulators allowed at once
    pub max_concurrent_dacs: usize,
    /// Fills per aggregate custody signal bundle
    pub max_fills_per_dacs: usize,
    /// Custody IDs held per accumulator before a forced flush
    pub max_acs_tree_size: usize,
    /// Active table slots
    pub active_table_size: usize,
    /// Bounded wait on active-table wrap, milliseconds
    pub wrap_timeout_millis: u64,
    /// Capacity of each storage queue created at open
    pub storage_capacity: usize,
    /// How long processed-bundle keys are remembered for duplicate detection,
    /// seconds
    pub seen_horizon_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            version: WireVersion::V6,
            local: EndpointId::null(),
            destination: EndpointId::null(),
            report_to: EndpointId::null(),
            custodian: EndpointId::null(),
            lifetime_secs: 86_400,
            request_custody: true,
            integrity_check: true,
            cipher_suite: CipherSuite::Crc16X25,
            integrity_key: None,
            allow_fragment: false,
            max_bundle_len: 4096,
            timeout_secs: 10,
            originate: true,
            process_admin_only: false,
            wrap_response: WrapResponse::Resend,
            cid_reuse: false,
            dacs_rate_secs: 5,
            max_concurrent_dacs: 4,
            max_fills_per_dacs: 64,
            max_acs_tree_size: 240,
            active_table_size: 512,
            wrap_timeout_millis: 1_000,
            storage_capacity: 1024,
            seen_horizon_secs: 3_600,
        }
    }
}

impl ChannelConfig {
    /// A channel bound to `local` that sends to `destination`
    pub fn between(local: EndpointId, destination: EndpointId) -> Self {
        Self {
            local,
            destination,
            report_to: local,
            custodian: local,
            ..Self::default()
        }
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.active_table_size == 0 {
            return Err(ChannelError::Param("active_table_size must be nonzero"));
        }
        if self.max_bundle_len == 0 {
            return Err(ChannelError::Param("max_bundle_len must be nonzero"));
        }
        if self.max_fills_per_dacs == 0 {
            return Err(ChannelError::Param("max_fills_per_dacs must be nonzero"));
        }
        if self.max_acs_tree_size == 0 {
            return Err(ChannelError::Param("max_acs_tree_size must be nonzero"));
        }
        if self.max_concurrent_dacs == 0 {
            return Err(ChannelError::Param("max_concurrent_dacs must be nonzero"));
        }
        if self.storage_capacity == 0 {
            return Err(ChannelError::Param("storage_capacity must be nonzero"));
        }
        if self.local.node == 0 {
            return Err(ChannelError::Param("local node must be nonzero"));
        }
        if self.integrity_check
            && self.cipher_suite == CipherSuite::KeyedBlake3
            && self.integrity_key.is_none()
        {
            return Err(ChannelError::Param("keyed cipher suite requires a key"));
        }
        Ok(())
    }
}

/// A settable channel option with its new value
///
/// Options that shape the primary block trigger a template rebuild when set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOption {
    DestinationNode(u32),
    DestinationService(u32),
    ReportToNode(u32),
    ReportToService(u32),
    CustodianNode(u32),
    CustodianService(u32),
    /// Overwrite the creation sequence counter
    SetSequence(u64),
    Lifetime(u64),
    RequestCustody(bool),
    IntegrityCheck(bool),
    PayloadCrc(CipherSuite),
    AllowFragment(bool),
    Timeout(u64),
    MaxBundleLength(usize),
    Originate(bool),
    ProcessAdminOnly(bool),
    Wrap(WrapResponse),
    CidReuse(bool),
    AcsRate(u64),
}

/// Keys for reading channel options back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOptionKey {
    DestinationNode,
    DestinationService,
    ReportToNode,
    ReportToService,
    CustodianNode,
    CustodianService,
    SetSequence,
    Lifetime,
    RequestCustody,
    IntegrityCheck,
    PayloadCrc,
    AllowFragment,
    Timeout,
    MaxBundleLength,
    Originate,
    ProcessAdminOnly,
    Wrap,
    CidReuse,
    AcsRate,
}

impl ChannelOption {
    /// Whether setting this option changes the primary-block template
    pub fn rebuilds_template(&self) -> bool {
        matches!(
            self,
            ChannelOption::DestinationNode(_)
                | ChannelOption::DestinationService(_)
                | ChannelOption::ReportToNode(_)
                | ChannelOption::ReportToService(_)
                | ChannelOption::CustodianNode(_)
                | ChannelOption::CustodianService(_)
                | ChannelOption::Lifetime(_)
                | ChannelOption::RequestCustody(_)
                | ChannelOption::IntegrityCheck(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ChannelConfig::between(EndpointId::new(1, 1), EndpointId::new(2, 1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_table_rejected() {
        let mut config = ChannelConfig::between(EndpointId::new(1, 1), EndpointId::new(2, 1));
        config.active_table_size = 0;
        assert!(matches!(config.validate(), Err(ChannelError::Param(_))));
    }

    #[test]
    fn test_keyed_suite_requires_key() {
        let mut config = ChannelConfig::between(EndpointId::new(1, 1), EndpointId::new(2, 1));
        config.cipher_suite = CipherSuite::KeyedBlake3;
        assert!(matches!(config.validate(), Err(ChannelError::Param(_))));

        config.integrity_key = Some([1u8; 32]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_primary_block_options_rebuild() {
        assert!(ChannelOption::DestinationNode(9).rebuilds_template());
        assert!(ChannelOption::RequestCustody(false).rebuilds_template());
        assert!(!ChannelOption::Timeout(3).rebuilds_template());
        assert!(!ChannelOption::CidReuse(true).rebuilds_template());
    }
}
