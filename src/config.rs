//! # Configuration Capability
//!
//! Configuration loading is treated as an external collaborator: a read-only
//! capability object supplying tunables. This module defines that seam as a
//! trait (`ConfigurationView`) rather than a concrete config-file reader —
//! file parsing, schema validation, and defaults-merging belong to a layer
//! outside this crate's scope. A `StaticConfiguration` implementation is
//! provided for tests and for hosts that just want to supply fixed values.

use std::net::IpAddr;
use std::time::Duration;

/// Timing requirements for one `(service, method)` passenger of a train
/// (train admission and the transmit scheduler).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingRequirement {
    pub debounce_time: Duration,
    pub max_retention_time: Duration,
}

/// TP configuration for one `(service, instance, method)` or
/// `(service, remote, method)` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpConfiguration {
    pub max_segment_length: u32,
    pub separation_time_us: u32,
}

impl Default for TpConfiguration {
    fn default() -> Self {
        Self {
            max_segment_length: 1392,
            separation_time_us: 0,
        }
    }
}

/// Read-only configuration capability consumed by endpoints.
///
/// Implementations are expected to be cheap to call repeatedly — endpoints
/// consult these on every admission and every connect attempt.
pub trait ConfigurationView: Send + Sync {
    fn max_message_size_reliable(&self, ip: IpAddr, port: u16) -> usize;
    fn max_message_size_unreliable(&self) -> usize;
    fn max_message_size_local(&self) -> usize;

    fn endpoint_queue_limit(&self, ip: IpAddr, port: u16) -> usize;
    fn endpoint_queue_limit_local(&self) -> usize;
    fn buffer_shrink_threshold(&self) -> usize;

    fn udp_receive_buffer_size(&self) -> usize;
    fn device(&self) -> Option<String>;

    fn get_configured_timing_requests(
        &self,
        service: u16,
        remote_ip: IpAddr,
        remote_port: u16,
        method: u16,
    ) -> TimingRequirement;

    fn get_configured_timing_responses(
        &self,
        service: u16,
        remote_ip: IpAddr,
        remote_port: u16,
        method: u16,
    ) -> TimingRequirement;

    fn is_tp_service(&self, service: u16, instance: u16, method: u16) -> bool;
    fn is_tp_client(&self, service: u16, remote_ip: IpAddr, remote_port: u16, method: u16)
        -> bool;
    fn get_tp_configuration(
        &self,
        service: u16,
        remote_ip: IpAddr,
        remote_port: u16,
        method: u16,
    ) -> TpConfiguration;

    fn diagnosis_address(&self) -> u8;
    fn diagnosis_mask(&self) -> u8;

    fn sd_ttl(&self) -> Duration;

    fn max_tcp_restart_aborts(&self) -> u32;
    fn max_tcp_connect_time(&self) -> Duration;

    /// Subnet membership check for the multicast reception path: senders
    /// outside the configured same-subnet are dropped. Not an enumerated
    /// option in the original configuration surface; added because the
    /// multicast filtering rule has to consult *something* external to
    /// decide subnet membership.
    fn is_same_subnet(&self, candidate: IpAddr) -> bool;

    /// Whether a unicast loopback of this host's own multicast send should
    /// be delivered to this host's own receiver.
    fn receive_own_multicast(&self) -> bool;
}

/// A fixed-value `ConfigurationView` for tests and simple embedders that do
/// not need per-(service, method) overrides.
#[derive(Debug, Clone)]
pub struct StaticConfiguration {
    pub max_message_size_reliable: usize,
    pub max_message_size_unreliable: usize,
    pub max_message_size_local: usize,
    pub queue_limit: usize,
    pub queue_limit_local: usize,
    pub buffer_shrink_threshold: usize,
    pub udp_receive_buffer_size: usize,
    pub device: Option<String>,
    pub default_timing: TimingRequirement,
    pub tp_enabled: bool,
    pub tp_configuration: TpConfiguration,
    pub diagnosis_address: u8,
    pub diagnosis_mask: u8,
    pub sd_ttl: Duration,
    pub max_tcp_restart_aborts: u32,
    pub max_tcp_connect_time: Duration,
    pub subnet: Option<(IpAddr, u8)>,
    pub receive_own_multicast: bool,
}

impl Default for StaticConfiguration {
    fn default() -> Self {
        Self {
            max_message_size_reliable: 16 * 1024 * 1024,
            max_message_size_unreliable: 65507,
            max_message_size_local: 16 * 1024 * 1024,
            queue_limit: 0, // unlimited
            queue_limit_local: 0,
            buffer_shrink_threshold: 5,
            udp_receive_buffer_size: 1024 * 1024,
            device: None,
            default_timing: TimingRequirement {
                debounce_time: Duration::from_millis(0),
                max_retention_time: Duration::from_millis(0),
            },
            tp_enabled: false,
            tp_configuration: TpConfiguration::default(),
            diagnosis_address: 0,
            diagnosis_mask: 0,
            sd_ttl: Duration::from_secs(3),
            max_tcp_restart_aborts: 3,
            max_tcp_connect_time: Duration::from_secs(5),
            subnet: None,
            receive_own_multicast: false,
        }
    }
}

impl ConfigurationView for StaticConfiguration {
    fn max_message_size_reliable(&self, _ip: IpAddr, _port: u16) -> usize {
        self.max_message_size_reliable
    }

    fn max_message_size_unreliable(&self) -> usize {
        self.max_message_size_unreliable
    }

    fn max_message_size_local(&self) -> usize {
        self.max_message_size_local
    }

    fn endpoint_queue_limit(&self, _ip: IpAddr, _port: u16) -> usize {
        self.queue_limit
    }

    fn endpoint_queue_limit_local(&self) -> usize {
        self.queue_limit_local
    }

    fn buffer_shrink_threshold(&self) -> usize {
        self.buffer_shrink_threshold
    }

    fn udp_receive_buffer_size(&self) -> usize {
        self.udp_receive_buffer_size
    }

    fn device(&self) -> Option<String> {
        self.device.clone()
    }

    fn get_configured_timing_requests(
        &self,
        _service: u16,
        _remote_ip: IpAddr,
        _remote_port: u16,
        _method: u16,
    ) -> TimingRequirement {
        self.default_timing
    }

    fn get_configured_timing_responses(
        &self,
        _service: u16,
        _remote_ip: IpAddr,
        _remote_port: u16,
        _method: u16,
    ) -> TimingRequirement {
        self.default_timing
    }

    fn is_tp_service(&self, _service: u16, _instance: u16, _method: u16) -> bool {
        self.tp_enabled
    }

    fn is_tp_client(
        &self,
        _service: u16,
        _remote_ip: IpAddr,
        _remote_port: u16,
        _method: u16,
    ) -> bool {
        self.tp_enabled
    }

    fn get_tp_configuration(
        &self,
        _service: u16,
        _remote_ip: IpAddr,
        _remote_port: u16,
        _method: u16,
    ) -> TpConfiguration {
        self.tp_configuration
    }

    fn diagnosis_address(&self) -> u8 {
        self.diagnosis_address
    }

    fn diagnosis_mask(&self) -> u8 {
        self.diagnosis_mask
    }

    fn sd_ttl(&self) -> Duration {
        self.sd_ttl
    }

    fn max_tcp_restart_aborts(&self) -> u32 {
        self.max_tcp_restart_aborts
    }

    fn max_tcp_connect_time(&self) -> Duration {
        self.max_tcp_connect_time
    }

    fn is_same_subnet(&self, candidate: IpAddr) -> bool {
        match self.subnet {
            None => true,
            Some((network, prefix_len)) => same_subnet(network, candidate, prefix_len),
        }
    }

    fn receive_own_multicast(&self) -> bool {
        self.receive_own_multicast
    }
}

fn same_subnet(network: IpAddr, candidate: IpAddr, prefix_len: u8) -> bool {
    match (network, candidate) {
        (IpAddr::V4(net), IpAddr::V4(cand)) => {
            let mask = if prefix_len == 0 {
                0u32
            } else {
                u32::MAX << (32 - prefix_len.min(32))
            };
            u32::from(net) & mask == u32::from(cand) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(cand)) => {
            let mask = if prefix_len == 0 {
                0u128
            } else {
                u128::MAX << (128 - prefix_len.min(128))
            };
            u128::from(net) & mask == u128::from(cand) & mask
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn subnet_check_matches_same_network() {
        let mut cfg = StaticConfiguration::default();
        cfg.subnet = Some((IpAddr::V4(Ipv4Addr::new(192, 168, 1, 0)), 24));
        assert!(cfg.is_same_subnet(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 42))));
        assert!(!cfg.is_same_subnet(IpAddr::V4(Ipv4Addr::new(192, 168, 2, 42))));
    }

    #[test]
    fn no_subnet_configured_matches_everything() {
        let cfg = StaticConfiguration::default();
        assert!(cfg.is_same_subnet(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
    }
}
