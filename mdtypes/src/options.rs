use std::time::Duration;

/// Recognized configuration, §6. A single enumerated-field struct rather
/// than a bag of dynamic string keys; every numeric field is clamped to a
/// documented bound in [`MdsOptions::clamped`] at construction time instead
/// of at the point of use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MdsOptions {
    /// Directory partition scale: live physical servers.
    pub num_servers: u32,
    /// Directory partition scale: fixed virtual-server count for a
    /// directory's lifetime. `num_servers <= num_virtual_servers <= 65_536`.
    pub num_virtual_servers: u32,
    /// Lease TTL upper bound, in microseconds.
    pub max_lease_duration_us: u64,
    /// LLT capacity (entry count).
    pub max_num_leases: usize,
    /// Memtable size in bytes before rotation to immutable.
    pub write_buffer_size: usize,
    /// Table block geometry: target data-block size in bytes.
    pub block_size: usize,
    /// Table block geometry: restart-point interval (entries per
    /// restart-point in prefix-compressed blocks).
    pub block_restart_interval: usize,
    /// Compaction policy: level byte-size growth factor.
    pub level_factor: u64,
    /// Compaction policy: L0 file-count soft limit (slows writers).
    pub l0_soft_limit: usize,
    /// Compaction policy: L0 file-count hard limit (stalls writers).
    pub l0_hard_limit: usize,
    /// Read-mostly mode: background compaction never runs.
    pub disable_compaction: bool,
    /// Extra validation on decode (DPI bitmap invariants, table footers).
    pub paranoid_checks: bool,
    /// RPC call deadline.
    pub rpc_timeout: Duration,
    /// Transport tuning: maximum UDP payload in either direction.
    pub udp_max_msgsz: usize,
}

impl Default for MdsOptions {
    fn default() -> Self {
        MdsOptions {
            num_servers: 4,
            num_virtual_servers: 1024,
            max_lease_duration_us: 5_000_000,
            max_num_leases: 1 << 16,
            write_buffer_size: 4 << 20,
            block_size: 4096,
            block_restart_interval: 16,
            level_factor: 10,
            l0_soft_limit: 4,
            l0_hard_limit: 12,
            disable_compaction: false,
            paranoid_checks: false,
            rpc_timeout: Duration::from_secs(5),
            udp_max_msgsz: 1432,
        }
    }
}

impl MdsOptions {
    /// Clamp every field to the bound documented on it above, returning a
    /// value that is always safe to construct subsystems from. This never
    /// fails: out-of-range input degrades to the nearest legal value rather
    /// than erroring, since these are operator-tunable knobs, not protocol
    /// input.
    pub fn clamped(mut self) -> Self {
        self.num_virtual_servers = self.num_virtual_servers.clamp(1, 65_536);
        self.num_servers = self.num_servers.clamp(1, self.num_virtual_servers);
        self.max_lease_duration_us = self.max_lease_duration_us.max(1);
        self.max_num_leases = self.max_num_leases.max(16);
        self.write_buffer_size = self.write_buffer_size.max(4096);
        self.block_size = self.block_size.max(256);
        self.block_restart_interval = self.block_restart_interval.max(1);
        self.level_factor = self.level_factor.max(2);
        self.l0_soft_limit = self.l0_soft_limit.max(1);
        self.l0_hard_limit = self.l0_hard_limit.max(self.l0_soft_limit + 1);
        self.udp_max_msgsz = self.udp_max_msgsz.clamp(64, 65_507);
        self
    }

    /// `radix = ceil(log2(num_virtual_servers))`.
    pub fn radix(&self) -> u32 {
        let v = self.num_virtual_servers.max(1);
        if v <= 1 {
            0
        } else {
            32 - (v - 1).leading_zeros()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_num_servers_to_virtual_servers() {
        let opts = MdsOptions {
            num_servers: 99,
            num_virtual_servers: 8,
            ..Default::default()
        }
        .clamped();
        assert_eq!(opts.num_servers, 8);
    }

    #[test]
    fn clamps_l0_hard_above_soft() {
        let opts = MdsOptions {
            l0_soft_limit: 20,
            l0_hard_limit: 1,
            ..Default::default()
        }
        .clamped();
        assert!(opts.l0_hard_limit > opts.l0_soft_limit);
    }

    #[test]
    fn default_is_already_clamped() {
        let opts = MdsOptions::default();
        assert_eq!(opts.clone().clamped(), opts);
    }
}
