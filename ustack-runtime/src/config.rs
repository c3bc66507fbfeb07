use std::time::Duration;

/// Tunables of the stack. `Default` gives the reference values; setters consume and return the
/// config so they can be chained. Fields are only reachable through the setters, which reject
/// values the stack cannot run with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackConfig {
    pub(crate) arp_request_timeout: Duration,
    pub(crate) arp_retries: u32,
    pub(crate) arp_entry_ttl: Duration,
    pub(crate) arp_pinned_ttl: Duration,
    pub(crate) arp_queue_capacity: usize,
    pub(crate) arp_tick_interval: Duration,
    pub(crate) reassembly_timeout: Duration,
    pub(crate) reassembly_sweep_interval: Duration,
    pub(crate) reassembly_queue_capacity: usize,
    pub(crate) default_ttl: u8,
    pub(crate) udp_queue_capacity: usize,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            arp_request_timeout: Duration::from_secs(5),
            arp_retries: 5,
            arp_entry_ttl: Duration::from_secs(60),
            arp_pinned_ttl: Duration::from_secs(3600),
            arp_queue_capacity: 1024,
            arp_tick_interval: Duration::from_secs(1),
            reassembly_timeout: Duration::from_secs(60),
            reassembly_sweep_interval: Duration::from_secs(5),
            reassembly_queue_capacity: 1024,
            default_ttl: 64,
            udp_queue_capacity: 64,
        }
    }
}

impl StackConfig {
    pub fn new() -> Self {
        StackConfig::default()
    }

    /// Time between resolution requests for one address. Whole seconds, at least one.
    pub fn arp_request_timeout(self, timeout: Duration) -> Self {
        assert!(
            timeout.as_secs() > 0,
            "arp request timeout must be at least one second"
        );
        StackConfig {
            arp_request_timeout: timeout,
            ..self
        }
    }

    /// Number of re-sent requests before an unanswered resolution is abandoned.
    pub fn arp_retries(self, retries: u32) -> Self {
        StackConfig {
            arp_retries: retries,
            ..self
        }
    }

    pub fn arp_entry_ttl(self, ttl: Duration) -> Self {
        assert!(ttl.as_secs() > 0, "arp entry ttl must be at least one second");
        StackConfig {
            arp_entry_ttl: ttl,
            ..self
        }
    }

    pub fn arp_pinned_ttl(self, ttl: Duration) -> Self {
        assert!(ttl.as_secs() > 0, "arp pinned ttl must be at least one second");
        StackConfig {
            arp_pinned_ttl: ttl,
            ..self
        }
    }

    pub fn arp_queue_capacity(self, capacity: usize) -> Self {
        assert_ne!(capacity, 0, "arp queue capacity must be non-zero");
        StackConfig {
            arp_queue_capacity: capacity,
            ..self
        }
    }

    /// Period of the resolution cache ticker. Must be non-zero.
    pub fn arp_tick_interval(self, interval: Duration) -> Self {
        assert!(interval > Duration::ZERO, "arp tick interval must be non-zero");
        StackConfig {
            arp_tick_interval: interval,
            ..self
        }
    }

    pub fn reassembly_timeout(self, timeout: Duration) -> Self {
        StackConfig {
            reassembly_timeout: timeout,
            ..self
        }
    }

    /// Period of the reassembly sweep. Must be non-zero.
    pub fn reassembly_sweep_interval(self, interval: Duration) -> Self {
        assert!(
            interval > Duration::ZERO,
            "reassembly sweep interval must be non-zero"
        );
        StackConfig {
            reassembly_sweep_interval: interval,
            ..self
        }
    }

    pub fn reassembly_queue_capacity(self, capacity: usize) -> Self {
        assert_ne!(capacity, 0, "reassembly queue capacity must be non-zero");
        StackConfig {
            reassembly_queue_capacity: capacity,
            ..self
        }
    }

    pub fn default_ttl(self, ttl: u8) -> Self {
        StackConfig {
            default_ttl: ttl,
            ..self
        }
    }

    /// Datagrams a UDP socket holds before further arrivals are dropped.
    pub fn udp_queue_capacity(self, capacity: usize) -> Self {
        assert_ne!(capacity, 0, "udp queue capacity must be non-zero");
        StackConfig {
            udp_queue_capacity: capacity,
            ..self
        }
    }

    pub(crate) fn arp_request_timeout_ticks(&self) -> u32 {
        self.ticks(self.arp_request_timeout)
    }

    pub(crate) fn arp_entry_ttl_ticks(&self) -> u32 {
        self.ticks(self.arp_entry_ttl)
    }

    pub(crate) fn arp_pinned_ttl_ticks(&self) -> u32 {
        self.ticks(self.arp_pinned_ttl)
    }

    // Cache lifetimes are counted in ticker passes, never less than one.
    fn ticks(&self, duration: Duration) -> u32 {
        let tick = self.arp_tick_interval.as_millis().max(1);
        ((duration.as_millis() / tick).max(1)).min(u128::from(u32::MAX)) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_defaults() {
        let config = StackConfig::default();
        assert_eq!(config.arp_request_timeout, Duration::from_secs(5));
        assert_eq!(config.arp_retries, 5);
        assert_eq!(config.arp_entry_ttl, Duration::from_secs(60));
        assert_eq!(config.arp_queue_capacity, 1024);
        assert_eq!(config.reassembly_timeout, Duration::from_secs(60));
        assert_eq!(config.reassembly_sweep_interval, Duration::from_secs(5));
        assert_eq!(config.udp_queue_capacity, 64);
    }

    #[test]
    fn ticks_follow_interval() {
        let config = StackConfig::new();
        assert_eq!(config.arp_request_timeout_ticks(), 5);
        assert_eq!(config.arp_entry_ttl_ticks(), 60);
        assert_eq!(config.arp_pinned_ttl_ticks(), 3600);

        let fast = StackConfig::new().arp_tick_interval(Duration::from_millis(500));
        assert_eq!(fast.arp_request_timeout_ticks(), 10);
    }

    #[test]
    fn chained_setters() {
        let config = StackConfig::new()
            .arp_retries(0)
            .arp_queue_capacity(4)
            .default_ttl(32);
        assert_eq!(config.arp_retries, 0);
        assert_eq!(config.arp_queue_capacity, 4);
        assert_eq!(config.default_ttl, 32);
    }

    #[test]
    #[should_panic]
    fn zero_queue_capacity() {
        StackConfig::new().arp_queue_capacity(0);
    }

    #[test]
    #[should_panic]
    fn zero_reassembly_queue_capacity() {
        StackConfig::new().reassembly_queue_capacity(0);
    }

    #[test]
    #[should_panic]
    fn zero_udp_queue_capacity() {
        StackConfig::new().udp_queue_capacity(0);
    }

    #[test]
    #[should_panic]
    fn zero_tick_interval() {
        StackConfig::new().arp_tick_interval(Duration::ZERO);
    }

    #[test]
    #[should_panic]
    fn zero_sweep_interval() {
        StackConfig::new().reassembly_sweep_interval(Duration::from_millis(0));
    }
}
