//! Typed configuration knobs, grounded in the reference downloader's layered
//! config pattern (one struct per concern, all aggregated into one top-level
//! config with a `Default` impl reproducing the spec's numeric constants).

use std::time::Duration;

/// Capacities of a [`crate::media_object_buffer::MediaObjectBuffer`], keyed by
/// whether the owning playlist is finished (VOD) or live.
#[derive(Debug, Clone, Copy)]
pub struct BufferCapacities {
    pub vod: usize,
    pub live: usize,
}

impl Default for BufferCapacities {
    fn default() -> Self {
        Self { vod: 3, live: 2 }
    }
}

impl BufferCapacities {
    pub fn for_playlist(&self, finished: bool) -> usize {
        if finished { self.vod } else { self.live }
    }
}

/// Variant-selection policy for the demuxer façade's bandwidth-driven switcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariantSelectionPolicy {
    /// Largest bandwidth strictly less than measured throughput, ties broken
    /// by smallest positive shortfall. The only policy the core spec names.
    #[default]
    LargestBelowMeasured,
}

#[derive(Debug, Clone)]
pub struct HlsConfig {
    /// MediaObjectBuffer capacities (§4.3): 3 for VOD, 2 for live.
    pub buffer_capacities: BufferCapacities,
    /// Init-section cache size (§3): MAX_INIT_SEGMENTS.
    pub max_init_segments: usize,
    /// Process-wide AES key cache size (§4.2): MAX_KEY_STORE_SIZE.
    pub max_key_store_size: usize,
    /// Floor applied to the live reload interval after halving (§4.5 step 2).
    pub min_reload_interval: Duration,
    /// Sleep between prefetch-loop re-evaluations when no segment is ready yet.
    pub prefetch_idle_sleep: Duration,
    /// Retry policy used for transport "again" conditions and key fetches.
    pub retry_policy: crate::retry::RetryPolicy,
    /// Overall HTTP timeout applied by the transport layer.
    pub http_timeout: Duration,
    pub variant_selection: VariantSelectionPolicy,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            buffer_capacities: BufferCapacities::default(),
            max_init_segments: 16,
            max_key_store_size: 3,
            min_reload_interval: Duration::from_millis(500),
            prefetch_idle_sleep: Duration::from_millis(10),
            retry_policy: crate::retry::RetryPolicy::default(),
            http_timeout: Duration::from_secs(30),
            variant_selection: VariantSelectionPolicy::default(),
        }
    }
}

impl HlsConfig {
    pub fn builder() -> HlsConfigBuilder {
        HlsConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HlsConfigBuilder {
    config: OptionalOverrides,
}

#[derive(Debug, Clone, Default)]
struct OptionalOverrides {
    buffer_capacities: Option<BufferCapacities>,
    max_init_segments: Option<usize>,
    max_key_store_size: Option<usize>,
    http_timeout: Option<Duration>,
}

impl HlsConfigBuilder {
    pub fn buffer_capacities(mut self, v: BufferCapacities) -> Self {
        self.config.buffer_capacities = Some(v);
        self
    }

    pub fn max_init_segments(mut self, v: usize) -> Self {
        self.config.max_init_segments = Some(v);
        self
    }

    pub fn max_key_store_size(mut self, v: usize) -> Self {
        self.config.max_key_store_size = Some(v);
        self
    }

    pub fn http_timeout(mut self, v: Duration) -> Self {
        self.config.http_timeout = Some(v);
        self
    }

    pub fn build(self) -> HlsConfig {
        let defaults = HlsConfig::default();
        HlsConfig {
            buffer_capacities: self.config.buffer_capacities.unwrap_or(defaults.buffer_capacities),
            max_init_segments: self.config.max_init_segments.unwrap_or(defaults.max_init_segments),
            max_key_store_size: self
                .config
                .max_key_store_size
                .unwrap_or(defaults.max_key_store_size),
            http_timeout: self.config.http_timeout.unwrap_or(defaults.http_timeout),
            ..defaults
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = HlsConfig::default();
        assert_eq!(cfg.buffer_capacities.vod, 3);
        assert_eq!(cfg.buffer_capacities.live, 2);
        assert_eq!(cfg.max_init_segments, 16);
        assert_eq!(cfg.max_key_store_size, 3);
    }

    #[test]
    fn builder_overrides_only_given_fields() {
        let cfg = HlsConfig::builder().max_init_segments(4).build();
        assert_eq!(cfg.max_init_segments, 4);
        assert_eq!(cfg.max_key_store_size, 3);
    }

    #[test]
    fn buffer_for_playlist_selects_by_finished_flag() {
        let caps = BufferCapacities::default();
        assert_eq!(caps.for_playlist(true), 3);
        assert_eq!(caps.for_playlist(false), 2);
    }
}
