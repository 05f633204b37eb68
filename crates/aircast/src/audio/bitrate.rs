//! Bitrate and duration estimation
//!
//! A VBR stream's bitrate is a running average of per-packet instantaneous
//! rates; a CBR stream's rate follows directly from the format. Duration
//! falls through three tiers: the container's declared packet count, the
//! bisection-discovered packet count, and finally the byte length over
//! the bitrate.

use crate::config::bitrate::{BITRATE_EST_MIN_PACKETS, PACKET_DISCOVERY_UPPER};
use crate::parse::Asbd;

/// Running bitrate estimate over processed packets.
///
/// The accumulator sums each packet's instantaneous rate
/// (`8 * byte_size / packet_duration`, bits per second), so the average is
/// simply `total / count`.
#[derive(Debug, Default)]
pub struct BitrateEstimator {
    processed_size_total: f64,
    processed_count: u64,
    ready_posted: bool,
}

impl BitrateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one VBR packet.
    pub fn record_packet(&mut self, byte_size: u32, packet_duration: f64) {
        if packet_duration > 0.0 {
            self.processed_size_total += 8.0 * f64::from(byte_size) / packet_duration;
            self.processed_count += 1;
        }
    }

    pub fn processed_count(&self) -> u64 {
        self.processed_count
    }

    /// Current estimate in bits/sec, if one is available for this format.
    pub fn rate(&self, asbd: &Asbd) -> Option<f64> {
        if asbd.is_vbr() {
            if self.processed_count >= BITRATE_EST_MIN_PACKETS {
                Some(self.processed_size_total / self.processed_count as f64)
            } else {
                None
            }
        } else if asbd.frames_per_packet > 0 && asbd.sample_rate > 0.0 {
            Some(
                8.0 * asbd.sample_rate * f64::from(asbd.bytes_per_packet)
                    / f64::from(asbd.frames_per_packet),
            )
        } else {
            None
        }
    }

    /// One-shot readiness check: returns the rate the first time an
    /// estimate becomes available, None ever after.
    pub fn take_ready(&mut self, asbd: &Asbd) -> Option<f64> {
        if self.ready_posted {
            return None;
        }
        let rate = self.rate(asbd)?;
        self.ready_posted = true;
        Some(rate)
    }

    /// Whether the one-shot readiness notification has fired.
    pub fn ready_posted(&self) -> bool {
        self.ready_posted
    }
}

/// Three-tier duration estimate in seconds.
///
/// 1. The container's declared packet count, unless it equals the
///    discovery sentinel.
/// 2. The bisection-discovered packet count, unless it is the sentinel.
/// 3. Audio byte length divided by the bitrate.
pub fn estimate_duration(
    declared_packets: Option<u64>,
    discovered_packets: Option<u64>,
    packet_duration: f64,
    file_length: u64,
    data_offset: u64,
    bit_rate: Option<f64>,
) -> Option<f64> {
    if packet_duration > 0.0 {
        if let Some(count) = declared_packets {
            if count > 0 && count != PACKET_DISCOVERY_UPPER {
                return Some(count as f64 * packet_duration);
            }
        }
        if let Some(count) = discovered_packets {
            if count > 0 && count != PACKET_DISCOVERY_UPPER {
                return Some(count as f64 * packet_duration);
            }
        }
    }

    let rate = bit_rate?;
    if rate > 0.0 && file_length > data_offset {
        Some((file_length - data_offset) as f64 / (rate / 8.0))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cbr_asbd() -> Asbd {
        // 128 kbps MP3: 417.96 bytes/packet rounded into a fixed 418
        Asbd {
            sample_rate: 44100.0,
            format_id: 0x2e6d7033,
            frames_per_packet: 1152,
            bytes_per_packet: 418,
            channels: 2,
        }
    }

    fn vbr_asbd() -> Asbd {
        Asbd {
            bytes_per_packet: 0,
            ..cbr_asbd()
        }
    }

    // --- CBR ---

    #[test]
    fn cbr_rate_is_immediate() {
        let est = BitrateEstimator::new();
        let rate = est.rate(&cbr_asbd()).unwrap();
        // 8 * 44100 * 418 / 1152 = 128,012.5 bits/sec
        assert!((rate - 128_012.5).abs() < 0.1);
    }

    #[test]
    fn cbr_take_ready_fires_once() {
        let mut est = BitrateEstimator::new();
        assert!(est.take_ready(&cbr_asbd()).is_some());
        assert!(est.take_ready(&cbr_asbd()).is_none());
        assert!(est.ready_posted());
    }

    // --- VBR ---

    #[test]
    fn vbr_rate_unavailable_below_minimum() {
        let mut est = BitrateEstimator::new();
        let duration = 1152.0 / 44100.0;
        for _ in 0..(BITRATE_EST_MIN_PACKETS - 1) {
            est.record_packet(418, duration);
        }
        assert!(est.rate(&vbr_asbd()).is_none());
        est.record_packet(418, duration);
        assert!(est.rate(&vbr_asbd()).is_some());
    }

    #[test]
    fn vbr_rate_averages_packet_rates() {
        let mut est = BitrateEstimator::new();
        let duration = 1152.0 / 44100.0;
        for _ in 0..100 {
            est.record_packet(418, duration);
        }
        let rate = est.rate(&vbr_asbd()).unwrap();
        let expected = 8.0 * 418.0 / duration;
        assert!((rate - expected).abs() < 0.5, "rate {} vs {}", rate, expected);
    }

    #[test]
    fn vbr_zero_duration_packets_ignored() {
        let mut est = BitrateEstimator::new();
        est.record_packet(418, 0.0);
        assert_eq!(est.processed_count(), 0);
    }

    #[test]
    fn rate_available_forever_after_ready() {
        // once the estimate is ready it stays available
        let mut est = BitrateEstimator::new();
        let duration = 1152.0 / 44100.0;
        for _ in 0..BITRATE_EST_MIN_PACKETS {
            est.record_packet(418, duration);
        }
        assert!(est.take_ready(&vbr_asbd()).is_some());
        for _ in 0..1000 {
            est.record_packet(100, duration);
            assert!(est.rate(&vbr_asbd()).is_some());
        }
    }

    // --- duration tiers ---

    #[test]
    fn duration_prefers_declared_count() {
        let d = estimate_duration(
            Some(1000),
            Some(2000),
            0.026,
            1_000_000,
            0,
            Some(128_000.0),
        );
        assert!((d.unwrap() - 26.0).abs() < 1e-9);
    }

    #[test]
    fn duration_falls_to_discovered_count() {
        let d = estimate_duration(None, Some(2000), 0.026, 1_000_000, 0, Some(128_000.0));
        assert!((d.unwrap() - 52.0).abs() < 1e-9);
    }

    #[test]
    fn sentinel_counts_are_rejected() {
        let d = estimate_duration(
            Some(PACKET_DISCOVERY_UPPER),
            Some(PACKET_DISCOVERY_UPPER),
            0.026,
            1_000_000,
            0,
            Some(128_000.0),
        );
        // falls through to the bitrate tier: 1_000_000 / 16_000 = 62.5
        assert!((d.unwrap() - 62.5).abs() < 1e-9);
    }

    #[test]
    fn duration_bitrate_fallback_subtracts_data_offset() {
        let d = estimate_duration(None, None, 0.0, 1_000_000, 200_000, Some(128_000.0));
        assert!((d.unwrap() - 50.0).abs() < 1e-9);
    }

    #[test]
    fn duration_unavailable_without_any_tier() {
        assert_eq!(estimate_duration(None, None, 0.0, 0, 0, None), None);
        assert_eq!(estimate_duration(None, None, 0.0, 1000, 1000, Some(128_000.0)), None);
    }
}
