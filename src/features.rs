use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DetectorError, Result};
use crate::packet::{PacketRecord, Protocol};

pub const FEATURE_COUNT: usize = 13;

/// Order of the values in every [`FeatureVector`]. Models are fitted on this order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "packet_rate",
    "byte_rate",
    "avg_packet_size",
    "tcp_ratio",
    "udp_ratio",
    "icmp_ratio",
    "syn_ratio",
    "fin_ratio",
    "rst_ratio",
    "entropy_src_ip",
    "entropy_dst_ip",
    "entropy_src_port",
    "entropy_dst_port",
];

/// Indices of the features bounded to [0, 1].
pub const RATIO_FEATURES: [usize; 6] = [3, 4, 5, 6, 7, 8];

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn new(values: [f64; FEATURE_COUNT]) -> Self {
        Self { values }
    }

    pub fn from_slice(values: &[f64]) -> Result<Self> {
        let values: [f64; FEATURE_COUNT] =
            values.try_into().map_err(|_| DetectorError::DimensionMismatch {
                expected: FEATURE_COUNT,
                actual: values.len(),
            })?;
        Ok(Self { values })
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|idx| self.values[idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, f64)> + '_ {
        FEATURE_NAMES.iter().copied().zip(self.values.iter().copied())
    }

    pub fn packet_rate(&self) -> f64 {
        self.values[0]
    }

    pub fn byte_rate(&self) -> f64 {
        self.values[1]
    }

    pub fn tcp_ratio(&self) -> f64 {
        self.values[3]
    }

    pub fn syn_ratio(&self) -> f64 {
        self.values[6]
    }
}

/// Turns a window of packets into one [`FeatureVector`].
///
/// Stateless: the only input besides the packets is the window duration the
/// rates are normalized by.
#[derive(Debug, Clone, Copy)]
pub struct FeatureExtractor {
    window: Duration,
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl FeatureExtractor {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn extract(&self, packets: &[PacketRecord]) -> FeatureVector {
        let mut values = [0.0; FEATURE_COUNT];
        if packets.is_empty() {
            return FeatureVector::new(values);
        }

        let window_secs = self.window.as_secs_f64().max(f64::EPSILON);
        let total = packets.len() as f64;
        let total_bytes: usize = packets.iter().map(|p| p.length).sum();

        let packet_rate = total / window_secs;
        let byte_rate = total_bytes as f64 / window_secs;
        values[0] = packet_rate;
        values[1] = byte_rate;
        values[2] = if packet_rate > 0.0 {
            byte_rate / packet_rate
        } else {
            0.0
        };

        let mut tcp = 0usize;
        let mut udp = 0usize;
        let mut icmp = 0usize;
        let mut syn = 0usize;
        let mut fin = 0usize;
        let mut rst = 0usize;
        for packet in packets {
            match packet.protocol {
                Protocol::Tcp => {
                    tcp += 1;
                    if let Some(flags) = packet.tcp_flags {
                        syn += usize::from(flags.syn);
                        fin += usize::from(flags.fin);
                        rst += usize::from(flags.rst);
                    }
                }
                Protocol::Udp => udp += 1,
                Protocol::Icmp => icmp += 1,
                Protocol::Other(_) => {}
            }
        }

        values[3] = tcp as f64 / total;
        values[4] = udp as f64 / total;
        values[5] = icmp as f64 / total;
        if tcp > 0 {
            values[6] = syn as f64 / tcp as f64;
            values[7] = fin as f64 / tcp as f64;
            values[8] = rst as f64 / tcp as f64;
        }

        values[9] = shannon_entropy(packets.iter().map(|p| p.src_ip));
        values[10] = shannon_entropy(packets.iter().map(|p| p.dst_ip));
        values[11] = shannon_entropy(packets.iter().map(|p| p.src_port));
        values[12] = shannon_entropy(packets.iter().map(|p| p.dst_port));

        FeatureVector::new(values)
    }
}

/// Shannon entropy (natural log) of the categorical distribution of `items`.
pub fn shannon_entropy<T, I>(items: I) -> f64
where
    T: Eq + Hash,
    I: IntoIterator<Item = T>,
{
    let mut counts: HashMap<T, usize> = HashMap::new();
    let mut total = 0usize;
    for item in items {
        *counts.entry(item).or_insert(0) += 1;
        total += 1;
    }
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    counts
        .values()
        .map(|&count| {
            let p = count as f64 / total;
            -p * p.ln()
        })
        .sum::<f64>()
        .max(0.0)
}
