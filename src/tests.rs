use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::capture::tests::{fast_config, scripted_opener, wait_for, Step};
use crate::config::{CaptureConfig, DetectionConfig};
use crate::detector::{ClusterModelState, Detector, FitOptions};
use crate::ensemble::EnsembleClassifier;
use crate::error::DetectorError;
use crate::features::{FeatureExtractor, FeatureVector};
use crate::filter::CaptureFilter;
use crate::models::save_model;
use crate::packet::{PacketRecord, TcpFlags};
use crate::pipeline::DetectionPipeline;

const ACK: u8 = 0x10;
const FIN_ACK: u8 = 0x11;

fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(a, b, c, d))
}

/// Mostly established TCP with some DNS; one SYN in ten packets.
fn normal_window(seed: usize) -> Vec<PacketRecord> {
    let total = 150 + (seed * 37) % 100;
    (0..total)
        .map(|i| {
            let src = ip(10, 0, (i % 17) as u8, ((seed + i) % 200) as u8);
            let dst = ip(10, 1, 0, (i % 5) as u8);
            let sport = 40_000 + (i % 300) as u16;
            let len = 60 + (i * 13 + seed * 7) % 1400;
            match (i + seed) % 10 {
                0 => PacketRecord::tcp(src, dst, sport, 443, len, TcpFlags::syn_only()),
                1..=6 => PacketRecord::tcp(src, dst, sport, 443, len, TcpFlags::from_bits(ACK)),
                7 => PacketRecord::tcp(src, dst, sport, 443, len, TcpFlags::from_bits(FIN_ACK)),
                _ => PacketRecord::udp(src, dst, sport, 53, len),
            }
        })
        .collect()
}

/// 1000 packets: 900 spoofed SYNs, 50 ACKs and 50 UDP datagrams at one target.
fn syn_flood_window() -> Vec<PacketRecord> {
    let target = ip(10, 1, 0, 1);
    let mut packets = Vec::with_capacity(1000);
    for i in 0..900usize {
        let src = ip(172, 16, (i / 250) as u8, (i % 250) as u8);
        packets.push(PacketRecord::tcp(src, target, 1024 + i as u16, 80, 60, TcpFlags::syn_only()));
    }
    for i in 0..50usize {
        let ack = TcpFlags::from_bits(ACK);
        packets.push(PacketRecord::tcp(ip(10, 0, 0, 9), target, 50_000 + i as u16, 80, 60, ack));
        packets.push(PacketRecord::udp(ip(10, 0, 0, 8), target, 5353, 53, 80));
    }
    packets
}

fn fitted_model() -> ClusterModelState {
    let extractor = FeatureExtractor::default();
    let samples: Vec<FeatureVector> =
        (0..40).map(|seed| extractor.extract(&normal_window(seed))).collect();
    let options = FitOptions { k: 2, ..FitOptions::default() };
    ClusterModelState::fit(&samples, &options).unwrap()
}

#[test]
fn test_syn_flood_features() {
    let features = FeatureExtractor::new(Duration::from_secs(60)).extract(&syn_flood_window());
    assert!((features.syn_ratio() - 900.0 / 950.0).abs() < 1e-12);
    assert!((features.syn_ratio() - 0.947).abs() < 1e-3);
    assert!((features.tcp_ratio() - 0.95).abs() < 1e-12);
    assert_eq!(features.get("udp_ratio"), Some(0.05));
    assert!((features.packet_rate() - 1000.0 / 60.0).abs() < 1e-9);
}

#[test]
fn test_cluster_model_flags_syn_flood() {
    let model = fitted_model();
    let extractor = FeatureExtractor::default();

    let attack = model.assess(extractor.extract(&syn_flood_window()).as_slice()).unwrap();
    assert!(attack.verdict.is_attack);
    assert!(attack.distance > model.threshold);

    let normal = model.assess(extractor.extract(&normal_window(3)).as_slice()).unwrap();
    assert!(normal.distance < attack.distance);
}

#[test]
fn test_detectors_share_the_trait() {
    let model = fitted_model();
    let sequence = crate::detector::sequence::tests::constant_model(2, [0.0, 1.0]);
    let detectors: Vec<&dyn Detector> = vec![&model, &sequence];

    let extractor = FeatureExtractor::default();
    let window = vec![
        extractor.extract(&normal_window(1)),
        extractor.extract(&syn_flood_window()),
    ];
    for detector in detectors {
        let verdict = detector.predict_sequence(&window).unwrap();
        assert!(verdict.is_attack, "{} missed the flood", detector.name());
        assert!((0.0..=1.0).contains(&verdict.confidence));
    }
}

#[test]
fn test_pipeline_detects_flood_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cluster_path = dir.path().join("cluster_model.json");
    save_model(&fitted_model(), &cluster_path).unwrap();

    let detection = DetectionConfig {
        window_packets: 1000,
        sequence_model: None,
        ..DetectionConfig::default()
    };
    let mut pipeline = DetectionPipeline::new(detection, 2000).unwrap();
    pipeline.load_models(&cluster_path, None).unwrap();

    let results = Arc::new(Mutex::new(Vec::new()));
    {
        let results = Arc::clone(&results);
        pipeline.on_detection(move |result| results.lock().push(result.clone()));
    }

    let script: Vec<Step> = syn_flood_window().into_iter().map(Step::Packet).collect();
    let cfg = CaptureConfig {
        queue_capacity: 2000,
        ..fast_config(3)
    };
    pipeline
        .start_with_source(scripted_opener(script), CaptureFilter::parse("ip").unwrap(), &cfg)
        .unwrap();

    assert!(wait_for(|| results.lock().len() == 1));
    pipeline.stop();

    let results = results.lock();
    let result = &results[0];
    assert!(result.is_attack);
    assert_eq!(result.packet_count, 1000);
    assert!((result.features.syn_ratio() - 0.947).abs() < 1e-3);
    assert!(result.sequence.is_none());
    assert_eq!(pipeline.status().attacks_detected, 1);
    assert_eq!(pipeline.status().packets_dropped, 0);
}

#[test]
fn test_next_window_after_reload_uses_new_model() {
    let dir = tempfile::tempdir().unwrap();
    let first_path = dir.path().join("first.json");
    let second_path = dir.path().join("second.json");
    let first = fitted_model();
    let mut second = first.clone();
    second.centers.mapv_inplace(|c| c + 0.5);
    second.threshold = 1e6;
    second.distance_scale = 2e6;
    save_model(&first, &first_path).unwrap();
    save_model(&second, &second_path).unwrap();

    let flood = FeatureExtractor::default().extract(&syn_flood_window());
    let pipeline = DetectionPipeline::new(DetectionConfig::default(), 16).unwrap();
    let mut ensemble = EnsembleClassifier::new(DetectionConfig::default().seq_length);

    pipeline.load_models(&first_path, None).unwrap();
    let result = ensemble.classify(flood, 1000, &pipeline.registry().snapshot()).unwrap();
    assert!(result.is_attack);
    assert_eq!(result.cluster, first.assess(flood.as_slice()).unwrap());

    pipeline.load_models(&second_path, None).unwrap();
    let snapshot = pipeline.registry().snapshot();
    assert_eq!(snapshot.generation, 2);
    assert_eq!(snapshot.cluster.as_ref(), Some(&second));
    assert_eq!(pipeline.status().model_generation, 2);

    let result = ensemble.classify(flood, 1000, &snapshot).unwrap();
    let expected = second.assess(flood.as_slice()).unwrap();
    assert_eq!(result.cluster, expected);
    assert_ne!(result.cluster.distance, first.assess(flood.as_slice()).unwrap().distance);
    assert!(!result.is_attack);
}

#[test]
fn test_reload_replaces_models_atomically() {
    let dir = tempfile::tempdir().unwrap();
    let cluster_path = dir.path().join("cluster_model.json");
    let broken_path = dir.path().join("broken.json");
    let model = fitted_model();
    save_model(&model, &cluster_path).unwrap();
    std::fs::write(&broken_path, b"[1, 2, 3]").unwrap();

    let pipeline = DetectionPipeline::new(DetectionConfig::default(), 16).unwrap();
    pipeline.load_models(&cluster_path, None).unwrap();
    let before = pipeline.registry().snapshot();

    let err = pipeline.load_models(&broken_path, None).unwrap_err();
    assert!(matches!(err, DetectorError::ModelLoadFailure { .. }));

    let after = pipeline.registry().snapshot();
    assert_eq!(after.generation, before.generation);
    assert_eq!(after.cluster.as_ref(), Some(&model));
    assert_eq!(pipeline.status().model_generation, 1);
}
