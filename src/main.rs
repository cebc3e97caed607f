use std::fs::File;
use std::io::{self, Write};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use pnet::datalink;

use ddos_sentinel::{
    AppConfig, DetectionPipeline, DetectionResult, DetectorError, Result, FEATURE_NAMES,
};

fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref())?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.as_str()),
    )
    .init();

    // Handle Ctrl+C gracefully
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || {
            info!("Ctrl+C received, stopping capture...");
            running.store(false, Ordering::SeqCst);
        })?;
    }

    let mut pipeline =
        DetectionPipeline::new(config.detection.clone(), config.capture.queue_capacity)?;

    info!("Loading trained models...");
    let cluster_path = config.detection.cluster_model_path();
    let sequence_path = config.detection.sequence_model_path();
    pipeline.load_models(&cluster_path, sequence_path.as_deref())?;
    log_feature_importance(&pipeline);

    if let Some(csv_path) = &config.output.csv_path {
        attach_csv_sink(&pipeline, csv_path)?;
        info!("Writing detections to {}", csv_path.display());
    }
    attach_alert_log(&pipeline, config.output.alert_confidence);

    let interface = match &config.capture.interface {
        Some(name) => name.clone(),
        None => select_interface()?,
    };
    pipeline.start(&interface, &config.capture.filter, &config.capture)?;
    info!("Capturing on {}... Press Ctrl+C to stop", interface);

    let status_interval = Duration::from_secs(config.output.status_interval_secs.max(1));
    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) && pipeline.is_running() {
        thread::sleep(Duration::from_millis(200));
        if last_status.elapsed() >= status_interval {
            let status = pipeline.status();
            info!(
                "📊 {:?}: {} captured, {} filtered, queue {}/{}, {} dropped, {} windows, {} attacks, {} failed, {} undelivered",
                status.capture.state,
                status.capture.packets_captured,
                status.capture.packets_filtered,
                status.queue_depth,
                status.queue_capacity,
                status.packets_dropped,
                status.windows_processed,
                status.attacks_detected,
                status.prediction_failures,
                status.results_dropped
            );
            last_status = Instant::now();
        }
    }

    let fatal = pipeline.fatal_error();
    pipeline.stop();
    match fatal {
        Some(e) => {
            error!("Capture stopped after repeated faults");
            Err(e)
        }
        None => {
            info!("Capture stopped. Exiting.");
            Ok(())
        }
    }
}

fn log_feature_importance(pipeline: &DetectionPipeline) {
    let models = pipeline.registry().snapshot();
    let Some(cluster) = &models.cluster else {
        return;
    };
    let mut ranked = cluster.feature_importance();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    let top: Vec<String> = ranked
        .iter()
        .take(5)
        .map(|(name, weight)| format!("{} {:.3}", name, weight))
        .collect();
    info!("Most weighted features: {}", top.join(", "));
}

/// Lists the interfaces and asks which one to capture on.
fn select_interface() -> Result<String> {
    let interfaces = datalink::interfaces();
    println!("Available Network Interfaces:");
    for (i, iface) in interfaces.iter().enumerate() {
        let ips: Vec<String> = iface
            .ips
            .iter()
            .filter_map(|network| match network.ip() {
                IpAddr::V4(ipv4) => Some(ipv4.to_string()),
                IpAddr::V6(_) => None,
            })
            .collect();
        if ips.is_empty() {
            println!("[{}] {} - IPs: No IPv4 assigned", i, iface.name);
        } else {
            println!("[{}] {} - IPs: {}", i, iface.name, ips.join(", "));
        }
    }

    print!("Enter interface index to capture on: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let index: usize = input
        .trim()
        .parse()
        .map_err(|_| DetectorError::Config(format!("not an interface index: '{}'", input.trim())))?;

    interfaces
        .get(index)
        .map(|iface| iface.name.clone())
        .ok_or_else(|| DetectorError::Config(format!("invalid interface index {}", index)))
}

/// Appends one CSV row per classified window.
fn attach_csv_sink(pipeline: &DetectionPipeline, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_writer(File::create(path)?);
    let mut header = vec![
        "timestamp",
        "is_attack",
        "confidence",
        "packet_count",
        "nearest_cluster",
        "cluster_distance",
        "sequence_confidence",
    ];
    header.extend(FEATURE_NAMES);
    writer.write_record(&header)?;
    writer.flush()?;

    let writer = Mutex::new(writer);
    pipeline.on_detection(move |result| {
        let mut writer = writer.lock();
        let written = writer
            .write_record(csv_row(result))
            .and_then(|_| writer.flush().map_err(csv::Error::from));
        if let Err(e) = written {
            warn!("Failed to write detection row: {}", e);
        }
    });
    Ok(())
}

fn csv_row(result: &DetectionResult) -> Vec<String> {
    let mut row = vec![
        result.timestamp.to_rfc3339(),
        result.is_attack.to_string(),
        format!("{:.4}", result.confidence),
        result.packet_count.to_string(),
        result.cluster.nearest_cluster.to_string(),
        format!("{:.6}", result.cluster.distance),
        result
            .sequence
            .map(|v| format!("{:.4}", v.confidence))
            .unwrap_or_default(),
    ];
    row.extend(result.features.as_slice().iter().map(|v| format!("{:.6}", v)));
    row
}

fn attach_alert_log(pipeline: &DetectionPipeline, alert_confidence: f64) {
    pipeline.on_detection(move |result| {
        if result.is_attack && result.confidence >= alert_confidence {
            warn!(
                "🚨 DDoS ALERT: confidence {:.2}, {} packets, {:.1} pkt/s, SYN ratio {:.3}",
                result.confidence,
                result.packet_count,
                result.features.packet_rate(),
                result.features.syn_ratio()
            );
        } else if result.is_attack {
            info!(
                "Suspicious window below alert confidence ({:.2}): {} packets",
                result.confidence, result.packet_count
            );
        } else {
            debug!(
                "Normal window: {} packets, confidence {:.2}",
                result.packet_count, result.confidence
            );
        }
    });
}
