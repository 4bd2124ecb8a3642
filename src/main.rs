//! plategate - license-plate recognition access and parking control core
//!
//! Consumes plate detections from LPR cameras, decides access against an
//! authorization list, drives the lane barrier with safety interlocks, and
//! manages parking sessions through fee calculation and payment settlement.
//!
//! Module structure:
//! - `domain/` - Core business types (ParkingSession, PlateNumber, Decision)
//! - `io/` - External interfaces (MQTT, payment listener, egress, Prometheus)
//! - `services/` - Business logic (Pipeline, SessionManager, Barrier, Fees)
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use clap::Parser;
use plategate::infra::{Config, Metrics};
use plategate::io::{
    create_egress_channel, start_payment_listener, MqttPublisher, PaymentListenerConfig,
};
use plategate::services::authorization::StaticAuthStore;
use plategate::services::barrier::{create_barrier, SafetyCheck, SensorProbe};
use plategate::services::payment::HttpPaymentProcessor;
use plategate::services::{MemorySessionRepository, Pipeline};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// plategate - automated car park access control
#[derive(Parser, Debug)]
#[command(name = "plategate", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, default_value = "config/dev.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with configurable level via RUST_LOG env var
    // Default: INFO, use RUST_LOG=debug for full event visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!("plategate starting");

    let args = Args::parse();

    // Invalid fee policy or lane topology refuses to start
    let config = Config::from_file(&args.config)?;

    // Start embedded MQTT broker with config
    plategate::infra::broker::start_embedded_broker(&config);

    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        lane_mode = ?config.lane_mode(),
        access_mode = ?config.access_mode(),
        payment_requirement = ?config.payment_requirement(),
        fee_mode = ?config.fee_policy().mode,
        debounce_window_ms = %config.debounce_window_ms(),
        barrier_open_secs = %config.barrier_open_secs(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared components
    let metrics = Arc::new(Metrics::new());

    // Plate authorization list; a missing list still boots (public car
    // parks run without one) but the operator gets a warning
    let auth = match StaticAuthStore::load(config.plates_file()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            warn!(error = %e, "plates_file_unavailable, starting with empty list");
            Arc::new(StaticAuthStore::from_records([]))
        }
    };

    // Create MQTT egress channel and publisher (if enabled)
    let egress_sender = if config.mqtt_egress_enabled() {
        let (egress_sender, egress_rx) = create_egress_channel(1000, config.site_id().to_string());

        // Start MQTT egress publisher
        let publisher = MqttPublisher::new(&config, egress_rx);
        let publisher_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            publisher.run(publisher_shutdown).await;
        });

        // Start metrics egress publisher (separate from logging)
        let metrics_egress = egress_sender.clone();
        let metrics_for_egress = metrics.clone();
        let egress_interval = config.mqtt_egress_metrics_interval_secs();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(egress_interval));
            loop {
                interval.tick().await;
                let summary = metrics_for_egress.report(0);
                metrics_egress.send_metrics(summary);
            }
        });

        Some(egress_sender)
    } else {
        None
    };

    // Barrier controller owns the actuator; it is the only task that
    // touches the relay
    let safety: Option<Arc<dyn SafetyCheck>> = if config.barrier_safety_check() {
        config.barrier_sensor_url().map(|url| {
            Arc::new(SensorProbe::new(url, Duration::from_millis(config.barrier_timeout_ms())))
                as Arc<dyn SafetyCheck>
        })
    } else {
        None
    };
    let (barrier, barrier_controller) =
        create_barrier(&config, safety, metrics.clone(), egress_sender.clone(), 64);
    tokio::spawn(barrier_controller.run());

    // Event channels (bounded for backpressure)
    let (detection_tx, detection_rx) = mpsc::channel(1000);
    let (payment_tx, payment_rx) = mpsc::channel(256);

    // Start MQTT ingest client
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = plategate::io::mqtt::start_mqtt_client(
            &mqtt_config,
            detection_tx,
            mqtt_metrics,
            mqtt_shutdown,
        )
        .await
        {
            tracing::error!(error = %e, "MQTT client error");
        }
    });

    // Start payment notification listener
    let listener_config = PaymentListenerConfig {
        port: config.payment_listener_port(),
        enabled: config.payment_listener_enabled(),
    };
    let listener_metrics = metrics.clone();
    let listener_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            start_payment_listener(listener_config, payment_tx, listener_metrics, listener_shutdown)
                .await
        {
            tracing::error!(error = %e, "Payment listener error");
        }
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_site = config.site_id().to_string();
        let prom_barrier = Some(barrier.clone());
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = plategate::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_site,
                prom_barrier,
                prom_shutdown,
            )
            .await
            {
                tracing::error!(error = %e, "Prometheus metrics server error");
            }
        });
    }

    // Start metrics reporter (lock-free reads with full summary)
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            let summary = metrics_clone.report(0);
            summary.log();
        }
    });

    // Assemble the pipeline
    let repo = Arc::new(MemorySessionRepository::new());
    let payments = Arc::new(HttpPaymentProcessor::new(&config));
    let pipeline = Arc::new(Pipeline::new(
        &config,
        auth,
        repo,
        payments,
        barrier,
        metrics,
        egress_sender,
    ));
    info!("pipeline_ready");

    // Handle shutdown on Ctrl+C
    let shutdown_signal = shutdown_tx;
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_signal.send(true);
    });

    // Run pipeline - consumes detections until the channel closes
    pipeline.run(detection_rx, payment_rx).await;

    info!("plategate shutdown complete");
    Ok(())
}
