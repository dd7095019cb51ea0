//! LSL Relay command line
//!
//! Lists LSL streams, serves them to a visualization backend, or relays
//! them to an MQTT broker with store-and-forward buffering.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lsl_relay::{
    clock::local_clock,
    config::{load_config, Config},
    constants::{DEFAULT_DISCOVERY_INTERVAL, DEFAULT_DISCOVERY_TIMEOUT},
    error::RelayError,
    logging,
    relay::{MetricsCollector, MqttBroker, MqttRelay, ReliabilityManager},
    stream::{ReaderConfig, StreamReader, StreamRegistry},
    sync::{TimeSyncPoints, TimestampSynchronizer},
    transport::{MemoryTransport, SimulatedSource, Transport},
    types::{ChannelFormat, StreamDescriptor},
    viz::{available_backends, create_backend, VisualizationBackend, VizOptions},
};

#[derive(Parser, Debug)]
#[command(name = "lsl-relay")]
#[command(about = "LSL stream tools: visualization and cloud streaming")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Append logs to this file as well as stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Serve synthetic streams instead of the LSL network
    #[arg(long, global = true)]
    simulate: bool,

    /// Seconds to wait for streams during discovery
    #[arg(long, global = true, default_value_t = 1.0)]
    discovery_timeout: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List available LSL streams
    List,

    /// Visualize LSL streams
    Visualize {
        /// Stream names (or uids) to visualize
        #[arg(long, num_args = 1..)]
        streams: Vec<String>,
    },

    /// Stream LSL data to the cloud over MQTT
    Stream {
        /// Stream names (or uids) to stream
        #[arg(long, num_args = 1..)]
        streams: Vec<String>,

        /// Seconds between metrics summaries
        #[arg(long, default_value_t = 10)]
        metrics_interval: u64,
    },
}

/// Transport plus whatever keeps it fed
struct Source {
    transport: Arc<dyn Transport>,
    _simulators: Vec<SimulatedSource>,
}

fn open_source(simulate: bool) -> Result<Source> {
    if simulate {
        let transport = Arc::new(MemoryTransport::new());
        let eeg = transport.add_stream(
            StreamDescriptor::new("SimEEG", "EEG", 8, 250.0, ChannelFormat::Float32)
                .with_uid("sim-eeg-1")
                .with_source_id("lsl-relay-sim"),
        );
        let markers = transport.add_stream(
            StreamDescriptor::new("SimMarkers", "Markers", 1, 1.0, ChannelFormat::String)
                .with_uid("sim-markers-1")
                .with_source_id("lsl-relay-sim"),
        );

        let mut simulators = vec![SimulatedSource::new(eeg), SimulatedSource::new(markers)];
        for simulator in simulators.iter_mut() {
            simulator.start()?;
        }
        tracing::info!("Serving {} simulated streams", simulators.len());
        return Ok(Source {
            transport,
            _simulators: simulators,
        });
    }

    #[cfg(feature = "lsl-support")]
    return Ok(Source {
        transport: Arc::new(lsl_relay::transport::LslTransport::new()),
        _simulators: Vec::new(),
    });

    #[cfg(not(feature = "lsl-support"))]
    bail!("built without the lsl-support feature; rerun with --simulate")
}

/// Discovered streams matching `names` by name or uid, in request order
fn select_streams(discovered: &[StreamDescriptor], names: &[String]) -> Vec<StreamDescriptor> {
    if names.is_empty() {
        return discovered.to_vec();
    }
    names
        .iter()
        .filter_map(|name| {
            let found = discovered.iter().find(|d| d.matches(name)).cloned();
            if found.is_none() {
                tracing::warn!("Stream '{}' not found", name);
            }
            found
        })
        .collect()
}

fn list_streams(registry: &StreamRegistry) {
    println!("Discovering LSL streams...");
    let streams = registry.discover(None, None, None);

    if streams.is_empty() {
        println!("No streams found.");
        return;
    }

    println!("\nFound {} stream(s):\n", streams.len());
    for (i, stream) in streams.iter().enumerate() {
        println!("{}. {}", i + 1, stream.name);
        println!("   Type: {}", stream.stream_type);
        println!("   Channels: {}", stream.channel_count);
        println!("   Sampling Rate: {} Hz", stream.nominal_srate);
        println!("   Format: {}", stream.channel_format);
        println!("   Status: {}", stream.status);
        if let Some(uid) = &stream.uid {
            println!("   UID: {}", uid);
        }
        if let Some(hostname) = &stream.hostname {
            println!("   Host: {}", hostname);
        }
        println!();
    }
}

async fn visualize(config: &Config, registry: Arc<StreamRegistry>, names: Vec<String>) -> Result<()> {
    let names = if names.is_empty() {
        config.visualization.streams.clone()
    } else {
        names
    };

    println!("Discovering streams...");
    let streams = select_streams(&registry.discover(None, None, None), &names);
    if streams.is_empty() {
        println!("No matching streams found.");
        println!("Available backends: {}", available_backends().join(", "));
        return Ok(());
    }

    let base = VizOptions::from(&config.visualization);
    let mut readers = Vec::new();
    let mut backends: Vec<Arc<dyn VisualizationBackend>> = Vec::new();

    for (i, descriptor) in streams.into_iter().enumerate() {
        println!("Setting up visualization for {}...", descriptor.name);

        let mut options = base.clone();
        options.http_port = base.http_port.saturating_add(i as u16);
        let port = options.http_port;

        let backend: Arc<dyn VisualizationBackend> =
            Arc::from(create_backend(&config.visualization.backend, Some(descriptor.clone()), options)?);
        if let Err(e) = backend.start() {
            tracing::error!("Failed to start visualization backend for {}: {}", descriptor.name, e);
            continue;
        }
        println!("  http://{}:{}/", config.visualization.bind_address, port);

        let sink = backend.clone();
        let mut reader = StreamReader::new(
            registry.clone(),
            descriptor.key().to_string(),
            ReaderConfig::default().with_buffer_size(config.visualization.buffer_size),
        )
        .with_callback(move |sample| sink.update(&sample));

        if let Err(e) = reader.start() {
            tracing::error!("Failed to start reader for {}: {}", descriptor.name, e);
            backend.stop();
            continue;
        }
        readers.push(reader);
        backends.push(backend);
    }

    if readers.is_empty() {
        bail!("no stream could be visualized");
    }

    println!("\nVisualization started. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown signal received");

    for reader in readers.iter_mut() {
        reader.stop();
    }
    for backend in &backends {
        backend.stop();
    }
    Ok(())
}

async fn stream_to_cloud(
    config: &Config,
    registry: Arc<StreamRegistry>,
    names: Vec<String>,
    metrics_interval: u64,
) -> Result<()> {
    let Some(mqtt) = config.mqtt() else {
        bail!("cloud streaming is disabled or its MQTT section is missing");
    };

    let metrics = Arc::new(MetricsCollector::new());
    let broker = Arc::new(MqttBroker::new(mqtt.settings()));
    let relay = Arc::new(MqttRelay::with_metrics(broker, mqtt.relay_config(), metrics.clone()));
    relay.add_connection_callback(|connected| {
        if connected {
            tracing::info!("Broker connection up");
        } else {
            tracing::warn!("Broker connection down, buffering samples");
        }
    });

    let reliability = ReliabilityManager::new(config.reliability.policy());
    let connecting = relay.clone();
    tokio::task::spawn_blocking(move || {
        let mut on_retry = |attempt: u32, error: &RelayError| {
            println!("Connection attempt {} failed ({}), retrying...", attempt, error);
        };
        reliability.execute_with_retry(
            || connecting.try_connect(),
            Some(&mut on_retry as &mut dyn FnMut(u32, &RelayError)),
        )
    })
    .await
    .context("connect task panicked")?
    .with_context(|| format!("failed to connect to MQTT broker {}:{}", mqtt.broker, mqtt.port))?;

    let names = if names.is_empty() {
        mqtt.topics.iter().map(|m| m.stream.clone()).collect()
    } else {
        names
    };

    println!("Discovering streams...");
    let streams = select_streams(&registry.discover(None, None, None), &names);
    if streams.is_empty() {
        relay.disconnect();
        println!("No matching streams found.");
        return Ok(());
    }

    if let Err(e) = registry.start_continuous_discovery(DEFAULT_DISCOVERY_INTERVAL) {
        tracing::warn!("Continuous discovery not started: {}", e);
    }

    let mut sync_points = TimeSyncPoints::new();
    sync_points.capture_recording_start();
    for (key, value) in sync_points.to_desc_entries() {
        tracing::debug!("Sync point {} = {}", key, value);
    }

    let synchronizer = Arc::new(TimestampSynchronizer::new());
    let mut readers = Vec::new();

    for descriptor in streams {
        let topic = mqtt.topic_for(&descriptor);
        println!("Streaming {} to {}...", descriptor.name, topic);

        let publisher = relay.clone();
        let latencies = metrics.clone();
        let mut reader = StreamReader::new(registry.clone(), descriptor.key().to_string(), ReaderConfig::default())
            .with_synchronizer(synchronizer.clone())
            .with_callback(move |sample| {
                let source_time = sample
                    .metadata()
                    .and_then(|m| m.corrected_timestamp())
                    .unwrap_or_else(|| sample.timestamp());
                let latency = local_clock() - source_time;
                if latency >= 0.0 {
                    latencies.record_latency(latency);
                }
                publisher.publish(sample, &topic);
            });

        if let Err(e) = reader.start() {
            tracing::error!("Failed to start reader for {}: {}", descriptor.name, e);
            continue;
        }
        readers.push(reader);
    }

    if readers.is_empty() {
        relay.disconnect();
        bail!("no stream could be relayed");
    }

    metrics.start();
    println!("\nStreaming to cloud. Press Ctrl+C to stop.");

    let mut ticker = tokio::time::interval(Duration::from_secs(metrics_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                tracing::info!("Shutdown signal received");
                break;
            }
            _ = ticker.tick() => {
                println!("{}", metrics.summary());
                if relay.buffered_len() > 0 {
                    println!("  Buffered (offline): {}", relay.buffered_len());
                }
            }
        }
    }

    for reader in readers.iter_mut() {
        reader.stop();
    }
    registry.stop_continuous_discovery();
    relay.disconnect();

    println!("\nFinal metrics:");
    println!("{}", metrics.summary());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    logging::init(&level, cli.log_file.as_deref());

    tracing::info!("Starting LSL Relay");

    let source = open_source(cli.simulate)?;
    let timeout = if cli.discovery_timeout.is_finite() && cli.discovery_timeout > 0.0 {
        Duration::from_secs_f64(cli.discovery_timeout)
    } else {
        DEFAULT_DISCOVERY_TIMEOUT
    };
    let registry = Arc::new(StreamRegistry::with_discovery_timeout(source.transport.clone(), timeout));

    let result = match cli.command {
        Command::List => {
            list_streams(&registry);
            Ok(())
        }
        Command::Visualize { streams } => visualize(&config, registry.clone(), streams).await,
        Command::Stream {
            streams,
            metrics_interval,
        } => stream_to_cloud(&config, registry.clone(), streams, metrics_interval).await,
    };

    registry.shutdown_all();
    tracing::info!("LSL Relay stopped");
    result
}
