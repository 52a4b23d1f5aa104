//! Command-line runner
//!
//! Scan for sensors, queue up to `max_devices`, report battery, stream the
//! configured payload and optionally reset heading, until Ctrl-C. Recorded
//! exports are processed offline by [`process_recordings`].

use crate::domain::events::EventSink;
use crate::domain::models::{AppEvent, DeviceIdentity, MessageSeverity, PayloadType};
use crate::domain::recording;
use crate::domain::settings::{Settings, SettingsService};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::session::SessionConfig;
use crate::infrastructure::bluetooth::transport::GattTransport;
use crate::infrastructure::bluetooth::SessionRegistry;
use anyhow::Result;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// What the console does with one event.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Status(MessageSeverity, String),
    Sample(String),
}

pub fn render(event: &AppEvent) -> Option<Output> {
    match event {
        AppEvent::Notify(status) => Some(Output::Status(status.severity, status.message.clone())),
        AppEvent::Stream(line) => Some(Output::Sample(line.clone())),
        AppEvent::JointAngle(reading) => {
            Some(Output::Sample(protocol::format_joint_angle(reading)))
        }
        AppEvent::DeviceFound(identity) => Some(Output::Status(
            MessageSeverity::Info,
            format!("[info] Found {} ({})", identity, identity.transport_id()),
        )),
        AppEvent::SessionState(device, state) => Some(Output::Status(
            MessageSeverity::Info,
            format!("[info] {} is now {:?}", device, state),
        )),
    }
}

/// Status text goes to the log, samples to stdout. Returns when every sender is gone.
pub async fn consume_events(mut events: mpsc::UnboundedReceiver<AppEvent>) {
    while let Some(event) = events.recv().await {
        match render(&event) {
            Some(Output::Status(MessageSeverity::Error, text)) => error!("{}", text),
            Some(Output::Status(MessageSeverity::Warning, text)) => warn!("{}", text),
            Some(Output::Status(_, text)) => info!("{}", text),
            Some(Output::Sample(line)) => println!("{}", line),
            None => {}
        }
    }
}

/// Streaming parameters taken from settings.
#[derive(Debug, Clone)]
pub struct StreamPlan {
    pub payload_type: PayloadType,
    pub reset_heading_after: Option<Duration>,
}

impl From<&Settings> for StreamPlan {
    fn from(settings: &Settings) -> Self {
        Self {
            payload_type: settings.payload_type,
            reset_heading_after: settings.reset_heading_after_secs.map(Duration::from_secs),
        }
    }
}

/// Battery, stream, optional heading reset, then stop once `shutdown` resolves.
pub async fn stream_until<F>(
    registry: &mut SessionRegistry,
    plan: &StreamPlan,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    registry.subscribe_battery_all().await?;
    let streaming = registry.start_streaming_all(plan.payload_type).await?;
    if streaming == 0 {
        anyhow::bail!("No device started streaming");
    }
    info!("{} of {} devices streaming {:?}", streaming, registry.len(), plan.payload_type);

    tokio::pin!(shutdown);
    if let Some(delay) = plan.reset_heading_after {
        tokio::select! {
            _ = &mut shutdown => {
                registry.stop_streaming_all().await?;
                return Ok(());
            }
            _ = tokio::time::sleep(delay) => {
                registry.reset_heading_all().await?;
            }
        }
    }

    shutdown.await;
    registry.stop_streaming_all().await?;
    Ok(())
}

pub async fn run(settings: &mut SettingsService) -> Result<()> {
    if !settings.path().exists() {
        settings.save()?;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let consumer = tokio::spawn(consume_events(rx));
    let events = EventSink::new(tx.clone());

    let mut registry = SessionRegistry::new(tx.clone(), SessionConfig::from(settings.get()));
    let plan = StreamPlan::from(settings.get());

    let result = async {
        let devices = open_devices(settings.get(), &events).await?;
        if devices.is_empty() {
            anyhow::bail!("No {} found", settings.get().target_device_name);
        }
        for (identity, transport) in devices {
            settings.add_known_device(identity.transport_id())?;
            registry.queue(identity, transport).await?;
        }

        stream_until(&mut registry, &plan, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Cannot listen for Ctrl-C: {}", e);
            }
            info!("Stopping...");
        })
        .await
    }
    .await;

    registry.shutdown().await;
    drop(events);
    drop(tx);
    let _ = consumer.await;
    result
}

/// Join two CSV exports offline and write the combined joint-angle file.
pub fn process_recordings(first: &Path, second: &Path, output: Option<&Path>) -> Result<()> {
    if first.parent() != second.parent() {
        warn!("Files are from different directories.");
    }
    let saved_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let summary = recording::process(first, second, output, &saved_at)?;

    info!(
        "Parsed {} and {} samples, start offset {}",
        summary.first_samples, summary.second_samples, summary.start_offset
    );
    if summary.joined_rows == 0 {
        warn!("No shared SampleTimeFine, recordings are not synced");
    }
    info!(
        "{} joint angles written to {}",
        summary.joined_rows,
        summary.output.display()
    );
    Ok(())
}

#[cfg(windows)]
async fn open_devices(
    settings: &Settings,
    events: &EventSink,
) -> Result<Vec<(DeviceIdentity, Arc<dyn GattTransport>)>> {
    use crate::infrastructure::bluetooth::connection::WinRtTransport;
    use crate::infrastructure::bluetooth::scanner::BleScanner;

    let (scan_tx, mut scan_rx) = mpsc::unbounded_channel();
    let mut scanner = BleScanner::new(EventSink::new(scan_tx), &settings.target_device_name);
    scanner.start()?;

    let deadline = tokio::time::sleep(Duration::from_secs(settings.scan_duration_secs));
    tokio::pin!(deadline);
    let mut found: Vec<DeviceIdentity> = Vec::new();
    while found.len() < settings.max_devices {
        tokio::select! {
            _ = &mut deadline => break,
            event = scan_rx.recv() => match event {
                Some(AppEvent::DeviceFound(identity)) => {
                    events.send(AppEvent::DeviceFound(identity.clone()));
                    found.push(identity);
                }
                Some(other) => events.send(other),
                None => break,
            }
        }
    }
    scanner.stop()?;

    let mut opened: Vec<(DeviceIdentity, Arc<dyn GattTransport>)> = Vec::new();
    for identity in found {
        match WinRtTransport::open(identity.transport_id()).await {
            Ok(transport) => {
                opened.push((identity, Arc::new(transport) as Arc<dyn GattTransport>))
            }
            Err(e) => events.error(format!("[err] Cannot open {}: {}", identity, e)),
        }
    }
    Ok(opened)
}

#[cfg(not(windows))]
async fn open_devices(
    _settings: &Settings,
    _events: &EventSink,
) -> Result<Vec<(DeviceIdentity, Arc<dyn GattTransport>)>> {
    anyhow::bail!("Bluetooth LE access is only implemented for Windows")
}
