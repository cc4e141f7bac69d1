//! Per-printer MQTT telemetry session and the registry that owns one per
//! printer.
//!
//! Each printer gets a dedicated task driving an `rumqttc` event loop over
//! a TLS session with a custom certificate verifier (Bambu printers present
//! self-signed certs), bridged to the rest of the process through a
//! command channel and a shared state snapshot.

use anyhow::Result;
use log::{debug, info, warn};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};

use crate::models::PrintParams;
use crate::state::{PrinterState, StateSnapshot, TelemetryUpdate};

const TELEMETRY_PORT: u16 = 8883;
const MQTT_PRINCIPAL: &str = "bblp";

#[derive(Debug)]
enum Command {
    PublishPrint {
        source_filename: String,
        md5: String,
        params: PrintParams,
        reply: tokio::sync::oneshot::Sender<bool>,
    },
}

/// Handle to a running Telemetry Client task. Cloneable; drop all clones
/// to let the task's command channel close and the task exit.
#[derive(Clone)]
pub struct TelemetryClient {
    state: Arc<PrinterState>,
    commands: mpsc::Sender<Command>,
}

impl TelemetryClient {
    pub fn state(&self) -> &PrinterState {
        &self.state
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.state.snapshot()
    }

    /// Publishes the start-print command. Returns `false` without
    /// attempting anything if the session is not connected.
    pub async fn publish_print(
        &self,
        source_filename: &str,
        md5: &str,
        params: PrintParams,
    ) -> bool {
        if !self.state.snapshot().connected {
            return false;
        }

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let command = Command::PublishPrint {
            source_filename: source_filename.to_string(),
            md5: md5.to_string(),
            params,
            reply: reply_tx,
        };

        if self.commands.send(command).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}

#[derive(Debug, Deserialize, Default)]
struct ReportFrame {
    #[serde(default)]
    print: Option<PrintSubobject>,
}

#[derive(Debug, Deserialize, Default)]
struct PrintSubobject {
    g_st: Option<i64>,
    print_error: Option<i64>,
    mc_percent: Option<i64>,
    nozzle_temper: Option<f64>,
    bed_temper: Option<f64>,
}

impl From<PrintSubobject> for TelemetryUpdate {
    fn from(p: PrintSubobject) -> Self {
        TelemetryUpdate {
            global_status: p.g_st,
            error_code: p.print_error,
            progress_percent: p.mc_percent,
            nozzle_temperature: p.nozzle_temper,
            bed_temperature: p.bed_temper,
        }
    }
}

fn tls_transport() -> Transport {
    let tls_config = TlsConfiguration::Rustls(Arc::new(crate::tls::insecure_client_config()));
    Transport::tls_with_config(tls_config)
}

/// Spawns the task driving one printer's MQTT session, auto-reconnecting
/// on error with a short fixed backoff (rumqttc handles in-session
/// keepalive/reconnect; this loop only restarts a fully-dead event loop).
fn spawn(serial: String, host: String, access_code: String, cooldown_secs: u64) -> TelemetryClient {
    let state = Arc::new(PrinterState::with_cooldown_secs(cooldown_secs));
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(16);

    let task_state = state.clone();
    tokio::spawn(async move {
        loop {
            let mut options = MqttOptions::new(
                format!("bambu-batch-{serial}"),
                host.clone(),
                TELEMETRY_PORT,
            );
            options.set_credentials(MQTT_PRINCIPAL, access_code.clone());
            options.set_transport(tls_transport());
            options.set_keep_alive(Duration::from_secs(10));
            // Bambu report frames can exceed the rumqttc default packet cap.
            options.set_max_packet_size(64 * 1024, 64 * 1024);

            let (client, mut eventloop) = AsyncClient::new(options, 16);
            let report_topic = format!("device/{serial}/report");
            let request_topic = format!("device/{serial}/request");

            info!("[{serial}]: connecting to {host}:{TELEMETRY_PORT}");

            loop {
                tokio::select! {
                    event = eventloop.poll() => {
                        match event {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                task_state.set_connected(true);
                                info!("[{serial}]: connected");
                                if let Err(err) = client.subscribe(&report_topic, QoS::AtMostOnce).await {
                                    warn!("[{serial}]: subscribe failed: {err}");
                                }
                                let pushall = serde_json::json!({
                                    "pushing": {"sequence_id": "1", "command": "pushall"}
                                });
                                if let Err(err) = client
                                    .publish(&request_topic, QoS::AtMostOnce, false, pushall.to_string())
                                    .await
                                {
                                    warn!("[{serial}]: pushall publish failed: {err}");
                                }
                            }
                            Ok(Event::Incoming(Packet::Publish(publish))) => {
                                match serde_json::from_slice::<ReportFrame>(&publish.payload) {
                                    Ok(frame) => {
                                        if let Some(print) = frame.print {
                                            let changed = task_state.update(print.into());
                                            if changed {
                                                debug!("[{serial}]: state changed");
                                            }
                                        }
                                    }
                                    Err(err) => {
                                        warn!("[{serial}]: malformed report frame: {err}");
                                    }
                                }
                            }
                            Ok(Event::Incoming(Packet::Disconnect)) => {
                                task_state.set_connected(false);
                                warn!("[{serial}]: disconnected");
                            }
                            Ok(_) => {}
                            Err(err) => {
                                task_state.set_connected(false);
                                warn!("[{serial}]: connection error: {err}, reconnecting");
                                tokio::time::sleep(Duration::from_secs(2)).await;
                                break;
                            }
                        }
                    }
                    command = cmd_rx.recv() => {
                        let Some(command) = command else {
                            info!("[{serial}]: command channel closed, stopping session");
                            return;
                        };
                        match command {
                            Command::PublishPrint { source_filename, md5, params, reply } => {
                                let ok = do_publish_print(
                                    &client,
                                    &request_topic,
                                    &source_filename,
                                    &md5,
                                    params,
                                )
                                .await;
                                let _ = reply.send(ok);
                            }
                        }
                    }
                }
            }
        }
    });

    TelemetryClient {
        state,
        commands: cmd_tx,
    }
}

async fn do_publish_print(
    client: &AsyncClient,
    request_topic: &str,
    source_filename: &str,
    md5: &str,
    params: PrintParams,
) -> bool {
    let sequence_id = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let body = serde_json::json!({
        "print": {
            "sequence_id": sequence_id.to_string(),
            "command": "project_file",
            "param": "Metadata/plate_1.gcode",
            "project_id": "0",
            "profile_id": "0",
            "task_id": "0",
            "subtask_id": "0",
            "subtask_name": "",
            "file": source_filename,
            "url": format!("file:///sdcard/{source_filename}"),
            "md5": md5,
            "timelapse": params.timelapse,
            "bed_levelling": params.bed_levelling,
            "flow_cali": params.flow_calibration,
            "vibration_cali": true,
            "layer_inspect": true,
            "use_ams": params.use_material_system,
        }
    });

    match client
        .publish(request_topic, QoS::AtLeastOnce, false, body.to_string())
        .await
    {
        Ok(()) => true,
        Err(err) => {
            warn!("publish_print failed: {err}");
            false
        }
    }
}

/// Registry of live Telemetry Client sessions, one per printer serial.
pub struct PrinterManager {
    clients: RwLock<HashMap<String, TelemetryClient>>,
    cooldown_secs: u64,
}

impl PrinterManager {
    pub fn new(cooldown_secs: u64) -> Self {
        PrinterManager {
            clients: RwLock::new(HashMap::new()),
            cooldown_secs,
        }
    }

    /// Idempotent: a second call for an already-managed serial is a no-op.
    pub async fn add_printer(&self, serial: &str, host: &str, access_code: &str) {
        if self.clients.read().await.contains_key(serial) {
            return;
        }
        let mut clients = self.clients.write().await;
        if clients.contains_key(serial) {
            return;
        }
        let client = spawn(serial.to_string(), host.to_string(), access_code.to_string(), self.cooldown_secs);
        clients.insert(serial.to_string(), client);
    }

    /// Tears down and forgets a printer's session (used on printer deletion
    /// — eager teardown per the Open Question resolution in DESIGN.md).
    pub async fn remove_printer(&self, serial: &str) {
        self.clients.write().await.remove(serial);
    }

    pub async fn get(&self, serial: &str) -> Option<TelemetryClient> {
        self.clients.read().await.get(serial).cloned()
    }

    pub async fn snapshot_all(&self) -> HashMap<String, StateSnapshot> {
        self.clients
            .read()
            .await
            .iter()
            .map(|(serial, client)| (serial.clone(), client.snapshot()))
            .collect()
    }
}

/// Never-fails command send wrapper used by the Dispatcher worker pool.
pub async fn publish_print(
    manager: &PrinterManager,
    serial: &str,
    source_filename: &str,
    md5: &str,
    params: PrintParams,
) -> Result<bool> {
    let Some(client) = manager.get(serial).await else {
        anyhow::bail!("no telemetry session for printer serial {serial}");
    };
    Ok(client.publish_print(source_filename, md5, params).await)
}
