use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};
use vitals_bridge::domain::events::{AppEvent, EventBus};
use vitals_bridge::domain::models::DeviceAddress;
use vitals_bridge::domain::settings::{Settings, SettingsService};
use vitals_bridge::infrastructure::bluetooth::file_transfer::decode_ecg_recording;
use vitals_bridge::infrastructure::bluetooth::simulated::SimulatedTransport;
use vitals_bridge::infrastructure::bluetooth::transport::SharedTransport;
use vitals_bridge::infrastructure::logging;
use vitals_bridge::{BridgeCommand, BridgeRequest, CommandOutput, MonitorService};

const HELP: &str = "commands: scan | stop-scan | connect <AA:BB:CC:DD:EE:FF> | disconnect | \
bp | ecg | stop | stream | stop-stream | files | read <name> | ecg-file <name> | quit \
(or a JSON command object)";

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Command(BridgeCommand),
    /// Read a stored ECG file and print its decoded header
    DecodeEcg(String),
    Help,
    Quit,
}

fn parse_input(line: &str) -> anyhow::Result<Input> {
    if line.starts_with('{') {
        return Ok(Input::Command(serde_json::from_str(line)?));
    }

    let mut parts = line.splitn(2, char::is_whitespace);
    let verb = parts.next().unwrap_or_default().to_lowercase();
    let arg = parts.next().map(str::trim).filter(|a| !a.is_empty());
    let need_arg = || arg.ok_or_else(|| anyhow::anyhow!("'{}' needs an argument", verb));

    let command = match verb.as_str() {
        "scan" => BridgeCommand::StartScan,
        "stop-scan" => BridgeCommand::StopScan,
        "connect" => {
            let address: DeviceAddress = need_arg()?.parse().map_err(anyhow::Error::msg)?;
            BridgeCommand::Connect(address)
        }
        "disconnect" => BridgeCommand::Disconnect,
        "bp" => BridgeCommand::StartBpMeasurement,
        "ecg" => BridgeCommand::StartEcgMeasurement,
        "stop" => BridgeCommand::StopMeasurement,
        "stream" => BridgeCommand::StartStream,
        "stop-stream" => BridgeCommand::StopStream,
        "files" => BridgeCommand::ListFiles,
        "read" => BridgeCommand::ReadFile(need_arg()?.to_string()),
        "ecg-file" => return Ok(Input::DecodeEcg(need_arg()?.to_string())),
        "help" => return Ok(Input::Help),
        "quit" | "exit" => return Ok(Input::Quit),
        other => anyhow::bail!("unknown command '{}'", other),
    };
    Ok(Input::Command(command))
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Failed to serialize output: {}", e),
    }
}

fn forward_events<T>(mut rx: broadcast::Receiver<T>, wrap: fn(T) -> AppEvent)
where
    T: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_json(&wrap(event)),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event printer lagged, {} events skipped", n)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn request(
    tx: &mpsc::UnboundedSender<BridgeRequest>,
    command: BridgeCommand,
) -> anyhow::Result<vitals_bridge::Result<CommandOutput>> {
    let (req, reply) = BridgeRequest::new(command);
    tx.send(req)
        .map_err(|_| anyhow::anyhow!("service stopped"))?;
    Ok(reply.await?)
}

fn print_reply(result: vitals_bridge::Result<CommandOutput>) {
    match result {
        Ok(CommandOutput::FileData(bytes)) => {
            print_json(&serde_json::json!({ "reply": "FileData", "length": bytes.len() }))
        }
        Ok(output) => print_json(&serde_json::json!({ "reply": output })),
        Err(e) => print_json(&serde_json::json!({ "error": e.to_string() })),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new().unwrap_or_else(|e| {
        eprintln!("Failed to load settings ({}), using defaults", e);
        SettingsService::in_memory(Settings::default())
    });

    let _logging_guard = logging::init_logger(&settings_service.get().log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting vitals bridge with the simulated monitor");
    eprintln!("{}", HELP);

    let settings = Arc::new(Mutex::new(settings_service));
    let bus = EventBus::new();
    forward_events(bus.subscribe_device(), AppEvent::Device);
    forward_events(bus.subscribe_bp(), AppEvent::Bp);
    forward_events(bus.subscribe_ecg(), AppEvent::Ecg);
    forward_events(bus.subscribe_battery(), AppEvent::Battery);

    let transport: SharedTransport = Arc::new(SimulatedTransport::demo());
    let service = MonitorService::new(transport, settings, bus)?;
    let (tx, rx) = mpsc::unbounded_channel();
    let service_task = tokio::spawn(service.run(rx));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_input(line) {
            Ok(Input::Command(command)) => print_reply(request(&tx, command).await?),
            Ok(Input::DecodeEcg(name)) => match request(&tx, BridgeCommand::ReadFile(name)).await? {
                Ok(CommandOutput::FileData(bytes)) => match decode_ecg_recording(&bytes) {
                    Ok(recording) => print_json(&serde_json::json!({
                        "reply": "EcgRecording",
                        "version": recording.version,
                        "declared_duration_s": recording.declared_duration_s,
                        "sample_count": recording.samples.len(),
                        "sample_rate": recording.sample_rate,
                    })),
                    Err(e) => print_reply(Err(e)),
                },
                other => print_reply(other),
            },
            Ok(Input::Help) => eprintln!("{}", HELP),
            Ok(Input::Quit) => break,
            Err(e) => eprintln!("{}", e),
        }
    }

    drop(tx);
    service_task.await?;
    info!("Vitals bridge stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_text_commands() {
        assert_eq!(
            parse_input("connect D4:36:39:12:0A:7C").unwrap(),
            Input::Command(BridgeCommand::Connect(DeviceAddress::new(0xD436_3912_0A7C)))
        );
        assert_eq!(
            parse_input("read 20261018083000").unwrap(),
            Input::Command(BridgeCommand::ReadFile("20261018083000".into()))
        );
        assert_eq!(
            parse_input("BP").unwrap(),
            Input::Command(BridgeCommand::StartBpMeasurement)
        );
        assert_eq!(parse_input("quit").unwrap(), Input::Quit);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse_input("connect").is_err());
        assert!(parse_input("connect nonsense").is_err());
        assert!(parse_input("fly").is_err());
    }

    #[test]
    fn test_parse_json_command() {
        assert_eq!(
            parse_input(r#"{"command":"ReadFile","arg":"a"}"#).unwrap(),
            Input::Command(BridgeCommand::ReadFile("a".into()))
        );
    }
}
