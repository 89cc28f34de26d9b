use anyhow::{bail, Context, Result};
use log::{debug, info, warn};

use crate::meter::Quantity;
use crate::modbus::{RegisterReader, RtuClient, SerialSettings};

/// Result of a successful probe: the port path and an open client on it.
pub struct ProbeResult {
    pub path: String,
    pub client: RtuClient<Box<dyn serialport::SerialPort>>,
}

/// Probe a single port by reading the voltage register from the device.
/// Returns the open client when the device answers with a plausible float.
fn probe_port(path: &str, settings: &SerialSettings, address: u8) -> Result<Option<ProbeResult>> {
    debug!("Probing port {}", path);
    let mut client = RtuClient::open(path, settings)?;

    match client.read(address, Quantity::Voltage.register()) {
        Ok(voltage) if voltage.is_finite() => {
            info!("Found meter {} on port {} ({} V)", address, path, voltage);
            Ok(Some(ProbeResult {
                path: path.to_string(),
                client,
            }))
        }
        Ok(voltage) => {
            debug!("Port {} answered with {} (not a meter)", path, voltage);
            Ok(None)
        }
        Err(e) => {
            debug!("Port {} did not answer: {}", path, e);
            Ok(None)
        }
    }
}

/// USB serial adapters among the enumerated ports, in a stable order.
fn usb_port_names(ports: &[serialport::SerialPortInfo]) -> Vec<&str> {
    let mut names: Vec<&str> = ports
        .iter()
        .map(|port| port.port_name.as_str())
        .filter(|name| name.contains("ttyUSB"))
        .collect();
    names.sort_unstable();
    names
}

/// Try every USB serial adapter in turn and keep the first one where the
/// meter at `address` answers.
pub fn find_meter_port(settings: &SerialSettings, address: u8) -> Result<ProbeResult> {
    let ports = serialport::available_ports().context("Failed to enumerate serial ports")?;
    let candidates = usb_port_names(&ports);
    if candidates.is_empty() {
        bail!("No /dev/ttyUSB* ports found");
    }
    info!("Probing {} for meter {}", candidates.join(", "), address);

    candidates
        .iter()
        .find_map(|path| match probe_port(path, settings, address) {
            Ok(found) => found,
            Err(e) => {
                warn!("Could not probe {}: {:#}", path, e);
                None
            }
        })
        .with_context(|| {
            format!(
                "Meter {} did not answer on {}",
                address,
                candidates.join(", ")
            )
        })
}
