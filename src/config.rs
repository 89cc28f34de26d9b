use anyhow::{bail, Result};
use chrono_tz::Tz;
use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::modbus::SerialSettings;
use crate::scheduler::ScheduleWindow;

#[derive(Parser, Debug)]
#[command(
    name = "sdm2pvoutput",
    about = "Eastron SDM meter reader uploading live status to PVOutput"
)]
pub struct Config {
    /// IANA timezone used for the reporting window and upload timestamps
    #[arg(long, env = "SDM_TIMEZONE", value_parser = parse_timezone)]
    pub timezone: Tz,

    /// Serial port path (if omitted, probes all /dev/ttyUSB* ports)
    #[arg(long, env = "SDM_PORT")]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(long, env = "SDM_BAUD_RATE", default_value_t = 9600)]
    pub baud_rate: u32,

    /// Serial parity
    #[arg(long, env = "SDM_PARITY", value_enum, default_value_t = Parity::None)]
    pub parity: Parity,

    /// Serial stop bits
    #[arg(long, env = "SDM_STOP_BITS", default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    pub stop_bits: u8,

    /// Serial read timeout in milliseconds
    #[arg(long, env = "SDM_TIMEOUT_MS", default_value_t = 1000)]
    pub timeout_ms: u64,

    /// Modbus device address of the meter, in hex
    #[arg(long, env = "SDM_ADDRESS", default_value = "01", value_parser = parse_hex_address)]
    pub address: u8,

    /// PVOutput API key
    #[arg(long, env = "PVOUTPUT_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// PVOutput system ID
    #[arg(long, env = "PVOUTPUT_SYSTEM_ID")]
    pub system_id: String,

    /// Hour of the day reporting starts (local time)
    #[arg(long, env = "SDM_START_HOUR", default_value_t = 5)]
    pub start_hour: u32,

    /// Hour of the day reporting stops (local time, exclusive)
    #[arg(long, env = "SDM_STOP_HOUR", default_value_t = 21)]
    pub stop_hour: u32,

    /// Also report imported energy as consumption
    #[arg(long, env = "SDM_REPORT_CONSUMPTION")]
    pub report_consumption: bool,

    /// Read every known register once, print them as JSON and exit
    #[arg(long)]
    pub dump: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Parity {
    None,
    Even,
    Odd,
}

impl Config {
    /// Checks that clap cannot express on its own.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            bail!("PVOutput API key must not be empty");
        }
        if self.system_id.trim().is_empty() {
            bail!("PVOutput system ID must not be empty");
        }
        if self.baud_rate == 0 {
            bail!("Baud rate must be positive");
        }
        self.window()?;
        Ok(())
    }

    pub fn window(&self) -> Result<ScheduleWindow> {
        ScheduleWindow::new(self.start_hour, self.stop_hour)
    }

    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings {
            baud_rate: self.baud_rate,
            parity: match self.parity {
                Parity::None => serialport::Parity::None,
                Parity::Even => serialport::Parity::Even,
                Parity::Odd => serialport::Parity::Odd,
            },
            stop_bits: if self.stop_bits == 2 {
                serialport::StopBits::Two
            } else {
                serialport::StopBits::One
            },
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn parse_timezone(s: &str) -> Result<Tz, String> {
    s.parse::<Tz>().map_err(|e| e.to_string())
}

fn parse_hex_address(s: &str) -> Result<u8, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u8::from_str_radix(digits, 16).map_err(|e| format!("invalid hex device address {:?}: {}", s, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 7] = [
        "sdm2pvoutput",
        "--timezone",
        "Europe/Amsterdam",
        "--api-key",
        "secret",
        "--system-id",
        "1234",
    ];

    fn parse(extra: &[&str]) -> Result<Config, clap::Error> {
        Config::try_parse_from(REQUIRED.iter().chain(extra.iter()))
    }

    #[test]
    fn defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.timezone, chrono_tz::Europe::Amsterdam);
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.parity, Parity::None);
        assert_eq!(config.address, 1);
        assert_eq!(config.start_hour, 5);
        assert_eq!(config.stop_hour, 21);
        assert!(!config.report_consumption);
        assert!(config.validate().is_ok());
        assert_eq!(config.serial_settings().stop_bits, serialport::StopBits::One);
    }

    #[test]
    fn hex_address() {
        assert_eq!(parse(&["--address", "0x0A"]).unwrap().address, 10);
        assert_eq!(parse(&["--address", "1f"]).unwrap().address, 31);
        assert!(parse(&["--address", "zz"]).is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        let args = [
            "sdm2pvoutput",
            "--timezone",
            "Mars/Olympus",
            "--api-key",
            "k",
            "--system-id",
            "1",
        ];
        assert!(Config::try_parse_from(args).is_err());
    }

    #[test]
    fn inverted_window_fails_validation() {
        let config = parse(&["--start-hour", "21", "--stop-hour", "5"]).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn blank_system_id_fails_validation() {
        let mut config = parse(&[]).unwrap();
        config.system_id = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn serial_settings_follow_flags() {
        let config = parse(&["--parity", "even", "--stop-bits", "2", "--timeout-ms", "250"]).unwrap();
        let settings = config.serial_settings();
        assert_eq!(settings.parity, serialport::Parity::Even);
        assert_eq!(settings.stop_bits, serialport::StopBits::Two);
        assert_eq!(settings.timeout, Duration::from_millis(250));
        assert!(parse(&["--stop-bits", "3"]).is_err());
    }
}
