use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use log::{error, info};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::process::ExitCode;

use sdm2pvoutput::clock::SystemClock;
use sdm2pvoutput::config::Config;
use sdm2pvoutput::meter::Meter;
use sdm2pvoutput::modbus::{RegisterReader, RtuClient};
use sdm2pvoutput::probe;
use sdm2pvoutput::pvoutput::{PvOutput, UreqTransport};
use sdm2pvoutput::scheduler::Scheduler;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match Config::try_parse() {
        Ok(config) => config,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::from(1);
    }

    if let Err(e) = watch_signals() {
        error!("Failed to install signal handlers: {:#}", e);
        return ExitCode::from(1);
    }

    info!("Starting sdm2pvoutput");
    let client = match open_client(&config) {
        Ok(client) => client,
        Err(e) => {
            error!("Could not initialize meter: {:#}", e);
            return ExitCode::from(1);
        }
    };
    let mut meter = Meter::new(client, config.address);

    if config.dump {
        return match dump(&mut meter) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Failed to dump readings: {:#}", e);
                ExitCode::from(1)
            }
        };
    }

    // Validated above.
    let Ok(window) = config.window() else {
        return ExitCode::from(1);
    };
    let clock = SystemClock::new(config.timezone);
    let uploader = PvOutput::new(
        UreqTransport::new(),
        &clock,
        config.api_key.clone(),
        Some(config.system_id.clone()),
    );
    Scheduler::new(meter, uploader, &clock, window, config.report_consumption).run()
}

fn open_client(config: &Config) -> Result<RtuClient<Box<dyn serialport::SerialPort>>> {
    let settings = config.serial_settings();
    match &config.port {
        Some(path) => {
            info!("Using specified port: {}", path);
            RtuClient::open(path, &settings)
        }
        None => {
            info!("No port specified, probing for meter {} ...", config.address);
            let result = probe::find_meter_port(&settings, config.address)?;
            info!("Using probed port: {}", result.path);
            Ok(result.client)
        }
    }
}

/// Exit cleanly on SIGINT/SIGTERM. The main thread only ever blocks in
/// reads, uploads or sleeps, so nothing is left half done.
fn watch_signals() -> Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM]).context("Failed to register signals")?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("Exiting by user request (signal {})", signal);
            std::process::exit(0);
        }
    });
    Ok(())
}

fn dump<R: RegisterReader>(meter: &mut Meter<R>) -> Result<()> {
    let json = serde_json::to_string_pretty(&meter.dump()).context("Failed to serialize readings")?;
    println!("{}", json);
    Ok(())
}
