use anyhow::{bail, Result};
use chrono::Timelike;
use log::{error, info};
use std::time::Duration;

use crate::clock::Clock;
use crate::meter::{Meter, Quantity};
use crate::modbus::{ReadError, RegisterReader};
use crate::pvoutput::{Delivery, PvOutput, StatusRecord, Transport};

/// Reporting cadence, aligned to wall clock minutes.
const TICK_MINUTES: u32 = 5;

/// Daily reporting interval in local hours, `[start, stop)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleWindow {
    start: u32,
    stop: u32,
}

impl ScheduleWindow {
    pub fn new(start: u32, stop: u32) -> Result<Self> {
        if start > 23 {
            bail!("Window start hour {} is not within 0..=23", start);
        }
        if stop > 24 {
            bail!("Window stop hour {} is not within 0..=24", stop);
        }
        if start >= stop {
            bail!("Window start hour {} must be before stop hour {}", start, stop);
        }
        Ok(Self { start, stop })
    }

    pub fn contains(&self, hour: u32) -> bool {
        self.start <= hour && hour < self.stop
    }

    /// Minutes from `hour:minute` until the window opens next, wrapping through midnight.
    pub fn minutes_until_start(&self, hour: u32, minute: u32) -> u32 {
        let hours = if hour >= self.stop {
            self.start + 24 - hour
        } else {
            self.start.saturating_sub(hour)
        };
        (hours * 60).saturating_sub(minute)
    }
}

/// Seconds until the next 5 minute wall clock boundary.
pub fn seconds_until_next_tick(minute: u32, second: u32) -> u64 {
    u64::from(TICK_MINUTES * 60 - (minute % TICK_MINUTES) * 60 - second.min(59))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    ActiveWindow,
    Idle,
}

/// Drives read-and-report inside the window and sleeps outside of it.
pub struct Scheduler<R, T, C> {
    meter: Meter<R>,
    uploader: PvOutput<T, C>,
    clock: C,
    window: ScheduleWindow,
    report_consumption: bool,
}

impl<R, T, C> Scheduler<R, T, C>
where
    R: RegisterReader,
    T: Transport,
    C: Clock,
{
    pub fn new(
        meter: Meter<R>,
        uploader: PvOutput<T, C>,
        clock: C,
        window: ScheduleWindow,
        report_consumption: bool,
    ) -> Self {
        Self {
            meter,
            uploader,
            clock,
            window,
            report_consumption,
        }
    }

    pub fn run(&mut self) -> ! {
        info!(
            "Reporting between {:02}:00 and {:02}:00 every {} minutes",
            self.window.start, self.window.stop, TICK_MINUTES
        );
        loop {
            self.step();
        }
    }

    /// Run one iteration including its trailing sleep.
    pub fn step(&mut self) -> State {
        let now = self.clock.now();
        if self.window.contains(now.hour()) {
            if let Err(e) = self.report() {
                error!("Skipping this report, failed to read meter: {}", e);
            }
            let now = self.clock.now();
            let wait = seconds_until_next_tick(now.minute(), now.second());
            self.clock.sleep(Duration::from_secs(wait));
            State::ActiveWindow
        } else {
            let minutes = self.window.minutes_until_start(now.hour(), now.minute());
            info!("Next shift starts in {} minutes", minutes);
            self.clock.sleep(Duration::from_secs(u64::from(minutes) * 60));
            State::Idle
        }
    }

    fn report(&mut self) -> Result<Delivery, ReadError> {
        let exported = self.read_required(Quantity::ExportActiveEnergy)?;
        let power = self.read_required(Quantity::ActivePower)?;
        let voltage = self.read_required(Quantity::Voltage)?;
        let imported = if self.report_consumption {
            Some(self.read_required(Quantity::ImportActiveEnergy)?)
        } else {
            None
        };

        let mut record = StatusRecord::new(self.clock.now());
        record.energy_generated = Some(kwh_to_wh(exported));
        record.power_generated = Some(power);
        record.voltage_ac = Some(voltage);
        record.energy_consumed = imported.map(kwh_to_wh);
        record.cumulative = true;

        Ok(self.uploader.send_status(&record, None))
    }

    /// A NaN or infinite value is treated like a failed read.
    fn read_required(&mut self, quantity: Quantity) -> Result<f32, ReadError> {
        let value = self.meter.read_quantity(quantity)?;
        if !value.is_finite() {
            return Err(ReadError::UnexpectedResponse(format!(
                "{:?} read as {}",
                quantity, value
            )));
        }
        Ok(value)
    }
}

fn kwh_to_wh(kwh: f32) -> f64 {
    f64::from(kwh) * 1000.0
}
