use serde::Serialize;
use std::collections::BTreeMap;

use crate::modbus::{ReadError, RegisterReader};

/// Physical quantities exposed by the Eastron SDM230 as input registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    Voltage,
    Current,
    ActivePower,
    ApparentPower,
    ReactivePower,
    PowerFactor,
    PhaseAngle,
    Frequency,
    ImportActiveEnergy,
    ExportActiveEnergy,
    ImportReactiveEnergy,
    ExportReactiveEnergy,
    TotalSystemPowerDemand,
    MaximumTotalSystemPowerDemand,
    PositivePowerDemand,
    MaximumPositivePowerDemand,
    ReversePowerDemand,
    MaximumReversePowerDemand,
    CurrentDemand,
    MaximumCurrentDemand,
    TotalActiveEnergy,
    TotalReactiveEnergy,
    ResettableTotalActiveEnergy,
    ResettableTotalReactiveEnergy,
}

impl Quantity {
    pub const ALL: [Quantity; 24] = [
        Quantity::Voltage,
        Quantity::Current,
        Quantity::ActivePower,
        Quantity::ApparentPower,
        Quantity::ReactivePower,
        Quantity::PowerFactor,
        Quantity::PhaseAngle,
        Quantity::Frequency,
        Quantity::ImportActiveEnergy,
        Quantity::ExportActiveEnergy,
        Quantity::ImportReactiveEnergy,
        Quantity::ExportReactiveEnergy,
        Quantity::TotalSystemPowerDemand,
        Quantity::MaximumTotalSystemPowerDemand,
        Quantity::PositivePowerDemand,
        Quantity::MaximumPositivePowerDemand,
        Quantity::ReversePowerDemand,
        Quantity::MaximumReversePowerDemand,
        Quantity::CurrentDemand,
        Quantity::MaximumCurrentDemand,
        Quantity::TotalActiveEnergy,
        Quantity::TotalReactiveEnergy,
        Quantity::ResettableTotalActiveEnergy,
        Quantity::ResettableTotalReactiveEnergy,
    ];

    /// Input register offset of the float holding this quantity.
    pub const fn register(self) -> u16 {
        match self {
            Quantity::Voltage => 0,
            Quantity::Current => 6,
            Quantity::ActivePower => 12,
            Quantity::ApparentPower => 18,
            Quantity::ReactivePower => 24,
            Quantity::PowerFactor => 30,
            Quantity::PhaseAngle => 36,
            Quantity::Frequency => 70,
            Quantity::ImportActiveEnergy => 72,
            Quantity::ExportActiveEnergy => 74,
            Quantity::ImportReactiveEnergy => 76,
            Quantity::ExportReactiveEnergy => 78,
            Quantity::TotalSystemPowerDemand => 84,
            Quantity::MaximumTotalSystemPowerDemand => 86,
            Quantity::PositivePowerDemand => 88,
            Quantity::MaximumPositivePowerDemand => 90,
            Quantity::ReversePowerDemand => 92,
            Quantity::MaximumReversePowerDemand => 94,
            Quantity::CurrentDemand => 258,
            Quantity::MaximumCurrentDemand => 264,
            Quantity::TotalActiveEnergy => 342,
            Quantity::TotalReactiveEnergy => 344,
            Quantity::ResettableTotalActiveEnergy => 384,
            Quantity::ResettableTotalReactiveEnergy => 386,
        }
    }

    pub const fn unit(self) -> &'static str {
        match self {
            Quantity::Voltage => "V",
            Quantity::Current | Quantity::CurrentDemand | Quantity::MaximumCurrentDemand => "A",
            Quantity::ActivePower
            | Quantity::TotalSystemPowerDemand
            | Quantity::MaximumTotalSystemPowerDemand
            | Quantity::PositivePowerDemand
            | Quantity::MaximumPositivePowerDemand
            | Quantity::ReversePowerDemand
            | Quantity::MaximumReversePowerDemand => "W",
            Quantity::ApparentPower => "VA",
            Quantity::ReactivePower => "VAr",
            Quantity::PowerFactor => "",
            Quantity::PhaseAngle => "°",
            Quantity::Frequency => "Hz",
            Quantity::ImportActiveEnergy
            | Quantity::ExportActiveEnergy
            | Quantity::TotalActiveEnergy
            | Quantity::ResettableTotalActiveEnergy => "kWh",
            Quantity::ImportReactiveEnergy
            | Quantity::ExportReactiveEnergy
            | Quantity::TotalReactiveEnergy
            | Quantity::ResettableTotalReactiveEnergy => "kVArh",
        }
    }
}

/// One register of a full dump: the value read, or why it could not be.
#[derive(Debug, Serialize)]
pub struct DumpEntry {
    pub quantity: Quantity,
    pub register: u16,
    pub unit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An SDM meter at a fixed device address on the bus.
pub struct Meter<R> {
    reader: R,
    address: u8,
}

impl<R: RegisterReader> Meter<R> {
    pub fn new(reader: R, address: u8) -> Self {
        Self { reader, address }
    }

    pub fn read_quantity(&mut self, quantity: Quantity) -> Result<f32, ReadError> {
        self.reader.read(self.address, quantity.register())
    }

    /// Read every known quantity. A failure on one does not stop the others.
    pub fn read_all(&mut self) -> BTreeMap<Quantity, Result<f32, ReadError>> {
        Quantity::ALL
            .iter()
            .map(|&quantity| (quantity, self.read_quantity(quantity)))
            .collect()
    }

    /// Read everything and keep failures next to the values.
    pub fn dump(&mut self) -> Vec<DumpEntry> {
        self.read_all()
            .into_iter()
            .map(|(quantity, result)| {
                let (value, error) = match result {
                    Ok(value) => (Some(value), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                DumpEntry {
                    quantity,
                    register: quantity.register(),
                    unit: quantity.unit(),
                    value,
                    error,
                }
            })
            .collect()
    }
}
