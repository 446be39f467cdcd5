use {
    crate::{
        bus::{Bus, BusError},
        switch::Channel,
    },
    chrono::{DateTime, Utc},
    std::{fmt, time::Duration},
    thiserror::Error,
};

pub mod bme680;
pub mod grove;
pub mod sgp30;

pub use {bme680::Bme680, grove::GroveGas, sgp30::Sgp30};

/// Progress of a multi-phase driver operation.
///
/// Drivers never sleep themselves. A driver that needs the device to settle
/// returns `Settle` and expects to be called again once the delay has passed.
#[derive(Debug, PartialEq)]
pub enum Step<T> {
    Settle(Duration),
    Done(T),
}

pub trait Sensor<I> {
    fn kind(&self) -> SensorKind;

    fn address(&self) -> u8;

    fn channel(&self) -> Option<Channel>;

    fn is_ready(&self) -> bool;

    /// Probes and configures the device. Calling it again after completion
    /// starts over from a cold device.
    fn initialize(&mut self, bus: &mut Bus<I>) -> Result<Step<()>, SensorError>;

    /// Takes one sample. Every call re-selects the sensor's channel first.
    fn read(&mut self, bus: &mut Bus<I>) -> Result<Step<Reading>, SensorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Bme680,
    Sgp30,
    GroveGas,
}

impl SensorKind {
    pub(crate) fn config_failed(self) -> impl FnOnce(BusError) -> SensorError {
        move |source| SensorError::ConfigFailed {
            sensor: self,
            source,
        }
    }

    pub(crate) fn read_failed(self) -> impl FnOnce(BusError) -> SensorError {
        move |source| SensorError::ReadFailed {
            sensor: self,
            source,
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SensorKind::Bme680 => "BME680",
            SensorKind::Sgp30 => "SGP30",
            SensorKind::GroveGas => "Grove Gas Sensor",
        })
    }
}

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("{sensor} not found at {address:#04x}, check wiring: {reason}")]
    NotFound {
        sensor: SensorKind,
        address: u8,
        reason: String,
    },

    #[error("{sensor} rejected configuration: {source}")]
    ConfigFailed {
        sensor: SensorKind,
        #[source]
        source: BusError,
    },

    #[error("Failed to read from {sensor}: {source}")]
    ReadFailed {
        sensor: SensorKind,
        #[source]
        source: BusError,
    },

    #[error("{sensor} read before a successful initialization")]
    NotReady { sensor: SensorKind },
}

impl SensorError {
    pub fn sensor(&self) -> SensorKind {
        match self {
            SensorError::NotFound { sensor, .. }
            | SensorError::ConfigFailed { sensor, .. }
            | SensorError::ReadFailed { sensor, .. }
            | SensorError::NotReady { sensor } => *sensor,
        }
    }

    pub(crate) fn not_found(sensor: SensorKind, address: u8, reason: impl fmt::Display) -> Self {
        SensorError::NotFound {
            sensor,
            address,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Celsius,
    RelativeHumidity,
    Hectopascal,
    Kiloohm,
    Ppb,
    Ppm,
}

impl Unit {
    /// Suffix written directly after a value.
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Celsius => "°C",
            Unit::RelativeHumidity => "%",
            Unit::Hectopascal => " hPa",
            Unit::Kiloohm => " kOhms",
            Unit::Ppb => " ppb",
            Unit::Ppm => " ppm",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: &'static str,
    pub value: f32,
    pub unit: Unit,
}

impl Measurement {
    pub fn new(name: &'static str, value: f32, unit: Unit) -> Self {
        Self { name, value, unit }
    }

    pub fn scaled(name: &'static str, raw: i64, divisor: u32, unit: Unit) -> Self {
        Self::new(name, (raw as f64 / f64::from(divisor)) as f32, unit)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub sensor: SensorKind,
    pub time: DateTime<Utc>,
    pub measurements: Vec<Measurement>,
}

impl Reading {
    pub fn new(sensor: SensorKind, measurements: Vec<Measurement>) -> Self {
        Self {
            sensor,
            time: Utc::now(),
            measurements,
        }
    }

    pub fn measurement(&self, name: &str) -> Option<&Measurement> {
        self.measurements.iter().find(|m| m.name == name)
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.measurement(name).map(|m| m.value)
    }
}
