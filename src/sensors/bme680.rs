//! Bosch BME680 temperature, humidity, pressure and gas resistance sensor.
//!
//! Raw ADC values are turned into fixed-point outputs by a [`Compensation`]
//! implementation; the Bosch compensation formulas live outside this crate.

use {
    super::{Measurement, Reading, Sensor, SensorError, SensorKind, Step, Unit},
    crate::{
        bus::{Bus, BusError, I2cBus},
        switch::Channel,
    },
    log::debug,
    serde::Deserialize,
    std::time::Duration,
};

pub const DEFAULT_ADDRESS: u8 = 0x76;

const KIND: SensorKind = SensorKind::Bme680;
const CHIP_ID: u8 = 0x61;

mod reg {
    pub const CHIP_ID: u8 = 0xD0;
    pub const RESET: u8 = 0xE0;
    pub const CTRL_GAS_1: u8 = 0x71;
    pub const CTRL_HUM: u8 = 0x72;
    pub const CTRL_MEAS: u8 = 0x74;
    pub const CONFIG: u8 = 0x75;
    pub const RES_HEAT_0: u8 = 0x5A;
    pub const GAS_WAIT_0: u8 = 0x64;
    pub const FIELD_0: u8 = 0x1D;
    pub const GAS_R: u8 = 0x2A;
}

/// (start register, length) of the factory calibration blocks.
const COEFFICIENT_BLOCKS: [(u8, usize); 3] = [(0x8A, 23), (0xE1, 14), (0x00, 5)];

const SOFT_RESET: u8 = 0xB6;
const RUN_GAS: u8 = 0x10;
const FORCED_MODE: u8 = 0x01;
const NEW_DATA: u8 = 0x80;
const GAS_VALID: u16 = 0x20;
const HEAT_STAB: u16 = 0x10;

const RESET_DELAY: Duration = Duration::from_millis(10);
const POLL_DELAY: Duration = Duration::from_millis(10);
const MAX_POLLS: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Oversampling {
    Skip = 0,
    X1 = 1,
    X2 = 2,
    X4 = 3,
    X8 = 4,
    X16 = 5,
}

impl Oversampling {
    fn code(self) -> u8 {
        self as u8
    }

    fn cycles(self) -> u32 {
        match self {
            Oversampling::Skip => 0,
            Oversampling::X1 => 1,
            Oversampling::X2 => 2,
            Oversampling::X4 => 4,
            Oversampling::X8 => 8,
            Oversampling::X16 => 16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filter {
    Off = 0,
    Size1 = 1,
    Size3 = 2,
    Size7 = 3,
    Size15 = 4,
    Size31 = 5,
    Size63 = 6,
    Size127 = 7,
}

impl Filter {
    fn code(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeaterProfile {
    /// Target plate temperature in °C.
    pub temperature: u16,
    pub duration_ms: u16,
}

impl Default for HeaterProfile {
    fn default() -> Self {
        Self {
            temperature: 320,
            duration_ms: 150,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Bme680Settings {
    pub temperature_oversampling: Oversampling,
    pub humidity_oversampling: Oversampling,
    pub pressure_oversampling: Oversampling,
    pub filter: Filter,
    pub heater: HeaterProfile,
}

impl Default for Bme680Settings {
    fn default() -> Self {
        Self {
            temperature_oversampling: Oversampling::X8,
            humidity_oversampling: Oversampling::X2,
            pressure_oversampling: Oversampling::X4,
            filter: Filter::Size3,
            heater: HeaterProfile::default(),
        }
    }
}

impl Bme680Settings {
    pub fn measurement_duration(&self) -> Duration {
        let cycles = self.temperature_oversampling.cycles()
            + self.pressure_oversampling.cycles()
            + self.humidity_oversampling.cycles();

        // TPH conversion, switching, gas measurement and wake up, in µs
        let micros = cycles * 1963 + 477 * 4 + 477 * 5 + 1000;

        Duration::from_millis(u64::from((micros + 500) / 1000) + u64::from(self.heater.duration_ms))
    }

    fn ctrl_meas(&self) -> u8 {
        self.temperature_oversampling.code() << 5 | self.pressure_oversampling.code() << 2
    }
}

/// `gas_wait` register encoding: 6 bit mantissa, 2 bit multiplier of 4^n ms.
pub fn encode_gas_wait(mut duration_ms: u16) -> u8 {
    if duration_ms >= 0xFC0 {
        return 0xFF;
    }

    let mut factor = 0;
    while duration_ms > 0x3F {
        duration_ms /= 4;
        factor += 1;
    }

    duration_ms as u8 + factor * 64
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasSample {
    pub adc: u16,
    pub range: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub temperature: u32,
    pub pressure: u32,
    pub humidity: u16,
    /// Absent when the heater did not reach a stable temperature.
    pub gas: Option<GasSample>,
}

impl RawSample {
    fn parse(field: &[u8; 13], gas: u16) -> Self {
        let adc20 = |b: &[u8]| u32::from(b[0]) << 12 | u32::from(b[1]) << 4 | u32::from(b[2]) >> 4;

        Self {
            pressure: adc20(&field[2..5]),
            temperature: adc20(&field[5..8]),
            humidity: u16::from(field[8]) << 8 | u16::from(field[9]),
            gas: if gas & GAS_VALID != 0 && gas & HEAT_STAB != 0 {
                Some(GasSample {
                    adc: gas >> 6,
                    range: (gas & 0x0F) as u8,
                })
            } else {
                None
            },
        }
    }
}

/// Fixed-point output of the vendor compensation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Compensated {
    /// 0.01 °C
    pub temperature: i32,
    /// Pa
    pub pressure: u32,
    /// 0.001 %RH
    pub humidity: u32,
    /// Ω
    pub gas_resistance: Option<u32>,
}

pub trait Compensation {
    /// Receives the factory calibration blocks read during initialization.
    fn load(&mut self, _coefficients: &[u8]) {}

    /// `res_heat` register value for a target plate temperature in °C.
    fn heater_resistance(&self, temperature: u16) -> u8;

    fn compensate(&self, raw: &RawSample) -> Compensated;
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Linear {
    pub gain: f64,
    pub offset: f64,
}

impl Default for Linear {
    fn default() -> Self {
        Self {
            gain: 1.0,
            offset: 0.0,
        }
    }
}

impl Linear {
    fn apply(&self, raw: f64) -> f64 {
        (raw * self.gain + self.offset).round()
    }
}

/// Per-field linear calibration taken from configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LinearCompensation {
    pub temperature: Linear,
    pub pressure: Linear,
    pub humidity: Linear,
    pub gas: Linear,
    pub heater_resistance: u8,
}

impl Default for LinearCompensation {
    fn default() -> Self {
        Self {
            temperature: Linear::default(),
            pressure: Linear::default(),
            humidity: Linear::default(),
            gas: Linear::default(),
            heater_resistance: 0x73,
        }
    }
}

impl LinearCompensation {
    /// No field calibrated: outputs are raw ADC counts.
    pub fn is_identity(&self) -> bool {
        [self.temperature, self.pressure, self.humidity, self.gas]
            .iter()
            .all(|field| *field == Linear::default())
    }
}

impl Compensation for LinearCompensation {
    fn heater_resistance(&self, _temperature: u16) -> u8 {
        self.heater_resistance
    }

    fn compensate(&self, raw: &RawSample) -> Compensated {
        Compensated {
            temperature: self.temperature.apply(f64::from(raw.temperature)) as i32,
            pressure: self.pressure.apply(f64::from(raw.pressure)) as u32,
            humidity: self.humidity.apply(f64::from(raw.humidity)) as u32,
            gas_resistance: raw.gas.map(|g| self.gas.apply(f64::from(g.adc)) as u32),
        }
    }
}

pub fn decode(c: &Compensated) -> Vec<Measurement> {
    let mut measurements = vec![
        Measurement::scaled("temperature", i64::from(c.temperature), 100, Unit::Celsius),
        Measurement::scaled("humidity", i64::from(c.humidity), 1000, Unit::RelativeHumidity),
        Measurement::scaled("pressure", i64::from(c.pressure), 100, Unit::Hectopascal),
    ];

    if let Some(gas) = c.gas_resistance {
        measurements.push(Measurement::scaled(
            "gas_resistance",
            i64::from(gas),
            1000,
            Unit::Kiloohm,
        ));
    }

    measurements
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Init {
    Probe,
    Configure,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Read {
    Trigger,
    Collect { polls: u8 },
}

pub struct Bme680<C> {
    address: u8,
    channel: Option<Channel>,
    settings: Bme680Settings,
    compensation: C,
    ready: bool,
    init: Init,
    read: Read,
}

impl<C: Compensation> Bme680<C> {
    pub fn new(
        address: u8,
        channel: Option<Channel>,
        settings: Bme680Settings,
        compensation: C,
    ) -> Self {
        Self {
            address,
            channel,
            settings,
            compensation,
            ready: false,
            init: Init::Probe,
            read: Read::Trigger,
        }
    }

    fn probe<I: I2cBus>(&mut self, bus: &mut Bus<I>) -> Result<Step<()>, SensorError> {
        let address = self.address;
        self.ready = false;
        self.read = Read::Trigger;

        bus.select(self.channel)
            .map_err(|e| SensorError::not_found(KIND, address, e))?;

        let mut id = [0];
        bus.write_read(address, &[reg::CHIP_ID], &mut id)
            .map_err(|e| SensorError::not_found(KIND, address, e))?;
        if id[0] != CHIP_ID {
            return Err(SensorError::not_found(
                KIND,
                address,
                format!("unexpected chip id {:#04x}", id[0]),
            ));
        }

        bus.write(address, &[reg::RESET, SOFT_RESET])
            .map_err(KIND.config_failed())?;

        self.init = Init::Configure;
        Ok(Step::Settle(RESET_DELAY))
    }

    fn configure<I: I2cBus>(&mut self, bus: &mut Bus<I>) -> Result<Step<()>, SensorError> {
        let address = self.address;
        self.init = Init::Probe;

        bus.select(self.channel).map_err(KIND.config_failed())?;

        let mut coefficients = Vec::new();
        for &(start, len) in COEFFICIENT_BLOCKS.iter() {
            let mut block = vec![0; len];
            bus.write_read(address, &[start], &mut block)
                .map_err(KIND.config_failed())?;
            coefficients.extend_from_slice(&block);
        }
        self.compensation.load(&coefficients);

        let s = &self.settings;
        let registers = [
            (reg::CTRL_HUM, s.humidity_oversampling.code()),
            (reg::CONFIG, s.filter.code() << 2),
            (reg::CTRL_MEAS, s.ctrl_meas()),
            (reg::GAS_WAIT_0, encode_gas_wait(s.heater.duration_ms)),
            (
                reg::RES_HEAT_0,
                self.compensation.heater_resistance(s.heater.temperature),
            ),
            (reg::CTRL_GAS_1, RUN_GAS),
        ];
        for &(register, value) in registers.iter() {
            bus.write(address, &[register, value])
                .map_err(KIND.config_failed())?;
        }

        debug!(
            "BME680 heater {}°C for {}ms",
            s.heater.temperature, s.heater.duration_ms
        );
        self.ready = true;
        Ok(Step::Done(()))
    }

    fn trigger<I: I2cBus>(&mut self, bus: &mut Bus<I>) -> Result<Step<Reading>, SensorError> {
        bus.select(self.channel).map_err(KIND.read_failed())?;
        bus.write(
            self.address,
            &[reg::CTRL_MEAS, self.settings.ctrl_meas() | FORCED_MODE],
        )
        .map_err(KIND.read_failed())?;

        self.read = Read::Collect { polls: 0 };
        Ok(Step::Settle(self.settings.measurement_duration()))
    }

    fn collect<I: I2cBus>(
        &mut self,
        bus: &mut Bus<I>,
        polls: u8,
    ) -> Result<Step<Reading>, SensorError> {
        let address = self.address;
        self.read = Read::Trigger;

        bus.select(self.channel).map_err(KIND.read_failed())?;

        let mut field = [0; 13];
        bus.write_read(address, &[reg::FIELD_0], &mut field)
            .map_err(KIND.read_failed())?;

        if field[0] & NEW_DATA == 0 {
            if polls + 1 >= MAX_POLLS {
                return Err(KIND.read_failed()(BusError::Timeout { address }));
            }
            self.read = Read::Collect { polls: polls + 1 };
            return Ok(Step::Settle(POLL_DELAY));
        }

        let gas = bus
            .read_register16(address, reg::GAS_R)
            .map_err(KIND.read_failed())?;

        let raw = RawSample::parse(&field, gas);
        if raw.gas.is_none() {
            debug!("BME680 heater not stable, dropping gas resistance");
        }

        let compensated = self.compensation.compensate(&raw);
        Ok(Step::Done(Reading::new(KIND, decode(&compensated))))
    }
}

impl<I: I2cBus, C: Compensation> Sensor<I> for Bme680<C> {
    fn kind(&self) -> SensorKind {
        KIND
    }

    fn address(&self) -> u8 {
        self.address
    }

    fn channel(&self) -> Option<Channel> {
        self.channel
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn initialize(&mut self, bus: &mut Bus<I>) -> Result<Step<()>, SensorError> {
        match self.init {
            Init::Probe => self.probe(bus),
            Init::Configure => self.configure(bus),
        }
    }

    fn read(&mut self, bus: &mut Bus<I>) -> Result<Step<Reading>, SensorError> {
        if !self.ready {
            return Err(SensorError::NotReady { sensor: KIND });
        }

        match self.read {
            Read::Trigger => self.trigger(bus),
            Read::Collect { polls } => self.collect(bus, polls),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::switch::ChannelSwitch,
        embedded_hal_mock::{
            i2c::{Mock as I2cMock, Transaction},
            MockError,
        },
        std::io::ErrorKind,
    };

    const SELECT: u8 = 0b0000_0010;

    fn select() -> Transaction {
        Transaction::write(0x70, vec![SELECT])
    }

    fn probe() -> Vec<Transaction> {
        vec![
            select(),
            Transaction::write_read(0x76, vec![0xD0], vec![0x61]),
            Transaction::write(0x76, vec![0xE0, 0xB6]),
        ]
    }

    fn configure() -> Vec<Transaction> {
        vec![
            select(),
            Transaction::write_read(0x76, vec![0x8A], vec![0; 23]),
            Transaction::write_read(0x76, vec![0xE1], vec![0; 14]),
            Transaction::write_read(0x76, vec![0x00], vec![0; 5]),
            Transaction::write(0x76, vec![0x72, 0x02]),
            Transaction::write(0x76, vec![0x75, 0x08]),
            Transaction::write(0x76, vec![0x74, 0x8C]),
            Transaction::write(0x76, vec![0x64, 0x65]),
            Transaction::write(0x76, vec![0x5A, 0x73]),
            Transaction::write(0x76, vec![0x71, 0x10]),
        ]
    }

    /// Temperature 8950, pressure 101325, humidity 44000.
    fn field(status: u8) -> Vec<u8> {
        vec![
            status, 0x00, 0x18, 0xBC, 0xD0, 0x02, 0x2F, 0x60, 0xAB, 0xE0, 0x00, 0x00, 0x00,
        ]
    }

    fn sample(gas: [u8; 2]) -> Vec<Transaction> {
        vec![
            select(),
            Transaction::write(0x76, vec![0x74, 0x8D]),
            select(),
            Transaction::write_read(0x76, vec![0x1D], field(0x80)),
            Transaction::write_read(0x76, vec![0x2A], gas.to_vec()),
        ]
    }

    fn sensor() -> Bme680<LinearCompensation> {
        let compensation = LinearCompensation {
            gas: Linear {
                gain: 1000.0,
                offset: 0.0,
            },
            ..LinearCompensation::default()
        };
        Bme680::new(
            0x76,
            Channel::new(1),
            Bme680Settings::default(),
            compensation,
        )
    }

    fn bus(expectations: &[Transaction]) -> (I2cMock, Bus<I2cMock>) {
        let i2c = I2cMock::new(expectations);
        let bus = Bus::new(i2c.clone(), Some(ChannelSwitch::new(0x70)));
        (i2c, bus)
    }

    fn initialize(sensor: &mut Bme680<LinearCompensation>, bus: &mut Bus<I2cMock>) {
        assert_eq!(sensor.initialize(bus).unwrap(), Step::Settle(RESET_DELAY));
        assert_eq!(sensor.initialize(bus).unwrap(), Step::Done(()));
    }

    fn read(sensor: &mut Bme680<LinearCompensation>, bus: &mut Bus<I2cMock>) -> Reading {
        let settle = sensor.read(bus).unwrap();
        assert_eq!(settle, Step::Settle(Duration::from_millis(183)));
        match sensor.read(bus).unwrap() {
            Step::Done(reading) => reading,
            other => panic!("expected a reading, got {:?}", other),
        }
    }

    #[test]
    fn read_before_initialize_is_not_ready() {
        let (mut i2c, mut bus) = bus(&[]);
        let mut sensor = sensor();

        assert!(matches!(
            sensor.read(&mut bus),
            Err(SensorError::NotReady {
                sensor: SensorKind::Bme680
            })
        ));
        i2c.done();
    }

    #[test]
    fn initialize_configures_oversampling_filter_and_heater() {
        let expectations: Vec<_> = probe().into_iter().chain(configure()).collect();
        let (mut i2c, mut bus) = bus(&expectations);
        let mut sensor = sensor();

        initialize(&mut sensor, &mut bus);

        assert!(Sensor::<I2cMock>::is_ready(&sensor));
        i2c.done();
    }

    #[test]
    fn every_read_reselects_the_channel() {
        let expectations: Vec<_> = probe()
            .into_iter()
            .chain(configure())
            .chain(sample([0x50, 0x30]))
            .chain(sample([0x50, 0x30]))
            .collect();
        let (mut i2c, mut bus) = bus(&expectations);
        let mut sensor = sensor();

        initialize(&mut sensor, &mut bus);
        read(&mut sensor, &mut bus);
        let reading = read(&mut sensor, &mut bus);

        assert_eq!(reading.sensor, SensorKind::Bme680);
        assert_eq!(reading.get("temperature"), Some(89.50));
        assert_eq!(reading.get("humidity"), Some(44.0));
        assert_eq!(reading.get("pressure"), Some(1013.25));
        assert_eq!(reading.get("gas_resistance"), Some(320.0));
        i2c.done();
    }

    #[test]
    fn unstable_heater_drops_gas_resistance() {
        let expectations: Vec<_> = probe()
            .into_iter()
            .chain(configure())
            .chain(sample([0x50, 0x20]))
            .collect();
        let (mut i2c, mut bus) = bus(&expectations);
        let mut sensor = sensor();

        initialize(&mut sensor, &mut bus);
        let reading = read(&mut sensor, &mut bus);

        assert_eq!(reading.get("gas_resistance"), None);
        assert_eq!(reading.get("temperature"), Some(89.50));
        i2c.done();
    }

    #[test]
    fn silent_device_is_not_found() {
        let (mut i2c, mut bus) = bus(&[
            select(),
            Transaction::write_read(0x76, vec![0xD0], vec![0])
                .with_error(MockError::Io(ErrorKind::Other)),
        ]);
        let mut sensor = sensor();

        assert!(matches!(
            sensor.initialize(&mut bus),
            Err(SensorError::NotFound { address: 0x76, .. })
        ));
        assert!(!Sensor::<I2cMock>::is_ready(&sensor));
        i2c.done();
    }

    #[test]
    fn foreign_chip_is_not_found() {
        let (mut i2c, mut bus) = bus(&[
            select(),
            Transaction::write_read(0x76, vec![0xD0], vec![0x60]),
        ]);
        let mut sensor = sensor();

        assert!(matches!(
            sensor.initialize(&mut bus),
            Err(SensorError::NotFound { .. })
        ));
        i2c.done();
    }

    #[test]
    fn rejected_register_write_is_config_failed() {
        let mut expectations = probe();
        expectations.extend(configure().into_iter().take(4));
        expectations.push(
            Transaction::write(0x76, vec![0x72, 0x02]).with_error(MockError::Io(ErrorKind::Other)),
        );
        let (mut i2c, mut bus) = bus(&expectations);
        let mut sensor = sensor();

        sensor.initialize(&mut bus).unwrap();
        assert!(matches!(
            sensor.initialize(&mut bus),
            Err(SensorError::ConfigFailed { .. })
        ));
        assert!(!Sensor::<I2cMock>::is_ready(&sensor));
        i2c.done();
    }

    #[test]
    fn missing_new_data_gives_up_after_bounded_polls() {
        let mut expectations: Vec<_> = probe().into_iter().chain(configure()).collect();
        expectations.push(select());
        expectations.push(Transaction::write(0x76, vec![0x74, 0x8D]));
        for _ in 0..MAX_POLLS {
            expectations.push(select());
            expectations.push(Transaction::write_read(0x76, vec![0x1D], field(0x00)));
        }
        let (mut i2c, mut bus) = bus(&expectations);
        let mut sensor = sensor();

        initialize(&mut sensor, &mut bus);
        assert!(matches!(sensor.read(&mut bus), Ok(Step::Settle(_))));
        for _ in 1..MAX_POLLS {
            assert_eq!(sensor.read(&mut bus).unwrap(), Step::Settle(POLL_DELAY));
        }
        assert!(matches!(
            sensor.read(&mut bus),
            Err(SensorError::ReadFailed {
                source: BusError::Timeout { address: 0x76 },
                ..
            })
        ));
        i2c.done();
    }

    #[test]
    fn decode_scale_factors() {
        let measurements = decode(&Compensated {
            temperature: 8950,
            pressure: 101_325,
            humidity: 44_000,
            gas_resistance: Some(320_000),
        });
        let values: Vec<_> = measurements.iter().map(|m| (m.name, m.value)).collect();

        assert_eq!(
            values,
            vec![
                ("temperature", 89.50),
                ("humidity", 44.0),
                ("pressure", 1013.25),
                ("gas_resistance", 320.0),
            ]
        );
    }

    #[test]
    fn measurement_duration_covers_oversampling_and_heater() {
        let settings = Bme680Settings::default();
        assert_eq!(settings.measurement_duration(), Duration::from_millis(183));

        let quick = Bme680Settings {
            temperature_oversampling: Oversampling::X1,
            humidity_oversampling: Oversampling::Skip,
            pressure_oversampling: Oversampling::Skip,
            heater: HeaterProfile {
                temperature: 200,
                duration_ms: 0,
            },
            ..Bme680Settings::default()
        };
        assert_eq!(quick.measurement_duration(), Duration::from_millis(7));
    }

    #[test]
    fn gas_wait_encoding() {
        assert_eq!(encode_gas_wait(40), 40);
        assert_eq!(encode_gas_wait(150), 0x65);
        assert_eq!(encode_gas_wait(0xFC0), 0xFF);
    }

    #[test]
    fn uncalibrated_compensation_is_identity() {
        assert!(LinearCompensation::default().is_identity());

        let tuned = LinearCompensation {
            pressure: Linear {
                gain: 1.0,
                offset: -12.0,
            },
            ..LinearCompensation::default()
        };
        assert!(!tuned.is_identity());

        let heater_only = LinearCompensation {
            heater_resistance: 0x80,
            ..LinearCompensation::default()
        };
        assert!(heater_only.is_identity());
    }
}
