use {
    super::{Measurement, Reading, Sensor, SensorError, SensorKind, Step, Unit},
    crate::{
        bus::{Bus, BusError, I2cBus},
        switch::Channel,
    },
    crc::{Crc, CRC_8_NRSC_5},
    log::debug,
    serde::Deserialize,
    std::time::Duration,
};

pub const DEFAULT_ADDRESS: u8 = 0x58;

const KIND: SensorKind = SensorKind::Sgp30;

// Sensirion word checksum: poly 0x31, init 0xFF
const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_NRSC_5);

const GET_SERIAL_ID: [u8; 2] = [0x36, 0x82];
const IAQ_INIT: [u8; 2] = [0x20, 0x03];
const MEASURE_IAQ: [u8; 2] = [0x20, 0x08];
const SET_IAQ_BASELINE: [u8; 2] = [0x20, 0x1E];
const SET_ABSOLUTE_HUMIDITY: [u8; 2] = [0x20, 0x61];

const SERIAL_DELAY: Duration = Duration::from_millis(1);
const COMMAND_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Baseline {
    pub eco2: u16,
    pub tvoc: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Sgp30Settings {
    pub baseline: Option<Baseline>,
    /// Absolute humidity in g/m³ as 8.8 fixed point.
    pub humidity_compensation: Option<u16>,
    pub measure_delay_ms: u64,
}

impl Default for Sgp30Settings {
    fn default() -> Self {
        Self {
            baseline: Some(Baseline {
                eco2: 0x8973,
                tvoc: 0x8AAE,
            }),
            // 22.1 °C at 44 %RH
            humidity_compensation: Some(0x0891),
            measure_delay_ms: 12,
        }
    }
}

fn word(word: u16) -> [u8; 3] {
    let [msb, lsb] = word.to_be_bytes();
    [msb, lsb, CRC8.checksum(&[msb, lsb])]
}

fn command(command: [u8; 2], argument: u16) -> [u8; 5] {
    let [msb, lsb, crc] = word(argument);
    [command[0], command[1], msb, lsb, crc]
}

fn words(address: u8, data: &[u8]) -> Result<Vec<u16>, BusError> {
    data.chunks(3)
        .map(|chunk| {
            if CRC8.checksum(&chunk[..2]) == chunk[2] {
                Ok(u16::from_be_bytes([chunk[0], chunk[1]]))
            } else {
                Err(BusError::Checksum { address })
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Init {
    Probe,
    Identify,
    Baseline,
    Humidity,
    Finish,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Read {
    Trigger,
    Collect,
}

pub struct Sgp30 {
    address: u8,
    channel: Option<Channel>,
    settings: Sgp30Settings,
    ready: bool,
    init: Init,
    read: Read,
}

impl Sgp30 {
    pub fn new(address: u8, channel: Option<Channel>, settings: Sgp30Settings) -> Self {
        Self {
            address,
            channel,
            settings,
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
        bus.write(address, &GET_SERIAL_ID)
            .map_err(|e| SensorError::not_found(KIND, address, e))?;

        self.init = Init::Identify;
        Ok(Step::Settle(SERIAL_DELAY))
    }

    fn identify<I: I2cBus>(&mut self, bus: &mut Bus<I>) -> Result<Step<()>, SensorError> {
        let address = self.address;
        self.init = Init::Probe;

        bus.select(self.channel)
            .map_err(|e| SensorError::not_found(KIND, address, e))?;

        let mut response = [0; 9];
        bus.read(address, &mut response)
            .and_then(|_| words(address, &response))
            .map(|serial| debug!("SGP30 serial {:04x?}", serial))
            .map_err(|e| SensorError::not_found(KIND, address, e))?;

        bus.write(address, &IAQ_INIT)
            .map_err(KIND.config_failed())?;

        self.init = Init::Baseline;
        Ok(Step::Settle(COMMAND_DELAY))
    }

    /// Applies the configured baseline and humidity compensation, one command
    /// per step since each needs the device idle.
    fn configure<I: I2cBus>(&mut self, bus: &mut Bus<I>) -> Result<Step<()>, SensorError> {
        let address = self.address;
        let stage = self.init;
        self.init = Init::Probe;

        bus.select(self.channel).map_err(KIND.config_failed())?;

        let (next, payload) = match stage {
            Init::Baseline => (
                Init::Humidity,
                self.settings.baseline.map(|b| {
                    // TVOC first, reverse of the get_iaq_baseline order
                    let [t0, t1, t2] = word(b.tvoc);
                    let [e0, e1, e2] = word(b.eco2);
                    vec![
                        SET_IAQ_BASELINE[0],
                        SET_IAQ_BASELINE[1],
                        t0,
                        t1,
                        t2,
                        e0,
                        e1,
                        e2,
                    ]
                }),
            ),
            Init::Humidity => (
                Init::Finish,
                self.settings
                    .humidity_compensation
                    .map(|h| command(SET_ABSOLUTE_HUMIDITY, h).to_vec()),
            ),
            _ => (Init::Finish, None),
        };

        match payload {
            Some(payload) => {
                bus.write(address, &payload)
                    .map_err(KIND.config_failed())?;
                self.init = next;
                Ok(Step::Settle(COMMAND_DELAY))
            }
            None if next == Init::Finish => {
                self.ready = true;
                Ok(Step::Done(()))
            }
            None => {
                self.init = next;
                self.configure(bus)
            }
        }
    }

    fn trigger<I: I2cBus>(&mut self, bus: &mut Bus<I>) -> Result<Step<Reading>, SensorError> {
        bus.select(self.channel).map_err(KIND.read_failed())?;
        bus.write(self.address, &MEASURE_IAQ)
            .map_err(KIND.read_failed())?;

        self.read = Read::Collect;
        Ok(Step::Settle(Duration::from_millis(
            self.settings.measure_delay_ms,
        )))
    }

    fn collect<I: I2cBus>(&mut self, bus: &mut Bus<I>) -> Result<Step<Reading>, SensorError> {
        let address = self.address;
        self.read = Read::Trigger;

        bus.select(self.channel).map_err(KIND.read_failed())?;

        let mut response = [0; 6];
        let values = bus
            .read(address, &mut response)
            .and_then(|_| words(address, &response))
            .map_err(KIND.read_failed())?;

        Ok(Step::Done(Reading::new(
            KIND,
            vec![
                Measurement::scaled("eco2", i64::from(values[0]), 1, Unit::Ppm),
                Measurement::scaled("tvoc", i64::from(values[1]), 1, Unit::Ppb),
            ],
        )))
    }
}

impl<I: I2cBus> Sensor<I> for Sgp30 {
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
            Init::Identify => self.identify(bus),
            Init::Baseline | Init::Humidity | Init::Finish => self.configure(bus),
        }
    }

    fn read(&mut self, bus: &mut Bus<I>) -> Result<Step<Reading>, SensorError> {
        if !self.ready {
            return Err(SensorError::NotReady { sensor: KIND });
        }

        match self.read {
            Read::Trigger => self.trigger(bus),
            Read::Collect => self.collect(bus),
        }
    }
}
