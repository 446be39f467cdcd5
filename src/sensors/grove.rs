//! Seeed Grove multichannel gas sensor V2 (GM102B, GM302B, GM502B, GM702B).

use {
    super::{Measurement, Reading, Sensor, SensorError, SensorKind, Step, Unit},
    crate::{
        bus::{Bus, I2cBus},
        switch::Channel,
    },
    serde::Deserialize,
    std::time::Duration,
};

pub const DEFAULT_ADDRESS: u8 = 0x08;

const KIND: SensorKind = SensorKind::GroveGas;

const WARMING_UP: u8 = 0xFE;

/// (command, measurement name) in read order.
const GASES: [(u8, &str); 4] = [(0x01, "co"), (0x03, "no2"), (0x05, "nh3"), (0x07, "ch4")];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GroveGasSettings {
    pub sample_delay_ms: u64,
}

impl Default for GroveGasSettings {
    fn default() -> Self {
        Self { sample_delay_ms: 1 }
    }
}

pub struct GroveGas {
    address: u8,
    channel: Option<Channel>,
    settings: GroveGasSettings,
    ready: bool,
    /// Index into `GASES` of the request in flight.
    pending: Option<usize>,
    values: [u32; 4],
}

impl GroveGas {
    pub fn new(address: u8, channel: Option<Channel>, settings: GroveGasSettings) -> Self {
        Self {
            address,
            channel,
            settings,
            ready: false,
            pending: None,
            values: [0; 4],
        }
    }

    fn request<I: I2cBus>(
        &mut self,
        bus: &mut Bus<I>,
        gas: usize,
    ) -> Result<Step<Reading>, SensorError> {
        bus.write(self.address, &[GASES[gas].0])
            .map_err(KIND.read_failed())?;

        self.pending = Some(gas);
        Ok(Step::Settle(Duration::from_millis(
            self.settings.sample_delay_ms,
        )))
    }

    fn collect<I: I2cBus>(
        &mut self,
        bus: &mut Bus<I>,
        gas: usize,
    ) -> Result<Step<Reading>, SensorError> {
        let mut raw = [0; 4];
        bus.read(self.address, &mut raw)
            .map_err(KIND.read_failed())?;
        self.values[gas] = u32::from_le_bytes(raw);

        if gas + 1 < GASES.len() {
            return self.request(bus, gas + 1);
        }

        let measurements = GASES
            .iter()
            .zip(self.values.iter())
            .map(|(&(_, name), &value)| Measurement::scaled(name, i64::from(value), 1, Unit::Ppm))
            .collect();

        Ok(Step::Done(Reading::new(KIND, measurements)))
    }
}

impl<I: I2cBus> Sensor<I> for GroveGas {
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
        let address = self.address;
        self.ready = false;
        self.pending = None;

        bus.select(self.channel)
            .map_err(|e| SensorError::not_found(KIND, address, e))?;
        bus.write(address, &[WARMING_UP])
            .map_err(|e| SensorError::not_found(KIND, address, e))?;

        self.ready = true;
        Ok(Step::Done(()))
    }

    fn read(&mut self, bus: &mut Bus<I>) -> Result<Step<Reading>, SensorError> {
        if !self.ready {
            return Err(SensorError::NotReady { sensor: KIND });
        }

        let pending = self.pending.take();
        bus.select(self.channel).map_err(KIND.read_failed())?;

        match pending {
            None => self.request(bus, 0),
            Some(gas) => self.collect(bus, gas),
        }
    }
}
