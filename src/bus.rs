use {
    crate::switch::{Channel, ChannelSwitch},
    embedded_hal::blocking::i2c,
    log::debug,
    std::fmt,
    thiserror::Error,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BusError {
    #[error("write to {address:#04x} failed: {reason}")]
    WriteFailed { address: u8, reason: String },

    #[error("read from {address:#04x} failed: {reason}")]
    ReadFailed { address: u8, reason: String },

    #[error("checksum mismatch in data from {address:#04x}")]
    Checksum { address: u8 },

    #[error("device at {address:#04x} did not finish conversion")]
    Timeout { address: u8 },

    #[error("channel {channel} requested but no channel switch is configured")]
    NoSwitch { channel: Channel },
}

/// Transaction primitives the drivers are written against.
pub trait I2cBus {
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError>;

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), BusError>;

    fn write_read(&mut self, address: u8, bytes: &[u8], buffer: &mut [u8])
        -> Result<(), BusError>;

    fn read_register16(&mut self, address: u8, register: u8) -> Result<u16, BusError> {
        let mut buffer = [0; 2];
        self.write_read(address, &[register], &mut buffer)?;
        Ok(u16::from_be_bytes(buffer))
    }
}

impl<T> I2cBus for T
where
    T: i2c::Write + i2c::Read + i2c::WriteRead,
    <T as i2c::Write>::Error: fmt::Debug,
    <T as i2c::Read>::Error: fmt::Debug,
    <T as i2c::WriteRead>::Error: fmt::Debug,
{
    fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError> {
        i2c::Write::write(self, address, bytes).map_err(|e| BusError::WriteFailed {
            address,
            reason: format!("{:?}", e),
        })
    }

    fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), BusError> {
        i2c::Read::read(self, address, buffer).map_err(|e| BusError::ReadFailed {
            address,
            reason: format!("{:?}", e),
        })
    }

    fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), BusError> {
        i2c::WriteRead::write_read(self, address, bytes, buffer).map_err(|e| {
            BusError::ReadFailed {
                address,
                reason: format!("{:?}", e),
            }
        })
    }
}

/// The shared bus together with the switch that routes it. Drivers borrow it
/// for one step at a time.
pub struct Bus<I> {
    i2c: I,
    switch: Option<ChannelSwitch>,
}

impl<I: I2cBus> Bus<I> {
    pub fn new(i2c: I, switch: Option<ChannelSwitch>) -> Self {
        Self { i2c, switch }
    }

    pub fn switch(&self) -> Option<&ChannelSwitch> {
        self.switch.as_ref()
    }

    pub fn select(&mut self, channel: Option<Channel>) -> Result<(), BusError> {
        let channel = match channel {
            Some(channel) => channel,
            None => return Ok(()),
        };

        match self.switch.as_mut() {
            Some(switch) => switch.activate(&mut self.i2c, channel),
            None => {
                debug!("No switch to route channel {}", channel);
                Err(BusError::NoSwitch { channel })
            }
        }
    }

    pub fn reset_switch(&mut self) -> Result<(), BusError> {
        match self.switch.as_mut() {
            Some(switch) => switch.reset(&mut self.i2c),
            None => Ok(()),
        }
    }

    pub fn write(&mut self, address: u8, bytes: &[u8]) -> Result<(), BusError> {
        self.i2c.write(address, bytes)
    }

    pub fn read(&mut self, address: u8, buffer: &mut [u8]) -> Result<(), BusError> {
        self.i2c.read(address, buffer)
    }

    pub fn write_read(
        &mut self,
        address: u8,
        bytes: &[u8],
        buffer: &mut [u8],
    ) -> Result<(), BusError> {
        self.i2c.write_read(address, bytes, buffer)
    }

    pub fn read_register16(&mut self, address: u8, register: u8) -> Result<u16, BusError> {
        self.i2c.read_register16(address, register)
    }

    pub fn into_inner(self) -> I {
        self.i2c
    }
}
