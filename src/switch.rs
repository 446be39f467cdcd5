use {
    crate::bus::{BusError, I2cBus},
    log::debug,
    serde::Deserialize,
    std::{convert::TryFrom, fmt},
    thiserror::Error,
};

/// Downstream segment index of a TCA9548A style switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "u8")]
pub struct Channel(u8);

#[derive(Debug, Clone, Copy, PartialEq, Error)]
#[error("channel {0} is outside 0..=7")]
pub struct InvalidChannel(pub u8);

impl Channel {
    pub const COUNT: u8 = 8;

    pub fn new(index: u8) -> Option<Self> {
        if index < Self::COUNT {
            Some(Self(index))
        } else {
            None
        }
    }

    pub fn index(self) -> u8 {
        self.0
    }

    pub fn mask(self) -> u8 {
        1 << self.0
    }
}

impl TryFrom<u8> for Channel {
    type Error = InvalidChannel;

    fn try_from(index: u8) -> Result<Self, Self::Error> {
        Self::new(index).ok_or(InvalidChannel(index))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct ChannelSwitch {
    address: u8,
    active: Option<Channel>,
}

impl ChannelSwitch {
    pub const DEFAULT_ADDRESS: u8 = 0x70;

    pub fn new(address: u8) -> Self {
        Self {
            address,
            active: None,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn active(&self) -> Option<Channel> {
        self.active
    }

    /// Always writes, even when `channel` is already the active one.
    pub fn activate<I: I2cBus>(&mut self, i2c: &mut I, channel: Channel) -> Result<(), BusError> {
        debug!("Switch {:#04x} -> channel {}", self.address, channel);

        match i2c.write(self.address, &[channel.mask()]) {
            Ok(()) => {
                self.active = Some(channel);
                Ok(())
            }
            Err(e) => {
                self.active = None;
                Err(e)
            }
        }
    }

    /// Disconnects every channel.
    pub fn reset<I: I2cBus>(&mut self, i2c: &mut I) -> Result<(), BusError> {
        self.active = None;
        i2c.write(self.address, &[0x00])
    }
}
