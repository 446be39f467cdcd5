use {
    crate::{
        bus::I2cBus,
        cycle::CycleConfig,
        sensors::{
            bme680::{self, Bme680Settings, LinearCompensation},
            grove::{self, GroveGasSettings},
            sgp30::{self, Sgp30Settings},
            Bme680, GroveGas, Sensor, SensorKind, Sgp30,
        },
        switch::{Channel, ChannelSwitch},
    },
    log::{info, warn},
    serde::Deserialize,
    std::{
        env, fs, io,
        path::{Path, PathBuf},
        time::Duration,
    },
    thiserror::Error,
};

pub const CONFIG_VAR: &str = "ENOSE_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{sensor} is on channel {channel} but the switch is disabled")]
    ChannelWithoutSwitch { sensor: SensorKind, channel: Channel },

    #[error("{first} and {second} share address {address:#04x} on the same segment")]
    DuplicateAddress {
        first: SensorKind,
        second: SensorKind,
        address: u8,
    },

    #[error("{sensor} uses address {address:#04x}, which belongs to the switch")]
    SwitchAddress { sensor: SensorKind, address: u8 },

    #[error("Cycle period must be greater than zero")]
    ZeroPeriod,

    #[error("No sensors configured")]
    NoSensors,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CycleSection {
    pub period_ms: u64,
    pub init_backoff_ms: u64,
}

impl Default for CycleSection {
    fn default() -> Self {
        Self {
            period_ms: 2000,
            init_backoff_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwitchSection {
    pub enabled: bool,
    pub address: u8,
}

impl Default for SwitchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            address: ChannelSwitch::DEFAULT_ADDRESS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SinkSection {
    pub human: bool,
}

impl Default for SinkSection {
    fn default() -> Self {
        Self { human: true }
    }
}

fn bme680_address() -> u8 {
    bme680::DEFAULT_ADDRESS
}

fn sgp30_address() -> u8 {
    sgp30::DEFAULT_ADDRESS
}

fn grove_address() -> u8 {
    grove::DEFAULT_ADDRESS
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorConfig {
    Bme680 {
        #[serde(default = "bme680_address")]
        address: u8,
        channel: Option<Channel>,
        #[serde(default)]
        settings: Bme680Settings,
        #[serde(default)]
        compensation: LinearCompensation,
    },
    Sgp30 {
        #[serde(default = "sgp30_address")]
        address: u8,
        channel: Option<Channel>,
        #[serde(default)]
        settings: Sgp30Settings,
    },
    GroveGas {
        #[serde(default = "grove_address")]
        address: u8,
        channel: Option<Channel>,
        #[serde(default)]
        settings: GroveGasSettings,
    },
}

impl SensorConfig {
    pub fn kind(&self) -> SensorKind {
        match self {
            SensorConfig::Bme680 { .. } => SensorKind::Bme680,
            SensorConfig::Sgp30 { .. } => SensorKind::Sgp30,
            SensorConfig::GroveGas { .. } => SensorKind::GroveGas,
        }
    }

    pub fn address(&self) -> u8 {
        match self {
            SensorConfig::Bme680 { address, .. }
            | SensorConfig::Sgp30 { address, .. }
            | SensorConfig::GroveGas { address, .. } => *address,
        }
    }

    pub fn channel(&self) -> Option<Channel> {
        match self {
            SensorConfig::Bme680 { channel, .. }
            | SensorConfig::Sgp30 { channel, .. }
            | SensorConfig::GroveGas { channel, .. } => *channel,
        }
    }

    fn build<I: I2cBus>(&self) -> Box<dyn Sensor<I>> {
        match self {
            SensorConfig::Bme680 {
                address,
                channel,
                settings,
                compensation,
            } => {
                if compensation.is_identity() {
                    warn!(
                        "BME680 at {:#04x} has no calibration, its values are raw ADC counts",
                        address
                    );
                }
                Box::new(Bme680::new(
                    *address,
                    *channel,
                    settings.clone(),
                    compensation.clone(),
                ))
            }
            SensorConfig::Sgp30 {
                address,
                channel,
                settings,
            } => Box::new(Sgp30::new(*address, *channel, settings.clone())),
            SensorConfig::GroveGas {
                address,
                channel,
                settings,
            } => Box::new(GroveGas::new(*address, *channel, settings.clone())),
        }
    }
}

/// Runtime configuration. Every field has a default matching the reference
/// wiring: BME680 behind channel 1 and SGP30 behind channel 2 of a switch at
/// 0x70.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cycle: CycleSection,
    pub switch: SwitchSection,
    pub sink: SinkSection,
    #[serde(rename = "sensor")]
    pub sensors: Vec<SensorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cycle: CycleSection::default(),
            switch: SwitchSection::default(),
            sink: SinkSection::default(),
            sensors: vec![
                SensorConfig::Bme680 {
                    address: bme680::DEFAULT_ADDRESS,
                    channel: Channel::new(1),
                    settings: Bme680Settings::default(),
                    compensation: LinearCompensation::default(),
                },
                SensorConfig::Sgp30 {
                    address: sgp30::DEFAULT_ADDRESS,
                    channel: Channel::new(2),
                    settings: Sgp30Settings::default(),
                },
            ],
        }
    }
}

impl Config {
    /// Loads the file named by `ENOSE_CONFIG`, or the defaults when unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        match env::var_os(CONFIG_VAR) {
            Some(path) => Self::load(path),
            None => {
                info!("{} not set, using default configuration", CONFIG_VAR);
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cycle.period_ms == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        if self.sensors.is_empty() {
            return Err(ConfigError::NoSensors);
        }

        // The default segment stays connected whichever channel is routed.
        let mut seen: Vec<(Option<Channel>, u8, SensorKind)> = Vec::new();
        for sensor in &self.sensors {
            let (kind, address, channel) = (sensor.kind(), sensor.address(), sensor.channel());

            if let Some(channel) = channel {
                if !self.switch.enabled {
                    return Err(ConfigError::ChannelWithoutSwitch {
                        sensor: kind,
                        channel,
                    });
                }
            }

            if self.switch.enabled && address == self.switch.address {
                return Err(ConfigError::SwitchAddress {
                    sensor: kind,
                    address,
                });
            }

            let clash = seen.iter().find(|&&(other, other_address, _)| {
                other_address == address
                    && (other.is_none() || channel.is_none() || other == channel)
            });
            if let Some(&(_, _, first)) = clash {
                return Err(ConfigError::DuplicateAddress {
                    first,
                    second: kind,
                    address,
                });
            }
            seen.push((channel, address, kind));
        }

        Ok(())
    }

    pub fn switch(&self) -> Option<ChannelSwitch> {
        if self.switch.enabled {
            Some(ChannelSwitch::new(self.switch.address))
        } else {
            None
        }
    }

    pub fn cycle(&self) -> CycleConfig {
        CycleConfig {
            period: Duration::from_millis(self.cycle.period_ms),
            init_backoff: Duration::from_millis(self.cycle.init_backoff_ms),
        }
    }

    pub fn sensors<I: I2cBus>(&self) -> Vec<Box<dyn Sensor<I>>> {
        self.sensors.iter().map(SensorConfig::build::<I>).collect()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::sensors::{bme680::Oversampling, sgp30::Baseline},
        embedded_hal_mock::i2c::Mock as I2cMock,
    };

    #[test]
    fn defaults_match_reference_wiring() {
        let config = Config::default();
        config.validate().unwrap();

        assert_eq!(config.cycle().period, Duration::from_secs(2));
        assert_eq!(config.cycle().init_backoff, Duration::from_secs(5));
        assert_eq!(config.switch().map(|s| s.address()), Some(0x70));

        let placement: Vec<_> = config
            .sensors
            .iter()
            .map(|s| (s.kind(), s.address(), s.channel().map(Channel::index)))
            .collect();
        assert_eq!(
            placement,
            vec![
                (SensorKind::Bme680, 0x76, Some(1)),
                (SensorKind::Sgp30, 0x58, Some(2)),
            ]
        );
    }

    #[test]
    fn empty_file_is_the_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn parses_sensor_tables() {
        let config = Config::from_toml(
            r#"
            [cycle]
            period_ms = 500

            [sink]
            human = false

            [[sensor]]
            kind = "grove_gas"
            channel = 3

            [[sensor]]
            kind = "bme680"
            address = 0x77
            channel = 1

            [sensor.settings]
            humidity_oversampling = "x16"

            [sensor.compensation.gas]
            gain = 1000.0

            [[sensor]]
            kind = "sgp30"
            channel = 2

            [sensor.settings]
            baseline = { eco2 = 0x1234, tvoc = 0x5678 }
            "#,
        )
        .unwrap();

        assert_eq!(config.cycle().period, Duration::from_millis(500));
        assert_eq!(config.cycle().init_backoff, Duration::from_secs(5));
        assert!(!config.sink.human);

        let kinds: Vec<_> = config.sensors.iter().map(SensorConfig::kind).collect();
        assert_eq!(
            kinds,
            vec![SensorKind::GroveGas, SensorKind::Bme680, SensorKind::Sgp30]
        );
        assert_eq!(config.sensors[0].address(), 0x08);

        match &config.sensors[1] {
            SensorConfig::Bme680 {
                address,
                settings,
                compensation,
                ..
            } => {
                assert_eq!(*address, 0x77);
                assert_eq!(settings.humidity_oversampling, Oversampling::X16);
                assert_eq!(settings.temperature_oversampling, Oversampling::X8);
                assert_eq!(compensation.gas.gain, 1000.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        match &config.sensors[2] {
            SensorConfig::Sgp30 { settings, .. } => assert_eq!(
                settings.baseline,
                Some(Baseline {
                    eco2: 0x1234,
                    tvoc: 0x5678
                })
            ),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn builds_drivers_in_order() {
        let config = Config::default();
        let sensors = config.sensors::<I2cMock>();

        let built: Vec<_> = sensors
            .iter()
            .map(|s| (s.kind(), s.address(), s.channel(), s.is_ready()))
            .collect();
        assert_eq!(
            built,
            vec![
                (SensorKind::Bme680, 0x76, Channel::new(1), false),
                (SensorKind::Sgp30, 0x58, Channel::new(2), false),
            ]
        );
    }

    #[test]
    fn channel_requires_switch() {
        let err = Config::from_toml(
            r#"
            [switch]
            enabled = false
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::ChannelWithoutSwitch {
                sensor: SensorKind::Bme680,
                ..
            }
        ));
    }

    #[test]
    fn sensors_on_the_default_segment_without_switch() {
        let config = Config::from_toml(
            r#"
            [switch]
            enabled = false

            [[sensor]]
            kind = "sgp30"
            "#,
        )
        .unwrap();

        assert!(config.switch().is_none());
        assert_eq!(config.sensors[0].channel(), None);
    }

    #[test]
    fn duplicate_address_on_one_segment_is_rejected() {
        let err = Config::from_toml(
            r#"
            [[sensor]]
            kind = "bme680"
            channel = 4

            [[sensor]]
            kind = "bme680"
            channel = 4
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::DuplicateAddress { address: 0x76, .. }
        ));
    }

    #[test]
    fn default_segment_address_clashes_with_every_channel() {
        let err = Config::from_toml(
            r#"
            [[sensor]]
            kind = "sgp30"

            [[sensor]]
            kind = "sgp30"
            channel = 2
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::DuplicateAddress {
                first: SensorKind::Sgp30,
                second: SensorKind::Sgp30,
                address: 0x58,
            }
        ));

        assert!(matches!(
            Config::from_toml(
                r#"
                [[sensor]]
                kind = "grove_gas"
                channel = 5

                [[sensor]]
                kind = "grove_gas"
                "#,
            ),
            Err(ConfigError::DuplicateAddress { address: 0x08, .. })
        ));
    }

    #[test]
    fn empty_sensor_list_is_rejected() {
        assert!(matches!(
            Config::from_toml("sensor = []"),
            Err(ConfigError::NoSensors)
        ));
    }

    #[test]
    fn same_address_on_different_channels_is_allowed() {
        Config::from_toml(
            r#"
            [[sensor]]
            kind = "bme680"
            channel = 4

            [[sensor]]
            kind = "bme680"
            channel = 5
            "#,
        )
        .unwrap();
    }

    #[test]
    fn sensor_cannot_shadow_switch() {
        let err = Config::from_toml(
            r#"
            [[sensor]]
            kind = "grove_gas"
            address = 0x70
            "#,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            ConfigError::SwitchAddress { address: 0x70, .. }
        ));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::from_toml("[cycle]\nperiod_ms = 0"),
            Err(ConfigError::ZeroPeriod)
        ));
        assert!(matches!(
            Config::from_toml("[[sensor]]\nkind = \"sgp30\"\nchannel = 8"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            Config::from_toml("[[sensor]]\nkind = \"aht20\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_names_the_path() {
        let err = Config::load("/nonexistent/enose.toml").unwrap_err();
        assert!(err.to_string().starts_with("Failed to read /nonexistent/enose.toml"));
    }
}
