use {
    crate::sensors::{Reading, SensorError, SensorKind},
    std::io::{self, Write},
};

#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    Reading(&'a Reading),
    Fault(&'a SensorError),
}

pub trait Sink {
    fn emit(&mut self, event: Event<'_>) -> io::Result<()>;
}

/// Machine lines (`DATA,<ohms>,` and `<eco2>,<tvoc>`) are always written,
/// human readable lines only on request.
pub struct LineSink<W> {
    out: W,
    human: bool,
}

impl<W: Write> LineSink<W> {
    pub fn new(out: W, human: bool) -> Self {
        Self { out, human }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn reading(&mut self, reading: &Reading) -> io::Result<()> {
        let value = |name: &str| reading.get(name);
        let quantity = |name: &str, precision: usize| {
            reading.measurement(name).map_or_else(
                || "n/a".to_string(),
                |m| format!("{:.*}{}", precision, m.value, m.unit.symbol()),
            )
        };

        match reading.sensor {
            SensorKind::Bme680 => {
                if self.human {
                    write!(
                        self.out,
                        "BME680 - Temp: {}, Humidity: {}, Pressure: {}",
                        quantity("temperature", 2),
                        quantity("humidity", 2),
                        quantity("pressure", 2),
                    )?;
                    if value("gas_resistance").is_some() {
                        write!(self.out, ", Gas Resistance: {}", quantity("gas_resistance", 2))?;
                    }
                    writeln!(self.out)?;
                }
                if let Some(gas) = value("gas_resistance") {
                    writeln!(self.out, "DATA,{:.2},", f64::from(gas) * 1000.0)?;
                }
            }
            SensorKind::Sgp30 => {
                let tvoc = value("tvoc").unwrap_or(f32::NAN);
                let eco2 = value("eco2").unwrap_or(f32::NAN);
                if self.human {
                    writeln!(
                        self.out,
                        "SGP30 - TVOC: {}, eCO2: {}",
                        quantity("tvoc", 0),
                        quantity("eco2", 0)
                    )?;
                }
                writeln!(self.out, "{},{}", eco2, tvoc)?;
            }
            SensorKind::GroveGas => {
                if self.human {
                    writeln!(
                        self.out,
                        "Grove Gas Sensor - CO: {}, NO2: {}, NH3: {}, CH4: {}",
                        quantity("co", 0),
                        quantity("no2", 0),
                        quantity("nh3", 0),
                        quantity("ch4", 0),
                    )?;
                }
            }
        }

        Ok(())
    }
}

impl<W: Write> Sink for LineSink<W> {
    fn emit(&mut self, event: Event<'_>) -> io::Result<()> {
        match event {
            Event::Reading(reading) => self.reading(reading)?,
            Event::Fault(error) if self.human => writeln!(self.out, "{}", error)?,
            Event::Fault(_) => {}
        }

        self.out.flush()
    }
}
