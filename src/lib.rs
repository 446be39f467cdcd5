pub mod bus;
pub mod config;
pub mod cycle;
pub mod sensors;
pub mod sink;
pub mod switch;

use {
    crate::{
        bus::Bus,
        config::Config,
        cycle::{AcquisitionCycle, Shutdown},
        sink::LineSink,
    },
    anyhow::{Context, Result},
    linux_embedded_hal::I2cdev,
    log::{info, warn},
    std::{env, io},
    tokio::{signal, task},
};

const I2C_DEV: &str = "/dev/i2c-1";

/// Runs acquisition on the host I2C adapter until Ctrl-C.
pub async fn acquire() -> Result<()> {
    let device = env::var("I2C_DEV").unwrap_or_else(|_| I2C_DEV.to_string());
    let config = Config::from_env()?;

    info!("Opening {}", device);
    let i2c = I2cdev::new(&device).with_context(|| format!("Failed to open {}", device))?;

    let mut cycle = AcquisitionCycle::new(Bus::new(i2c, config.switch()), config.cycle());
    for sensor in config.sensors::<I2cdev>() {
        info!(
            "Registered {} at {:#04x} on channel {}",
            sensor.kind(),
            sensor.address(),
            sensor
                .channel()
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        );
        cycle.register(sensor);
    }

    let shutdown = Shutdown::new();
    task::spawn({
        let shutdown = shutdown.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => {
                    info!("Interrupt received, stopping acquisition");
                    shutdown.trigger();
                }
                Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
            }
        }
    });

    let mut sink = LineSink::new(io::stdout(), config.sink.human);
    cycle.run(&mut sink, &shutdown).await;

    Ok(())
}
