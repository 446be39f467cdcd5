use {
    crate::{
        bus::{Bus, I2cBus},
        sensors::{Sensor, SensorError, SensorKind, Step},
        sink::{Event, Sink},
    },
    async_channel::{Receiver, Sender},
    log::{debug, info, warn},
    std::{future::Future, time::Duration},
    thiserror::Error,
    tokio::time,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Initializing,
    Running,
    /// No sensor is active; initialization is retried on a fixed backoff.
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("acquisition cancelled by shutdown")]
pub struct Cancelled;

/// Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Shutdown {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = async_channel::bounded(1);
        Self { tx, rx }
    }

    pub fn trigger(&self) {
        self.tx.close();
    }

    pub fn is_triggered(&self) -> bool {
        self.rx.is_closed()
    }

    pub async fn guard<F: Future>(&self, future: F) -> Result<F::Output, Cancelled> {
        if self.is_triggered() {
            return Err(Cancelled);
        }

        tokio::select! {
            output = future => Ok(output),
            _ = self.rx.recv() => Err(Cancelled),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.guard(time::delay_for(duration)).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    pub period: Duration,
    pub init_backoff: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
            init_backoff: Duration::from_secs(5),
        }
    }
}

struct Slot<I> {
    sensor: Box<dyn Sensor<I>>,
    active: bool,
}

pub struct AcquisitionCycle<I> {
    bus: Bus<I>,
    slots: Vec<Slot<I>>,
    config: CycleConfig,
    state: State,
}

impl<I: I2cBus> AcquisitionCycle<I> {
    pub fn new(bus: Bus<I>, config: CycleConfig) -> Self {
        Self {
            bus,
            slots: Vec::new(),
            config,
            state: State::Uninitialized,
        }
    }

    pub fn register(&mut self, sensor: Box<dyn Sensor<I>>) {
        self.slots.push(Slot {
            sensor,
            active: false,
        });
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn active(&self) -> Vec<SensorKind> {
        self.slots
            .iter()
            .filter(|slot| slot.active)
            .map(|slot| slot.sensor.kind())
            .collect()
    }

    pub fn into_bus(self) -> Bus<I> {
        self.bus
    }

    /// Initializes every sensor once. Sensors that fail stay inactive.
    pub async fn start<K: Sink>(
        &mut self,
        sink: &mut K,
        shutdown: &Shutdown,
    ) -> Result<State, Cancelled> {
        info!("Initializing {} sensors", self.slots.len());
        self.state = State::Initializing;

        if let Err(e) = self.bus.reset_switch() {
            warn!("Channel switch not responding: {}", e);
        }

        let active = self.initialize_inactive(sink, shutdown).await?;
        info!(
            "Initialization complete, {} of {} sensors active",
            active,
            self.slots.len()
        );

        self.state = if active > 0 {
            State::Running
        } else {
            warn!(
                "No sensors responded, retrying every {:?}",
                self.config.init_backoff
            );
            State::Degraded
        };
        Ok(self.state)
    }

    pub async fn poll<K: Sink>(
        &mut self,
        sink: &mut K,
        shutdown: &Shutdown,
    ) -> Result<usize, Cancelled> {
        debug!("Reading sensor data");

        let bus = &mut self.bus;
        let mut readings = 0;

        for slot in self.slots.iter_mut().filter(|slot| slot.active) {
            let sensor = &mut slot.sensor;
            match complete(shutdown, || sensor.read(bus)).await? {
                Ok(reading) => {
                    debug!(
                        "{} sampled at {}",
                        reading.sensor,
                        reading.time.format("%H:%M:%S%.3f")
                    );
                    emit(sink, Event::Reading(&reading));
                    readings += 1;
                }
                Err(e) => {
                    warn!("{}", e);
                    emit(sink, Event::Fault(&e));
                }
            }
        }

        Ok(readings)
    }

    pub async fn run<K: Sink>(&mut self, sink: &mut K, shutdown: &Shutdown) {
        if self.drive(sink, shutdown).await.is_err() {
            debug!("Shutdown reached the acquisition loop");
        }

        self.state = State::Stopped;
        info!("Acquisition stopped");
    }

    async fn drive<K: Sink>(&mut self, sink: &mut K, shutdown: &Shutdown) -> Result<(), Cancelled> {
        if self.state == State::Uninitialized {
            self.start(sink, shutdown).await?;
        }

        let mut interval = time::interval(self.config.period);
        loop {
            match self.state {
                State::Running => {
                    shutdown.guard(interval.tick()).await?;
                    self.poll(sink, shutdown).await?;
                }
                State::Degraded => {
                    shutdown.sleep(self.config.init_backoff).await?;
                    if self.initialize_inactive(sink, shutdown).await? > 0 {
                        info!("Sensors recovered, resuming acquisition");
                        self.state = State::Running;
                        interval = time::interval(self.config.period);
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    async fn initialize_inactive<K: Sink>(
        &mut self,
        sink: &mut K,
        shutdown: &Shutdown,
    ) -> Result<usize, Cancelled> {
        let bus = &mut self.bus;

        for slot in self.slots.iter_mut().filter(|slot| !slot.active) {
            let kind = slot.sensor.kind();
            let sensor = &mut slot.sensor;
            match complete(shutdown, || sensor.initialize(bus)).await? {
                Ok(()) => {
                    info!("{} initialized", kind);
                    slot.active = true;
                }
                Err(e) => {
                    warn!("{}", e);
                    emit(sink, Event::Fault(&e));
                }
            }
        }

        Ok(self.slots.iter().filter(|slot| slot.active).count())
    }
}

/// Repeats `step`, sleeping whenever the driver asks the device to settle.
async fn complete<T, F>(shutdown: &Shutdown, mut step: F) -> Result<Result<T, SensorError>, Cancelled>
where
    F: FnMut() -> Result<Step<T>, SensorError>,
{
    loop {
        match step() {
            Ok(Step::Settle(delay)) => shutdown.sleep(delay).await?,
            Ok(Step::Done(value)) => return Ok(Ok(value)),
            Err(e) => return Ok(Err(e)),
        }
    }
}

fn emit<K: Sink>(sink: &mut K, event: Event<'_>) {
    if let Err(e) = sink.emit(event) {
        warn!("Failed to write to output: {}", e);
    }
}
