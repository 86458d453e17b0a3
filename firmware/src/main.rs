#![no_main]
#![no_std]
#![cfg(target_arch = "arm")]

// Third party
use panic_persist as _;

// First party crates
use eddyprobe_common::clock::{Clock, Instant};
use eddyprobe_common::pool::MAX_SENSORS;
use eddyprobe_common::scheduler::SampleMailbox;

// Modules
mod commands;
mod monotonic_stm32l0;

const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Number of pins usable as data ready input (PA0, PA1).
const INTB_PINS: usize = 2;

#[allow(clippy::declare_interior_mutable_const)]
const IDLE_MAILBOX: SampleMailbox = SampleMailbox::new();

/// Sample handoff from `sample_event` to `sensor_task`, indexed by oid.
static MAILBOXES: [SampleMailbox; MAX_SENSORS] = [IDLE_MAILBOX; MAX_SENSORS];

/// System time from the monotonic timer.
struct MonoClock;

impl Clock for MonoClock {
    fn now(&self) -> Instant {
        app::monotonics::now()
    }
}

#[rtic::app(device = stm32l0xx_hal::pac, peripherals = true, dispatchers = [SPI1, SPI2])]
mod app {
    // Libcore
    use core::fmt::Write;

    // Third party
    use stm32l0xx_hal::gpio::{
        gpioa::{PA10, PA9},
        Input, OpenDrain, Output, Pin, PullUp, PushPull,
    };
    use stm32l0xx_hal::prelude::*;
    use stm32l0xx_hal::{self as hal, i2c::I2c, pac, serial, time};

    // First party crates
    use eddyprobe_common::link::{HostLink, TriggerLine};
    use eddyprobe_common::pool::{SensorPool, MAX_SENSORS};
    use eddyprobe_common::protocol::{Command, ErrorCode, Parser, ProtocolError, Response};
    use eddyprobe_common::scheduler::SampleTimer;
    use eddyprobe_common::sensor::SampleReport;
    use eddyprobe_config::Config;

    // Crate-internal
    use crate::commands;
    use crate::monotonic_stm32l0::ExtendedTim2;
    use crate::{MonoClock, FIRMWARE_VERSION, INTB_PINS, MAILBOXES};

    type I2C1 = I2c<pac::I2C1, PA10<Output<OpenDrain>>, PA9<Output<OpenDrain>>>;
    type IntbPin = Pin<Input<PullUp>>;
    type DebugSerial = serial::Serial<pac::USART1>;

    #[monotonic(binds = TIM2, default = true)]
    type MonoTimer = ExtendedTim2;

    #[shared]
    struct Shared {
        timers: [SampleTimer<IntbPin>; MAX_SENSORS],
        handles: [Option<sample_event::SpawnHandle>; MAX_SENSORS],

        // Serial debug output
        #[lock_free]
        debug: DebugSerial,

        #[lock_free]
        pool: SensorPool,
        #[lock_free]
        i2c: I2C1,
        #[lock_free]
        host: HostLink<serial::Tx<pac::USART2>>,
        #[lock_free]
        trigger: TriggerLine<Pin<Output<PushPull>>>,
        /// Data ready pins not yet claimed by a sensor
        #[lock_free]
        intb_pins: [Option<IntbPin>; INTB_PINS],
        #[lock_free]
        config: Config,
    }

    #[local]
    struct Local {
        host_rx: serial::Rx<pac::USART2>,
    }

    #[init]
    fn init(ctx: init::Context) -> (Shared, Local, init::Monotonics) {
        let mut dp: pac::Peripherals = ctx.device;

        // Clock configuration. Use HSI at 16 MHz, the monotonic depends on it.
        let mut rcc = dp.RCC.freeze(hal::rcc::Config::hsi16());

        // Initialize monotonic timer TIM2
        let mono = ExtendedTim2::init(dp.TIM2);

        // Get access to GPIOs
        let gpioa = dp.GPIOA.split(&mut rcc);
        let gpiob = dp.GPIOB.split(&mut rcc);

        // Initialize debug serial port
        let mut debug = serial::Serial::usart1(
            dp.USART1,
            gpiob.pb6.into_floating_input(),
            gpiob.pb7.into_floating_input(),
            serial::Config {
                baudrate: time::Bps(57_600),
                wordlength: serial::WordLength::DataBits8,
                parity: serial::Parity::ParityNone,
                stopbits: serial::StopBits::STOP1,
            },
            &mut rcc,
        )
        .expect("Could not initialize debug serial");

        writeln!(debug, "Booting: eddy probe firmware={}", FIRMWARE_VERSION).ok();

        // Check whether we just woke up after a panic
        if let Some(msg) = panic_persist::get_panic_message_utf8() {
            // If yes, send backtrace via serial
            writeln!(debug, "=== 🔥 FOUND PANIC 🔥 ===").ok();
            writeln!(debug, "{}", msg.trim_end()).ok();
            writeln!(debug, "==== 🚒 END PANIC 🚒 ====").ok();
        }

        // Dump EEPROM config data
        if cfg!(feature = "dev") {
            writeln!(debug, "\nEEPROM contents at 0x0808_0000:").ok();
            let config_data: &[u8] = unsafe {
                core::slice::from_raw_parts(
                    eddyprobe_config::BASE_ADDR as *const u8,
                    eddyprobe_config::CONFIG_DATA_SIZE,
                )
            };
            for byte in config_data {
                write!(debug, " {:02x}", byte).ok();
            }
            write!(debug, "\n\n").ok();
        }

        // Read config from EEPROM
        //
        // Note(unsafe): We need to guarantee that no part of the code can
        // write to EEPROM while it's being read. To ensure that, we hold a
        // mutable reference to the FLASH peripheral.
        let config = match unsafe {
            let _flash = &mut dp.FLASH;
            Config::read_from_eeprom()
        } {
            Ok(c) => c,
            Err(e) => panic!("Error: Could not read config from EEPROM: {}", e),
        };
        writeln!(
            debug,
            "Loaded config (v{}) from EEPROM: I²C {} kHz, bus fault policy {:?}",
            config.version, config.i2c_speed_khz, config.bus_fault_policy,
        )
        .ok();

        // Initialize host link
        writeln!(debug, "Initialize host link ({} baud)", config.host_baud).ok();
        let mut host_serial = serial::Serial::usart2(
            dp.USART2,
            gpioa.pa2.into_floating_input(),
            gpioa.pa3.into_floating_input(),
            serial::Config {
                baudrate: time::Bps(config.host_baud),
                wordlength: serial::WordLength::DataBits8,
                parity: serial::Parity::ParityNone,
                stopbits: serial::StopBits::STOP1,
            },
            &mut rcc,
        )
        .expect("Could not initialize host serial");
        host_serial.listen(serial::Event::Rxne);
        let (host_tx, host_rx) = host_serial.split();

        // Set up I²C pins
        writeln!(debug, "Initialize I²C peripheral").ok();
        let sda = gpioa.pa10.into_open_drain_output();
        let scl = gpioa.pa9.into_open_drain_output();
        let i2c = dp
            .I2C1
            .i2c(sda, scl, u32::from(config.i2c_speed_khz).khz(), &mut rcc);

        // Data ready inputs and trigger output
        let intb_pins = [
            Some(gpioa.pa0.into_pull_up_input().downgrade()),
            Some(gpioa.pa1.into_pull_up_input().downgrade()),
        ];
        let trigger = TriggerLine::new(gpiob.pb0.into_push_pull_output().downgrade());

        writeln!(debug, "Initialization done").ok();

        (
            Shared {
                timers: core::array::from_fn(|_| SampleTimer::new(None)),
                handles: Default::default(),
                debug,
                pool: SensorPool::new(),
                i2c,
                host: HostLink::new(host_tx),
                trigger,
                intb_pins,
                config,
            },
            Local { host_rx },
            init::Monotonics(mono),
        )
    }

    /// Periodic sample timer event of sensor `oid`.
    #[task(shared = [timers, handles], priority = 3, capacity = 8)]
    fn sample_event(ctx: sample_event::Context, oid: u8, epoch: u8) {
        let idx = usize::from(oid);
        let mut timers = ctx.shared.timers;
        let mut handles = ctx.shared.handles;
        let event = match timers.lock(|timers| timers[idx].on_event(&MAILBOXES[idx], epoch)) {
            Some(event) => event,
            None => return,
        };
        let handle = sample_event::spawn_at(event.next.at, oid, event.next.epoch).ok();
        handles.lock(|handles| handles[idx] = handle);
        if event.wake {
            // Already queued if the task is busy, it drains all sensors
            sensor_task::spawn().ok();
        }
    }

    /// Process one pending sample. Re-spawns itself while samples of other
    /// sensors are pending, so that host commands are served in between.
    #[task(shared = [debug, pool, i2c, host, trigger, config], local = [last: Option<u8> = None], priority = 1)]
    fn sensor_task(ctx: sensor_task::Context) {
        let sensor_task::SharedResources {
            debug,
            pool,
            i2c,
            host,
            trigger,
            config,
            ..
        } = ctx.shared;
        let last = ctx.local.last;

        let oid = match pool.next_pending(&MAILBOXES, *last) {
            Some(oid) => oid,
            None => return,
        };
        *last = Some(oid);

        if let Ok(sensor) = pool.get_mut(oid) {
            let report = sensor.process_sample(
                oid,
                &mut *i2c,
                &MAILBOXES[usize::from(oid)],
                &MonoClock,
                config.bus_fault_policy.into(),
                &mut *trigger,
                &mut *host,
            );
            match report {
                Ok(SampleReport::Dropped) => {
                    if cfg!(feature = "dev") {
                        writeln!(debug, "Sensor {}: Sample dropped", oid).ok();
                    }
                }
                Ok(_) => {}
                Err(e) => panic!("Error: Sensor {}: {}", oid, e),
            }
        }

        if let Some((sync_oid, reason)) = trigger.take_fired() {
            host.send(&Response::Trigger { sync_oid, reason });
            if cfg!(feature = "dev") {
                writeln!(debug, "Sensor {}: Homing done (reason {})", oid, reason).ok();
            }
        }

        if pool.next_pending(&MAILBOXES, Some(oid)).is_some() {
            sensor_task::spawn().ok();
        }
    }

    /// Receive host link bytes.
    #[task(binds = USART2, local = [host_rx, parser: Parser = Parser::new()], priority = 2)]
    fn host_receive(ctx: host_receive::Context) {
        while let Ok(byte) = ctx.local.host_rx.read() {
            if let Some(received) = ctx.local.parser.push(byte) {
                // Commands are dropped while the queue is full, the host
                // retries on missing replies
                host_command::spawn(received).ok();
            }
        }
    }

    /// Execute a host command.
    #[task(
        shared = [timers, handles, debug, pool, i2c, host, trigger, intb_pins, config],
        priority = 1,
        capacity = 4
    )]
    fn host_command(ctx: host_command::Context, received: Result<Command, ProtocolError>) {
        let host_command::SharedResources {
            mut timers,
            mut handles,
            debug,
            pool,
            i2c,
            host,
            trigger,
            intb_pins,
            config,
            ..
        } = ctx.shared;

        let command = match received {
            Ok(command) => command,
            Err(e) => {
                writeln!(debug, "Host link: {}", e).ok();
                host.send(&Response::Error {
                    code: e.error_code(),
                    oid: e.oid(),
                });
                return;
            }
        };
        if cfg!(feature = "dev") {
            writeln!(debug, "Command: {:?}", command).ok();
        }

        let oid = command.oid();
        let idx = usize::from(oid);
        let result: Result<(), ErrorCode> = match command {
            Command::Config {
                oid,
                bus_device,
                intb_pin,
            } => commands::configure(pool, config, intb_pins, oid, bus_device, intb_pin).map(
                |data_ready| {
                    timers.lock(|timers| timers[idx] = SampleTimer::new(data_ready));
                    writeln!(debug, "Sensor {} configured (bus device {})", oid, bus_device).ok();
                },
            ),
            Command::SetupHome { oid, request } => pool
                .get_mut(oid)
                .map(|sensor| {
                    if request.trigger_threshold != 0 {
                        trigger.release();
                    }
                    sensor.setup_home(&request);
                })
                .map_err(ErrorCode::from),
            Command::QueryHomeState { oid } => pool
                .get(oid)
                .map(|sensor| host.send(&Response::HomeState(sensor.home_state(oid))))
                .map_err(ErrorCode::from),
            Command::Query { oid, rest_ticks } => pool
                .get_mut(oid)
                .map(|sensor| {
                    if rest_ticks != 0 {
                        sensor.start_sampling();
                    }
                    (&mut timers, &mut handles).lock(|timers, handles| {
                        if let Some(handle) = handles[idx].take() {
                            // Fails if the event is already running, its
                            // stale epoch makes it a no-op
                            handle.cancel().ok();
                        }
                        let schedule =
                            timers[idx].arm(&MAILBOXES[idx], monotonics::now(), rest_ticks);
                        handles[idx] = schedule.and_then(|schedule| {
                            sample_event::spawn_at(schedule.at, oid, schedule.epoch).ok()
                        });
                    });
                })
                .map_err(ErrorCode::from),
            Command::QueryStatus { oid } => pool
                .get(oid)
                .map(|sensor| {
                    let status = if sensor.has_data_ready() {
                        let (asserted, now) = timers.lock(|timers| {
                            critical_section::with(|_| {
                                (
                                    timers[idx].data_ready_asserted().unwrap_or(false),
                                    monotonics::now(),
                                )
                            })
                        });
                        sensor.status_from_pin(oid, now, asserted)
                    } else {
                        match sensor.status_polled(
                            oid,
                            &mut *i2c,
                            &MonoClock,
                            config.bus_fault_policy.into(),
                        ) {
                            Ok(status) => status,
                            Err(e) => panic!("Error: Sensor {}: {}", oid, e),
                        }
                    };
                    host.send(&Response::BulkStatus(status));
                })
                .map_err(ErrorCode::from),
        };

        if let Err(code) = result {
            writeln!(debug, "Command for oid {} failed: {:?}", oid, code).ok();
            host.send(&Response::Error { code, oid });
        }
    }
}
