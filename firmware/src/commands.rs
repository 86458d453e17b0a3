//! Sensor setup requested by the host.

use eddyprobe_common::ldc1612::Ldc1612;
use eddyprobe_common::pool::{PoolError, SensorPool};
use eddyprobe_common::protocol::ErrorCode;
use eddyprobe_config::Config;

/// Create the sensor `oid` and claim its data ready pin, if any.
///
/// The pin is handed out for the sample timer of the new sensor. Nothing is
/// claimed if the command fails.
pub fn configure<P>(
    pool: &mut SensorPool,
    config: &Config,
    pins: &mut [Option<P>],
    oid: u8,
    bus_device: u8,
    intb_pin: Option<u8>,
) -> Result<Option<P>, ErrorCode> {
    let address = config
        .bus_device(bus_device)
        .ok_or(ErrorCode::UnknownBusDevice)?;

    // Validate the oid before a pin is taken
    match pool.get(oid) {
        Ok(_) => return Err(ErrorCode::OidInUse),
        Err(e @ PoolError::OutOfRange(_)) => return Err(e.into()),
        Err(_) => {}
    }

    let pin = match intb_pin {
        None => None,
        Some(index) => Some(
            pins.get_mut(usize::from(index))
                .and_then(Option::take)
                .ok_or(ErrorCode::InvalidPin)?,
        ),
    };
    pool.config(oid, Ldc1612::new(address), pin.is_some())?;
    Ok(pin)
}
