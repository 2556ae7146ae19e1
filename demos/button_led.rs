//! Button-controlled LED.
//!
//! Pressing the button (falling edge) starts three seconds of background work on `ButtonThread`, after which the
//! LED blinks three times. The program then stops and restarts its lifecycle once, which releases and reopens both
//! pins, waits for one more press and shuts down.
//!
//! On a Raspberry Pi 3 the button goes to BCM21 (pulled up, shorted to ground when pressed) and the LED anode to
//! BCM6 through a resistor. Set `GPIO_LIFECYCLE_DEVICE` to override model detection.
//!
//! Without hardware, run with `GPIO_LIFECYCLE_SIMULATE=1`: a thread presses a simulated button instead.
//! Log output is controlled through `RUST_LOG`, e.g. `RUST_LOG=debug`.

use gpio_lifecycle::app::{ButtonLed, ButtonLedConfig};
use gpio_lifecycle::{
    BoardDefaults, DeviceModel, Foreground, Lifecycle, PeripheralRegistry, PinName,
    SimulatedDriver, SysfsDriver, Value,
};
use std::env;
use std::error::Error;
use std::thread;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SIMULATE_ENV: &str = "GPIO_LIFECYCLE_SIMULATE";
const WAIT_FOR_PRESS: Duration = Duration::from_secs(60);

fn press_later(sim: SimulatedDriver, button: PinName, after: Duration) {
    thread::spawn(move || {
        thread::sleep(after);
        log::info!("pressing {}", button);
        sim.press(&button);
        thread::sleep(Duration::from_millis(50));
        sim.release(&button);
    });
}

fn wait_for_presses(app: &ButtonLed, foreground: &mut Foreground, count: usize) -> Result<(), Box<dyn Error>> {
    foreground.run_while(
        || app.completions().map_or(false, |done| done.len() < count),
        WAIT_FOR_PRESS,
    )?;
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let simulated = env::var_os(SIMULATE_ENV).map(|_| SimulatedDriver::new());
    let (board, registry) = match &simulated {
        Some(sim) => {
            let board = BoardDefaults::for_device(DeviceModel::Rpi3);
            sim.preset(&board.button, Value::High);
            (board, PeripheralRegistry::new(sim.clone()))
        }
        None => (BoardDefaults::detect()?, PeripheralRegistry::new(SysfsDriver::default())),
    };
    log::info!("button on {}, LED on {}", board.button, board.led);

    let mut lifecycle = Lifecycle::new();
    let mut foreground = Foreground::new();
    let app = ButtonLed::start(
        &registry,
        &board,
        &mut lifecycle,
        &foreground,
        ButtonLedConfig::default(),
    )?;
    lifecycle.start()?;

    if let Some(sim) = &simulated {
        press_later(sim.clone(), board.button.clone(), Duration::from_secs(1));
    }
    wait_for_presses(&app, &mut foreground, 1)?;

    log::info!("pausing: pins are released");
    lifecycle.stop()?;
    thread::sleep(Duration::from_secs(1));
    lifecycle.start()?;
    log::info!("resumed: press the button once more");

    if let Some(sim) = &simulated {
        press_later(sim.clone(), board.button.clone(), Duration::from_secs(1));
    }
    wait_for_presses(&app, &mut foreground, 2)?;

    lifecycle.destroy()?;
    log::info!("{} presses handled", app.presses());
    Ok(())
}
