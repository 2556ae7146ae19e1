use gpio_lifecycle::{
    Direction, Edge, GpioError, PeripheralRegistry, PinError, PinHandle, PinName,
    SimulatedDriver, Value,
};
use std::thread;

const PINS: [&str; 3] = ["BCM21", "BCM6", "GPIO6_IO14"];

// xorshift64, so the sequence is the same on every run.
struct Steps(u64);

impl Steps {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }
}

#[test]
fn never_more_than_one_open_handle_per_pin() {
    let sim = SimulatedDriver::new();
    let registry = PeripheralRegistry::new(sim.clone());
    let mut slots: Vec<Option<PinHandle>> = PINS.iter().map(|_| None).collect();
    let mut steps = Steps(0x2545_f491_4f6c_dd1d);

    for _ in 0..500 {
        let roll = steps.next();
        let idx = (roll % PINS.len() as u64) as usize;
        let name = PinName::from(PINS[idx]);

        match (roll >> 8) % 3 {
            0 => {
                let opened = if roll & 0x10000 == 0 {
                    registry.open(name.clone(), Direction::Input, Some(Edge::Both))
                } else {
                    registry.open_output(name.clone(), Value::High)
                };
                match (&slots[idx], opened) {
                    (None, Ok(handle)) => slots[idx] = Some(handle),
                    (Some(_), Err(GpioError::PinError(PinError::AlreadyOpen(n)))) => {
                        assert_eq!(n, name)
                    }
                    (held, other) => panic!(
                        "{} held={} unexpected open result {:?}",
                        name,
                        held.is_some(),
                        other
                    ),
                }
            }
            1 => {
                if let Some(mut handle) = slots[idx].take() {
                    registry.close(&mut handle).unwrap();
                    assert!(!handle.is_open());
                    // Closing twice is harmless.
                    handle.close().unwrap();
                }
            }
            _ => {
                // Dropping a handle releases the pin as well.
                slots[idx] = None;
            }
        }

        let held = slots.iter().filter(|slot| slot.is_some()).count();
        assert_eq!(registry.open_count().unwrap(), held);
        for (pin, slot) in PINS.iter().zip(&slots) {
            let pin = PinName::from(*pin);
            assert_eq!(registry.is_open(&pin).unwrap(), slot.is_some());
            assert_eq!(sim.is_open(&pin), slot.is_some());
        }
    }
}

#[test]
fn handle_dropped_on_another_thread_frees_the_pin() {
    let registry = PeripheralRegistry::new(SimulatedDriver::new());
    let handle = registry.open_output("BCM6", Value::Low).unwrap();

    thread::spawn(move || drop(handle)).join().unwrap();

    assert!(!registry.is_open(&PinName::from("BCM6")).unwrap());
    assert!(registry.open_output("BCM6", Value::Low).is_ok());
}

#[test]
fn edge_trigger_on_output_is_refused() {
    let registry = PeripheralRegistry::new(SimulatedDriver::new());

    assert!(matches!(
        registry.open("BCM6", Direction::Output, Some(Edge::Rising)),
        Err(GpioError::PinError(PinError::EdgeOnOutput(_)))
    ));
    assert_eq!(registry.open_count().unwrap(), 0);
}
