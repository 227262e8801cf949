//! Concurrent access to one adapter from several instruments.

use daq_props::adapters::{share, Adapter};
use daq_props::prelude::*;
use std::thread;
use std::time::Duration;

/// Answers every read with the last command written, after a short delay.
#[derive(Default)]
struct SlowEcho {
    last: Option<String>,
}

impl Adapter for SlowEcho {
    fn write(&mut self, command: &str) -> Result<()> {
        self.last = Some(command.to_string());
        Ok(())
    }

    fn read(&mut self) -> Result<String> {
        thread::sleep(Duration::from_micros(50));
        self.last
            .take()
            .ok_or_else(|| PropError::Protocol("read without a command".into()))
    }

    fn read_bytes(&mut self, _count: usize) -> Result<Vec<u8>> {
        Err(PropError::Unsupported("binary reads"))
    }
}

fn echo_driver(name: &str, command: &str) -> std::sync::Arc<Driver> {
    Driver::builder(name)
        .property(
            Property::measurement("reply", command, "")
                .cast(Cast::Str)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[test]
fn queries_on_a_shared_adapter_never_cross() {
    let adapter = share(SlowEcho::default());
    let left = Instrument::with_adapter(&echo_driver("Left", "LEFT?"), adapter.clone());
    let right = Instrument::with_adapter(&echo_driver("Right", "RIGHT?"), adapter);

    thread::scope(|s| {
        for (inst, expected) in [(&left, "LEFT?"), (&right, "RIGHT?")] {
            s.spawn(move || {
                for _ in 0..200 {
                    assert_eq!(inst.get("reply").unwrap(), Value::from(expected));
                }
            });
        }
    });
}

#[test]
fn direct_asks_are_atomic_too() {
    let driver = Driver::builder("Bus").build().unwrap();
    let inst = Instrument::new(&driver, SlowEcho::default());

    thread::scope(|s| {
        for n in 0..4 {
            let inst = &inst;
            s.spawn(move || {
                let command = format!("Q{n}?");
                for _ in 0..100 {
                    assert_eq!(inst.ask(&command).unwrap(), command);
                }
            });
        }
    });
}
