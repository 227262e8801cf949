//! Per-instance overrides of dynamic property domains and validators.

use daq_props::prelude::*;
use daq_props::testing::{expected_protocol, Exchange, ProtocolAdapter};
use std::sync::Arc;

fn source_meter() -> Arc<Driver> {
    Driver::builder("SourceMeter")
        .property(
            Property::control("current", "CURR?", "CURR %g", "Source current in mA")
                .validator(Validator::StrictRange)
                .values(Domain::range(0.0, 100.0))
                .dynamic(true)
                .build()
                .unwrap(),
        )
        .property(
            Property::control("range", "RANG?", "RANG %d", "Range index")
                .validator(Validator::StrictDiscreteSet)
                .values(Domain::map(ValueMap::new([(0.1, 1), (1.0, 2)]).unwrap()))
                .map_values(true)
                .dynamic(true)
                .build()
                .unwrap(),
        )
        .property(
            Property::control("voltage", "VOLT?", "VOLT %g", "")
                .validator(Validator::StrictRange)
                .values(Domain::range(0.0, 20.0))
                .build()
                .unwrap(),
        )
        .build()
        .unwrap()
}

#[test]
fn narrowed_domain_applies_to_one_instance() {
    let driver = source_meter();
    expected_protocol(&driver, [Exchange::write("CURR 3")], |inst| {
        inst.set_values("current", Domain::range(0.0, 5.0)).unwrap();
        inst.set("current", 3).unwrap();
        assert!(matches!(inst.set("current", 10), Err(PropError::Validation(_))));
        assert_eq!(inst.effective_values("current").unwrap(), &Domain::range(0.0, 5.0));
    });
    // a fresh instance of the same driver keeps the declared limits
    expected_protocol(&driver, [Exchange::write("CURR 10")], |inst| {
        inst.set("current", 10).unwrap();
    });
}

#[test]
fn validator_and_domain_are_replaced_together() {
    expected_protocol(&source_meter(), [Exchange::write("CURR 10")], |inst| {
        inst.set_override(
            "current",
            Some(Validator::StrictDiscreteSet),
            Some(Domain::set([0.1, 1.0, 10.0])),
        )
        .unwrap();
        inst.set("current", 10).unwrap();
        assert!(matches!(inst.set("current", 5), Err(PropError::Validation(_))));
    });
}

#[test]
fn overrides_can_be_cleared() {
    expected_protocol(&source_meter(), [Exchange::write("CURR 0.5")], |inst| {
        inst.set_values("current", Domain::range(0.0, 0.1)).unwrap();
        inst.clear_override("current").unwrap();
        inst.set("current", 0.5).unwrap();
    });
}

#[test]
fn validator_override_truncates_instead_of_failing() {
    expected_protocol(&source_meter(), [Exchange::write("CURR 100")], |inst| {
        inst.set_validator("current", Validator::TruncatedRange).unwrap();
        inst.set("current", 300.0).unwrap();
        assert!(matches!(
            inst.effective_validator("current").unwrap(),
            Validator::TruncatedRange
        ));
    });
}

#[test]
fn mapped_override_changes_the_wire_tokens() {
    expected_protocol(
        &source_meter(),
        [Exchange::write("RANG 3"), Exchange::ask("RANG?", "3")],
        |inst| {
            inst.set_values(
                "range",
                Domain::map(ValueMap::new([(0.01, 3), (0.1, 4)]).unwrap()),
            )
            .unwrap();
            inst.set("range", 0.01).unwrap();
            assert_eq!(inst.get("range").unwrap(), Value::Float(0.01));
        },
    );
}

#[test]
fn static_properties_refuse_overrides() {
    expected_protocol(&source_meter(), Vec::<Exchange>::new(), |inst| {
        let err = inst.set_values("voltage", Domain::range(0.0, 5.0)).unwrap_err();
        assert!(matches!(err, PropError::NotDynamic(_)));
        assert_eq!(inst.effective_values("voltage").unwrap(), &Domain::range(0.0, 20.0));
    });
}

#[test]
fn incompatible_override_is_rejected() {
    expected_protocol(&source_meter(), Vec::<Exchange>::new(), |inst| {
        // a value-mapped property needs a map or a list
        let err = inst.set_values("range", Domain::range(0.0, 1.0)).unwrap_err();
        assert!(matches!(err, PropError::Declaration(_)));
        // a range validator cannot check a discrete set
        let err = inst.set_values("current", Domain::set([1, 2, 3])).unwrap_err();
        assert!(matches!(err, PropError::Declaration(_)));
        assert!(matches!(
            inst.set_values("unknown", Domain::Any),
            Err(PropError::UnknownProperty(_))
        ));
    });
}

#[test]
fn overrides_stay_on_the_overriding_channel() {
    let output = ChannelClass::new("Output")
        .property(
            Property::control("limit", "OUTP{ch}:LIM?", "OUTP{ch}:LIM %g", "")
                .validator(Validator::StrictRange)
                .values(Domain::range(0.0, 10.0))
                .dynamic(true)
                .build()
                .unwrap(),
        )
        .unwrap();
    let driver = Driver::builder("Supply")
        .channels(ChannelGroup::multi(output, [1, 2], "ch_"))
        .build()
        .unwrap();

    let adapter = ProtocolAdapter::new([Exchange::write("OUTP2:LIM 8")]);
    let script = adapter.clone();
    let mut supply = Instrument::new(&driver, adapter);
    supply
        .channel_mut("ch_1")
        .unwrap()
        .set_values("limit", Domain::range(0.0, 5.0))
        .unwrap();
    assert!(supply.channel("ch_1").unwrap().set("limit", 8).is_err());
    supply.channel("ch_2").unwrap().set("limit", 8).unwrap();
    script.assert_exhausted();
}
