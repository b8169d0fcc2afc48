//! Building a master from configuration through the process-wide runtime.
//!
//! One `Runtime` per process, so everything runs inside a single test.

use marionette::logging::LogSink;
use marionette::{Master, MasterError, Runtime, StartContext};
use marionette_common::config::{MasterConfig, PuppetSection};
use std::time::Duration;

fn config_with_main_puppet() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.puppets.push(PuppetSection::default());
    config
}

#[test]
fn test_from_config_validates_before_building() {
    let runtime = Runtime::init(LogSink::stderr(), StartContext::capture().unwrap()).unwrap();

    for bad in [-1.0, f64::NAN] {
        let mut config = config_with_main_puppet();
        config.master.nap_time = bad;
        assert!(
            matches!(Master::from_config(&config, &runtime), Err(MasterError::Config { .. })),
            "master nap_time {bad} must be rejected"
        );
    }

    let mut config = config_with_main_puppet();
    config.puppets[0].nap_time = -0.5;
    assert!(matches!(
        Master::from_config(&config, &runtime),
        Err(MasterError::Config { .. })
    ));

    assert!(matches!(
        Master::from_config(&MasterConfig::default(), &runtime),
        Err(MasterError::Config { .. })
    ));

    let master = Master::from_config(&config_with_main_puppet(), &runtime).unwrap();
    assert_eq!(master.settings().nap_time, config_with_main_puppet().nap_time());
    assert_eq!(master.family().map(|f| f.puppets().count()), Some(1));
    assert!(master.settings().timeout > Duration::ZERO);
}
