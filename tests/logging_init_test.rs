//! Global subscriber installation; kept in its own binary so nothing else installs one first.

use daq_runcontrol::logging::{init, init_from_settings, LoggingConfig, LogFormat};
use daq_runcontrol::settings::DaqSettings;
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    init(LoggingConfig::new(Level::DEBUG).format(LogFormat::Compact)).unwrap();
    init(LoggingConfig::new(Level::INFO)).unwrap();
    init_from_settings(&DaqSettings::default()).unwrap();
    tracing::info!("logging initialised");
}
