// GNSS coordinator
// Drives a positioning engine, its assisted-data connections and time/ephemeris
// sync from a single worker thread.

pub mod alarm;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod hal;
pub mod listeners;
pub mod mock;
pub mod provider;
pub mod sync;
pub mod usage;
pub mod worker;

pub use config::GnssConfig;
pub use engine::{EngineSession, ProviderStatus};
pub use error::{GnssError, GnssResult};
pub use hal::{GnssCallbacks, GnssDriver, Location};
pub use listeners::{ChannelObserver, StatusEvent, StatusObserver};
pub use provider::{ExtraCommand, GnssLocationProvider, ProviderSnapshot, Services};
pub use worker::FixRequest;
