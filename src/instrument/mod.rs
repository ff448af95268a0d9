//! Instrument links and drivers

pub mod dispatcher;
pub mod driver;
pub mod factory;

pub use dispatcher::{DispatchError, ScpiDispatcher};
pub use driver::InstrumentDriver;
pub use factory::DriverFactory;
