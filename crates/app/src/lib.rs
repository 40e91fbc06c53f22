//! Provisioning and process orchestration for running a Behat suite against a local instance.
//!
//! [`driver::Driver`] ties the pieces together: it probes for JavaScript support, installs
//! Composer and the Selenium server when missing, applies the switch-completely setting for
//! the duration of the run, and supervises the PHP web server and Selenium while Behat runs.

pub mod check;
pub mod config;
pub mod driver;
pub mod error;
pub mod instance;
pub mod probe;
pub mod provision;
pub mod supervisor;
pub mod switch;

pub use error::{HarnessError, Result};
