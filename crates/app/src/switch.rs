use semver::Version;
use serde_json::Value;
use tracing::{info, warn};

use crate::{error::Result, instance::Instance};

/// Instance setting that makes the application route every request to the test site instead
/// of relying on the built-in PHP web server.
pub const SWITCH_COMPLETELY_KEY: &str = "behat_switchcompletely";

/// PHP releases before this one have no built-in web server.
pub const EMBEDDED_SERVER_SINCE: Version = Version::new(5, 4, 0);

pub fn switch_completely_required(force: bool, runtime_version: &Version) -> bool {
    force || *runtime_version < EMBEDDED_SERVER_SINCE
}

/// Holds the switch-completely setting on an instance and removes it when released or dropped.
pub struct SwitchCompletelyGuard<'a> {
    instance: &'a dyn Instance,
    enabled: bool,
    released: bool,
}

impl<'a> SwitchCompletelyGuard<'a> {
    pub fn acquire(instance: &'a dyn Instance, force: bool) -> Result<Self> {
        let version = instance.runtime_version()?;
        let enabled = switch_completely_required(force, &version);
        if enabled && !force {
            info!(%version, "PHP has no built-in web server; enabling switch completely");
        }
        instance.set_config(SWITCH_COMPLETELY_KEY, Value::Bool(enabled))?;
        Ok(Self {
            instance,
            enabled,
            released: false,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Remove the setting now, reporting a failure instead of logging it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.instance.remove_config(SWITCH_COMPLETELY_KEY)?;
        Ok(())
    }
}

impl Drop for SwitchCompletelyGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.instance.remove_config(SWITCH_COMPLETELY_KEY) {
            warn!(?err, key = SWITCH_COMPLETELY_KEY, "failed to remove instance setting");
        }
    }
}

/// Run `f` with the switch-completely setting applied; it is removed however `f` finishes.
pub fn with_switch_complete_override<T>(
    instance: &dyn Instance,
    force: bool,
    f: impl FnOnce(bool) -> Result<T>,
) -> Result<T> {
    let guard = SwitchCompletelyGuard::acquire(instance, force)?;
    let result = f(guard.enabled());
    match result {
        Ok(value) => {
            guard.release()?;
            Ok(value)
        }
        Err(err) => {
            drop(guard);
            Err(err)
        }
    }
}
