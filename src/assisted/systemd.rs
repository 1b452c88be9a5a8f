use zbus::blocking::{Connection, Proxy};
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use super::{AssistedError, ServiceManager, UnitState};

const SYSTEMD_DEST: &str = "org.freedesktop.systemd1";
const SYSTEMD_PATH: &str = "/org/freedesktop/systemd1";
const MANAGER_IFACE: &str = "org.freedesktop.systemd1.Manager";
const UNIT_IFACE: &str = "org.freedesktop.systemd1.Unit";
const SERVICE_IFACE: &str = "org.freedesktop.systemd1.Service";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
const NO_SUCH_UNIT: &str = "org.freedesktop.systemd1.NoSuchUnit";

/// Watches a systemd unit over the system bus.
///
/// Owns its bus connection. `InactiveEnterTimestampMonotonic` is sampled
/// when the unit is started, so a unit still showing the result of an older
/// run is not mistaken for a finished one.
pub struct SystemdServiceManager {
    conn: Connection,
    unit: String,
    baseline: Option<u64>,
}

impl std::fmt::Debug for SystemdServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemdServiceManager")
            .field("unit", &self.unit)
            .field("baseline", &self.baseline)
            .finish()
    }
}

impl SystemdServiceManager {
    pub fn connect(unit: &str) -> Result<Self, AssistedError> {
        Ok(Self {
            conn: Connection::system()?,
            unit: unit.to_string(),
            baseline: None,
        })
    }

    fn manager(&self) -> zbus::Result<Proxy<'_>> {
        Proxy::new(&self.conn, SYSTEMD_DEST, SYSTEMD_PATH, MANAGER_IFACE)
    }

    /// Object path of the unit, if systemd has it loaded
    fn get_unit(&self) -> zbus::Result<Option<OwnedObjectPath>> {
        match self.manager()?.call("GetUnit", &(self.unit.as_str(),)) {
            Ok(path) => Ok(Some(path)),
            Err(zbus::Error::MethodError(name, _, _)) if name.as_str() == NO_SUCH_UNIT => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn get_property(&self, unit: &OwnedObjectPath, iface: &str, name: &str) -> zbus::Result<OwnedValue> {
        let props = Proxy::new(&self.conn, SYSTEMD_DEST, unit.as_str(), PROPERTIES_IFACE)?;
        props.call("Get", &(iface, name))
    }

    fn string_property(&self, unit: &OwnedObjectPath, iface: &str, name: &str) -> zbus::Result<String> {
        let value = self.get_property(unit, iface, name)?;
        match &*value {
            Value::Str(s) => Ok(s.as_str().to_string()),
            other => Err(zbus::Error::Failure(format!(
                "{}.{} is not a string: {:?}",
                iface, name, other
            ))),
        }
    }

    fn inactive_since(&self, unit: &OwnedObjectPath) -> zbus::Result<u64> {
        let value = self.get_property(unit, UNIT_IFACE, "InactiveEnterTimestampMonotonic")?;
        match &*value {
            Value::U64(ts) => Ok(*ts),
            other => Err(zbus::Error::Failure(format!(
                "InactiveEnterTimestampMonotonic is not a u64: {:?}",
                other
            ))),
        }
    }

    /// Whether the unit has a job queued. `Job` is `(uo)` with id 0 for none.
    fn job_pending(&self, unit: &OwnedObjectPath) -> zbus::Result<bool> {
        let value = self.get_property(unit, UNIT_IFACE, "Job")?;
        if let Value::Structure(job) = &*value {
            if let Some(Value::U32(id)) = job.fields().first() {
                return Ok(*id != 0);
            }
        }
        Err(zbus::Error::Failure(format!("Job is not a (uo) pair: {:?}", &*value)))
    }
}

/// How far our start request has got
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StartProgress {
    NotStarted,
    /// Start job still queued; the unit may show an older run's state
    Queued,
    /// The unit went inactive again after we started it
    Finished,
    /// Start job is gone but the unit never ran (unmet condition, failed
    /// dependency, skipped job)
    Skipped,
}

/// Map systemd's ActiveState/Result pair to a unit state.
pub(crate) fn map_state(active_state: &str, result: &str, progress: StartProgress) -> UnitState {
    match (active_state, progress) {
        ("activating", _) => UnitState::Activating,
        ("active" | "reloading" | "deactivating" | "refreshing", _) => UnitState::Active,
        ("inactive" | "failed", StartProgress::NotStarted | StartProgress::Queued) => {
            UnitState::Inactive
        }
        ("inactive", StartProgress::Finished) if result == "success" => UnitState::Succeeded,
        ("inactive" | "failed", StartProgress::Finished) => {
            UnitState::Failed(format!("{} (result: {})", active_state, result))
        }
        ("inactive" | "failed", StartProgress::Skipped) => UnitState::Failed(format!(
            "{} without running, start job finished (result: {})",
            active_state, result
        )),
        (other, _) => {
            tracing::debug!("Unknown ActiveState {}, treating as running", other);
            UnitState::Active
        }
    }
}

impl ServiceManager for SystemdServiceManager {
    fn describe(&self) -> String {
        self.unit.clone()
    }

    fn status(&mut self) -> Result<UnitState, AssistedError> {
        let Some(unit) = self.get_unit()? else {
            return Ok(UnitState::NotPresent);
        };

        let active_state = self.string_property(&unit, UNIT_IFACE, "ActiveState")?;
        let result = self.string_property(&unit, SERVICE_IFACE, "Result")?;

        let progress = match self.baseline {
            None => StartProgress::NotStarted,
            Some(baseline) if self.inactive_since(&unit)? > baseline => StartProgress::Finished,
            Some(_) if self.job_pending(&unit)? => StartProgress::Queued,
            Some(_) => StartProgress::Skipped,
        };

        tracing::debug!(
            "{}: ActiveState={} Result={} progress={:?}",
            self.unit,
            active_state,
            result,
            progress
        );
        Ok(map_state(&active_state, &result, progress))
    }

    fn start(&mut self) -> Result<(), AssistedError> {
        let baseline = match self.get_unit()? {
            Some(unit) => self.inactive_since(&unit)?,
            None => 0,
        };

        let job: OwnedObjectPath = self
            .manager()?
            .call("StartUnit", &(self.unit.as_str(), "fail"))?;
        tracing::debug!("Queued start of {} as job {}", self.unit, job.as_str());

        self.baseline = Some(baseline);
        Ok(())
    }
}
