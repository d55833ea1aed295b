//! Recording vehicle with fault injection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::world::SimWorld;
use crate::control::VelocityCommand;
use crate::vehicle::{Vehicle, VehicleError};

/// One call made on a [`SimVehicle`], successful or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehicleCall {
    Connect,
    Takeoff,
    Land,
    SetVelocity(VelocityCommand),
    AltitudeCm,
    BatteryPercent,
    Disconnect,
}

/// Ordered record of vehicle calls, shared with the test that inspects it.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<VehicleCall>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, call: VehicleCall) {
        self.calls.lock().push(call);
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<VehicleCall> {
        self.calls.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.lock().is_empty()
    }

    /// Number of calls matching `predicate`.
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&VehicleCall) -> bool,
    {
        self.calls.lock().iter().filter(|c| predicate(*c)).count()
    }

    /// Index of the first call matching `predicate`.
    pub fn position<F>(&self, predicate: F) -> Option<usize>
    where
        F: Fn(&VehicleCall) -> bool,
    {
        self.calls.lock().iter().position(predicate)
    }

    /// Index of the last call matching `predicate`.
    pub fn last_position<F>(&self, predicate: F) -> Option<usize>
    where
        F: Fn(&VehicleCall) -> bool,
    {
        self.calls.lock().iter().rposition(predicate)
    }

    /// Every velocity command sent, oldest first.
    pub fn velocity_commands(&self) -> Vec<VelocityCommand> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                VehicleCall::SetVelocity(cmd) => Some(*cmd),
                _ => None,
            })
            .collect()
    }

    /// Velocity commands other than [`VelocityCommand::HOLD`].
    pub fn motion_commands(&self) -> Vec<VelocityCommand> {
        self.velocity_commands()
            .into_iter()
            .filter(|cmd| !cmd.is_hold())
            .collect()
    }
}

#[derive(Debug, Default)]
struct FaultState {
    connect: AtomicBool,
    telemetry: AtomicBool,
    commands: AtomicBool,
    connect_delay: Mutex<Duration>,
}

/// Switches that make a [`SimVehicle`] misbehave. Shared; changes apply to
/// the next call.
#[derive(Debug, Clone, Default)]
pub struct SimFaults {
    inner: Arc<FaultState>,
}

impl SimFaults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect` time out.
    pub fn set_connect_failure(&self, fail: bool) {
        self.inner.connect.store(fail, Ordering::SeqCst);
    }

    /// Make altitude and battery reads time out.
    pub fn set_telemetry_failure(&self, fail: bool) {
        self.inner.telemetry.store(fail, Ordering::SeqCst);
    }

    /// Make takeoff, land and velocity commands fail.
    pub fn set_command_failure(&self, fail: bool) {
        self.inner.commands.store(fail, Ordering::SeqCst);
    }

    /// Delay every `connect`.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.inner.connect_delay.lock() = delay;
    }

    /// Turn every fault off.
    pub fn clear(&self) {
        self.set_connect_failure(false);
        self.set_telemetry_failure(false);
        self.set_command_failure(false);
        self.set_connect_delay(Duration::ZERO);
    }

    fn connect_fails(&self) -> bool {
        self.inner.connect.load(Ordering::SeqCst)
    }

    fn telemetry_fails(&self) -> bool {
        self.inner.telemetry.load(Ordering::SeqCst)
    }

    fn commands_fail(&self) -> bool {
        self.inner.commands.load(Ordering::SeqCst)
    }

    fn connect_delay(&self) -> Duration {
        *self.inner.connect_delay.lock()
    }
}

/// A [`Vehicle`] acting on a [`SimWorld`].
///
/// Every call is appended to the [`CallLog`] before it is checked, so failed
/// attempts are visible too.
pub struct SimVehicle {
    world: SimWorld,
    log: CallLog,
    faults: SimFaults,
    connected: bool,
}

impl SimVehicle {
    pub fn new(world: SimWorld) -> Self {
        Self {
            world,
            log: CallLog::new(),
            faults: SimFaults::new(),
            connected: false,
        }
    }

    /// Record into an existing log.
    pub fn with_log(mut self, log: CallLog) -> Self {
        self.log = log;
        self
    }

    /// Share fault switches with the caller.
    pub fn with_faults(mut self, faults: SimFaults) -> Self {
        self.faults = faults;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    pub fn faults(&self) -> SimFaults {
        self.faults.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    fn ensure_connected(&self) -> Result<(), VehicleError> {
        if self.connected {
            Ok(())
        } else {
            Err(VehicleError::NotConnected)
        }
    }

    fn ensure_commands(&self) -> Result<(), VehicleError> {
        self.ensure_connected()?;
        if self.faults.commands_fail() {
            return Err(VehicleError::Link("command not acknowledged".into()));
        }
        Ok(())
    }

    fn ensure_telemetry(&self) -> Result<(), VehicleError> {
        self.ensure_connected()?;
        if self.faults.telemetry_fails() {
            return Err(VehicleError::Timeout);
        }
        Ok(())
    }
}

impl Vehicle for SimVehicle {
    fn connect(&mut self) -> Result<(), VehicleError> {
        self.log.record(VehicleCall::Connect);
        let delay = self.faults.connect_delay();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if self.faults.connect_fails() {
            return Err(VehicleError::Timeout);
        }
        self.connected = true;
        Ok(())
    }

    fn takeoff(&mut self) -> Result<(), VehicleError> {
        self.log.record(VehicleCall::Takeoff);
        self.ensure_commands()?;
        self.world.take_off();
        Ok(())
    }

    fn land(&mut self) -> Result<(), VehicleError> {
        self.log.record(VehicleCall::Land);
        self.ensure_commands()?;
        self.world.land();
        Ok(())
    }

    fn set_velocity(&mut self, command: VelocityCommand) -> Result<(), VehicleError> {
        self.log.record(VehicleCall::SetVelocity(command));
        self.ensure_commands()?;
        self.world.set_velocity(command);
        Ok(())
    }

    fn altitude_cm(&mut self) -> Result<i32, VehicleError> {
        self.log.record(VehicleCall::AltitudeCm);
        self.ensure_telemetry()?;
        Ok(self.world.altitude_cm())
    }

    fn battery_percent(&mut self) -> Result<u8, VehicleError> {
        self.log.record(VehicleCall::BatteryPercent);
        self.ensure_telemetry()?;
        Ok(self.world.battery_percent())
    }

    fn disconnect(&mut self) -> Result<(), VehicleError> {
        self.log.record(VehicleCall::Disconnect);
        self.connected = false;
        Ok(())
    }
}
