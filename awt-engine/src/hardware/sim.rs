//! Simulation backend
//!
//! Deterministic stand-ins for the device and sensor traits. Used by
//! `--simulation` mode and by the test suite: every operation succeeds
//! instantly, gets journaled, and can be failed on demand.

use super::{ColorReading, Device, DeviceError, DeviceResult, LowerTarget, Pump, Sensor, Station};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type OpHook = Box<dyn FnMut(&str) + Send>;

#[derive(Default)]
struct SimDeviceInner {
    journal: Vec<String>,
    /// Op names (the part before ':') that should fail
    fail_ops: HashSet<String>,
    hook: Option<OpHook>,
}

/// Simulated actuation backend.
#[derive(Clone, Default)]
pub struct SimDevice {
    inner: Arc<Mutex<SimDeviceInner>>,
}

impl SimDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every op recorded so far, e.g. `move:Mixer`, `withdraw:0.80`.
    pub fn journal(&self) -> Vec<String> {
        self.inner.lock().expect("sim device lock").journal.clone()
    }

    /// Make every future occurrence of `op` (journal prefix before ':')
    /// report failure.
    pub fn fail_on(&self, op: &str) {
        self.inner
            .lock()
            .expect("sim device lock")
            .fail_ops
            .insert(op.to_string());
    }

    /// Install a callback invoked after each successful op, with the
    /// journal entry. Tests use this to flip flags mid-run.
    pub fn set_hook(&self, hook: impl FnMut(&str) + Send + 'static) {
        self.inner.lock().expect("sim device lock").hook = Some(Box::new(hook));
    }

    fn record(&self, entry: String) -> DeviceResult<()> {
        let mut inner = self.inner.lock().expect("sim device lock");
        let op_name = entry.split(':').next().unwrap_or(&entry).to_string();
        if inner.fail_ops.contains(&op_name) {
            return Err(DeviceError::Io(format!("simulated failure: {entry}")));
        }
        inner.journal.push(entry.clone());
        if let Some(hook) = inner.hook.as_mut() {
            hook(&entry);
        }
        Ok(())
    }

    /// Count of journal entries whose op name matches.
    pub fn count_op(&self, op: &str) -> usize {
        self.journal()
            .iter()
            .filter(|e| e.split(':').next() == Some(op))
            .count()
    }
}

impl Device for SimDevice {
    async fn move_to(&self, station: Station) -> DeviceResult<()> {
        self.record(format!("move:{station}"))
    }

    async fn raise_syringe(&self) -> DeviceResult<()> {
        self.record("raise".to_string())
    }

    async fn lower_into(&self, target: LowerTarget) -> DeviceResult<()> {
        self.record(format!("lower:{target}"))
    }

    async fn withdraw(&self, ml: f64) -> DeviceResult<()> {
        self.record(format!("withdraw:{ml:.2}"))
    }

    async fn dispense(&self) -> DeviceResult<()> {
        self.record("dispense".to_string())
    }

    async fn run_agitator(&self, secs: f64) {
        let _ = self.record(format!("agitate:{secs}"));
    }

    async fn agitator_off(&self) {
        let _ = self.record("agitator_off".to_string());
    }

    async fn run_pump(&self, pump: Pump, amount: f64) -> DeviceResult<()> {
        self.record(format!("pump:{pump}:{amount:.2}"))
    }

    async fn home(&self) -> DeviceResult<()> {
        self.record("home".to_string())
    }
}

type ColorFn = Box<dyn Fn(usize) -> ColorReading + Send + Sync>;

#[derive(Default)]
struct SimSensorInner {
    colors: VecDeque<ColorReading>,
    ph_values: VecDeque<f64>,
}

/// Simulated measurement backend with scripted readings.
#[derive(Clone)]
pub struct SimSensor {
    inner: Arc<Mutex<SimSensorInner>>,
    color_fn: Arc<Mutex<Option<ColorFn>>>,
    default_color: ColorReading,
    default_ph: f64,
    color_reads: Arc<AtomicUsize>,
    calibrations: Arc<AtomicUsize>,
}

impl SimSensor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimSensorInner::default())),
            color_fn: Arc::new(Mutex::new(None)),
            default_color: ColorReading {
                l: 100.0,
                a: 0.0,
                b: 0.0,
                rgb: (255, 255, 255),
            },
            default_ph: 7.0,
            color_reads: Arc::new(AtomicUsize::new(0)),
            calibrations: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue color readings returned in order; the default repeats once
    /// the queue is empty.
    pub fn push_colors(&self, colors: impl IntoIterator<Item = ColorReading>) {
        self.inner
            .lock()
            .expect("sim sensor lock")
            .colors
            .extend(colors);
    }

    /// Script colors as a function of the read index. Takes precedence
    /// over the queue.
    pub fn set_color_fn(&self, f: impl Fn(usize) -> ColorReading + Send + Sync + 'static) {
        *self.color_fn.lock().expect("sim sensor lock") = Some(Box::new(f));
    }

    /// Queue pH readings returned in order; the default repeats after.
    pub fn push_ph(&self, values: impl IntoIterator<Item = f64>) {
        self.inner
            .lock()
            .expect("sim sensor lock")
            .ph_values
            .extend(values);
    }

    pub fn color_reads(&self) -> usize {
        self.color_reads.load(Ordering::SeqCst)
    }

    pub fn calibrations(&self) -> usize {
        self.calibrations.load(Ordering::SeqCst)
    }
}

impl Default for SimSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl Sensor for SimSensor {
    async fn read_color(&self) -> DeviceResult<ColorReading> {
        let idx = self.color_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(f) = self.color_fn.lock().expect("sim sensor lock").as_ref() {
            return Ok(f(idx));
        }
        let mut inner = self.inner.lock().expect("sim sensor lock");
        Ok(inner.colors.pop_front().unwrap_or(self.default_color))
    }

    async fn calibrate(&self) -> DeviceResult<()> {
        self.calibrations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_ph(&self) -> DeviceResult<f64> {
        let mut inner = self.inner.lock().expect("sim sensor lock");
        Ok(inner.ph_values.pop_front().unwrap_or(self.default_ph))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn journal_records_ops_in_order() {
        let device = SimDevice::new();
        device.move_to(Station::MixerReactor).await.unwrap();
        device.withdraw(0.8).await.unwrap();
        device.dispense().await.unwrap();
        assert_eq!(
            device.journal(),
            vec!["move:Mixer", "withdraw:0.80", "dispense"]
        );
        assert_eq!(device.count_op("withdraw"), 1);
    }

    #[tokio::test]
    async fn injected_failure_only_hits_named_op() {
        let device = SimDevice::new();
        device.fail_on("move");
        assert!(device.move_to(Station::Reagent('B')).await.is_err());
        assert!(device.raise_syringe().await.is_ok());
    }

    #[tokio::test]
    async fn scripted_colors_then_default() {
        let sensor = SimSensor::new();
        sensor.push_colors([ColorReading {
            l: 10.0,
            a: 1.0,
            b: 2.0,
            rgb: (0, 0, 0),
        }]);
        assert_eq!(sensor.read_color().await.unwrap().l, 10.0);
        assert_eq!(sensor.read_color().await.unwrap().l, 100.0);
        assert_eq!(sensor.color_reads(), 2);
    }

    #[tokio::test]
    async fn scripted_ph_sequence() {
        let sensor = SimSensor::new();
        sensor.push_ph([7.5, 6.2]);
        assert_eq!(sensor.read_ph().await.unwrap(), 7.5);
        assert_eq!(sensor.read_ph().await.unwrap(), 6.2);
        assert_eq!(sensor.read_ph().await.unwrap(), 7.0);
    }
}
