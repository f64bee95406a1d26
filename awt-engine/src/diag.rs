//! Hardware diagnostics
//!
//! Operator-triggered exercise cycles for the moving parts. Requests
//! queue up and run one at a time when the instrument is Idle, with the
//! status latch held at RunningDiagnostic for the duration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::hardware::{Device, LowerTarget, Pump, Station, WaterSource};
use crate::state::{SharedState, SystemStatus};

const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One requested diagnostic run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// Rotate the carousel across its stations
    Carousel { cycles: u32 },
    /// Open/close the syringe plunger
    Plunger { cycles: u32 },
    /// Withdraw-and-dispense drop cycles
    Dispense { cycles: u32 },
    /// Fill and drain the mixing chamber
    MixerFill { cycles: u32 },
}

impl Diagnostic {
    pub fn parse(kind: &str, cycles: u32) -> Option<Diagnostic> {
        match kind {
            "carousel" => Some(Diagnostic::Carousel { cycles }),
            "plunger" => Some(Diagnostic::Plunger { cycles }),
            "dispense" => Some(Diagnostic::Dispense { cycles }),
            "mixer-fill" => Some(Diagnostic::MixerFill { cycles }),
            _ => None,
        }
    }
}

/// FIFO of pending diagnostics, shared between the API and the consumer.
#[derive(Default)]
pub struct DiagnosticQueue {
    inner: Mutex<VecDeque<Diagnostic>>,
}

impl DiagnosticQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, diagnostic: Diagnostic) {
        self.inner
            .lock()
            .expect("diagnostic queue lock")
            .push_back(diagnostic);
    }

    pub fn pop(&self) -> Option<Diagnostic> {
        self.inner.lock().expect("diagnostic queue lock").pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("diagnostic queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Long-running diagnostics consumer.
pub async fn run_consumer<D: Device>(
    device: D,
    state: Arc<SharedState>,
    queue: Arc<DiagnosticQueue>,
) {
    loop {
        tokio::time::sleep(POLL_INTERVAL).await;
        if state.status().await != SystemStatus::Idle {
            continue;
        }
        let Some(diagnostic) = queue.pop() else {
            continue;
        };
        state.set_status(SystemStatus::RunningDiagnostic).await;
        run_diagnostic(&device, &diagnostic).await;
        state.set_status(SystemStatus::Idle).await;
    }
}

async fn run_diagnostic<D: Device>(device: &D, diagnostic: &Diagnostic) {
    let (mut passed, mut failed) = (0u32, 0u32);
    match *diagnostic {
        Diagnostic::Carousel { cycles } => {
            info!("Starting Carousel Diagnostic for {cycles} movements");
            let stations: Vec<Station> = ('A'..='M').map(Station::Reagent).collect();
            for cycle in 0..cycles {
                let station = stations[cycle as usize % stations.len()];
                match device.move_to(station).await {
                    Ok(()) => passed += 1,
                    Err(e) => {
                        warn!("Carousel move to {station} failed: {e}");
                        failed += 1;
                    }
                }
            }
            if let Err(e) = device.home().await {
                warn!("Carousel homing after diagnostic failed: {e}");
            }
        }
        Diagnostic::Plunger { cycles } => {
            info!("Starting Plunger Diagnostic for {cycles} open/close cycles");
            for _ in 0..cycles {
                let cycle = async {
                    device.withdraw(0.8).await?;
                    device.dispense().await
                };
                match cycle.await {
                    Ok(()) => passed += 1,
                    Err(e) => {
                        warn!("Plunger cycle failed: {e}");
                        failed += 1;
                    }
                }
            }
        }
        Diagnostic::Dispense { cycles } => {
            info!("Starting Drop Dispensing Diagnostic for {cycles} cycles");
            for _ in 0..cycles {
                let cycle = async {
                    device.move_to(Station::CleanReactor).await?;
                    device.lower_into(LowerTarget::CleanReactor).await?;
                    device.withdraw(0.1).await?;
                    device.dispense().await?;
                    device.raise_syringe().await
                };
                match cycle.await {
                    Ok(()) => passed += 1,
                    Err(e) => {
                        warn!("Dispense cycle failed: {e}");
                        failed += 1;
                    }
                }
            }
        }
        Diagnostic::MixerFill { cycles } => {
            info!("Starting Mixer Fill Diagnostic for {cycles} cycles");
            for cycle in 0..cycles {
                // Vary the fill level across cycles like a real soak run
                let level = 4.0 + (cycle % 4) as f64;
                info!("Test filling mixer to level: {level}");
                let fill = async {
                    device.move_to(Station::MixerReactor).await?;
                    device
                        .run_pump(Pump::MixerFill(WaterSource::Tank), level)
                        .await?;
                    device.run_pump(Pump::MainDrain, 12.0).await
                };
                match fill.await {
                    Ok(()) => {
                        info!("Cycle completion: Success");
                        passed += 1;
                    }
                    Err(e) => {
                        info!("Cycle completion: Failed ({e})");
                        failed += 1;
                    }
                }
            }
            if let Err(e) = device.run_pump(Pump::MainDrain, 6.0).await {
                warn!("Final drain failed: {e}");
            }
        }
    }
    info!("Diagnostic completed. Success: {passed}, Failures: {failed}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::sim::SimDevice;

    #[test]
    fn queue_is_fifo() {
        let queue = DiagnosticQueue::new();
        queue.push(Diagnostic::Carousel { cycles: 2 });
        queue.push(Diagnostic::Plunger { cycles: 1 });
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(Diagnostic::Carousel { cycles: 2 }));
        assert_eq!(queue.pop(), Some(Diagnostic::Plunger { cycles: 1 }));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn parse_accepts_known_kinds_only() {
        assert_eq!(
            Diagnostic::parse("carousel", 5),
            Some(Diagnostic::Carousel { cycles: 5 })
        );
        assert_eq!(
            Diagnostic::parse("mixer-fill", 2),
            Some(Diagnostic::MixerFill { cycles: 2 })
        );
        assert_eq!(Diagnostic::parse("warp-core", 1), None);
    }

    #[tokio::test]
    async fn plunger_diagnostic_counts_cycles() {
        let device = SimDevice::new();
        run_diagnostic(&device, &Diagnostic::Plunger { cycles: 3 }).await;
        assert_eq!(device.count_op("withdraw"), 3);
        assert_eq!(device.count_op("dispense"), 3);
    }
}
