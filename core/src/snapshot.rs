//! Cycle snapshots for the lower-priority datalogger and telemetry tasks
//!
//! At the end of every cycle the scheduler copies everything a reader may want into an immutable
//! [`CycleSnapshot`] and offers it to each subscriber through a bounded crossbeam channel. The
//! offer never blocks: when a reader falls behind and its channel is full, the snapshot is
//! dropped and counted. A subscriber whose receiver has been dropped is detached.
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::messages::{
    AhrsDrState, AirData, ControlState, GpsFix, ImuSample, InsState, NavEstimate, SurfacePositions,
};
use crate::scheduler::{CycleTimes, SchedulerState};

/// Everything published at the end of one cycle
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CycleSnapshot {
    pub cycle: u64,
    /// [s] cycle index times the base period
    pub time: f64,
    pub state: SchedulerState,
    pub nav: NavEstimate,
    pub ahrs_dr: AhrsDrState,
    pub ins: InsState,
    pub control: ControlState,
    pub imu: ImuSample,
    pub gps: GpsFix,
    pub air: AirData,
    pub surface: SurfacePositions,
    pub times: CycleTimes,
}

#[derive(Debug)]
struct Subscriber {
    name: String,
    sender: Sender<CycleSnapshot>,
    /// Publish on every `divider`-th cycle
    divider: u64,
    sent: u64,
    dropped: u64,
}

/// Delivery counters of one subscriber
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub name: String,
    pub sent: u64,
    pub dropped: u64,
}

/// Fan-out of cycle snapshots to subscribed readers
#[derive(Debug, Default)]
pub struct SnapshotPublisher {
    subscribers: Vec<Subscriber>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        SnapshotPublisher::default()
    }
    /// Add a reader that receives every `divider`-th snapshot through a channel of `capacity`
    pub fn subscribe(&mut self, name: &str, capacity: usize, divider: u64) -> Receiver<CycleSnapshot> {
        let (sender, receiver) = channel::bounded(capacity.max(1));
        self.subscribers.push(Subscriber {
            name: name.to_string(),
            sender,
            divider: divider.max(1),
            sent: 0,
            dropped: 0,
        });
        info!("Snapshot subscriber '{}' attached (every {} cycles)", name, divider.max(1));
        receiver
    }
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
    /// Offer a snapshot to every subscriber due this cycle. Never blocks.
    pub fn publish(&mut self, snapshot: &CycleSnapshot) {
        self.subscribers.retain_mut(|sub| {
            if snapshot.cycle % sub.divider != 0 {
                return true;
            }
            match sub.sender.try_send(*snapshot) {
                Ok(()) => {
                    sub.sent += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    if sub.dropped == 1 || sub.dropped % 100 == 0 {
                        warn!(
                            "Snapshot reader '{}' is behind, {} snapshots dropped",
                            sub.name, sub.dropped
                        );
                    }
                    true
                }
                Err(TrySendError::Disconnected(_)) => {
                    info!(
                        "Snapshot reader '{}' disconnected after {} snapshots",
                        sub.name, sub.sent
                    );
                    false
                }
            }
        });
    }
    pub fn stats(&self) -> Vec<DeliveryStats> {
        self.subscribers
            .iter()
            .map(|sub| DeliveryStats {
                name: sub.name.clone(),
                sent: sub.sent,
                dropped: sub.dropped,
            })
            .collect()
    }
    /// Detach every subscriber so that their receivers see the channel close
    pub fn disconnect_all(&mut self) {
        for sub in self.subscribers.drain(..) {
            info!(
                "Snapshot reader '{}' detached: {} sent, {} dropped",
                sub.name, sub.sent, sub.dropped
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(cycle: u64) -> CycleSnapshot {
        CycleSnapshot {
            cycle,
            time: cycle as f64 * 0.02,
            state: SchedulerState::Navigating,
            nav: NavEstimate::default(),
            ahrs_dr: AhrsDrState::default(),
            ins: InsState::default(),
            control: ControlState::default(),
            imu: ImuSample::default(),
            gps: GpsFix::default(),
            air: AirData::default(),
            surface: SurfacePositions::default(),
            times: CycleTimes::default(),
        }
    }

    #[test]
    fn decimates_per_subscriber() {
        let mut publisher = SnapshotPublisher::new();
        let datalog = publisher.subscribe("datalog", 64, 1);
        let telemetry = publisher.subscribe("telemetry", 64, 5);
        for cycle in 0..20 {
            publisher.publish(&snapshot(cycle));
        }
        assert_eq!(datalog.try_iter().count(), 20);
        let cycles: Vec<u64> = telemetry.try_iter().map(|s| s.cycle).collect();
        assert_eq!(cycles, vec![0, 5, 10, 15]);
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let mut publisher = SnapshotPublisher::new();
        let slow = publisher.subscribe("slow", 2, 1);
        for cycle in 0..10 {
            publisher.publish(&snapshot(cycle));
        }
        let stats = publisher.stats();
        assert_eq!(stats[0].sent, 2);
        assert_eq!(stats[0].dropped, 8);
        assert_eq!(slow.recv().unwrap().cycle, 0);
    }

    #[test]
    fn disconnected_reader_is_detached() {
        let mut publisher = SnapshotPublisher::new();
        let reader = publisher.subscribe("gone", 4, 1);
        drop(reader);
        publisher.publish(&snapshot(0));
        assert_eq!(publisher.subscriber_count(), 0);

        let reader = publisher.subscribe("kept", 4, 1);
        publisher.disconnect_all();
        assert!(reader.recv().is_err());
    }
}
