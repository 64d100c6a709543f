// Motor driver fault monitoring
//
// The driver reports faults on two open-drain lines (FF1, FF2). Edge callbacks
// fire on whatever thread the pin controller uses, so they only sample both
// lines and push a `FaultEdge` onto a channel. A dedicated task drains the
// channel, classifies the fault and logs it, away from any lock held by the
// command path.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use super::pins::{Level, Pin};

/// Capacity of the classified-fault broadcast
const EVENT_CAPACITY: usize = 64;

/// Fault reported by the motor driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    Undervolt,
    Overtemp,
    /// The driver has latched itself off and ignores commands until reset
    ShortCircuitLatched,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Undervolt => write!(f, "undervolt"),
            Fault::Overtemp => write!(f, "overtemp"),
            Fault::ShortCircuitLatched => write!(f, "short circuit (driver latched)"),
        }
    }
}

/// Classify the fault from both line levels. First match wins.
pub fn classify(fault_1: Level, fault_2: Level) -> Option<Fault> {
    match (fault_1, fault_2) {
        (Level::High, Level::High) => Some(Fault::Undervolt),
        (Level::High, Level::Low) => Some(Fault::Overtemp),
        (Level::Low, Level::High) => Some(Fault::ShortCircuitLatched),
        (Level::Low, Level::Low) => None,
    }
}

/// Raw interrupt sample taken in the edge callback
#[derive(Debug, Clone)]
pub struct FaultEdge {
    pub motor_id: u8,
    pub motor: Arc<str>,
    /// Line whose rising edge fired the interrupt
    pub source: Pin,
    pub fault_1: Level,
    pub fault_2: Level,
}

/// Classified fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    pub motor_id: u8,
    pub motor: Arc<str>,
    pub fault: Fault,
}

/// Sending side handed to every motor's edge callbacks
#[derive(Debug, Clone)]
pub struct FaultSink {
    tx: mpsc::UnboundedSender<FaultEdge>,
}

impl FaultSink {
    /// Queue an edge sample. Never blocks; dropped if the monitor is gone.
    pub fn report(&self, edge: FaultEdge) {
        if self.tx.send(edge).is_err() {
            trace!("Fault monitor stopped, edge dropped");
        }
    }
}

/// Consumer of fault edges
pub struct FaultMonitor {
    rx: mpsc::UnboundedReceiver<FaultEdge>,
    events: broadcast::Sender<FaultEvent>,
}

impl FaultMonitor {
    /// Create a monitor and the sink motors report into
    pub fn channel() -> (FaultSink, FaultMonitor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        (FaultSink { tx }, FaultMonitor { rx, events })
    }

    /// Receive every classified fault from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FaultEvent> {
        self.events.subscribe()
    }

    /// Classify and log one edge sample
    pub fn observe(&self, edge: &FaultEdge) -> Option<FaultEvent> {
        let Some(fault) = classify(edge.fault_1, edge.fault_2) else {
            debug!(
                "Spurious edge on pin {} for {} (ID# {}), both fault lines low",
                edge.source, edge.motor, edge.motor_id
            );
            return None;
        };

        match fault {
            Fault::ShortCircuitLatched => warn!(
                "Fault detected on {} (ID# {})! Short circuit. Motor driver has been latched.",
                edge.motor, edge.motor_id
            ),
            _ => warn!(
                "Fault detected on {} (ID# {})! {}.",
                edge.motor, edge.motor_id, fault
            ),
        }

        let event = FaultEvent {
            motor_id: edge.motor_id,
            motor: Arc::clone(&edge.motor),
            fault,
        };
        // No subscribers is fine; the log line above is the primary record
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Drain edges until every sink is dropped
    pub async fn run(mut self) {
        debug!("Fault monitor started");
        while let Some(edge) = self.rx.recv().await {
            self.observe(&edge);
        }
        debug!("Fault monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(source: Pin, fault_1: Level, fault_2: Level) -> FaultEdge {
        FaultEdge {
            motor_id: 1,
            motor: Arc::from("right_motor"),
            source,
            fault_1,
            fault_2,
        }
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(classify(Level::High, Level::High), Some(Fault::Undervolt));
        assert_eq!(classify(Level::High, Level::Low), Some(Fault::Overtemp));
        assert_eq!(
            classify(Level::Low, Level::High),
            Some(Fault::ShortCircuitLatched)
        );
        assert_eq!(classify(Level::Low, Level::Low), None);
    }

    #[test]
    fn test_source_line_does_not_change_classification() {
        let (_sink, monitor) = FaultMonitor::channel();
        for source in [15, 16] {
            let event = monitor.observe(&edge(source, Level::Low, Level::High));
            assert_eq!(event.map(|e| e.fault), Some(Fault::ShortCircuitLatched));
            let event = monitor.observe(&edge(source, Level::High, Level::High));
            assert_eq!(event.map(|e| e.fault), Some(Fault::Undervolt));
        }
    }

    #[tokio::test]
    async fn test_monitor_task_broadcasts_events() {
        let (sink, monitor) = FaultMonitor::channel();
        let mut events = monitor.subscribe();
        let task = tokio::spawn(monitor.run());

        sink.report(edge(15, Level::Low, Level::Low));
        sink.report(edge(15, Level::High, Level::Low));

        let event = events.recv().await.unwrap();
        assert_eq!(event.fault, Fault::Overtemp);
        assert_eq!(&*event.motor, "right_motor");

        drop(sink);
        task.await.unwrap();
    }
}
