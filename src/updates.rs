//! Items carried on the session bus and the consumer that forwards them
//! to the client.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::bus::{BusError, DataConsumer, NotificationBus};
use crate::peer::Peer;
use crate::protocol::{methods, NodeChange, TestNode, TestUpdatesParams};

#[derive(Debug, Clone, PartialEq)]
pub enum BusItem {
    /// A test node changed state during a discover or run.
    NodeUpdate { run_id: Uuid, change: NodeChange },
    /// Free-form data from lifetime hooks or engines.
    Telemetry(Value),
}

/// Publishes node updates for one run.
#[derive(Clone)]
pub struct UpdateSink {
    run_id: Uuid,
    bus: NotificationBus<BusItem>,
}

impl UpdateSink {
    pub fn new(run_id: Uuid, bus: NotificationBus<BusItem>) -> Self {
        Self { run_id, bus }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn report(&self, node: TestNode) -> Result<(), BusError> {
        self.report_change(NodeChange { node, parent: None })
    }

    pub fn report_change(&self, change: NodeChange) -> Result<(), BusError> {
        self.bus.publish(BusItem::NodeUpdate {
            run_id: self.run_id,
            change,
        })
    }

    pub fn telemetry(&self, data: Value) -> Result<(), BusError> {
        self.bus.publish(BusItem::Telemetry(data))
    }
}

/// Session-wide consumer that turns bus items into client notifications.
pub struct PeerUpdateForwarder {
    peer: Peer,
}

impl PeerUpdateForwarder {
    pub fn new(peer: Peer) -> Self {
        Self { peer }
    }
}

#[async_trait]
impl DataConsumer<BusItem> for PeerUpdateForwarder {
    fn name(&self) -> &str {
        "peer-update-forwarder"
    }

    async fn consume(&self, item: &BusItem) -> anyhow::Result<()> {
        match item {
            BusItem::NodeUpdate { run_id, change } => {
                let params = TestUpdatesParams {
                    run_id: *run_id,
                    changes: Some(vec![change.clone()]),
                };
                self.peer.notify(methods::TEST_UPDATES, &params).await?;
            }
            BusItem::Telemetry(data) => {
                self.peer.notify(methods::TELEMETRY_UPDATE, data).await?;
            }
        }
        Ok(())
    }
}
