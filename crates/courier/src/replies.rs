//! Reply rows written by the courier service.

use common::CourierId;
use domain::messages::{CourierAssigned, CourierAssignmentFailed, OrderPreparing};
use outbox::OutboxRecord;

pub const AGGREGATE_TYPE: &str = "Courier";

pub(crate) fn assigned(
    msg: &OrderPreparing,
    courier_id: CourierId,
) -> Result<OutboxRecord, serde_json::Error> {
    OutboxRecord::for_message(
        AGGREGATE_TYPE,
        &CourierAssigned {
            order_id: msg.order_id,
            courier_id,
            store_id: msg.store_id,
            user_id: msg.user_id,
        },
    )
}

pub(crate) fn failed(msg: &OrderPreparing, reason: &str) -> Result<OutboxRecord, serde_json::Error> {
    OutboxRecord::for_message(
        AGGREGATE_TYPE,
        &CourierAssignmentFailed {
            order_id: msg.order_id,
            user_id: msg.user_id,
            store_id: msg.store_id,
            reason: reason.to_string(),
        },
    )
}
