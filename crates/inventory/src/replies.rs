//! Reply rows written by the inventory service.

use domain::ReservationFailure;
use domain::messages::{StockReservationFailed, StockReservationRequested, StockReserved};
use outbox::OutboxRecord;

pub const AGGREGATE_TYPE: &str = "Stock";

pub(crate) fn reserved(
    request: &StockReservationRequested,
) -> Result<OutboxRecord, serde_json::Error> {
    OutboxRecord::for_message(
        AGGREGATE_TYPE,
        &StockReserved {
            order_id: request.order_id,
            store_id: request.store_id,
            user_id: request.user_id,
            attempt: request.attempt,
            pickup_address: request.pickup_address.clone(),
            shipping_address: request.shipping_address.clone(),
        },
    )
}

pub(crate) fn refused(
    request: &StockReservationRequested,
    failure: &ReservationFailure,
) -> Result<OutboxRecord, serde_json::Error> {
    OutboxRecord::for_message(
        AGGREGATE_TYPE,
        &StockReservationFailed {
            order_id: request.order_id,
            user_id: request.user_id,
            attempt: request.attempt,
            reason: failure.reason().to_string(),
        },
    )
}
