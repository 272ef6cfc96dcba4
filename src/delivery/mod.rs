//! Consumer side of the alert topics
//!
//! One [`DeliveryWorker`] per alert kind reads its topic through an
//! independent consumer group and hands each alert to the notification
//! gateway.

pub mod view;
pub mod worker;

pub use view::AlertView;
pub use worker::{
    start_delivery, DeliverySettings, DeliveryWorker, WorkerConfig, WorkerHandle, WorkerState,
    WorkerStats,
};
