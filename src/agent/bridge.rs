use std::sync::Arc;

use tracing::trace;

use super::request::{Discharge, SnapshotRequest};
use crate::engine::{Isolate, Scheduler, WorkStatus};

/// Hands a request to the two home-thread trigger paths: an engine interrupt
/// and the completion of a no-op background task.
pub struct EngineBridge {
    scheduler: Arc<dyn Scheduler>,
}

impl EngineBridge {
    pub const TRIGGERS: usize = 2;

    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn submit<A>(&self, request: SnapshotRequest, action: A)
    where
        A: Fn(&mut dyn Isolate) + Send + Sync + 'static,
    {
        let request_id = request.id();
        let mut tickets = request.arm(Self::TRIGGERS);
        let (Some(interrupt_ticket), Some(work_ticket)) = (tickets.pop(), tickets.pop()) else {
            return;
        };
        let action = Arc::new(action);
        let on_interrupt = Arc::clone(&action);

        self.scheduler.queue_work(
            Box::new(|| {}),
            Box::new(move |isolate: &mut dyn Isolate, status: WorkStatus| match status {
                WorkStatus::Completed => {
                    if work_ticket.discharge() == Discharge::Act {
                        trace!(request = request_id, "work completion won");
                        action(isolate);
                    }
                }
                WorkStatus::Canceled => work_ticket.cancel(),
            }),
        );

        self.scheduler.request_interrupt(Box::new(move |isolate: &mut dyn Isolate| {
            if interrupt_ticket.discharge() == Discharge::Act {
                trace!(request = request_id, "interrupt won");
                on_interrupt(isolate);
            }
        }));
    }
}
