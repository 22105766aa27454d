//! Periodic task table for the beat.

use courier_core::{BeatSchedule, ScheduleEntry};
use std::time::Duration;

use crate::tasks::PERIODIC_TASK;

pub const PERIODIC_ENTRY: &str = "periodic-task";

/// The beat schedule: `tasks.periodic_task` every 30 seconds.
pub fn beat_schedule() -> BeatSchedule {
    BeatSchedule::new().entry(ScheduleEntry::new(
        PERIODIC_ENTRY,
        PERIODIC_TASK,
        Duration::from_secs(30),
    ))
}
