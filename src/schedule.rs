use chrono::{Duration, NaiveDateTime, NaiveTime, Timelike};
use log::debug;
use strum_macros::{Display, VariantArray};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, VariantArray)]
pub enum Job {
    #[strum(to_string = "scrape")]
    Scrape,
    #[strum(to_string = "daily report")]
    Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Every hour at `minute` past.
    Hourly { minute: u32 },
    /// Every day at a fixed time.
    Daily { at: NaiveTime },
}

impl Trigger {
    /// Next firing strictly after `now`.
    pub fn next_after(self, now: NaiveDateTime) -> NaiveDateTime {
        match self {
            Self::Hourly { minute } => {
                let hour_start = now
                    - Duration::minutes(i64::from(now.minute()))
                    - Duration::seconds(i64::from(now.second()))
                    - Duration::nanoseconds(i64::from(now.nanosecond()));
                let candidate = hour_start + Duration::minutes(i64::from(minute));
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::hours(1)
                }
            }
            Self::Daily { at } => {
                let candidate = now.date().and_time(at);
                if candidate > now {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
        }
    }
}

#[derive(Debug)]
struct Entry {
    job: Job,
    trigger: Trigger,
    next_run: NaiveDateTime,
}

/// Recurring jobs polled by the caller; nothing runs on its own.
#[derive(Debug, Default)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    pub fn every(mut self, trigger: Trigger, job: Job, now: NaiveDateTime) -> Self {
        let next_run = trigger.next_after(now);
        debug!("{job} job first runs at {next_run}");
        self.entries.push(Entry {
            job,
            trigger,
            next_run,
        });
        self
    }

    /// Jobs whose time has come, each rescheduled past `now`.
    pub fn due(&mut self, now: NaiveDateTime) -> Vec<Job> {
        self.entries
            .iter_mut()
            .filter(|e| e.next_run <= now)
            .map(|e| {
                e.next_run = e.trigger.next_after(now);
                debug!("{} job due, next run at {}", e.job, e.next_run);
                e.job
            })
            .collect()
    }

    pub fn next_run(&self, job: Job) -> Option<NaiveDateTime> {
        self.entries
            .iter()
            .filter(|e| e.job == job)
            .map(|e| e.next_run)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn at(day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 7, day)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn nine() -> NaiveTime {
        NaiveTime::from_hms_opt(9, 0, 0).unwrap()
    }

    #[test]
    fn hourly_fires_at_offset_in_current_hour() {
        let trigger = Trigger::Hourly { minute: 1 };
        assert_eq!(trigger.next_after(at(13, 5, 0, 30)), at(13, 5, 1, 0));
    }

    #[test]
    fn hourly_rolls_into_next_hour_once_offset_passed() {
        let trigger = Trigger::Hourly { minute: 1 };
        assert_eq!(trigger.next_after(at(13, 5, 1, 0)), at(13, 6, 1, 0));
        assert_eq!(trigger.next_after(at(13, 23, 30, 0)), at(14, 0, 1, 0));
    }

    #[test]
    fn daily_rolls_over_midnight() {
        let trigger = Trigger::Daily { at: nine() };
        assert_eq!(trigger.next_after(at(13, 8, 59, 59)), at(13, 9, 0, 0));
        assert_eq!(trigger.next_after(at(13, 9, 0, 0)), at(14, 9, 0, 0));
    }

    #[test]
    fn due_returns_each_job_once_and_reschedules() {
        let start = at(13, 8, 30, 0);
        let mut scheduler = Scheduler::default()
            .every(Trigger::Hourly { minute: 1 }, Job::Scrape, start)
            .every(Trigger::Daily { at: nine() }, Job::Report, start);

        assert!(scheduler.due(at(13, 8, 59, 59)).is_empty());
        assert_eq!(scheduler.due(at(13, 9, 0, 0)), [Job::Report]);
        assert!(scheduler.due(at(13, 9, 0, 1)).is_empty());
        assert_eq!(scheduler.due(at(13, 9, 1, 0)), [Job::Scrape]);

        assert_eq!(scheduler.next_run(Job::Scrape), Some(at(13, 10, 1, 0)));
        assert_eq!(scheduler.next_run(Job::Report), Some(at(14, 9, 0, 0)));
    }

    #[test]
    fn late_poll_runs_job_once_not_per_missed_slot() {
        let start = at(13, 5, 30, 0);
        let mut scheduler =
            Scheduler::default().every(Trigger::Hourly { minute: 1 }, Job::Scrape, start);

        assert_eq!(scheduler.due(at(13, 9, 10, 0)), [Job::Scrape]);
        assert_eq!(scheduler.next_run(Job::Scrape), Some(at(13, 10, 1, 0)));
    }
}
