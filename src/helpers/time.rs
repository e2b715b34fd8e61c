use std::time;

pub const fn from_minutes(minutes: u64) -> time::Duration {
    time::Duration::from_secs(minutes * 60)
}

pub const fn from_hours(hours: u64) -> time::Duration {
    from_minutes(hours * 60)
}

pub const fn from_days(days: u64) -> time::Duration {
    from_hours(days * 24)
}
