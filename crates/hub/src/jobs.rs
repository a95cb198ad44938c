//! In-memory job store: recurring and one-shot jobs indexed by structured
//! tags. The store only decides *when* something runs; the payload `A`
//! describes *what* runs and is handed back by `run_pending`.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

use crate::clock::SharedClock;
use crate::model::LightState;

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Garden,
    Zone,
}

/// Structured job label. A query matches a job when every queried tag is
/// present on the job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Tag {
    Kind(EntityKind),
    Entity(String),
    Light(LightState),
    Adhoc,
}

impl Tag {
    pub fn entity(id: impl Into<String>) -> Self {
        Tag::Entity(id.into())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tag::Kind(EntityKind::Garden) => f.write_str("garden"),
            Tag::Kind(EntityKind::Zone) => f.write_str("zone"),
            Tag::Entity(id) => f.write_str(id),
            Tag::Light(state) => write!(f, "{}", state.as_str().to_lowercase()),
            Tag::Adhoc => f.write_str("ADHOC"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("recurring job interval must be greater than zero")]
    ZeroInterval,
    #[error("job time is out of range")]
    OutOfRange,
    #[error("job {0} not found")]
    NotFound(JobId),
}

struct Job<A> {
    tags: HashSet<Tag>,
    /// `None` for one-shot jobs.
    interval: Option<Duration>,
    next_run: OffsetDateTime,
    action: A,
}

struct Inner<A> {
    next_id: JobId,
    jobs: HashMap<JobId, Job<A>>,
    index: HashMap<Tag, BTreeSet<JobId>>,
}

pub struct JobStore<A> {
    clock: SharedClock,
    inner: Mutex<Inner<A>>,
}

impl<A: Clone> JobStore<A> {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner {
                next_id: 1,
                jobs: HashMap::new(),
                index: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<A>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a job due at `anchor + k * interval` for the smallest `k >= 0`
    /// that is not in the past.
    pub fn schedule_recurring(
        &self,
        tags: &[Tag],
        interval: Duration,
        anchor: OffsetDateTime,
        action: A,
    ) -> Result<JobId, JobError> {
        if interval.is_zero() {
            return Err(JobError::ZeroInterval);
        }
        let next_run = first_due(anchor, interval, self.clock.now()).ok_or(JobError::OutOfRange)?;
        Ok(self.insert(tags, Some(interval), next_run, action))
    }

    /// Register a job that runs once at `at` and is then dropped.
    pub fn schedule_once(&self, tags: &[Tag], at: OffsetDateTime, action: A) -> JobId {
        self.insert(tags, None, at, action)
    }

    fn insert(
        &self,
        tags: &[Tag],
        interval: Option<Duration>,
        next_run: OffsetDateTime,
        action: A,
    ) -> JobId {
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        for tag in tags {
            inner.index.entry(tag.clone()).or_default().insert(id);
        }
        inner.jobs.insert(
            id,
            Job {
                tags: tags.iter().cloned().collect(),
                interval,
                next_run,
                action,
            },
        );
        id
    }

    /// Jobs carrying every tag in `tags`, soonest first.
    pub fn find_by_tags(&self, tags: &[Tag]) -> Vec<JobId> {
        let inner = self.lock();
        let mut ids = matching(&inner, tags);
        ids.sort_by_key(|id| (inner.jobs[id].next_run, *id));
        ids
    }

    pub fn next_run(&self, id: JobId) -> Option<OffsetDateTime> {
        self.lock().jobs.get(&id).map(|j| j.next_run)
    }

    pub fn has_tag(&self, id: JobId, tag: &Tag) -> bool {
        self.lock()
            .jobs
            .get(&id)
            .map_or(false, |j| j.tags.contains(tag))
    }

    /// Remove every job carrying all of `tags`. Returns how many were removed;
    /// zero is not an error.
    pub fn remove_by_tags(&self, tags: &[Tag]) -> usize {
        let mut inner = self.lock();
        let ids = matching(&inner, tags);
        for id in &ids {
            remove_job(&mut inner, *id);
        }
        ids.len()
    }

    /// Move a job's next-due instant without touching its tags or interval.
    pub fn reschedule(&self, id: JobId, next_run: OffsetDateTime) -> Result<(), JobError> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(JobError::NotFound(id))?;
        job.next_run = next_run;
        Ok(())
    }

    /// Pop every due job and return its payload. Recurring jobs are re-armed
    /// to their first slot strictly after now; skipped slots are not replayed.
    pub fn run_pending(&self) -> Vec<A> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let mut due: Vec<(OffsetDateTime, JobId)> = inner
            .jobs
            .iter()
            .filter(|(_, j)| j.next_run <= now)
            .map(|(id, j)| (j.next_run, *id))
            .collect();
        due.sort();

        let mut actions = Vec::with_capacity(due.len());
        for (_, id) in due {
            let rearm = match inner.jobs.get_mut(&id) {
                Some(job) => {
                    actions.push(job.action.clone());
                    // A recurrence that runs off the calendar is dropped.
                    match job.interval.and_then(|i| next_after(job.next_run, i, now)) {
                        Some(next) => {
                            job.next_run = next;
                            true
                        }
                        None => false,
                    }
                }
                None => continue,
            };
            if !rearm {
                remove_job(&mut inner, id);
            }
        }
        actions
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn matching<A>(inner: &Inner<A>, tags: &[Tag]) -> Vec<JobId> {
    let Some((first, rest)) = tags.split_first() else {
        return inner.jobs.keys().copied().collect();
    };
    let Some(candidates) = inner.index.get(first) else {
        return Vec::new();
    };
    candidates
        .iter()
        .copied()
        .filter(|id| {
            rest.iter()
                .all(|t| inner.index.get(t).map_or(false, |set| set.contains(id)))
        })
        .collect()
}

fn remove_job<A>(inner: &mut Inner<A>, id: JobId) {
    let Some(job) = inner.jobs.remove(&id) else {
        return;
    };
    for tag in &job.tags {
        if let Some(set) = inner.index.get_mut(tag) {
            set.remove(&id);
            if set.is_empty() {
                inner.index.remove(tag);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Recurrence arithmetic
// ---------------------------------------------------------------------------

fn offset(interval: Duration, k: i128) -> Option<time::Duration> {
    let total = (interval.as_nanos() as i128).checked_mul(k)?;
    let secs = i64::try_from(total / 1_000_000_000).ok()?;
    let nanos = (total % 1_000_000_000) as i64;
    time::Duration::seconds(secs).checked_add(time::Duration::nanoseconds(nanos))
}

/// `at + d`, failing instead of panicking past the representable range.
pub fn add_duration(at: OffsetDateTime, d: Duration) -> Result<OffsetDateTime, JobError> {
    time::Duration::try_from(d)
        .ok()
        .and_then(|d| at.checked_add(d))
        .ok_or(JobError::OutOfRange)
}

/// First instant `anchor + k * interval` (k >= 0) that is `>= now`, or `None`
/// when it falls outside the representable date range.
pub fn first_due(anchor: OffsetDateTime, interval: Duration, now: OffsetDateTime) -> Option<OffsetDateTime> {
    if anchor >= now || interval.is_zero() {
        return Some(anchor);
    }
    let behind = (now - anchor).whole_nanoseconds();
    let step = interval.as_nanos() as i128;
    let k = (behind + step - 1) / step;
    anchor.checked_add(offset(interval, k)?)
}

/// First instant `from + k * interval` (k >= 1) that is strictly after `now`.
fn next_after(from: OffsetDateTime, interval: Duration, now: OffsetDateTime) -> Option<OffsetDateTime> {
    let step = interval.as_nanos() as i128;
    let behind = (now - from).whole_nanoseconds().max(0);
    let k = behind / step + 1;
    from.checked_add(offset(interval, k)?)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FakeClock};
    use std::sync::Arc;
    use time::macros::datetime;

    const HOUR: Duration = Duration::from_secs(3600);
    const DAY: Duration = Duration::from_secs(86_400);

    fn store() -> (FakeClock, JobStore<&'static str>) {
        let clock = FakeClock::new(datetime!(2023-08-23 10:00 UTC));
        let store = JobStore::new(Arc::new(clock.clone()));
        (clock, store)
    }

    fn zone_tags(id: &str) -> Vec<Tag> {
        vec![Tag::Kind(EntityKind::Zone), Tag::entity(id)]
    }

    // -- scheduling ---------------------------------------------------------

    #[test]
    fn future_anchor_runs_exactly_at_anchor() {
        let (_clock, store) = store();
        let anchor = datetime!(2023-08-24 06:00 UTC);
        let id = store.schedule_recurring(&zone_tags("ws1"), DAY, anchor, "w").unwrap();
        assert_eq!(store.next_run(id), Some(anchor));
    }

    #[test]
    fn past_anchor_catches_up_to_next_slot() {
        let (_clock, store) = store();
        let anchor = datetime!(2023-08-01 06:00 UTC);
        let id = store.schedule_recurring(&zone_tags("ws1"), DAY, anchor, "w").unwrap();
        assert_eq!(store.next_run(id), Some(datetime!(2023-08-24 06:00 UTC)));
    }

    #[test]
    fn anchor_on_slot_equal_to_now_runs_now() {
        let (_clock, store) = store();
        let anchor = datetime!(2023-08-22 10:00 UTC);
        let id = store.schedule_recurring(&zone_tags("ws1"), DAY, anchor, "w").unwrap();
        assert_eq!(store.next_run(id), Some(datetime!(2023-08-23 10:00 UTC)));
    }

    #[test]
    fn zero_interval_is_rejected() {
        let (clock, store) = store();
        let err = store
            .schedule_recurring(&zone_tags("ws1"), Duration::ZERO, clock.now(), "w")
            .unwrap_err();
        assert_eq!(err, JobError::ZeroInterval);
        assert!(store.is_empty());
    }

    #[test]
    fn interval_past_the_calendar_is_rejected() {
        let (_clock, store) = store();
        let anchor = datetime!(2023-08-01 06:00 UTC);
        let huge = Duration::from_secs(100_000_000 * 3600);
        let err = store
            .schedule_recurring(&zone_tags("ws1"), huge, anchor, "w")
            .unwrap_err();
        assert_eq!(err, JobError::OutOfRange);
        assert!(store.is_empty());
    }

    #[test]
    fn recurrence_running_off_the_calendar_is_dropped() {
        let (clock, store) = store();
        let anchor = datetime!(9999-12-30 00:00 UTC);
        store
            .schedule_recurring(&zone_tags("ws1"), 2 * DAY, anchor, "w")
            .unwrap();

        clock.set(anchor);
        assert_eq!(store.run_pending(), vec!["w"]);
        assert!(store.is_empty());
    }

    #[test]
    fn add_duration_reports_overflow() {
        let at = datetime!(2023-08-23 10:00 UTC);
        assert_eq!(add_duration(at, HOUR), Ok(datetime!(2023-08-23 11:00 UTC)));
        assert_eq!(add_duration(at, Duration::MAX), Err(JobError::OutOfRange));
    }

    #[test]
    fn next_run_never_in_the_past() {
        let (clock, store) = store();
        for (i, anchor) in [
            datetime!(2020-01-01 00:00:00 UTC),
            datetime!(2023-08-23 09:59:59 UTC),
            datetime!(2023-08-23 10:00:00 UTC),
            datetime!(2030-01-01 00:00:00 UTC),
        ]
        .into_iter()
        .enumerate()
        {
            let interval = Duration::from_secs(3600 * (i as u64 + 1) + 7);
            let id = store.schedule_recurring(&[], interval, anchor, "w").unwrap();
            assert!(store.next_run(id).unwrap() >= clock.now());
        }
    }

    // -- lookup -------------------------------------------------------------

    #[test]
    fn find_by_tags_matches_supersets_sorted_by_next_run() {
        let (clock, store) = store();
        let on = vec![
            Tag::Kind(EntityKind::Garden),
            Tag::entity("g1"),
            Tag::Light(LightState::On),
        ];
        let regular = store
            .schedule_recurring(&on, DAY, datetime!(2023-08-24 06:00 UTC), "on")
            .unwrap();
        let mut adhoc_tags = on.clone();
        adhoc_tags.push(Tag::Adhoc);
        let adhoc = store.schedule_once(&adhoc_tags, clock.now() + HOUR, "adhoc");

        let found = store.find_by_tags(&[Tag::entity("g1"), Tag::Light(LightState::On)]);
        assert_eq!(found, vec![adhoc, regular]);

        let only_adhoc = store.find_by_tags(&[Tag::entity("g1"), Tag::Adhoc]);
        assert_eq!(only_adhoc, vec![adhoc]);
        assert!(store.has_tag(adhoc, &Tag::Adhoc));
        assert!(!store.has_tag(regular, &Tag::Adhoc));
    }

    #[test]
    fn find_by_unknown_tag_is_empty() {
        let (_clock, store) = store();
        store
            .schedule_recurring(&zone_tags("ws1"), DAY, datetime!(2023-08-24 06:00 UTC), "w")
            .unwrap();
        assert!(store.find_by_tags(&[Tag::entity("nope")]).is_empty());
    }

    // -- removal ------------------------------------------------------------

    #[test]
    fn remove_unknown_tag_is_ok_and_leaves_others() {
        let (_clock, store) = store();
        store
            .schedule_recurring(&zone_tags("ws1"), DAY, datetime!(2023-08-24 06:00 UTC), "w")
            .unwrap();
        assert_eq!(store.remove_by_tags(&[Tag::entity("missing")]), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_by_entity_drops_all_matching() {
        let (_clock, store) = store();
        store
            .schedule_recurring(&zone_tags("ws1"), DAY, datetime!(2023-08-24 06:00 UTC), "a")
            .unwrap();
        store
            .schedule_recurring(&zone_tags("ws1"), HOUR, datetime!(2023-08-24 06:00 UTC), "b")
            .unwrap();
        let keep = store
            .schedule_recurring(&zone_tags("ws2"), DAY, datetime!(2023-08-24 06:00 UTC), "c")
            .unwrap();

        assert_eq!(store.remove_by_tags(&[Tag::entity("ws1")]), 2);
        assert_eq!(store.find_by_tags(&[Tag::Kind(EntityKind::Zone)]), vec![keep]);
    }

    #[test]
    fn reset_is_remove_then_schedule() {
        let (_clock, store) = store();
        let anchor = datetime!(2023-08-01 06:00 UTC);
        let before = store.schedule_recurring(&zone_tags("ws1"), DAY, anchor, "w").unwrap();
        let before_next = store.next_run(before);

        store.remove_by_tags(&[Tag::entity("ws1")]);
        let after = store.schedule_recurring(&zone_tags("ws1"), DAY, anchor, "w").unwrap();

        assert_eq!(store.next_run(after), before_next);
        assert_eq!(store.len(), 1);
    }

    // -- reschedule ---------------------------------------------------------

    #[test]
    fn reschedule_moves_only_next_run() {
        let (clock, store) = store();
        let id = store
            .schedule_recurring(&zone_tags("ws1"), DAY, datetime!(2023-08-23 12:00 UTC), "w")
            .unwrap();
        store.reschedule(id, datetime!(2023-08-24 12:00 UTC)).unwrap();
        assert_eq!(store.next_run(id), Some(datetime!(2023-08-24 12:00 UTC)));

        // Interval survives: after firing, the next slot is one day later.
        clock.set(datetime!(2023-08-24 12:00 UTC));
        assert_eq!(store.run_pending(), vec!["w"]);
        assert_eq!(store.next_run(id), Some(datetime!(2023-08-25 12:00 UTC)));
        assert!(store.has_tag(id, &Tag::entity("ws1")));
    }

    #[test]
    fn reschedule_unknown_job_errors() {
        let (clock, store) = store();
        assert_eq!(store.reschedule(42, clock.now()), Err(JobError::NotFound(42)));
    }

    // -- runner -------------------------------------------------------------

    #[test]
    fn run_pending_returns_nothing_before_due() {
        let (_clock, store) = store();
        store
            .schedule_recurring(&[], HOUR, datetime!(2023-08-23 11:00 UTC), "w")
            .unwrap();
        assert!(store.run_pending().is_empty());
    }

    #[test]
    fn one_shot_runs_once_then_disappears() {
        let (clock, store) = store();
        let id = store.schedule_once(&[Tag::Adhoc], clock.now() + HOUR, "once");
        clock.advance(HOUR);
        assert_eq!(store.run_pending(), vec!["once"]);
        assert_eq!(store.next_run(id), None);
        assert!(store.find_by_tags(&[Tag::Adhoc]).is_empty());
        assert!(store.run_pending().is_empty());
    }

    #[test]
    fn recurring_rearms_strictly_after_now_without_replay() {
        let (clock, store) = store();
        let id = store
            .schedule_recurring(&[], HOUR, datetime!(2023-08-23 11:00 UTC), "w")
            .unwrap();

        // Five slots elapse; only one firing is returned.
        clock.set(datetime!(2023-08-23 15:30 UTC));
        assert_eq!(store.run_pending(), vec!["w"]);
        let next = store.next_run(id).unwrap();
        assert_eq!(next, datetime!(2023-08-23 16:00 UTC));
        assert!(next > clock.now());
    }

    #[test]
    fn run_pending_orders_by_due_time() {
        let (clock, store) = store();
        store.schedule_once(&[], clock.now() + 2 * HOUR, "second");
        store.schedule_once(&[], clock.now() + HOUR, "first");
        clock.advance(3 * HOUR);
        assert_eq!(store.run_pending(), vec!["first", "second"]);
    }

    #[test]
    fn tag_display_matches_labels() {
        assert_eq!(Tag::Kind(EntityKind::Zone).to_string(), "zone");
        assert_eq!(Tag::Light(LightState::Off).to_string(), "off");
        assert_eq!(Tag::Adhoc.to_string(), "ADHOC");
    }
}
