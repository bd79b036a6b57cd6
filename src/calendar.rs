//! Staff occupancy calendar.
//!
//! A view expands each room's restrictions for one month into a per-day map
//! and leaves a snapshot of the blocks it showed in the session. An edit
//! submission is a diff against that snapshot: removals name a room and day
//! whose block ids the snapshot knows, additions name a room and day for a
//! new single-day block unless one already starts there. Days not mentioned
//! are left alone.
//!
//! Reservations occupy every day of `[start, end)` that falls in the month.
//! Blocks occupy only their start day, whatever their length; a reservation
//! day stays shown as reserved even when a block also sits on it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use ulid::Ulid;

use crate::app::App;
use crate::limits::MAX_CALENDAR_EDITS;
use crate::model::{DateSpan, Room, RoomRestriction};
use crate::observability::CALENDAR_EDITS_TOTAL;
use crate::outcome::{Outcome, Page, Route};
use crate::repository::Repository;
use crate::session::{Session, SessionKey, SessionStateError};
use crate::store::StorageError;

const SNAPSHOT_SLOT: &str = "calendar_snapshot";

pub const SNAPSHOT: SessionKey<CalendarSnapshot> = SessionKey::new(SNAPSHOT_SLOT);

/// A calendar month, held as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MonthKey {
    first: NaiveDate,
}

impl MonthKey {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, 1).map(|first| Self { first })
    }

    pub fn of(day: NaiveDate) -> Self {
        Self { first: day.with_day(1).unwrap_or(day) }
    }

    pub fn current() -> Self {
        Self::of(Utc::now().date_naive())
    }

    pub fn year(&self) -> i32 {
        self.first.year()
    }

    pub fn month(&self) -> u32 {
        self.first.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.first
    }

    /// Last day, inclusive.
    pub fn last_day(&self) -> NaiveDate {
        self.span().end.pred_opt().unwrap_or(self.first)
    }

    /// `[first, first of next month)`.
    pub fn span(&self) -> DateSpan {
        self.first
            .checked_add_months(Months::new(1))
            .and_then(|end| DateSpan::try_new(self.first, end))
            .unwrap_or_else(|| DateSpan::single_day(self.first))
    }

    pub fn days_in_month(&self) -> u32 {
        self.span().nights() as u32
    }

    /// Saturates at the end of the representable calendar.
    pub fn next(&self) -> Self {
        Self { first: self.first.checked_add_months(Months::new(1)).unwrap_or(self.first) }
    }

    pub fn prev(&self) -> Self {
        Self { first: self.first.checked_sub_months(Months::new(1)).unwrap_or(self.first) }
    }
}

impl fmt::Display for MonthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DayState {
    Free,
    Reserved(Ulid),
    Blocked(Ulid),
}

/// One room's month.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupancyMap {
    pub room: Room,
    /// Every day of the month.
    pub days: BTreeMap<NaiveDate, DayState>,
    /// Block start days in the month and their restriction ids. Blocks can
    /// stack, so a day may carry several.
    pub blocks: BTreeMap<NaiveDate, Vec<Ulid>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CalendarView {
    pub month: MonthKey,
    pub prev: MonthKey,
    pub next: MonthKey,
    pub days_in_month: u32,
    pub rooms: Vec<OccupancyMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomBlocks {
    pub room_id: Ulid,
    pub blocks: Vec<(NaiveDate, Vec<Ulid>)>,
}

/// Blocks as last shown to staff, kept for the next edit submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSnapshot {
    pub month: MonthKey,
    pub rooms: Vec<RoomBlocks>,
}

impl CalendarSnapshot {
    fn from_view(view: &CalendarView) -> Self {
        let rooms = view
            .rooms
            .iter()
            .map(|map| RoomBlocks {
                room_id: map.room.id,
                blocks: map.blocks.iter().map(|(day, ids)| (*day, ids.clone())).collect(),
            })
            .collect();
        Self { month: view.month, rooms }
    }

    fn room(&self, room_id: Ulid) -> Option<&RoomBlocks> {
        self.rooms.iter().find(|r| r.room_id == room_id)
    }

    fn blocks_at(&self, room_id: Ulid, day: NaiveDate) -> &[Ulid] {
        self.room(room_id)
            .and_then(|r| r.blocks.iter().find(|(d, _)| *d == day))
            .map(|(_, ids)| ids.as_slice())
            .unwrap_or_default()
    }
}

pub fn occupancy(room: &Room, month: MonthKey, restrictions: &[RoomRestriction]) -> OccupancyMap {
    let window = month.span();
    let mut days: BTreeMap<NaiveDate, DayState> = window.days().map(|d| (d, DayState::Free)).collect();
    let mut blocks: BTreeMap<NaiveDate, Vec<Ulid>> = BTreeMap::new();

    for restriction in restrictions.iter().filter(|r| r.room_id == room.id) {
        match restriction.reservation_id {
            Some(reservation_id) => {
                let Some(inside) = restriction.span.clamp_to(&window) else { continue };
                for day in inside.days() {
                    days.insert(day, DayState::Reserved(reservation_id));
                }
            }
            None => {
                let start = restriction.span.start;
                if !window.contains_day(start) {
                    continue;
                }
                blocks.entry(start).or_default().push(restriction.id);
                if let Some(state) = days.get_mut(&start)
                    && *state == DayState::Free
                {
                    *state = DayState::Blocked(restriction.id);
                }
            }
        }
    }

    OccupancyMap { room: room.clone(), days, blocks }
}

/// Build the month for every room. Any storage failure aborts the whole
/// view and clears the previous snapshot.
pub async fn build(
    repo: &dyn Repository,
    session: &mut Session,
    month: Option<MonthKey>,
) -> Result<CalendarView, StorageError> {
    let month = month.unwrap_or_else(MonthKey::current);
    let built = async {
        let rooms = repo.all_rooms().await?;
        let window = month.span();
        let mut maps = Vec::with_capacity(rooms.len());
        for room in &rooms {
            let restrictions = repo.restrictions_for_room_in_range(room.id, window).await?;
            maps.push(occupancy(room, month, &restrictions));
        }
        Ok::<_, StorageError>(maps)
    }
    .await;

    let rooms = match built {
        Ok(rooms) => rooms,
        Err(e) => {
            session.remove(&SNAPSHOT);
            return Err(e);
        }
    };
    let view = CalendarView {
        month,
        prev: month.prev(),
        next: month.next(),
        days_in_month: month.days_in_month(),
        rooms,
    };
    if let Err(e) = session.put(&SNAPSHOT, &CalendarSnapshot::from_view(&view)) {
        warn!(%month, "calendar snapshot not stored: {e}");
    }
    Ok(view)
}

pub async fn show(app: &App, session: &mut Session, month: Option<MonthKey>) -> Result<Outcome, StorageError> {
    let view = build(app.repo.as_ref(), session, month).await?;
    Ok(Outcome::Render(Page::Calendar(view)))
}

/// A room and day named by the edit form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayRef {
    pub room_id: Ulid,
    pub day: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarEdits {
    pub month: MonthKey,
    pub remove: Vec<DayRef>,
    pub add: Vec<DayRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomFailure {
    pub room_id: Ulid,
    pub day: NaiveDate,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub removed: usize,
    pub added: usize,
    /// Edits that were already in effect.
    pub skipped: usize,
    pub failures: Vec<RoomFailure>,
}

impl ReconcileReport {
    fn fail(&mut self, at: &DayRef, reason: impl fmt::Display) {
        self.failures.push(RoomFailure {
            room_id: at.room_id,
            day: at.day,
            reason: reason.to_string(),
        });
    }

    pub fn failed_rooms(&self) -> BTreeSet<Ulid> {
        self.failures.iter().map(|f| f.room_id).collect()
    }
}

#[derive(Debug, Error)]
pub enum CalendarError {
    #[error(transparent)]
    Session(#[from] SessionStateError),
    #[error("{0} calendar edits in one submission")]
    TooManyEdits(usize),
}

async fn block_starts_on(repo: &dyn Repository, at: &DayRef) -> Result<bool, StorageError> {
    let current = repo
        .restrictions_for_room_in_range(at.room_id, DateSpan::single_day(at.day))
        .await?;
    Ok(current.iter().any(|r| r.is_block() && r.span.start == at.day))
}

/// Apply an edit submission against the snapshot the editor was shown.
///
/// The snapshot is consumed, so a resubmitted form cannot apply twice.
/// Removals take out every block the snapshot showed on that day. Additions
/// are checked against the repository, not the snapshot, so a day blocked
/// since the page was rendered is not blocked again. Repeated days in one
/// submission count once. Failures are collected per room and day; one
/// room's storage error does not stop the others.
pub async fn reconcile(
    repo: &dyn Repository,
    session: &mut Session,
    edits: &CalendarEdits,
) -> Result<ReconcileReport, CalendarError> {
    let count = edits.remove.len() + edits.add.len();
    if count > MAX_CALENDAR_EDITS {
        return Err(CalendarError::TooManyEdits(count));
    }
    let snapshot = session.get(&SNAPSHOT).require(SNAPSHOT_SLOT)?;
    if snapshot.month != edits.month {
        return Err(SessionStateError::Malformed {
            key: SNAPSHOT_SLOT,
            reason: format!("snapshot is for {}, edits are for {}", snapshot.month, edits.month),
        }
        .into());
    }
    session.remove(&SNAPSHOT);

    let window = snapshot.month.span();
    let mut report = ReconcileReport::default();

    let removals: BTreeSet<DayRef> = edits.remove.iter().copied().collect();
    let additions: BTreeSet<DayRef> = edits.add.iter().copied().collect();

    for target in &removals {
        if snapshot.room(target.room_id).is_none() {
            report.fail(target, "room was not on the calendar");
            continue;
        }
        let shown = snapshot.blocks_at(target.room_id, target.day);
        let mut removed = false;
        let mut failed = false;
        for block_id in shown {
            match repo.remove_restriction(*block_id).await {
                Ok(()) => removed = true,
                Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    report.fail(target, e);
                    failed = true;
                }
            }
        }
        match (removed, failed) {
            (true, _) => report.removed += 1,
            (false, false) => report.skipped += 1,
            (false, true) => {}
        }
    }

    for target in &additions {
        if snapshot.room(target.room_id).is_none() {
            report.fail(target, "room was not on the calendar");
            continue;
        }
        if !window.contains_day(target.day) {
            report.fail(target, format!("{} is outside {}", target.day, snapshot.month));
            continue;
        }
        match block_starts_on(repo, target).await {
            Ok(true) => {
                report.skipped += 1;
                continue;
            }
            Ok(false) => {}
            Err(e) => {
                report.fail(target, e);
                continue;
            }
        }
        match repo
            .insert_restriction(RoomRestriction::block(target.room_id, target.day))
            .await
        {
            Ok(_) => report.added += 1,
            Err(e) => report.fail(target, e),
        }
    }

    Ok(report)
}

/// Handle an edit submission and send staff back to the same month.
pub async fn submit(app: &App, session: &mut Session, edits: CalendarEdits) -> Outcome {
    let back = Outcome::Redirect(Route::AdminCalendar(edits.month));
    let report = match reconcile(app.repo.as_ref(), session, &edits).await {
        Ok(report) => report,
        Err(e) => {
            warn!(month = %edits.month, "calendar edits rejected: {e}");
            metrics::counter!(CALENDAR_EDITS_TOTAL, "outcome" => "rejected").increment(1);
            session.error("The calendar changed since it was shown. Please review and try again.");
            return back;
        }
    };

    for failure in &report.failures {
        error!(room = %failure.room_id, day = %failure.day, "calendar edit failed: {}", failure.reason);
    }
    info!(
        month = %edits.month,
        added = report.added,
        removed = report.removed,
        skipped = report.skipped,
        failed = report.failures.len(),
        "calendar edits applied"
    );
    metrics::counter!(CALENDAR_EDITS_TOTAL, "outcome" => "applied").increment((report.added + report.removed) as u64);
    metrics::counter!(CALENDAR_EDITS_TOTAL, "outcome" => "failed").increment(report.failures.len() as u64);

    if report.failures.is_empty() {
        session.flash("Changes saved");
    } else {
        session.error(format!(
            "{} change(s) could not be saved for {} room(s)",
            report.failures.len(),
            report.failed_rooms().len()
        ));
    }
    back
}
