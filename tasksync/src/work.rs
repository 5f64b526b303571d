//! Progress tracking and reports for work-category tasks.
//!
//! Time is kept in hours (`time_spent` is fractional hours) and progress in
//! percent. Days and ISO weeks are computed in UTC. Everything past
//! [`TaskStore::record_progress`] is a pure function over a task list, so
//! callers load tasks once and build whichever reports they need.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Days, Months, NaiveDate, Utc};
use sea_orm::{ActiveModelTrait, ActiveValue::Set};

use crate::conflict::{clamp_progress, normalize_text};
use crate::entity::task;
use crate::store::{ChangeKind, ChangeOrigin, StoreError, TaskStore};

impl TaskStore {
    /// Record work on a task: set its progress, add `extra_hours` to the time
    /// spent and replace the notes. The task is marked as needing sync; push it
    /// with [`SyncHandle::update_task`](crate::SyncHandle::update_task).
    pub async fn record_progress(
        &self,
        record_id: &str,
        progress: f64,
        extra_hours: f64,
        notes: Option<&str>,
    ) -> Result<task::Model, StoreError> {
        if !extra_hours.is_finite() || extra_hours < 0.0 {
            return Err(StoreError::Validation(format!(
                "time spent must be a non-negative number of hours, got {extra_hours}"
            )));
        }
        let existing = self
            .get_task(record_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;

        let now = Utc::now();
        let time_spent = existing.time_spent + extra_hours;
        let mut active: task::ActiveModel = existing.into();
        active.work_progress = Set(clamp_progress(progress));
        active.time_spent = Set(time_spent);
        active.progress_notes = Set(normalize_text(notes));
        active.last_progress_update = Set(Some(now));
        active.updated_at = Set(now);
        active.needs_sync = Set(true);

        let model = active.update(self.inner()).await?;
        log::info!(
            "Recorded progress on {} ({}): {:.0}%",
            model.record_id,
            model.title,
            model.work_progress
        );
        self.notify("tasks", ChangeKind::Update, &model.record_id, ChangeOrigin::Local);
        Ok(model)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressLevel {
    NotStarted,
    InProgress,
    NearCompletion,
    AlmostDone,
    Completed,
}

impl ProgressLevel {
    pub fn from_progress(progress: f64) -> Self {
        let progress = clamp_progress(progress);
        if progress <= 0.0 {
            ProgressLevel::NotStarted
        } else if progress < 50.0 {
            ProgressLevel::InProgress
        } else if progress < 90.0 {
            ProgressLevel::NearCompletion
        } else if progress < 100.0 {
            ProgressLevel::AlmostDone
        } else {
            ProgressLevel::Completed
        }
    }

    pub fn of(task: &task::Model) -> Self {
        Self::from_progress(task.work_progress)
    }
}

/// Render fractional hours as `"2h 15m"`, or `"40m"` under an hour.
pub fn format_time_spent(hours: f64) -> String {
    let hours = hours.max(0.0);
    let whole = hours.trunc() as u64;
    let minutes = ((hours - hours.trunc()) * 60.0) as u64;
    if whole > 0 {
        format!("{whole}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

fn completion_rate(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    completed as f64 / total as f64 * 100.0
}

fn due_within(task: &task::Model, start: NaiveDate, end: NaiveDate) -> bool {
    task.due_date
        .map(|due| {
            let day = due.date_naive();
            day >= start && day < end
        })
        .unwrap_or(false)
}

fn work_tasks_due(tasks: &[task::Model], start: NaiveDate, end: NaiveDate) -> Vec<task::Model> {
    let mut selected: Vec<task::Model> = tasks
        .iter()
        .filter(|t| t.is_work() && due_within(t, start, end))
        .cloned()
        .collect();
    selected.sort_by_key(|t| t.due_date);
    selected
}

/// Work tasks due on a single day.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyReport {
    pub date: NaiveDate,
    pub tasks: Vec<task::Model>,
    pub total_time_spent: f64,
    /// Tasks that have had progress recorded at least once.
    pub progress_updates: usize,
}

impl DailyReport {
    pub fn for_day(tasks: &[task::Model], date: NaiveDate) -> Self {
        let end = date.checked_add_days(Days::new(1)).unwrap_or(date);
        let tasks = work_tasks_due(tasks, date, end);
        let total_time_spent = tasks.iter().map(|t| t.time_spent).sum();
        let progress_updates = tasks
            .iter()
            .filter(|t| t.last_progress_update.is_some())
            .count();

        Self {
            date,
            tasks,
            total_time_spent,
            progress_updates,
        }
    }

    pub fn completed(&self) -> impl Iterator<Item = &task::Model> {
        self.tasks.iter().filter(|t| t.is_completed)
    }

    pub fn ongoing(&self) -> impl Iterator<Item = &task::Model> {
        self.tasks.iter().filter(|t| !t.is_completed)
    }

    /// Percentage of the day's work tasks that are done.
    pub fn completion_rate(&self) -> f64 {
        completion_rate(self.completed().count(), self.tasks.len())
    }
}

/// Work tasks due in the ISO week (Monday to Sunday) containing a date.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyOverview {
    pub week_start: NaiveDate,
    /// Exclusive.
    pub week_end: NaiveDate,
    pub tasks: Vec<task::Model>,
    pub total_time_spent: f64,
    pub average_progress: f64,
    pub completed_count: usize,
    pub ongoing_count: usize,
}

impl WeeklyOverview {
    pub fn for_week(tasks: &[task::Model], date: NaiveDate) -> Self {
        let offset = u64::from(date.weekday().num_days_from_monday());
        let week_start = date.checked_sub_days(Days::new(offset)).unwrap_or(date);
        let week_end = week_start.checked_add_days(Days::new(7)).unwrap_or(week_start);

        let tasks = work_tasks_due(tasks, week_start, week_end);
        let total_time_spent = tasks.iter().map(|t| t.time_spent).sum();
        let average_progress = if tasks.is_empty() {
            0.0
        } else {
            tasks.iter().map(|t| t.work_progress).sum::<f64>() / tasks.len() as f64
        };
        let completed_count = tasks.iter().filter(|t| t.is_completed).count();
        let ongoing_count = tasks.len() - completed_count;

        Self {
            week_start,
            week_end,
            tasks,
            total_time_spent,
            average_progress,
            completed_count,
            ongoing_count,
        }
    }

    /// Overview for the week containing `now`.
    pub fn current(tasks: &[task::Model], now: DateTime<Utc>) -> Self {
        Self::for_week(tasks, now.date_naive())
    }

    pub fn completion_rate(&self) -> f64 {
        completion_rate(self.completed_count, self.tasks.len())
    }

    pub fn average_time_per_task(&self) -> f64 {
        if self.tasks.is_empty() {
            return 0.0;
        }
        self.total_time_spent / self.tasks.len() as f64
    }

    pub fn productivity_score(&self) -> f64 {
        self.completion_rate() * 0.6 + self.average_progress * 0.4
    }

    /// Overview for the week after the one containing `date`, for planning.
    pub fn next_week(tasks: &[task::Model], date: NaiveDate) -> Self {
        Self::for_week(tasks, date.checked_add_days(Days::new(7)).unwrap_or(date))
    }
}

/// Weeks covered by [`WorkAnalytics::weekly_trend`], the current one included.
pub const TREND_WEEKS: u64 = 4;

/// One week of the trend.
#[derive(Debug, Clone, PartialEq)]
pub struct WeeklyData {
    pub week_start: NaiveDate,
    pub tasks_completed: usize,
    pub total_hours: f64,
    pub average_progress: f64,
}

impl From<&WeeklyOverview> for WeeklyData {
    fn from(week: &WeeklyOverview) -> Self {
        Self {
            week_start: week.week_start,
            tasks_completed: week.completed_count,
            total_hours: week.total_time_spent,
            average_progress: week.average_progress,
        }
    }
}

/// Per-category totals over the last month.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryData {
    pub category: String,
    pub task_count: usize,
    pub time_spent: f64,
    pub completion_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rating {
    Strong,
    Fair,
    Weak,
}

impl Rating {
    fn grade(value: f64, strong: f64, fair: f64) -> Self {
        if value >= strong {
            Rating::Strong
        } else if value >= fair {
            Rating::Fair
        } else {
            Rating::Weak
        }
    }
}

/// An observation about the current week.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Insight {
    CompletionRate { percent: f64, rating: Rating },
    HoursWorked { hours: f64, rating: Rating },
    AverageProgress { percent: f64, rating: Rating },
}

impl Insight {
    pub fn rating(&self) -> Rating {
        match self {
            Insight::CompletionRate { rating, .. }
            | Insight::HoursWorked { rating, .. }
            | Insight::AverageProgress { rating, .. } => *rating,
        }
    }
}

impl fmt::Display for Insight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Insight::CompletionRate { percent, rating } => match rating {
                Rating::Strong => write!(f, "{percent:.1}% of this week's work is done, excellent"),
                Rating::Fair => write!(f, "{percent:.1}% of this week's work is done, room to improve"),
                Rating::Weak => write!(f, "Only {percent:.1}% of this week's work is done, plan tasks more closely"),
            },
            Insight::HoursWorked { hours, rating } => match rating {
                Rating::Strong => write!(f, "{hours:.1} hours worked this week, a solid investment"),
                Rating::Fair => write!(f, "{hours:.1} hours worked this week, there is room for more"),
                Rating::Weak => write!(f, "{hours:.1} hours worked this week, consider putting in more time"),
            },
            Insight::AverageProgress { percent, rating } => match rating {
                Rating::Strong => write!(f, "Average task progress is {percent:.1}%, strong execution"),
                Rating::Fair => write!(f, "Average task progress is {percent:.1}%, moving steadily"),
                Rating::Weak => write!(f, "Average task progress is {percent:.1}%, pick up the pace"),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recommendation {
    BreakDownLargeTasks,
    SetDailyGoals,
    SpendMoreTimePerTask,
    SplitLongTasks,
    UpdateProgressRegularly,
    UsePomodoro,
    ReviewDailyReport,
    KeepWorkInOnePlace,
}

impl fmt::Display for Recommendation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Recommendation::BreakDownLargeTasks => "Break large tasks into smaller ones to finish more of them",
            Recommendation::SetDailyGoals => "Set a daily work goal and keep a steady rhythm",
            Recommendation::SpendMoreTimePerTask => "Little time goes into each task; block out time for deep work",
            Recommendation::SplitLongTasks => "Single tasks run long; split them into smaller subtasks",
            Recommendation::UpdateProgressRegularly => "Record progress regularly so the work stays visible",
            Recommendation::UsePomodoro => "Use pomodoro sessions to stay focused",
            Recommendation::ReviewDailyReport => "Check the daily report at 18:00 and adjust the plan",
            Recommendation::KeepWorkInOnePlace => "Keep every work task in the work category",
        })
    }
}

/// Trend, breakdown and advice built from a task list.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkAnalytics {
    /// Oldest week first, ending with the week containing the report date.
    pub weekly_trend: Vec<WeeklyData>,
    pub category_breakdown: Vec<CategoryData>,
    pub insights: Vec<Insight>,
    pub recommendations: Vec<Recommendation>,
}

impl WorkAnalytics {
    pub fn for_date(tasks: &[task::Model], date: NaiveDate) -> Self {
        let week = WeeklyOverview::for_week(tasks, date);
        let analytics = Self {
            weekly_trend: weekly_trend(tasks, date),
            category_breakdown: category_breakdown(tasks, date),
            insights: insights(&week),
            recommendations: recommendations(&week),
        };
        log::debug!(
            "Work analytics for {date}: {} weeks, {} categories",
            analytics.weekly_trend.len(),
            analytics.category_breakdown.len()
        );
        analytics
    }

    pub fn current(tasks: &[task::Model], now: DateTime<Utc>) -> Self {
        Self::for_date(tasks, now.date_naive())
    }
}

fn weekly_trend(tasks: &[task::Model], date: NaiveDate) -> Vec<WeeklyData> {
    (0..TREND_WEEKS)
        .rev()
        .filter_map(|weeks_back| date.checked_sub_days(Days::new(weeks_back * 7)))
        .map(|day| WeeklyData::from(&WeeklyOverview::for_week(tasks, day)))
        .collect()
}

/// Every category with a task due since one month before `date`, busiest first.
fn category_breakdown(tasks: &[task::Model], date: NaiveDate) -> Vec<CategoryData> {
    let since = date.checked_sub_months(Months::new(1)).unwrap_or(date);

    // category -> (tasks, completed, hours)
    let mut totals: BTreeMap<&str, (usize, usize, f64)> = BTreeMap::new();
    for task in tasks {
        let Some(due) = task.due_date else { continue };
        if due.date_naive() < since {
            continue;
        }
        let entry = totals.entry(task.category.as_str()).or_default();
        entry.0 += 1;
        entry.1 += usize::from(task.is_completed);
        entry.2 += task.time_spent;
    }

    let mut breakdown: Vec<CategoryData> = totals
        .into_iter()
        .map(|(category, (count, completed, hours))| CategoryData {
            category: category.to_string(),
            task_count: count,
            time_spent: hours,
            completion_rate: completion_rate(completed, count),
        })
        .collect();
    breakdown.sort_by(|a, b| b.task_count.cmp(&a.task_count));
    breakdown
}

fn insights(week: &WeeklyOverview) -> Vec<Insight> {
    let completion = week.completion_rate();
    vec![
        Insight::CompletionRate {
            percent: completion,
            rating: Rating::grade(completion, 80.0, 60.0),
        },
        Insight::HoursWorked {
            hours: week.total_time_spent,
            rating: Rating::grade(week.total_time_spent, 40.0, 20.0),
        },
        Insight::AverageProgress {
            percent: week.average_progress,
            rating: Rating::grade(week.average_progress, 80.0, 50.0),
        },
    ]
}

fn recommendations(week: &WeeklyOverview) -> Vec<Recommendation> {
    let mut advice = Vec::new();
    if week.completion_rate() < 60.0 {
        advice.push(Recommendation::BreakDownLargeTasks);
        advice.push(Recommendation::SetDailyGoals);
    }

    let hours_per_task = week.average_time_per_task();
    if hours_per_task < 2.0 {
        advice.push(Recommendation::SpendMoreTimePerTask);
    } else if hours_per_task > 8.0 {
        advice.push(Recommendation::SplitLongTasks);
    }

    if week.average_progress < 50.0 {
        advice.push(Recommendation::UpdateProgressRegularly);
        advice.push(Recommendation::UsePomodoro);
    }

    advice.push(Recommendation::ReviewDailyReport);
    advice.push(Recommendation::KeepWorkInOnePlace);
    advice
}
