//! Contribution graph: one commit count per UTC day over 32 weeks.
//!
//! Laid out like GitHub's profile graph. Columns are weeks starting on Sunday,
//! oldest on the left; rows are weekdays with Sunday at row 0. The rightmost
//! column is the week containing today and its future days stay at zero.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

pub const GRAPH_ROWS: usize = 7;
pub const GRAPH_COLUMNS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContributionGraph {
    cells: [[u32; GRAPH_ROWS]; GRAPH_COLUMNS],
    column_updated: [Option<DateTime<Utc>>; GRAPH_COLUMNS],
    current_week_start: NaiveDate,
    today: NaiveDate,
}

fn week_start(date: NaiveDate) -> NaiveDate {
    let offset = u64::from(date.weekday().num_days_from_sunday());
    date.checked_sub_days(Days::new(offset)).unwrap_or(date)
}

impl ContributionGraph {
    /// An empty graph whose rightmost column contains `today`.
    pub fn new(today: NaiveDate) -> Self {
        Self {
            cells: [[0; GRAPH_ROWS]; GRAPH_COLUMNS],
            column_updated: [None; GRAPH_COLUMNS],
            current_week_start: week_start(today),
            today,
        }
    }

    pub const fn today(&self) -> NaiveDate {
        self.today
    }

    /// First day (a Sunday) covered by the graph.
    pub fn window_start(&self) -> NaiveDate {
        let weeks = (GRAPH_COLUMNS as u64 - 1) * 7;
        self.current_week_start
            .checked_sub_days(Days::new(weeks))
            .unwrap_or(NaiveDate::MIN)
    }

    /// Moves the graph forward to `today`, dropping the oldest columns when
    /// a new week begins. Returns the number of columns shifted out. A date
    /// earlier than the current one is ignored.
    pub fn advance_to(&mut self, today: NaiveDate) -> usize {
        if today <= self.today {
            return 0;
        }

        let new_week_start = week_start(today);
        let weeks = (new_week_start - self.current_week_start).num_days() / 7;
        let shift = usize::try_from(weeks).unwrap_or(GRAPH_COLUMNS).min(GRAPH_COLUMNS);

        if shift > 0 {
            self.cells.rotate_left(shift);
            self.column_updated.rotate_left(shift);
            for column in GRAPH_COLUMNS - shift..GRAPH_COLUMNS {
                self.cells[column] = [0; GRAPH_ROWS];
                self.column_updated[column] = None;
            }
        }

        self.current_week_start = new_week_start;
        self.today = today;
        shift
    }

    /// `(column, row)` of `date`, or `None` outside the window or in the future.
    pub fn position(&self, date: NaiveDate) -> Option<(usize, usize)> {
        if date > self.today {
            return None;
        }
        let days = (date - self.window_start()).num_days();
        let days = usize::try_from(days).ok()?;
        let column = days / 7;
        (column < GRAPH_COLUMNS).then(|| (column, days % 7))
    }

    /// Raises the count for `date` to `count` if it is higher. Counts never
    /// go down. Returns whether the cell changed.
    pub fn record(&mut self, date: NaiveDate, count: u32, now: DateTime<Utc>) -> bool {
        let Some((column, row)) = self.position(date) else {
            return false;
        };

        self.column_updated[column] = Some(now);
        let cell = &mut self.cells[column][row];
        if count > *cell {
            *cell = count;
            true
        } else {
            false
        }
    }

    pub fn count(&self, date: NaiveDate) -> Option<u32> {
        self.position(date)
            .map(|(column, row)| self.cells[column][row])
    }

    /// Count at a grid position; out-of-range positions read as zero.
    pub fn cell(&self, column: usize, row: usize) -> u32 {
        self.cells
            .get(column)
            .and_then(|c| c.get(row))
            .copied()
            .unwrap_or(0)
    }

    pub fn column_updated(&self, column: usize) -> Option<DateTime<Utc>> {
        self.column_updated.get(column).copied().flatten()
    }

    pub fn total(&self) -> u64 {
        self.cells
            .iter()
            .flatten()
            .map(|c| u64::from(*c))
            .sum()
    }
}
