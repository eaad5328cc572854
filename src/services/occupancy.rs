use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::calendar::CalendarEvent;
use crate::models::config::SchedulerConfig;
use crate::models::plan::Slot;
use crate::services::time_utils;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CellState {
    Free,
    External,
    Owned(String),
}

impl CellState {
    fn is_external(&self) -> bool {
        matches!(self, CellState::External)
    }

    fn owner(&self) -> Option<&str> {
        match self {
            CellState::Owned(capture_id) => Some(capture_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct GridDay {
    local_date: NaiveDate,
    start: DateTime<Utc>,
    cells: Vec<CellState>,
}

/// Fixed-resolution occupancy over the working-window hours of the search
/// horizon. Cells are labeled by the dominant overlapping event: an owned
/// event beats an external one, otherwise the larger coverage wins.
#[derive(Debug, Clone)]
pub struct OccupancyGrid {
    cell_minutes: i64,
    days: Vec<GridDay>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridDayStats {
    pub local_date: NaiveDate,
    pub free_minutes: i64,
    pub owned_minutes: i64,
    pub external_minutes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub state: CellState,
}

/// A candidate placement window produced by the sliding scan: a run of
/// consecutive non-external cells with its occupancy breakdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GridWindowCandidate {
    pub slot: Slot,
    pub free_minutes: i64,
    pub owned_minutes: i64,
    pub external_minutes: i64,
    /// Owned minutes per blocking capture id inside the window.
    pub owners: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct GridWindowStats {
    pub free_minutes: i64,
    pub owned_minutes: i64,
    pub external_minutes: i64,
}

pub fn build_occupancy_grid(
    events: &[CalendarEvent],
    now: DateTime<Utc>,
    offset_minutes: i32,
    config: &SchedulerConfig,
) -> OccupancyGrid {
    let cell_minutes = config.slot_increment_minutes.max(1);
    let cells_per_day = (config.working_day_minutes() / cell_minutes) as usize;
    let day_count = config.search_days.clamp(1, 7);

    let mut days = Vec::with_capacity(day_count as usize);
    for day_offset in 0..day_count {
        let day_start = time_utils::start_of_working_day(now, offset_minutes, day_offset, config);
        let local_date = time_utils::local_date(day_start, offset_minutes);

        let mut cells = Vec::with_capacity(cells_per_day);
        for index in 0..cells_per_day {
            let cell_start = day_start + Duration::minutes(cell_minutes * index as i64);
            let cell_end = cell_start + Duration::minutes(cell_minutes);
            cells.push(label_cell(events, cell_start, cell_end, offset_minutes));
        }

        days.push(GridDay {
            local_date,
            start: day_start,
            cells,
        });
    }

    OccupancyGrid { cell_minutes, days }
}

fn label_cell(
    events: &[CalendarEvent],
    cell_start: DateTime<Utc>,
    cell_end: DateTime<Utc>,
    offset_minutes: i32,
) -> CellState {
    let mut best_owned: Option<(i64, &CalendarEvent)> = None;
    let mut best_external: Option<i64> = None;

    for event in events {
        let start = event.start_instant(offset_minutes);
        let end = event.end_instant(offset_minutes);
        if end <= cell_start || cell_end <= start {
            continue;
        }
        let coverage = (end.min(cell_end) - start.max(cell_start)).num_minutes();
        if event.is_owned() {
            if best_owned.map(|(c, _)| coverage > c).unwrap_or(true) {
                best_owned = Some((coverage, event));
            }
        } else if best_external.map(|c| coverage > c).unwrap_or(true) {
            best_external = Some(coverage);
        }
    }

    match (best_owned, best_external) {
        (Some((_, event)), _) => CellState::Owned(
            event
                .capture_id()
                .unwrap_or(event.id.as_str())
                .to_string(),
        ),
        (None, Some(_)) => CellState::External,
        (None, None) => CellState::Free,
    }
}

impl OccupancyGrid {
    /// Instant just past the final working-window cell of the horizon.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.days.last().map(|day| {
            day.start + Duration::minutes(self.cell_minutes * day.cells.len() as i64)
        })
    }

    pub fn daily_stats(&self) -> Vec<GridDayStats> {
        self.days
            .iter()
            .map(|day| {
                let mut stats = GridDayStats {
                    local_date: day.local_date,
                    free_minutes: 0,
                    owned_minutes: 0,
                    external_minutes: 0,
                };
                for cell in &day.cells {
                    match cell {
                        CellState::Free => stats.free_minutes += self.cell_minutes,
                        CellState::External => stats.external_minutes += self.cell_minutes,
                        CellState::Owned(_) => stats.owned_minutes += self.cell_minutes,
                    }
                }
                stats
            })
            .collect()
    }

    /// Run-length compressed listing of the whole grid, day by day.
    pub fn segments(&self) -> Vec<GridSegment> {
        let mut segments = Vec::new();
        for day in &self.days {
            let mut cursor: Option<GridSegment> = None;
            for (index, cell) in day.cells.iter().enumerate() {
                let cell_start = day.start + Duration::minutes(self.cell_minutes * index as i64);
                let cell_end = cell_start + Duration::minutes(self.cell_minutes);
                match cursor.as_mut() {
                    Some(segment) if segment.state == *cell && segment.end == cell_start => {
                        segment.end = cell_end;
                    }
                    _ => {
                        if let Some(done) = cursor.take() {
                            segments.push(done);
                        }
                        cursor = Some(GridSegment {
                            start: cell_start,
                            end: cell_end,
                            state: cell.clone(),
                        });
                    }
                }
            }
            if let Some(done) = cursor.take() {
                segments.push(done);
            }
        }
        segments
    }

    /// Occupancy totals over cells whose span lies within [start, end).
    pub fn window_stats(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> GridWindowStats {
        let mut stats = GridWindowStats::default();
        for day in &self.days {
            for (index, cell) in day.cells.iter().enumerate() {
                let cell_start = day.start + Duration::minutes(self.cell_minutes * index as i64);
                let cell_end = cell_start + Duration::minutes(self.cell_minutes);
                if cell_start < start || cell_end > end {
                    continue;
                }
                match cell {
                    CellState::Free => stats.free_minutes += self.cell_minutes,
                    CellState::External => stats.external_minutes += self.cell_minutes,
                    CellState::Owned(_) => stats.owned_minutes += self.cell_minutes,
                }
            }
        }
        stats
    }

    /// Sliding-window scan for placements of `duration_minutes` inside
    /// [window_start, window_end): every run of consecutive cells with no
    /// external occupancy, earliest first, capped at `limit`.
    pub fn collect_window_candidates(
        &self,
        duration_minutes: i64,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<GridWindowCandidate> {
        let cells_needed = ((duration_minutes.max(1) + self.cell_minutes - 1)
            / self.cell_minutes) as usize;
        let mut candidates = Vec::new();

        'days: for day in &self.days {
            if day.cells.len() < cells_needed {
                continue;
            }
            for start_index in 0..=(day.cells.len() - cells_needed) {
                let slot_start =
                    day.start + Duration::minutes(self.cell_minutes * start_index as i64);
                let slot_end = slot_start + Duration::minutes(self.cell_minutes * cells_needed as i64);
                if slot_start < window_start || slot_end > window_end {
                    continue;
                }

                let run = &day.cells[start_index..start_index + cells_needed];
                if run.iter().any(CellState::is_external) {
                    continue;
                }

                let mut free_minutes = 0;
                let mut owned_minutes = 0;
                let mut owners: BTreeMap<String, i64> = BTreeMap::new();
                for cell in run {
                    match cell.owner() {
                        Some(owner) => {
                            owned_minutes += self.cell_minutes;
                            *owners.entry(owner.to_string()).or_insert(0) += self.cell_minutes;
                        }
                        None => free_minutes += self.cell_minutes,
                    }
                }

                candidates.push(GridWindowCandidate {
                    slot: Slot::new(slot_start, slot_end),
                    free_minutes,
                    owned_minutes,
                    external_minutes: 0,
                    owners,
                });

                if candidates.len() >= limit {
                    break 'days;
                }
            }
        }

        candidates
    }
}
