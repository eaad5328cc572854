use serde::{Deserialize, Serialize};

/// Engine-wide knobs, passed by value into the orchestrator. There is no
/// ambient/global configuration; tests construct their own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerConfig {
    pub buffer_minutes: i64,
    pub compressed_buffer_minutes: i64,
    pub search_days: i64,
    pub slot_increment_minutes: i64,
    pub working_start_hour: u32,
    pub working_end_hour: u32,
    pub stability_window_minutes: i64,
    pub default_min_chunk_minutes: i64,
    pub target_chunk_minutes: i64,
    pub sleep_priority: RoutinePriorityRule,
    pub meal_priority: RoutinePriorityRule,
    pub overlap: OverlapPolicy,
    pub preemption: PreemptionPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advisor: Option<AdvisorConfig>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoutinePriorityRule {
    pub scale: f64,
    pub cap: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlapPolicy {
    pub enabled: bool,
    pub max_concurrency: usize,
    pub per_task_overlap_fraction: f64,
    pub daily_budget_minutes: i64,
    pub soft_cost_per_minute: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PreemptionPolicy {
    pub net_gain_floor: f64,
    pub per_minute_gain_floor: f64,
    pub max_displaced_minutes: i64,
    pub max_displaced_tasks: usize,
    pub max_combination_size: usize,
    pub max_combinations: usize,
    pub displacement_friction: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdvisorConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_advisor_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_advisor_timeout_secs() -> u64 {
    20
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            buffer_minutes: 10,
            compressed_buffer_minutes: 5,
            search_days: 7,
            slot_increment_minutes: 15,
            working_start_hour: 8,
            working_end_hour: 22,
            stability_window_minutes: 30,
            default_min_chunk_minutes: 15,
            target_chunk_minutes: 50,
            sleep_priority: RoutinePriorityRule {
                scale: 0.7,
                cap: 70.0,
            },
            meal_priority: RoutinePriorityRule {
                scale: 0.5,
                cap: 55.0,
            },
            overlap: OverlapPolicy::default(),
            preemption: PreemptionPolicy::default(),
            advisor: None,
        }
    }
}

impl Default for OverlapPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrency: 2,
            per_task_overlap_fraction: 0.5,
            daily_budget_minutes: 120,
            soft_cost_per_minute: 0.05,
        }
    }
}

impl Default for PreemptionPolicy {
    fn default() -> Self {
        Self {
            net_gain_floor: 5.0,
            per_minute_gain_floor: 0.1,
            max_displaced_minutes: 240,
            max_displaced_tasks: 3,
            max_combination_size: 4,
            max_combinations: 64,
            displacement_friction: 2.0,
        }
    }
}

impl SchedulerConfig {
    pub fn working_day_minutes(&self) -> i64 {
        i64::from(self.working_end_hour - self.working_start_hour) * 60
    }
}
