//! SeaORM entities for the local store, plus the small value types that sit on
//! top of their string and integer columns.

pub mod pomodoro_session;
pub mod task;

use std::fmt;

/// Lowest task priority.
pub const MIN_PRIORITY: i32 = 1;
/// Highest task priority.
pub const MAX_PRIORITY: i32 = 3;

/// Clamp a priority into `MIN_PRIORITY..=MAX_PRIORITY`.
pub fn clamp_priority(priority: i32) -> i32 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// Task category.
///
/// The relay and every other device exchange categories as their display
/// labels, so the label is what gets stored and sent. Labels outside the known
/// set are preserved verbatim in [`Category::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Category {
    Work,
    #[default]
    Study,
    Exercise,
    Entertainment,
    Life,
    Other,
    Custom(String),
}

impl Category {
    pub fn from_label(label: &str) -> Self {
        match label {
            "工作" => Category::Work,
            "学习" => Category::Study,
            "运动" => Category::Exercise,
            "娱乐" => Category::Entertainment,
            "生活" => Category::Life,
            "其他" => Category::Other,
            other => Category::Custom(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Category::Work => "工作",
            Category::Study => "学习",
            Category::Exercise => "运动",
            Category::Entertainment => "娱乐",
            Category::Life => "生活",
            Category::Other => "其他",
            Category::Custom(label) => label,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl From<&str> for Category {
    fn from(label: &str) -> Self {
        Category::from_label(label)
    }
}
