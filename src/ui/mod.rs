pub mod icons;
pub mod output;
pub mod progress;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{error, header, interrupted, issue, section, status, success, warn};
pub use progress::ProgressManager;
pub use table::{stats_table, summary_table, TableBuilder};
pub use theme::{theme, Theme};
