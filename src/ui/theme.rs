//! Terminal styles for import and validation output

use owo_colors::Style;
use std::sync::OnceLock;

static THEME: OnceLock<Theme> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct Theme {
    pub header: Style,
    pub success: Style,
    pub failure: Style,
    pub warn: Style,
    /// Interrupt reason of an aborted run
    pub interrupted: Style,
    /// File and feature counts in the run summary
    pub counter: Style,
    pub label: Style,
    /// `file#ordinal` of a validation issue
    pub location: Style,
    pub position: Style,
}

impl Theme {
    /// Colored on a terminal unless colors are turned off (`NO_COLOR`, `CLICOLOR=0`).
    pub fn detect() -> Self {
        if console::Term::stdout().is_term() && console::colors_enabled() {
            Self::colored()
        } else {
            Self::plain()
        }
    }

    pub fn colored() -> Self {
        Self {
            header: Style::new().cyan().bold(),
            success: Style::new().green().bold(),
            failure: Style::new().red().bold(),
            warn: Style::new().yellow(),
            interrupted: Style::new().yellow().bold(),
            counter: Style::new().magenta().bold(),
            label: Style::new().dimmed(),
            location: Style::new().bright_black().underline(),
            position: Style::new().bright_black(),
        }
    }

    pub fn plain() -> Self {
        Self {
            header: Style::new(),
            success: Style::new(),
            failure: Style::new(),
            warn: Style::new(),
            interrupted: Style::new(),
            counter: Style::new(),
            label: Style::new(),
            location: Style::new(),
            position: Style::new(),
        }
    }
}

pub fn theme() -> &'static Theme {
    THEME.get_or_init(Theme::detect)
}
