use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;

pub fn header(text: &str) {
    println!("{} {}", Icons::ROCKET, text.style(theme().header.clone()));
}

pub fn status(icon: &str, label: &str, value: &str) {
    println!("{} {}: {}", icon, label.style(theme().label.clone()), value);
}

pub fn success(label: &str) {
    println!("{} {}", Icons::CHECK, label.style(theme().success.clone()));
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(theme().failure.clone()));
}

pub fn warn(label: &str) {
    eprintln!("{} {}", Icons::WARN, label.style(theme().warn.clone()));
}

pub fn section(title: &str) {
    println!();
    println!("━{}━", title.style(theme().header.clone()));
}

/// One validation finding, `file:position message`
pub fn issue(file: &str, position: u64, message: &str) {
    println!(
        "  {}:{} {}",
        file.style(theme().location.clone()),
        position.style(theme().position.clone()),
        message
    );
}

pub fn interrupted(reason: &str) {
    eprintln!("{} {}", Icons::STOP, reason.style(theme().interrupted.clone()));
}
